use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use eyre::{Result, bail};

/// Builds a [`Command`] from a whitespace-split format string, with optional
/// trailing arguments appended verbatim (so values containing spaces are
/// passed as single arguments).
#[macro_export]
macro_rules! cmd {
    ($cmd:literal $(, $arg:expr)* $(,)?) => {{
        let bin_str = format!($cmd);
        let parts: Vec<&str> = bin_str.split_whitespace().collect();
        let (bin, args) = match parts.as_slice() {
            [bin, args @ ..] => (bin, args),
            [] => panic!("Command cannot be empty"),
        };

        let mut c = $crate::util::cmd(bin, args);
        $(c.arg(&$arg);)*
        log::debug!("exec: {:?}", c);
        c
    }};
}

/// A once-compiled regex, either as a named accessor fn or inline.
#[macro_export]
macro_rules! re {
    ($name:ident, $re:literal) => {
        fn $name() -> &'static regex::Regex {
            re!(@inner $re)
        }
    };
    ($re:literal) => {
        (|| -> &'static regex::Regex { re!(@inner $re) })()
    };
    (@inner $re:literal) => {{
        static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| regex::Regex::new($re).unwrap())
    }};
}

pub fn cmd<I: AsRef<OsStr>>(name: &str, args: impl IntoIterator<Item = I>) -> Command {
    let mut c = Command::new(name);
    c.args(args);
    c
}

pub fn to_trimmed_string_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Runs a command to completion in `dir`, returning trimmed stdout, or an
/// error carrying the command line and stderr on non-zero exit.
pub fn run_in(dir: &Path, mut command: Command) -> Result<String> {
    command.current_dir(dir);
    let output = command.output()?;
    if !output.status.success() {
        bail!(
            "command {:?} failed ({}): {}",
            command,
            output.status,
            to_trimmed_string_lossy(&output.stderr)
        );
    }
    Ok(to_trimmed_string_lossy(&output.stdout))
}
