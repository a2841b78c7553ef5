use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eyre::{Context, Result, eyre};

use ghstack::config::{self, Config};
use ghstack::git::Git;
use ghstack::github::GhCli;
use ghstack::{submit, unlink};

/// Submit each commit on the current branch as its own stacked pull request.
#[derive(Parser)]
#[command(name = "ghstack", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Create or update one pull request per commit (the default)
    Submit(SubmitArgs),
    /// Strip stack metadata from the current branch's commits
    Unlink,
}

#[derive(Args, Default)]
struct SubmitArgs {
    /// Overwrite remote changes even when the local stack is out of date
    #[arg(long)]
    force: bool,

    /// Open new pull requests as drafts
    #[arg(long)]
    draft: bool,

    /// Target the default branch directly instead of per-slot base branches
    #[arg(long)]
    direct: bool,

    /// Remote branch the stack targets [default: ghstack.defaultBranch]
    #[arg(long)]
    base: Option<String>,

    /// Overwrite pull request titles and bodies from the commit messages
    #[arg(long)]
    update_fields: bool,

    /// Re-fetch and validate remote stack structure after submitting
    #[arg(long)]
    check_invariants: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let repo = gix::discover(".").wrap_err("not inside a git repository")?;
    let workdir = repo
        .workdir()
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("bare repositories are not supported"))?;
    let mut cfg = Config::load(&repo)?;
    let head_ref = config::current_branch_ref(&repo)?;
    let git = Git::new(&workdir, &cfg.remote_name);

    match cli.command.unwrap_or(Command::Submit(SubmitArgs::default())) {
        Command::Submit(args) => {
            if args.direct {
                cfg.direct = true;
            }
            let opts = submit::SubmitOptions {
                force: args.force,
                draft: args.draft,
                base: args.base,
                update_fields: args.update_fields,
                check_invariants: args.check_invariants,
            };
            let github = GhCli::new(&workdir, &cfg.host);
            let report = submit::run(&git, &github, &cfg, &opts, &head_ref)?;
            submit::print_summary(&report);
        }
        Command::Unlink => unlink::run(&git, &cfg.default_branch, &head_ref)?,
    }
    Ok(())
}
