//! Git plumbing: typed commit records, the `--header` stream parser, and the
//! [`GitOps`] seam the engine drives. The real implementation shells out to
//! `git`; tests substitute an in-memory repository.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use eyre::{Context, Result, bail, eyre};

use crate::{cmd, re, util};

/// A commit, tree, or blob id in hex form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    pub fn new(hex: impl Into<String>) -> Oid {
        Oid(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", &self.0)
    }
}

/// Immutable snapshot of one commit as enumerated by `git rev-list --header`.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub oid: Oid,
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    /// Included by history enumeration only for ancestry context; not part of
    /// the range being submitted.
    pub boundary: bool,
}

impl CommitRecord {
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim_end()
    }

    /// The single parent of a linear stack commit.
    pub fn sole_parent(&self) -> Result<&Oid> {
        match self.parents.as_slice() {
            [p] => Ok(p),
            _ => bail!(
                "commit {} has {} parents; only linear histories with exactly one \
                 parent per commit can be submitted",
                self.oid,
                self.parents.len()
            ),
        }
    }
}

/// Parses the NUL-separated output of `git rev-list --header [--boundary]`.
///
/// Each record is a newline-separated header block (commit id on the first
/// line, `tree`/`parent`/`author`/`committer` fields, signature continuation
/// lines indented with a single space) followed by a blank line and the
/// message indented with four spaces. Records arrive newest-first; callers
/// reverse when they want oldest-first. A record missing its commit id or
/// `tree` line is a malformed stream and fails the whole parse.
pub fn parse_header_stream(raw: &str) -> Result<Vec<CommitRecord>> {
    re!(author_re, r"^(.*) <(.*)> \d+ [-+]\d{4}$");

    let mut records = Vec::new();
    for chunk in raw.split('\0') {
        if chunk.trim().is_empty() {
            continue;
        }
        let mut lines = chunk.split('\n');

        let first = lines
            .next()
            .ok_or_else(|| eyre!("malformed rev-list record: empty header"))?;
        let (boundary, id) = match first.strip_prefix('-') {
            Some(id) => (true, id),
            None => (false, first),
        };
        if id.is_empty() {
            bail!("malformed rev-list record: missing commit id");
        }

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author_name = String::new();
        let mut author_email = String::new();

        // Header fields up to the blank separator. Continuation lines (e.g.
        // inside gpgsig blocks) start with a space and carry no fields.
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') {
                continue;
            }
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            match key {
                "tree" => tree = Some(Oid::new(value)),
                "parent" => parents.push(Oid::new(value)),
                "author" => {
                    if let Some(caps) = author_re().captures(value) {
                        author_name = caps[1].to_string();
                        author_email = caps[2].to_string();
                    }
                }
                _ => {}
            }
        }

        let Some(tree) = tree else {
            bail!("malformed rev-list record for {id}: no tree line");
        };

        let message = lines
            .map(|line| line.strip_prefix("    ").unwrap_or(line))
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string();

        records.push(CommitRecord {
            oid: Oid::new(id),
            tree,
            parents,
            author_name,
            author_email,
            message,
            boundary,
        });
    }
    Ok(records)
}

/// One local-commit-to-remote-ref push, with an explicit per-ref force flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSpec {
    pub oid: Oid,
    pub remote_ref: String,
    pub force: bool,
}

impl PushSpec {
    pub fn refspec(&self) -> String {
        let plus = if self.force { "+" } else { "" };
        format!("{plus}{}:refs/heads/{}", self.oid, self.remote_ref)
    }
}

/// The version-control operations the engine consumes. The binary uses the
/// subprocess-backed [`Git`]; tests substitute an in-memory implementation.
pub trait GitOps {
    /// Resolves a local revision (e.g. `HEAD`) to a commit id, `None` if it
    /// does not exist.
    fn resolve(&self, rev: &str) -> Result<Option<Oid>>;

    /// Resolves a branch as known on the configured remote (short name, e.g.
    /// `gh/alice/1/head` or `main`).
    fn remote_branch(&self, name: &str) -> Result<Option<Oid>>;

    /// Fetches the named remote branch globs into the remote-tracking
    /// namespace so [`GitOps::remote_branch`] sees fresh state.
    fn fetch_refs(&self, globs: &[String]) -> Result<()>;

    fn read_commit(&self, oid: &Oid) -> Result<CommitRecord>;

    /// `base..head` commits with a boundary record for `base`, newest first.
    fn rev_list_range(&self, base: &Oid, head: &Oid) -> Result<Vec<CommitRecord>>;

    /// Creates a commit object. `author` is a (name, email) pair carried over
    /// when rewriting a user's commit; `None` synthesizes the commit under the
    /// configured committer identity.
    fn commit_tree(
        &self,
        tree: &Oid,
        parents: &[Oid],
        message: &str,
        author: Option<(&str, &str)>,
    ) -> Result<Oid>;

    fn merge_base(&self, a: &Oid, b: &Oid) -> Result<Oid>;

    fn is_ancestor(&self, ancestor: &Oid, descendant: &Oid) -> Result<bool>;

    /// Enumerates remote branches matching a glob, as (short name, tip) pairs.
    fn list_remote_refs(&self, glob: &str) -> Result<Vec<(String, Oid)>>;

    /// Pushes the given refspecs in order, in one operation.
    fn push(&self, specs: &[PushSpec]) -> Result<()>;

    /// Moves a local ref (fully qualified, e.g. `refs/heads/feature`).
    fn update_ref(&self, name: &str, oid: &Oid) -> Result<()>;

    fn tree_of(&self, oid: &Oid) -> Result<Oid> {
        Ok(self.read_commit(oid)?.tree)
    }
}

/// Subprocess-backed [`GitOps`] running `git` in a working directory.
pub struct Git {
    dir: PathBuf,
    remote: String,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>, remote: impl Into<String>) -> Git {
        Git { dir: dir.into(), remote: remote.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl GitOps for Git {
    fn resolve(&self, rev: &str) -> Result<Option<Oid>> {
        let mut command = cmd!("git rev-parse --verify --quiet", format!("{rev}^{{commit}}"));
        command.current_dir(&self.dir);
        let output = command.output().wrap_err("Failed to run `git rev-parse`")?;
        if output.status.success() {
            Ok(Some(Oid::new(util::to_trimmed_string_lossy(&output.stdout))))
        } else {
            Ok(None)
        }
    }

    fn remote_branch(&self, name: &str) -> Result<Option<Oid>> {
        self.resolve(&format!("refs/remotes/{}/{}", self.remote, name))
    }

    fn fetch_refs(&self, globs: &[String]) -> Result<()> {
        let mut command = cmd!("git fetch --prune --no-tags --quiet", self.remote);
        for glob in globs {
            command.arg(format!(
                "+refs/heads/{glob}:refs/remotes/{}/{glob}",
                self.remote
            ));
        }
        util::run_in(&self.dir, command).wrap_err("Failed to fetch remote refs")?;
        Ok(())
    }

    fn read_commit(&self, oid: &Oid) -> Result<CommitRecord> {
        let raw = util::run_in(
            &self.dir,
            cmd!("git rev-list --header --max-count=1", oid.as_str()),
        )?;
        parse_header_stream(&raw)?
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("no commit record for {oid}"))
    }

    fn rev_list_range(&self, base: &Oid, head: &Oid) -> Result<Vec<CommitRecord>> {
        let raw = util::run_in(
            &self.dir,
            cmd!(
                "git rev-list --header --boundary",
                head.as_str(),
                format!("^{base}"),
            ),
        )?;
        parse_header_stream(&raw)
    }

    fn commit_tree(
        &self,
        tree: &Oid,
        parents: &[Oid],
        message: &str,
        author: Option<(&str, &str)>,
    ) -> Result<Oid> {
        let mut command = cmd!("git commit-tree", tree.as_str());
        for parent in parents {
            command.arg("-p").arg(parent.as_str());
        }
        if let Some((name, email)) = author {
            command.env("GIT_AUTHOR_NAME", name).env("GIT_AUTHOR_EMAIL", email);
        }
        command.current_dir(&self.dir);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().wrap_err("Failed to run `git commit-tree`")?;
        child
            .stdin
            .take()
            .ok_or_else(|| eyre!("no stdin for `git commit-tree`"))?
            .write_all(message.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "`git commit-tree` failed: {}",
                util::to_trimmed_string_lossy(&output.stderr)
            );
        }
        Ok(Oid::new(util::to_trimmed_string_lossy(&output.stdout)))
    }

    fn merge_base(&self, a: &Oid, b: &Oid) -> Result<Oid> {
        let out = util::run_in(&self.dir, cmd!("git merge-base", a.as_str(), b.as_str()))?;
        Ok(Oid::new(out))
    }

    fn is_ancestor(&self, ancestor: &Oid, descendant: &Oid) -> Result<bool> {
        let mut command = cmd!(
            "git merge-base --is-ancestor",
            ancestor.as_str(),
            descendant.as_str(),
        );
        command.current_dir(&self.dir);
        let status = command.status().wrap_err("Failed to run `git merge-base`")?;
        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!("`git merge-base --is-ancestor` failed: {status}"),
        }
    }

    fn list_remote_refs(&self, glob: &str) -> Result<Vec<(String, Oid)>> {
        let out = util::run_in(
            &self.dir,
            cmd!("git ls-remote", self.remote, format!("refs/heads/{glob}")),
        )?;
        let mut refs = Vec::new();
        for line in out.lines() {
            let Some((sha, name)) = line.split_once('\t') else {
                continue;
            };
            let Some(short) = name.strip_prefix("refs/heads/") else {
                continue;
            };
            refs.push((short.to_string(), Oid::new(sha)));
        }
        Ok(refs)
    }

    fn push(&self, specs: &[PushSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let mut command = cmd!("git push --quiet --no-verify", self.remote);
        for spec in specs {
            command.arg(spec.refspec());
        }
        util::run_in(&self.dir, command).wrap_err("Failed to push branches")?;
        Ok(())
    }

    fn update_ref(&self, name: &str, oid: &Oid) -> Result<()> {
        util::run_in(&self.dir, cmd!("git update-ref", name, oid.as_str()))?;
        Ok(())
    }
}
