//! Run configuration resolved from git config and the remote URL.

use eyre::{Result, bail, eyre};

use crate::re;

#[derive(Debug, Clone)]
pub struct Config {
    /// GitHub username owning the `gh/{username}/*` branch namespace.
    pub username: String,
    pub remote_name: String,
    /// The upstream default branch new stacks are based on.
    pub default_branch: String,
    pub host: String,
    pub owner: String,
    pub repo: String,
    /// Direct topology: review requests merge straight into the default
    /// branch (or a preceding slot's head) instead of a per-slot base branch.
    pub direct: bool,
}

impl Config {
    pub fn load(repo: &gix::Repository) -> Result<Config> {
        let config = repo.config_snapshot();
        let get = |key: &str| config.string(key).map(|v| v.to_string());

        let remote_name = get("ghstack.remote").unwrap_or_else(|| "origin".to_string());
        let url = get(&format!("remote.{remote_name}.url")).ok_or_else(|| {
            eyre!("remote '{remote_name}' has no URL; is this repository set up to push anywhere?")
        })?;
        let (host, owner, repo_name) = parse_remote_url(&url)?;

        let Some(username) = get("ghstack.username").or_else(|| get("github.user")) else {
            bail!(
                "no GitHub username configured; set it with \
                 `git config ghstack.username <your-username>`"
            );
        };

        let default_branch = get("ghstack.defaultBranch").unwrap_or_else(|| "main".to_string());
        let direct = config.boolean("ghstack.direct").unwrap_or(false);

        Ok(Config {
            username,
            remote_name,
            default_branch,
            host,
            owner,
            repo: repo_name,
            direct,
        })
    }

    /// `owner/repo` for REST paths.
    pub fn repo_path(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Parses `https://`, `ssh://git@`, and scp-style `git@host:` remote URLs.
pub fn parse_remote_url(url: &str) -> Result<(String, String, String)> {
    re!(
        url_re,
        r"^(?:https://|ssh://git@|git@)([^/:]+)[:/]([^/:]+)/([^/]+?)(?:\.git)?/?$"
    );
    let caps = url_re()
        .captures(url.trim())
        .ok_or_else(|| eyre!("could not parse remote URL '{url}' as a GitHub repository"))?;
    Ok((caps[1].to_string(), caps[2].to_string(), caps[3].to_string()))
}

/// The fully qualified ref name of the checked-out branch.
pub fn current_branch_ref(repo: &gix::Repository) -> Result<String> {
    let head = repo.head()?;
    let head_ref = head
        .try_into_referent()
        .ok_or_else(|| eyre!("cannot submit from a detached HEAD"))?;
    Ok(head_ref.name().as_bstr().to_string())
}
