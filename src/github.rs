//! The remote API surface the engine consumes. Transport concerns
//! (authentication, rate-limit retry, proxies) belong to the `gh` CLI, which
//! [`GhCli`] drives; tests substitute an in-memory implementation.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use eyre::{Context, Result, bail, eyre};
use serde_json::{Value, json};

use crate::{cmd, util};

pub trait GitHubApi {
    /// Structured query: query text + variables, returning the `data` object.
    fn graphql(&self, query: &str, variables: Value) -> Result<Value>;

    fn get(&self, path: &str) -> Result<Value>;

    fn post(&self, path: &str, body: Value) -> Result<Value>;

    fn patch(&self, path: &str, body: Value) -> Result<Value>;
}

/// [`GitHubApi`] implementation shelling out to `gh api`.
pub struct GhCli {
    dir: PathBuf,
    host: String,
}

impl GhCli {
    pub fn new(dir: impl Into<PathBuf>, host: impl Into<String>) -> GhCli {
        GhCli { dir: dir.into(), host: host.into() }
    }

    fn request(&self, method: Option<&str>, path: &str, body: Option<Value>) -> Result<Value> {
        let mut command = cmd!("gh api --hostname", self.host, path);
        if let Some(method) = method {
            command.arg("--method").arg(method);
        }
        if body.is_some() {
            command.arg("--input").arg("-");
        }
        command.current_dir(&self.dir);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command.spawn().wrap_err("Failed to run `gh api`")?;
        if let Some(body) = body {
            child
                .stdin
                .take()
                .ok_or_else(|| eyre!("no stdin for `gh api`"))?
                .write_all(body.to_string().as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "`gh api {path}` failed: {}",
                util::to_trimmed_string_lossy(&output.stderr)
            );
        }
        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout)
            .wrap_err_with(|| format!("failed to parse `gh api {path}` output"))
    }
}

impl GitHubApi for GhCli {
    fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let response = self.request(
            None,
            "graphql",
            Some(json!({ "query": query, "variables": variables })),
        )?;
        if let Some(errors) = response.get("errors")
            && errors.as_array().is_none_or(|a| !a.is_empty())
        {
            bail!("GraphQL query failed: {errors}");
        }
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    }

    fn get(&self, path: &str) -> Result<Value> {
        self.request(None, path, None)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Some("POST"), path, Some(body))
    }

    fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Some("PATCH"), path, Some(body))
    }
}
