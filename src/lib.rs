//! Stacked-diff submission for GitHub: one pull request per commit on the
//! current branch, with stable slot identity across amends and rebases.
//!
//! The submission engine lives in [`submit`]; everything else is plumbing it
//! stands on. The engine only talks to the outside world through the
//! [`git::GitOps`] and [`github::GitHubApi`] traits, so integration tests can
//! drive a full run against in-memory fakes.

pub mod config;
pub mod diff;
pub mod git;
pub mod github;
pub mod submit;
pub mod trailers;
pub mod unlink;
pub mod util;
pub mod verify;
