//! The message-level view of a commit: its change identity, content identity,
//! and the structured review-request reference embedded in its trailers.

use std::fmt;

use crate::git::{CommitRecord, Oid};
use crate::{re, trailers};

/// Trailer carrying the content identity (a tree id); invariant under
/// message-only edits.
pub const SOURCE_ID_KEY: &str = "ghstack-source-id";
/// Trailer carrying the id of the stack-position side comment (direct
/// topology only).
pub const COMMENT_ID_KEY: &str = "ghstack-comment-id";
/// Trailer carrying the review-request URL.
pub const PULL_REQUEST_KEY: &str = "Pull-Request";

/// Marker embedded in synthetic head/base commit bodies. A user commit
/// bearing it means the user is working directly on an internal branch.
pub const POISON_MARKER: &str = "[ghstack-poisoned]";

/// A per-username stack slot number; stable for the life of a review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GhNumber(pub u64);

impl fmt::Display for GhNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The durable cross-reference to an already-created review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestResolved {
    pub host: String,
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestResolved {
    pub fn url(&self) -> String {
        format!(
            "https://{}/{}/{}/pull/{}",
            self.host, self.owner, self.repo, self.number
        )
    }
}

// Current spelling plus two historical URL spellings.
re!(
    pr_url_trailer_re,
    r"(?m)^(?:Pull-Request|Pull-Request-resolved|Pull Request resolved): +https://([^/\s]+)/([^/\s]+)/([^/\s]+)/pull/(\d+) *$"
);

// Legacy single-line metadata form; carries no host.
re!(
    gh_metadata_re,
    r"(?m)^gh-metadata: +(\S+) +(\S+) +(\d+) +gh/[^/\s]+/\d+/head *$"
);

/// Extracts a review-request reference from a commit message, accepting the
/// current trailer spelling and the historical ones.
pub fn parse_pull_request_resolved(message: &str, default_host: &str) -> Option<PullRequestResolved> {
    if let Some(caps) = pr_url_trailer_re().captures(message) {
        return Some(PullRequestResolved {
            host: caps[1].to_string(),
            owner: caps[2].to_string(),
            repo: caps[3].to_string(),
            number: caps[4].parse().ok()?,
        });
    }
    if let Some(caps) = gh_metadata_re().captures(message) {
        return Some(PullRequestResolved {
            host: default_host.to_string(),
            owner: caps[1].to_string(),
            repo: caps[2].to_string(),
            number: caps[3].parse().ok()?,
        });
    }
    None
}

/// A commit normalized for submission.
#[derive(Debug, Clone)]
pub struct Diff {
    pub title: String,
    /// The full commit message.
    pub summary: String,
    /// Change identity: the commit id.
    pub oid: Oid,
    /// Content identity from the `ghstack-source-id` trailer, if present.
    pub source_id: Option<String>,
    pub pull_request_resolved: Option<PullRequestResolved>,
    pub tree: Oid,
    pub author_name: String,
    pub author_email: String,
    pub boundary: bool,
}

impl Diff {
    pub fn from_commit(c: &CommitRecord, default_host: &str) -> Diff {
        Diff {
            title: c.title().to_string(),
            summary: c.message.clone(),
            oid: c.oid.clone(),
            source_id: trailers::trailer_value(&c.message, SOURCE_ID_KEY),
            pull_request_resolved: parse_pull_request_resolved(&c.message, default_host),
            tree: c.tree.clone(),
            author_name: c.author_name.clone(),
            author_email: c.author_email.clone(),
            boundary: c.boundary,
        }
    }
}
