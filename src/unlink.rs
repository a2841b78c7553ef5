//! Detaches the current branch's commits from their review requests by
//! stripping the stack metadata trailers. The next submit treats each commit
//! as new and opens fresh requests.

use eyre::{Result, eyre};

use crate::diff::{COMMENT_ID_KEY, PULL_REQUEST_KEY, SOURCE_ID_KEY};
use crate::git::GitOps;
use crate::trailers;

const LINK_TRAILER_KEYS: &[&str] = &[
    PULL_REQUEST_KEY,
    "Pull-Request-resolved",
    "Pull Request resolved",
    "gh-metadata",
    SOURCE_ID_KEY,
    COMMENT_ID_KEY,
];

pub fn run(git: &dyn GitOps, default_branch: &str, head_ref: &str) -> Result<()> {
    git.fetch_refs(&[default_branch.to_string()])?;
    let default_tip = git
        .remote_branch(default_branch)?
        .ok_or_else(|| eyre!("remote has no branch '{default_branch}'"))?;
    let head = git
        .resolve("HEAD")?
        .ok_or_else(|| eyre!("HEAD does not point at a commit"))?;
    let stack_base = git.merge_base(&head, &default_tip)?;

    let mut commits = git.rev_list_range(&stack_base, &head)?;
    commits.retain(|c| !c.boundary);
    commits.reverse();

    let mut new_parent = stack_base;
    let mut changed = 0;
    for c in &commits {
        let stripped = trailers::strip_trailers(&c.message, LINK_TRAILER_KEYS);
        if changed == 0 && stripped == c.message {
            new_parent = c.oid.clone();
            continue;
        }
        if stripped != c.message {
            changed += 1;
        }
        new_parent = git.commit_tree(
            &c.tree,
            std::slice::from_ref(&new_parent),
            &stripped,
            Some((&c.author_name, &c.author_email)),
        )?;
    }
    if changed == 0 {
        log::info!("No commits on this branch carry stack metadata; nothing to do.");
        return Ok(());
    }
    git.update_ref(head_ref, &new_parent)?;
    log::info!("Unlinked {changed} commit(s); the next submit will open new pull requests.");
    Ok(())
}
