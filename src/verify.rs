//! Opt-in post-run invariant checking. After pushing, re-fetches the slot
//! namespace and asserts the structural properties every synchronized stack
//! must satisfy. A failure here is a bug in the engine, not user error.

use std::collections::HashMap;

use eyre::{Result, ensure};

use crate::config::Config;
use crate::diff::parse_pull_request_resolved;
use crate::git::{GitOps, Oid};
use crate::submit::SubmitReport;

/// `before` is the snapshot of the `gh/{username}/*` namespace taken when the
/// run started; it anchors the concurrent-writer check for branches the run
/// left untouched.
pub fn check(
    git: &dyn GitOps,
    cfg: &Config,
    report: &SubmitReport,
    before: &HashMap<String, Oid>,
) -> Result<()> {
    git.fetch_refs(&[format!("gh/{}/*", cfg.username)])?;

    let base_kind = if cfg.direct { "next" } else { "base" };
    for d in &report.decisions {
        let base_name = format!("gh/{}/{}/{}", cfg.username, d.ghnum, base_kind);
        let orig_name = format!("gh/{}/{}/orig", cfg.username, d.ghnum);

        let head_tip = tip(git, &d.head_ref_name)?;
        let base_tip = tip(git, &base_name)?;
        let orig_tip = tip(git, &orig_name)?;

        // The run's decided values must have landed; a mismatch on a pushed
        // branch means the push silently failed, on an unchanged branch that
        // someone else wrote to the slot mid-run.
        for (name, state, remote) in [
            (&d.head_ref_name, &d.branches.head, &head_tip),
            (&base_name, &d.branches.base, &base_tip),
            (&orig_name, &d.branches.orig, &orig_tip),
        ] {
            ensure!(
                remote == state.oid(),
                "internal error: {name} is at {remote}, expected {}{}",
                state.oid(),
                if state.needs_push() {
                    ""
                } else {
                    " (branch changed underneath this run)"
                }
            );
            if !state.needs_push() {
                ensure!(
                    before.get(name.as_str()) == Some(remote),
                    "internal error: {name} moved since the run started"
                );
            }
        }

        let head_tree = git.tree_of(&head_tip)?;
        ensure!(
            head_tree == d.commit.tree,
            "internal error: {} has tree {head_tree}, expected the commit tree {}",
            d.head_ref_name,
            d.commit.tree
        );
        if !cfg.direct {
            let base_tree = git.tree_of(&base_tip)?;
            ensure!(
                base_tree == d.parent_tree,
                "internal error: {base_name} has tree {base_tree}, expected the \
                 stack-parent tree {}",
                d.parent_tree
            );
        }
        ensure!(
            git.is_ancestor(&base_tip, &head_tip)?,
            "internal error: {base_name} is not an ancestor of {}",
            d.head_ref_name
        );

        let orig_tree = git.tree_of(&orig_tip)?;
        ensure!(
            orig_tree == d.commit.tree,
            "internal error: {orig_name} has tree {orig_tree}, expected {}",
            d.commit.tree
        );

        let reference = parse_pull_request_resolved(&d.message, &cfg.host);
        ensure!(
            reference.map(|r| r.number) == Some(d.number),
            "internal error: final message for #{} lost its request reference",
            d.number
        );
    }
    Ok(())
}

fn tip(git: &dyn GitOps, name: &str) -> Result<Oid> {
    git.remote_branch(name)?
        .ok_or_else(|| eyre::eyre!("internal error: branch {name} missing after push"))
}
