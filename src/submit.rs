//! The stack synchronization engine: walks the commit range oldest-first,
//! classifies each commit, synthesizes the per-slot auxiliary branches, and
//! reconciles the remote pull requests with a minimal, idempotent set of
//! pushes.

use std::collections::{BTreeSet, HashMap};

use eyre::{Context, Result, bail, eyre};
use owo_colors::OwoColorize;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::Config;
use crate::diff::{
    COMMENT_ID_KEY, Diff, GhNumber, POISON_MARKER, PULL_REQUEST_KEY, PullRequestResolved,
    SOURCE_ID_KEY,
};
use crate::git::{CommitRecord, GitOps, Oid, PushSpec};
use crate::github::GitHubApi;
use crate::{re, trailers, verify};

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overwrite remote state even when the staleness check fails, and force
    /// head pushes.
    pub force: bool,
    pub draft: bool,
    /// Target branch for the stack; defaults to the configured default branch.
    pub base: Option<String>,
    /// Overwrite remote title/body from the local commit message instead of
    /// preserving remote edits around the stack block.
    pub update_fields: bool,
    /// Re-fetch remote state after pushing and assert structural invariants.
    pub check_invariants: bool,
}

/// The resolved value of one auxiliary branch for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    /// Remote tip is already correct.
    Unchanged(Oid),
    /// Branch does not exist remotely yet.
    ToCreate(Oid),
    /// Branch exists and must move to this commit.
    ToUpdate(Oid),
}

impl BranchState {
    pub fn oid(&self) -> &Oid {
        match self {
            BranchState::Unchanged(oid) | BranchState::ToCreate(oid) | BranchState::ToUpdate(oid) => {
                oid
            }
        }
    }

    pub fn needs_push(&self) -> bool {
        !matches!(self, BranchState::Unchanged(_))
    }
}

/// Per-slot branch states: `orig`, `head`, and `base` (stacked topology) or
/// `next` (direct topology) in the `base` position.
#[derive(Debug, Clone)]
pub struct BranchSet {
    pub base: BranchState,
    pub head: BranchState,
    pub orig: BranchState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Skipped,
}

/// A [`Diff`] merged with remote-fetched state.
#[derive(Debug, Clone)]
pub struct ElaboratedDiff {
    pub diff: Diff,
    pub number: u64,
    pub username: String,
    pub ghnum: GhNumber,
    /// `ghstack-source-id` read back from the remote `orig` branch tip.
    pub remote_source_id: Option<String>,
    pub comment_id: Option<u64>,
    pub title: String,
    pub body: String,
    pub closed: bool,
    pub head_ref: String,
    pub base_ref: String,
    pub orig_tip: Oid,
}

/// The finalized outcome for one submitted commit.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub commit: CommitRecord,
    pub diff: Diff,
    pub ghnum: GhNumber,
    pub number: u64,
    pub url: String,
    /// The commit message with refreshed trailers.
    pub message: String,
    pub branches: BranchSet,
    pub action: Action,
    /// The review request's target branch name.
    pub base_ref_name: String,
    pub head_ref_name: String,
    /// Tree of the stack-parent commit; the base branch tip must carry it.
    pub parent_tree: Oid,
    pub remote_title: Option<String>,
    pub remote_body: Option<String>,
    pub remote_base_ref: Option<String>,
    pub comment_id: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SubmitReport {
    pub decisions: Vec<DecisionRecord>,
    pub skipped_empty: Vec<CommitRecord>,
    /// (commit, request number) pairs whose requests were already closed.
    pub skipped_closed: Vec<(CommitRecord, u64)>,
    /// New tip of the local branch after trailers were embedded, if rewritten.
    pub rewritten_head: Option<Oid>,
}

/// State threaded from one commit's decision to the next. Derived fresh each
/// run; nothing persists between runs except remote branches and trailers.
#[derive(Debug, Clone)]
pub struct StackAccumulator {
    /// The local parent commit of the commit under consideration.
    pub parent_commit: Oid,
    pub parent_tree: Oid,
    /// The parent's resolved state: the previous submitted slot's head tip,
    /// or the stack base commit.
    pub parent_resolved: Oid,
    /// The previous submitted slot's orig tip, or the stack base commit.
    pub prev_orig: Oid,
    /// Nearest preceding slot that was itself submitted: (head ref, head tip).
    pub nearest_submitted: Option<(String, Oid)>,
}

/// The base-resolution outcome for one slot.
pub struct BaseDecision {
    pub state: BranchState,
    /// Additional parent the new head commit must carry beyond the remote
    /// head tip, if any.
    pub head_extra_parent: Option<Oid>,
}

/// Submission topology, selected once per run.
pub trait Topology {
    /// Name of the branch playing the base role: `base` or `next`.
    fn base_kind(&self) -> &'static str;

    /// Whether an already-closed slot aborts the run.
    fn closed_is_fatal(&self) -> bool;

    /// The commit this slot's branches depend on.
    fn dependency(&self, acc: &StackAccumulator, default_tip: &Oid) -> Oid;

    /// The review request's target branch for this slot.
    fn pr_base_ref(&self, cfg: &Config, ghnum: GhNumber, acc: &StackAccumulator) -> String;

    /// Whether a rebuilt head commit drops the dependency parent when it is
    /// already reachable from the previous head tip.
    fn prunes_redundant_head_parent(&self) -> bool;

    fn resolve_base(
        &self,
        git: &dyn GitOps,
        cfg: &Config,
        ghnum: GhNumber,
        acc: &StackAccumulator,
        remote_base: Option<&Oid>,
        default_tip: &Oid,
    ) -> Result<BaseDecision>;
}

/// Stacked topology: each request targets a synthetic per-slot base branch
/// mirroring the parent commit's state.
pub struct Stacked;

/// Direct topology: requests merge straight into the default branch or the
/// preceding submitted slot's head.
pub struct Direct;

impl Topology for Stacked {
    fn base_kind(&self) -> &'static str {
        "base"
    }

    fn closed_is_fatal(&self) -> bool {
        false
    }

    fn dependency(&self, acc: &StackAccumulator, _default_tip: &Oid) -> Oid {
        acc.parent_resolved.clone()
    }

    fn pr_base_ref(&self, cfg: &Config, ghnum: GhNumber, _acc: &StackAccumulator) -> String {
        branch_name(cfg, ghnum, "base")
    }

    // A rebuilt head always records its base as a parent, even when the base
    // did not move; the merge pins the exact base the head was built against.
    fn prunes_redundant_head_parent(&self) -> bool {
        false
    }

    fn resolve_base(
        &self,
        git: &dyn GitOps,
        cfg: &Config,
        ghnum: GhNumber,
        acc: &StackAccumulator,
        remote_base: Option<&Oid>,
        default_tip: &Oid,
    ) -> Result<BaseDecision> {
        let dep = self.dependency(acc, default_tip);
        let Some(rb) = remote_base else {
            return Ok(BaseDecision {
                state: BranchState::ToCreate(dep.clone()),
                head_extra_parent: Some(dep),
            });
        };
        if *rb == dep {
            return Ok(BaseDecision {
                state: BranchState::Unchanged(rb.clone()),
                head_extra_parent: Some(rb.clone()),
            });
        }
        if git.is_ancestor(rb, &dep)? {
            // Fast-forward; no synthetic merge needed.
            return Ok(BaseDecision {
                state: BranchState::ToUpdate(dep.clone()),
                head_extra_parent: Some(dep),
            });
        }
        // Divergent histories: merge parentage (not content) with an empty-diff
        // commit carrying the parent's tree. Also pull in the merge-base with
        // the remote default branch so the request's merge-base stays sane for
        // reviewers after a rebase onto new upstream.
        let mut parents = vec![rb.clone(), dep.clone()];
        let mb = git.merge_base(&acc.parent_commit, default_tip)?;
        if !git.is_ancestor(&mb, rb)? && !git.is_ancestor(&mb, &dep)? {
            parents.push(mb);
        }
        let tree = git.tree_of(&dep)?;
        let name = branch_name(cfg, ghnum, "base");
        let new_base = git.commit_tree(&tree, &parents, &synthetic_message(&name), None)?;
        Ok(BaseDecision {
            state: BranchState::ToUpdate(new_base.clone()),
            head_extra_parent: Some(new_base),
        })
    }
}

impl Topology for Direct {
    fn base_kind(&self) -> &'static str {
        "next"
    }

    fn closed_is_fatal(&self) -> bool {
        true
    }

    fn dependency(&self, acc: &StackAccumulator, default_tip: &Oid) -> Oid {
        acc.nearest_submitted
            .as_ref()
            .map(|(_, oid)| oid.clone())
            .unwrap_or_else(|| default_tip.clone())
    }

    fn pr_base_ref(&self, cfg: &Config, _ghnum: GhNumber, acc: &StackAccumulator) -> String {
        acc.nearest_submitted
            .as_ref()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| cfg.default_branch.clone())
    }

    fn prunes_redundant_head_parent(&self) -> bool {
        true
    }

    fn resolve_base(
        &self,
        git: &dyn GitOps,
        cfg: &Config,
        ghnum: GhNumber,
        acc: &StackAccumulator,
        remote_base: Option<&Oid>,
        default_tip: &Oid,
    ) -> Result<BaseDecision> {
        let dep = self.dependency(acc, default_tip);
        let Some(rn) = remote_base else {
            return Ok(BaseDecision {
                state: BranchState::ToCreate(dep.clone()),
                head_extra_parent: Some(dep),
            });
        };
        if *rn == dep {
            return Ok(BaseDecision {
                state: BranchState::Unchanged(rn.clone()),
                head_extra_parent: Some(rn.clone()),
            });
        }
        if git.is_ancestor(rn, &dep)? {
            return Ok(BaseDecision {
                state: BranchState::ToUpdate(dep.clone()),
                head_extra_parent: Some(dep),
            });
        }
        let tree = git.tree_of(&dep)?;
        let name = branch_name(cfg, ghnum, "next");
        let new_next =
            git.commit_tree(&tree, &[rn.clone(), dep.clone()], &synthetic_message(&name), None)?;
        Ok(BaseDecision {
            state: BranchState::ToUpdate(new_next.clone()),
            head_extra_parent: Some(new_next),
        })
    }
}

fn branch_name(cfg: &Config, ghnum: GhNumber, kind: &str) -> String {
    format!("gh/{}/{}/{}", cfg.username, ghnum, kind)
}

fn synthetic_message(branch: &str) -> String {
    format!("Update {branch}\n\n{POISON_MARKER}")
}

struct Ctx<'a> {
    git: &'a dyn GitOps,
    github: &'a dyn GitHubApi,
    cfg: &'a Config,
    opts: &'a SubmitOptions,
    topo: &'a dyn Topology,
    default_tip: Oid,
}

/// Runs the full synchronization pass. `head_ref` is the fully qualified
/// local branch ref to rewrite once trailers are embedded.
pub fn run(
    git: &dyn GitOps,
    github: &dyn GitHubApi,
    cfg: &Config,
    opts: &SubmitOptions,
    head_ref: &str,
) -> Result<SubmitReport> {
    // Refuse forks before touching any commit: the gh/* namespace belongs to
    // the upstream repository.
    let repo_info = github
        .get(&format!("repos/{}", cfg.repo_path()))
        .wrap_err("Failed to query repository metadata")?;
    if repo_info.get("fork").and_then(Value::as_bool) == Some(true) {
        bail!(
            "{} is a fork; run this from a clone of the upstream repository instead",
            cfg.repo_path()
        );
    }

    // --base retargets everything that would otherwise refer to the default
    // branch, including direct-topology merge targets.
    let cfg_override;
    let cfg = match &opts.base {
        Some(base) => {
            cfg_override = Config { default_branch: base.clone(), ..cfg.clone() };
            &cfg_override
        }
        None => cfg,
    };
    git.fetch_refs(&[format!("gh/{}/*", cfg.username), cfg.default_branch.clone()])?;

    let default_tip = git
        .remote_branch(&cfg.default_branch)?
        .ok_or_else(|| eyre!("remote has no branch '{}'", cfg.default_branch))?;
    let head = git
        .resolve("HEAD")?
        .ok_or_else(|| eyre!("HEAD does not point at a commit"))?;
    let stack_base = git.merge_base(&head, &default_tip)?;

    let mut commits = git.rev_list_range(&stack_base, &head)?;
    commits.retain(|c| !c.boundary);
    commits.reverse();
    if commits.is_empty() {
        log::info!("No commits to submit; HEAD does not diverge from {}.", cfg.default_branch);
        return Ok(SubmitReport::default());
    }

    // Snapshot the slot namespace up front: it both allocates fresh slot
    // numbers and anchors the post-push force-push check.
    let namespace = git.list_remote_refs(&format!("gh/{}/*", cfg.username))?;
    let snapshot: HashMap<String, Oid> = namespace.iter().cloned().collect();
    let mut next_free = next_free_slot(&namespace, &cfg.username);

    let topo: &dyn Topology = if cfg.direct { &Direct } else { &Stacked };
    let ctx = Ctx { git, github, cfg, opts, topo, default_tip };

    let mut report = SubmitReport::default();
    let mut seen = BTreeSet::new();
    let mut acc = StackAccumulator {
        parent_commit: stack_base.clone(),
        parent_tree: git.tree_of(&stack_base)?,
        parent_resolved: stack_base.clone(),
        prev_orig: stack_base,
        nearest_submitted: None,
    };

    for c in &commits {
        if c.message.contains(POISON_MARKER) {
            bail!(
                "commit {} contains '{POISON_MARKER}'. This usually means you are working \
                 directly on an internal gh/{}/N/head or .../base branch; check out the \
                 corresponding .../orig branch instead",
                c.oid,
                ctx.cfg.username
            );
        }
        c.sole_parent()?;

        let diff = Diff::from_commit(c, &ctx.cfg.host);

        if diff.tree == acc.parent_tree {
            log::warn!("Skipping commit {} ({}): it is empty", c.oid, c.title());
            report.skipped_empty.push(c.clone());
            acc.parent_commit = c.oid.clone();
            continue;
        }

        let decision = match diff.pull_request_resolved.clone() {
            Some(resolved) => {
                if resolved.owner != ctx.cfg.owner || resolved.repo != ctx.cfg.repo {
                    bail!(
                        "commit {} references {}/{}#{}, but this repository is {}; \
                         run `ghstack unlink` on it before submitting",
                        c.oid,
                        resolved.owner,
                        resolved.repo,
                        resolved.number,
                        ctx.cfg.repo_path()
                    );
                }
                let elaborated = elaborate_diff(ctx.git, ctx.github, ctx.cfg, &diff, &resolved)?;
                if !seen.insert(elaborated.ghnum) {
                    bail!(
                        "two commits in this stack claim slot gh/{}/{}; this indicates \
                         corrupted history (a duplicated Pull-Request trailer, e.g. from a \
                         cherry-pick). Run `ghstack unlink` on one of them",
                        ctx.cfg.username,
                        elaborated.ghnum
                    );
                }
                if elaborated.closed {
                    if ctx.topo.closed_is_fatal() {
                        bail!(
                            "pull request #{} is closed, and in direct topology later commits \
                             may depend on it; drop commit {} from the stack first",
                            elaborated.number,
                            c.oid
                        );
                    }
                    log::warn!(
                        "Skipping commit {}: pull request #{} is already closed",
                        c.oid,
                        elaborated.number
                    );
                    report.skipped_closed.push((c.clone(), elaborated.number));
                    acc.parent_commit = c.oid.clone();
                    acc.parent_tree = c.tree.clone();
                    continue;
                }
                process_existing(&ctx, c, diff, elaborated, &acc)?
            }
            None => {
                let ghnum = GhNumber(next_free);
                next_free += 1;
                seen.insert(ghnum);
                process_new(&ctx, c, diff, &acc, ghnum)?
            }
        };

        acc.parent_commit = c.oid.clone();
        acc.parent_tree = c.tree.clone();
        acc.parent_resolved = decision.branches.head.oid().clone();
        acc.prev_orig = decision.branches.orig.oid().clone();
        acc.nearest_submitted =
            Some((decision.head_ref_name.clone(), decision.branches.head.oid().clone()));
        report.decisions.push(decision);
    }

    push_updates(&ctx, &report.decisions)?;
    update_pull_requests(&ctx, &report.decisions)?;
    report.rewritten_head = rewrite_local_range(&ctx, head_ref, &commits, &report)?;

    if opts.check_invariants {
        verify::check(git, cfg, &report, &snapshot)?;
    }

    Ok(report)
}

fn next_free_slot(namespace: &[(String, Oid)], username: &str) -> u64 {
    let prefix = format!("gh/{username}/");
    namespace
        .iter()
        .filter_map(|(name, _)| {
            name.strip_prefix(&prefix)?
                .strip_suffix("/head")?
                .parse::<u64>()
                .ok()
        })
        .max()
        .unwrap_or(0)
        + 1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestInfo {
    title: String,
    body: String,
    closed: bool,
    head_ref_name: String,
    base_ref_name: String,
}

const PULL_REQUEST_INFO_QUERY: &str = "\
query PullRequestInfo($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      title
      body
      closed
      headRefName
      baseRefName
    }
  }
}";

/// Cross-validates a commit's review-request reference against live remote
/// state and recovers the remote content identity from the `orig` branch.
pub fn elaborate_diff(
    git: &dyn GitOps,
    github: &dyn GitHubApi,
    cfg: &Config,
    diff: &Diff,
    resolved: &PullRequestResolved,
) -> Result<ElaboratedDiff> {
    let data = github.graphql(
        PULL_REQUEST_INFO_QUERY,
        json!({ "owner": cfg.owner, "name": cfg.repo, "number": resolved.number }),
    )?;
    let node = &data["repository"]["pullRequest"];
    if node.is_null() {
        bail!(
            "commit {} references pull request #{}, which does not exist on {}; \
             run `ghstack unlink` on it and resubmit",
            diff.oid,
            resolved.number,
            cfg.repo_path()
        );
    }
    let pr: PullRequestInfo = serde_json::from_value(node.clone())
        .wrap_err("failed to parse pull request metadata")?;

    re!(head_ref_re, r"^gh/([^/]+)/([0-9]+)/head$");
    let Some(caps) = head_ref_re().captures(&pr.head_ref_name) else {
        if pr.head_ref_name.starts_with("gh/") {
            bail!(
                "pull request #{} has head branch '{}', which does not match \
                 gh/<username>/<number>/head; its association looks manually broken. \
                 Run `ghstack unlink` on commit {} and resubmit",
                resolved.number,
                pr.head_ref_name,
                diff.oid
            );
        }
        bail!(
            "pull request #{} (head branch '{}') was not created by this tool; \
             run `ghstack unlink` on commit {} to detach it",
            resolved.number,
            pr.head_ref_name,
            diff.oid
        );
    };
    let username = caps[1].to_string();
    let ghnum = GhNumber(caps[2].parse()?);
    if username != cfg.username {
        bail!(
            "pull request #{} belongs to @{}, not @{}; you cannot resubmit someone \
             else's stack. Run `ghstack unlink` on commit {} to take it over as a new \
             pull request",
            resolved.number,
            username,
            cfg.username,
            diff.oid
        );
    }

    let orig_name = format!("gh/{username}/{ghnum}/orig");
    let Some(orig_tip) = git.remote_branch(&orig_name)? else {
        if pr.closed {
            bail!(
                "cannot resync commit {}: pull request #{} is closed and its {} branch \
                 was deleted. Reopen the pull request, or run `ghstack unlink` to submit \
                 the commit as a new request",
                diff.oid,
                resolved.number,
                orig_name
            );
        }
        bail!("could not find branch {orig_name} on the remote; was it deleted?");
    };
    let orig_commit = git.read_commit(&orig_tip)?;
    let remote_source_id = trailers::trailer_value(&orig_commit.message, SOURCE_ID_KEY);
    let comment_id = trailers::trailer_value(&orig_commit.message, COMMENT_ID_KEY)
        .and_then(|v| v.parse().ok());

    Ok(ElaboratedDiff {
        diff: diff.clone(),
        number: resolved.number,
        username,
        ghnum,
        remote_source_id,
        comment_id,
        title: pr.title,
        body: pr.body,
        closed: pr.closed,
        head_ref: pr.head_ref_name,
        base_ref: pr.base_ref_name,
        orig_tip,
    })
}

#[derive(Deserialize)]
struct CreatedPullRequest {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct CreatedComment {
    id: u64,
}

fn process_new(
    ctx: &Ctx<'_>,
    c: &CommitRecord,
    diff: Diff,
    acc: &StackAccumulator,
    ghnum: GhNumber,
) -> Result<DecisionRecord> {
    let base_name = branch_name(ctx.cfg, ghnum, ctx.topo.base_kind());
    let head_name = branch_name(ctx.cfg, ghnum, "head");

    let dep = ctx.topo.dependency(acc, &ctx.default_tip);
    let head_commit = ctx.git.commit_tree(
        &c.tree,
        std::slice::from_ref(&dep),
        &format!("{}\n\n{POISON_MARKER}", c.title()),
        None,
    )?;

    // The request cannot be opened until its refs exist, so this slot's base
    // and head go out now; the orig branch follows in the batched push once
    // the request number is known.
    ctx.git.push(&[
        PushSpec { oid: dep.clone(), remote_ref: base_name.clone(), force: false },
        PushSpec { oid: head_commit.clone(), remote_ref: head_name.clone(), force: false },
    ])?;

    let pr_base_ref = ctx.topo.pr_base_ref(ctx.cfg, ghnum, acc);
    let body = trailers::parse(&c.message).body;
    let created: CreatedPullRequest = serde_json::from_value(ctx.github.post(
        &format!("repos/{}/pulls", ctx.cfg.repo_path()),
        json!({
            "title": diff.title,
            "head": head_name,
            "base": pr_base_ref,
            "body": body,
            "draft": ctx.opts.draft,
        }),
    )?)
    .wrap_err("failed to parse pull request creation response")?;
    log::info!("Created pull request #{} for {}", created.number, c.title());

    let mut message = trailers::set_trailer(&c.message, SOURCE_ID_KEY, c.tree.as_str());
    let mut comment_id = None;
    if ctx.cfg.direct {
        let comment: CreatedComment = serde_json::from_value(ctx.github.post(
            &format!("repos/{}/issues/{}/comments", ctx.cfg.repo_path(), created.number),
            json!({ "body": stack_comment_placeholder(created.number) }),
        )?)
        .wrap_err("failed to parse comment creation response")?;
        comment_id = Some(comment.id);
        message = trailers::set_trailer(&message, COMMENT_ID_KEY, &comment.id.to_string());
    }
    let resolved = PullRequestResolved {
        host: ctx.cfg.host.clone(),
        owner: ctx.cfg.owner.clone(),
        repo: ctx.cfg.repo.clone(),
        number: created.number,
    };
    let message = trailers::set_trailer(&message, PULL_REQUEST_KEY, &resolved.url());

    let orig_commit = ctx.git.commit_tree(
        &c.tree,
        std::slice::from_ref(&acc.prev_orig),
        &message,
        Some((&c.author_name, &c.author_email)),
    )?;

    Ok(DecisionRecord {
        commit: c.clone(),
        diff,
        ghnum,
        number: created.number,
        url: created.html_url,
        message,
        branches: BranchSet {
            base: BranchState::ToCreate(dep),
            head: BranchState::ToCreate(head_commit),
            orig: BranchState::ToCreate(orig_commit),
        },
        action: Action::Created,
        base_ref_name: pr_base_ref.clone(),
        head_ref_name: head_name,
        parent_tree: acc.parent_tree.clone(),
        remote_title: Some(c.title().to_string()),
        remote_body: Some(trailers::parse(&c.message).body),
        remote_base_ref: Some(pr_base_ref),
        comment_id,
    })
}

fn process_existing(
    ctx: &Ctx<'_>,
    c: &CommitRecord,
    diff: Diff,
    elaborated: ElaboratedDiff,
    acc: &StackAccumulator,
) -> Result<DecisionRecord> {
    let ghnum = elaborated.ghnum;
    let base_name = branch_name(ctx.cfg, ghnum, ctx.topo.base_kind());
    let head_name = branch_name(ctx.cfg, ghnum, "head");

    let head_tip = ctx.git.remote_branch(&head_name)?.ok_or_else(|| {
        eyre!("could not find branch {head_name} on the remote; was it deleted?")
    })?;
    let remote_base = ctx.git.remote_branch(&base_name)?;

    // Staleness: the source id on the remote orig branch is the sole
    // indicator that someone else updated the request since our last sync.
    let mut message = c.message.clone();
    match &diff.source_id {
        None => {
            log::warn!(
                "commit {} has no {SOURCE_ID_KEY} trailer (submitted with an older \
                 version?); assuming it is up to date and adding one",
                c.oid
            );
        }
        Some(local) => {
            if let Some(remote) = &elaborated.remote_source_id
                && local != remote
                && !ctx.opts.force
            {
                bail!(
                    "commit {} (pull request #{}) is out of date: local {SOURCE_ID_KEY} is \
                     {local} but the remote has {remote}. The request was updated from \
                     somewhere else since your last sync; rebase onto gh/{}/{}/orig to pick \
                     up those changes, or pass --force to overwrite them",
                    c.oid,
                    elaborated.number,
                    ctx.cfg.username,
                    ghnum
                );
            }
        }
    }
    // Leave the message byte-identical when the trailers are already fresh so
    // unchanged commits keep their ids.
    if trailers::trailer_value(&message, SOURCE_ID_KEY).as_deref() != Some(c.tree.as_str()) {
        message = trailers::set_trailer(&message, SOURCE_ID_KEY, c.tree.as_str());
    }
    let mut comment_id = elaborated.comment_id;
    if ctx.cfg.direct {
        if comment_id.is_none() {
            let comment: CreatedComment = serde_json::from_value(ctx.github.post(
                &format!("repos/{}/issues/{}/comments", ctx.cfg.repo_path(), elaborated.number),
                json!({ "body": stack_comment_placeholder(elaborated.number) }),
            )?)
            .wrap_err("failed to parse comment creation response")?;
            comment_id = Some(comment.id);
        }
        let id = comment_id.unwrap_or_default().to_string();
        if trailers::trailer_value(&message, COMMENT_ID_KEY).as_deref() != Some(id.as_str()) {
            message = trailers::set_trailer(&message, COMMENT_ID_KEY, &id);
        }
    }

    let base = ctx.topo.resolve_base(
        ctx.git,
        ctx.cfg,
        ghnum,
        acc,
        remote_base.as_ref(),
        &ctx.default_tip,
    )?;

    let tree_changed = c.tree != ctx.git.tree_of(&head_tip)?;
    let head = if base.state.needs_push() || tree_changed {
        let mut parents = vec![head_tip.clone()];
        if let Some(extra) = &base.head_extra_parent
            && !(ctx.topo.prunes_redundant_head_parent() && ctx.git.is_ancestor(extra, &head_tip)?)
        {
            parents.push(extra.clone());
        }
        let new_head =
            ctx.git.commit_tree(&c.tree, &parents, &synthetic_message(&head_name), None)?;
        BranchState::ToUpdate(new_head)
    } else {
        BranchState::Unchanged(head_tip)
    };

    // The orig chain is always recomputed, but structurally compared against
    // the remote tip so an unchanged slot issues no push.
    let orig_commit = ctx.git.read_commit(&elaborated.orig_tip)?;
    let orig_fresh = orig_commit.tree == c.tree
        && orig_commit.message.trim_end() == message.trim_end()
        && orig_commit.parents.as_slice() == std::slice::from_ref(&acc.prev_orig);
    let orig = if orig_fresh {
        BranchState::Unchanged(elaborated.orig_tip.clone())
    } else {
        let new_orig = ctx.git.commit_tree(
            &c.tree,
            std::slice::from_ref(&acc.prev_orig),
            &message,
            Some((&c.author_name, &c.author_email)),
        )?;
        BranchState::ToUpdate(new_orig)
    };

    let action = if !base.state.needs_push()
        && !head.needs_push()
        && !orig.needs_push()
        && message == c.message
    {
        Action::Skipped
    } else {
        Action::Updated
    };

    let url = PullRequestResolved {
        host: ctx.cfg.host.clone(),
        owner: ctx.cfg.owner.clone(),
        repo: ctx.cfg.repo.clone(),
        number: elaborated.number,
    }
    .url();

    Ok(DecisionRecord {
        commit: c.clone(),
        number: elaborated.number,
        url,
        ghnum,
        message,
        branches: BranchSet { base: base.state, head, orig },
        action,
        base_ref_name: ctx.topo.pr_base_ref(ctx.cfg, ghnum, acc),
        head_ref_name: head_name,
        parent_tree: acc.parent_tree.clone(),
        remote_title: Some(elaborated.title.clone()),
        remote_body: Some(elaborated.body.clone()),
        remote_base_ref: Some(elaborated.base_ref.clone()),
        comment_id,
        diff,
    })
}

/// Pushes branch updates grouped and ordered base → head → orig. Pushing head
/// before base would make the remote briefly report unrelated commits as part
/// of the request. Orig is a rewritten linear history and is always forced.
fn push_updates(ctx: &Ctx<'_>, decisions: &[DecisionRecord]) -> Result<()> {
    // ToCreate base/head pairs were pushed when their request was opened.
    let bases: Vec<PushSpec> = decisions
        .iter()
        .filter(|d| matches!(d.branches.base, BranchState::ToUpdate(_)))
        .map(|d| PushSpec {
            oid: d.branches.base.oid().clone(),
            remote_ref: branch_name(ctx.cfg, d.ghnum, ctx.topo.base_kind()),
            force: false,
        })
        .collect();
    let heads: Vec<PushSpec> = decisions
        .iter()
        .filter(|d| matches!(d.branches.head, BranchState::ToUpdate(_)))
        .map(|d| PushSpec {
            oid: d.branches.head.oid().clone(),
            remote_ref: d.head_ref_name.clone(),
            force: ctx.opts.force,
        })
        .collect();
    let origs: Vec<PushSpec> = decisions
        .iter()
        .filter(|d| d.branches.orig.needs_push())
        .map(|d| PushSpec {
            oid: d.branches.orig.oid().clone(),
            remote_ref: branch_name(ctx.cfg, d.ghnum, "orig"),
            force: true,
        })
        .collect();

    ctx.git.push(&bases).wrap_err("Failed to push base branches")?;
    ctx.git.push(&heads).wrap_err("Failed to push head branches")?;
    ctx.git.push(&origs).wrap_err("Failed to push orig branches")?;
    Ok(())
}

const STACK_HEADER: &str =
    "Stack from [ghstack](https://github.com/ezyang/ghstack) (oldest at bottom):";

re!(
    stack_block_re,
    r"(?m)^Stack from \[ghstack\][^\r\n]*:\r?\n(?:\* [^\r\n]*\r?\n?)+"
);

/// The machine-generated stack-position block, newest slot first, the current
/// request marked with an arrow.
fn stack_block(decisions: &[DecisionRecord], current: u64) -> String {
    let mut block = String::from(STACK_HEADER);
    block.push('\n');
    for d in decisions.iter().rev() {
        if d.number == current {
            block.push_str(&format!("* __->__ #{}\n", d.number));
        } else {
            block.push_str(&format!("* #{}\n", d.number));
        }
    }
    block
}

fn stack_comment_placeholder(number: u64) -> String {
    format!("{STACK_HEADER}\n* __->__ #{number}\n")
}

/// Substitutes the stack block inside a body, preserving all other content
/// verbatim; prepends the block when no delimiter is present.
fn splice_stack_block(body: &str, block: &str) -> String {
    if stack_block_re().is_match(body) {
        stack_block_re().replace(body, block).into_owned()
    } else if body.trim().is_empty() {
        block.to_string()
    } else {
        format!("{block}\n{body}")
    }
}

/// Patches remote request metadata (title/body/base, and the side comment in
/// direct topology) for every non-closed slot.
fn update_pull_requests(ctx: &Ctx<'_>, decisions: &[DecisionRecord]) -> Result<()> {
    for d in decisions {
        let block = stack_block(decisions, d.number);

        let title = if ctx.opts.update_fields {
            d.diff.title.clone()
        } else {
            d.remote_title.clone().unwrap_or_else(|| d.diff.title.clone())
        };
        let body_source = if ctx.opts.update_fields {
            trailers::parse(&d.message).body
        } else {
            d.remote_body.clone().unwrap_or_default()
        };
        let body = splice_stack_block(&body_source, &block);

        let mut payload = serde_json::Map::new();
        if Some(&title) != d.remote_title.as_ref() {
            payload.insert("title".to_string(), json!(title));
        }
        if Some(&body) != d.remote_body.as_ref() {
            payload.insert("body".to_string(), json!(body));
        }
        if Some(&d.base_ref_name) != d.remote_base_ref.as_ref() {
            payload.insert("base".to_string(), json!(d.base_ref_name));
        }
        if !payload.is_empty() {
            ctx.github
                .patch(
                    &format!("repos/{}/pulls/{}", ctx.cfg.repo_path(), d.number),
                    Value::Object(payload),
                )
                .wrap_err_with(|| format!("Failed to update pull request #{}", d.number))?;
        }

        if ctx.cfg.direct
            && let Some(comment_id) = d.comment_id
            && d.action != Action::Skipped
        {
            ctx.github
                .patch(
                    &format!("repos/{}/issues/comments/{}", ctx.cfg.repo_path(), comment_id),
                    json!({ "body": block }),
                )
                .wrap_err_with(|| format!("Failed to update stack comment on #{}", d.number))?;
        }
    }
    Ok(())
}

/// Rewrites the submitted range (only) so the commits carry their refreshed
/// trailers, then moves the local branch ref. Commits with untouched messages
/// keep their ids until a rewritten ancestor forces a reparent.
fn rewrite_local_range(
    ctx: &Ctx<'_>,
    head_ref: &str,
    commits: &[CommitRecord],
    report: &SubmitReport,
) -> Result<Option<Oid>> {
    let messages: HashMap<&Oid, &str> = report
        .decisions
        .iter()
        .map(|d| (&d.commit.oid, d.message.as_str()))
        .collect();

    let Some(first) = commits.first() else {
        return Ok(None);
    };
    let mut new_parent = first.sole_parent()?.clone();
    let mut changed = false;
    for c in commits {
        let message = messages.get(&c.oid).copied().unwrap_or(c.message.as_str());
        if !changed && message == c.message {
            new_parent = c.oid.clone();
            continue;
        }
        new_parent = ctx.git.commit_tree(
            &c.tree,
            std::slice::from_ref(&new_parent),
            message,
            Some((&c.author_name, &c.author_email)),
        )?;
        changed = true;
    }
    if !changed {
        return Ok(None);
    }
    ctx.git.update_ref(head_ref, &new_parent)?;
    log::info!("Updated {head_ref} with refreshed commit trailers");
    Ok(Some(new_parent))
}

/// Renders the human-readable end-of-run summary.
pub fn print_summary(report: &SubmitReport) {
    for d in &report.decisions {
        let label = match d.action {
            Action::Created => "Created".green().to_string(),
            Action::Updated => "Updated".yellow().to_string(),
            Action::Skipped => "Skipped".dimmed().to_string(),
        };
        println!(
            "{label} {} {} ({})",
            format!("#{}", d.number).bold(),
            d.diff.title,
            d.url.blue().underline()
        );
    }
    for (c, number) in &report.skipped_closed {
        println!(
            "{} {} {} (already closed)",
            "Skipped".dimmed(),
            format!("#{number}").bold(),
            c.title()
        );
    }
    if !report.skipped_empty.is_empty() {
        log::warn!(
            "{} commit(s) had no changes relative to their parent and were not submitted:",
            report.skipped_empty.len()
        );
        for c in &report.skipped_empty {
            log::warn!("  {} {}", c.oid, c.title());
        }
        log::warn!("Rebase to drop or amend them if this is unexpected.");
    }
}
