//! In-memory [`GitOps`] and [`GitHubApi`] implementations so scenario tests
//! can drive full submit runs without a network or a real repository.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

use eyre::{Result, bail, eyre};
use serde_json::{Value, json};

use ghstack::config::Config;
use ghstack::git::{CommitRecord, GitOps, Oid, PushSpec};
use ghstack::github::GitHubApi;
use ghstack::submit::{self, SubmitOptions, SubmitReport};

/// Deterministic tree id derived from a content token, so two commits built
/// from the same token compare as content-identical.
pub fn tree(token: &str) -> Oid {
    let mut hex: String = token.bytes().map(|b| format!("{b:02x}")).collect();
    hex.truncate(40);
    Oid::new(format!("{hex:0>40}"))
}

#[derive(Default)]
struct GitState {
    commits: HashMap<Oid, CommitRecord>,
    /// Local refs, fully qualified.
    local_refs: HashMap<String, Oid>,
    /// Remote branches by short name.
    remote_refs: HashMap<String, Oid>,
    head_ref: String,
    next_oid: u64,
    pushed: usize,
}

impl GitState {
    fn new_oid(&mut self) -> Oid {
        self.next_oid += 1;
        Oid::new(format!("{:040x}", self.next_oid))
    }
}

fn ancestor_of(st: &GitState, ancestor: &Oid, descendant: &Oid) -> bool {
    let mut queue = VecDeque::from([descendant.clone()]);
    let mut seen = HashSet::new();
    while let Some(oid) = queue.pop_front() {
        if oid == *ancestor {
            return true;
        }
        if !seen.insert(oid.clone()) {
            continue;
        }
        if let Some(rec) = st.commits.get(&oid) {
            queue.extend(rec.parents.iter().cloned());
        }
    }
    false
}

#[derive(Default)]
pub struct FakeGit {
    state: RefCell<GitState>,
}

impl FakeGit {
    pub fn commit(&self, parents: &[&Oid], tree_token: &str, message: &str) -> Oid {
        let mut st = self.state.borrow_mut();
        let oid = st.new_oid();
        st.commits.insert(
            oid.clone(),
            CommitRecord {
                oid: oid.clone(),
                tree: tree(tree_token),
                parents: parents.iter().map(|p| (*p).clone()).collect(),
                author_name: "Test User".to_string(),
                author_email: "test@example.com".to_string(),
                message: message.trim_end().to_string(),
                boundary: false,
            },
        );
        oid
    }

    pub fn checkout(&self, branch: &str, oid: &Oid) {
        let mut st = self.state.borrow_mut();
        let name = format!("refs/heads/{branch}");
        st.local_refs.insert(name.clone(), oid.clone());
        st.head_ref = name;
    }

    pub fn head(&self) -> Oid {
        let st = self.state.borrow();
        st.local_refs[&st.head_ref].clone()
    }

    pub fn set_remote(&self, name: &str, oid: &Oid) {
        self.state.borrow_mut().remote_refs.insert(name.to_string(), oid.clone());
    }

    pub fn remote(&self, name: &str) -> Option<Oid> {
        self.state.borrow().remote_refs.get(name).cloned()
    }

    pub fn remove_remote(&self, name: &str) {
        self.state.borrow_mut().remote_refs.remove(name);
    }

    pub fn commit_record(&self, oid: &Oid) -> CommitRecord {
        self.state.borrow().commits[oid].clone()
    }

    /// Total refspecs pushed so far.
    pub fn pushed(&self) -> usize {
        self.state.borrow().pushed
    }
}

impl GitOps for FakeGit {
    fn resolve(&self, rev: &str) -> Result<Option<Oid>> {
        let st = self.state.borrow();
        let name = if rev == "HEAD" { st.head_ref.clone() } else { rev.to_string() };
        if let Some(oid) = st.local_refs.get(&name) {
            return Ok(Some(oid.clone()));
        }
        let oid = Oid::new(rev);
        Ok(st.commits.contains_key(&oid).then_some(oid))
    }

    fn remote_branch(&self, name: &str) -> Result<Option<Oid>> {
        Ok(self.state.borrow().remote_refs.get(name).cloned())
    }

    fn fetch_refs(&self, _globs: &[String]) -> Result<()> {
        // Remote refs are authoritative in-memory; nothing to transfer.
        Ok(())
    }

    fn read_commit(&self, oid: &Oid) -> Result<CommitRecord> {
        self.state
            .borrow()
            .commits
            .get(oid)
            .cloned()
            .ok_or_else(|| eyre!("no commit {oid}"))
    }

    fn rev_list_range(&self, base: &Oid, head: &Oid) -> Result<Vec<CommitRecord>> {
        let st = self.state.borrow();
        let mut out = Vec::new();
        let mut cur = head.clone();
        while cur != *base {
            let rec = st.commits.get(&cur).ok_or_else(|| eyre!("no commit {cur}"))?.clone();
            cur = rec
                .parents
                .first()
                .cloned()
                .ok_or_else(|| eyre!("hit a root commit before reaching {base}"))?;
            out.push(rec);
        }
        let mut boundary = st.commits.get(base).ok_or_else(|| eyre!("no commit {base}"))?.clone();
        boundary.boundary = true;
        out.push(boundary);
        Ok(out)
    }

    fn commit_tree(
        &self,
        tree: &Oid,
        parents: &[Oid],
        message: &str,
        author: Option<(&str, &str)>,
    ) -> Result<Oid> {
        // Synthesized commits fall back to the committer identity, so tests
        // can tell them apart from rewritten user commits.
        let (name, email) = author.unwrap_or(("Test Committer", "committer@example.com"));
        let mut st = self.state.borrow_mut();
        let oid = st.new_oid();
        st.commits.insert(
            oid.clone(),
            CommitRecord {
                oid: oid.clone(),
                tree: tree.clone(),
                parents: parents.to_vec(),
                author_name: name.to_string(),
                author_email: email.to_string(),
                message: message.trim_end().to_string(),
                boundary: false,
            },
        );
        Ok(oid)
    }

    fn merge_base(&self, a: &Oid, b: &Oid) -> Result<Oid> {
        let st = self.state.borrow();
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([a.clone()]);
        while let Some(oid) = queue.pop_front() {
            if !reachable.insert(oid.clone()) {
                continue;
            }
            if let Some(rec) = st.commits.get(&oid) {
                queue.extend(rec.parents.iter().cloned());
            }
        }
        let mut queue = VecDeque::from([b.clone()]);
        let mut seen = HashSet::new();
        while let Some(oid) = queue.pop_front() {
            if reachable.contains(&oid) {
                return Ok(oid);
            }
            if !seen.insert(oid.clone()) {
                continue;
            }
            if let Some(rec) = st.commits.get(&oid) {
                queue.extend(rec.parents.iter().cloned());
            }
        }
        bail!("{a} and {b} have no merge base")
    }

    fn is_ancestor(&self, ancestor: &Oid, descendant: &Oid) -> Result<bool> {
        Ok(ancestor_of(&self.state.borrow(), ancestor, descendant))
    }

    fn list_remote_refs(&self, glob: &str) -> Result<Vec<(String, Oid)>> {
        let (prefix, suffix) = glob.split_once('*').unwrap_or((glob, ""));
        Ok(self
            .state
            .borrow()
            .remote_refs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix) && name.ends_with(suffix))
            .map(|(name, oid)| (name.clone(), oid.clone()))
            .collect())
    }

    fn push(&self, specs: &[PushSpec]) -> Result<()> {
        let mut st = self.state.borrow_mut();
        for spec in specs {
            if !st.commits.contains_key(&spec.oid) {
                bail!("push of unknown object {} to {}", spec.oid, spec.remote_ref);
            }
            if !spec.force
                && let Some(existing) = st.remote_refs.get(&spec.remote_ref)
                && *existing != spec.oid
                && !ancestor_of(&st, existing, &spec.oid)
            {
                bail!("non-fast-forward push to {}", spec.remote_ref);
            }
            st.remote_refs.insert(spec.remote_ref.clone(), spec.oid.clone());
            st.pushed += 1;
        }
        Ok(())
    }

    fn update_ref(&self, name: &str, oid: &Oid) -> Result<()> {
        self.state.borrow_mut().local_refs.insert(name.to_string(), oid.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakePr {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub draft: bool,
    pub closed: bool,
}

struct GitHubState {
    prs: HashMap<u64, FakePr>,
    comments: HashMap<u64, String>,
    next_number: u64,
    next_comment: u64,
    fork: bool,
    patches: usize,
}

impl Default for GitHubState {
    fn default() -> GitHubState {
        GitHubState {
            prs: HashMap::new(),
            comments: HashMap::new(),
            next_number: 100,
            next_comment: 9000,
            fork: false,
            patches: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeGitHub {
    state: RefCell<GitHubState>,
}

impl FakeGitHub {
    pub fn pr(&self, number: u64) -> FakePr {
        self.state.borrow().prs[&number].clone()
    }

    pub fn pr_count(&self) -> usize {
        self.state.borrow().prs.len()
    }

    pub fn insert_pr(&self, pr: FakePr) {
        self.state.borrow_mut().prs.insert(pr.number, pr);
    }

    pub fn close(&self, number: u64) {
        self.state.borrow_mut().prs.get_mut(&number).unwrap().closed = true;
    }

    pub fn set_fork(&self, fork: bool) {
        self.state.borrow_mut().fork = fork;
    }

    pub fn patches(&self) -> usize {
        self.state.borrow().patches
    }

    pub fn comment(&self, id: u64) -> String {
        self.state.borrow().comments[&id].clone()
    }

    pub fn comment_count(&self) -> usize {
        self.state.borrow().comments.len()
    }
}

impl GitHubApi for FakeGitHub {
    fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        if !query.contains("pullRequest") {
            bail!("unexpected GraphQL query: {query}");
        }
        let number = variables["number"].as_u64().ok_or_else(|| eyre!("missing number"))?;
        let st = self.state.borrow();
        let node = match st.prs.get(&number) {
            None => Value::Null,
            Some(pr) => json!({
                "title": pr.title,
                "body": pr.body,
                "closed": pr.closed,
                "headRefName": pr.head,
                "baseRefName": pr.base,
            }),
        };
        Ok(json!({ "repository": { "pullRequest": node } }))
    }

    fn get(&self, path: &str) -> Result<Value> {
        if path.starts_with("repos/") && path.matches('/').count() == 2 {
            return Ok(json!({ "fork": self.state.borrow().fork }));
        }
        bail!("unexpected GET {path}")
    }

    fn post(&self, path: &str, body: Value) -> Result<Value> {
        let mut st = self.state.borrow_mut();
        if let Some(repo_path) = path.strip_prefix("repos/").and_then(|p| p.strip_suffix("/pulls"))
        {
            let number = st.next_number;
            st.next_number += 1;
            let pr = FakePr {
                number,
                title: body["title"].as_str().unwrap_or_default().to_string(),
                body: body["body"].as_str().unwrap_or_default().to_string(),
                head: body["head"].as_str().unwrap_or_default().to_string(),
                base: body["base"].as_str().unwrap_or_default().to_string(),
                draft: body["draft"].as_bool().unwrap_or(false),
                closed: false,
            };
            st.prs.insert(number, pr);
            return Ok(json!({
                "number": number,
                "html_url": format!("https://github.com/{repo_path}/pull/{number}"),
            }));
        }
        if path.contains("/issues/") && path.ends_with("/comments") {
            let id = st.next_comment;
            st.next_comment += 1;
            st.comments.insert(id, body["body"].as_str().unwrap_or_default().to_string());
            return Ok(json!({ "id": id }));
        }
        bail!("unexpected POST {path}")
    }

    fn patch(&self, path: &str, body: Value) -> Result<Value> {
        let mut st = self.state.borrow_mut();
        st.patches += 1;
        if let Some(rest) = path.split("/pulls/").nth(1) {
            let number: u64 = rest.parse()?;
            let pr = st.prs.get_mut(&number).ok_or_else(|| eyre!("no pull request {number}"))?;
            if let Some(title) = body["title"].as_str() {
                pr.title = title.to_string();
            }
            if let Some(text) = body["body"].as_str() {
                pr.body = text.to_string();
            }
            if let Some(base) = body["base"].as_str() {
                pr.base = base.to_string();
            }
            return Ok(json!({ "number": number }));
        }
        if let Some(rest) = path.split("/comments/").nth(1) {
            let id: u64 = rest.parse()?;
            st.comments.insert(id, body["body"].as_str().unwrap_or_default().to_string());
            return Ok(json!({ "id": id }));
        }
        bail!("unexpected PATCH {path}")
    }
}

pub struct Harness {
    pub git: FakeGit,
    pub github: FakeGitHub,
    pub cfg: Config,
    /// Tip of the remote default branch seeded by [`harness`].
    pub main_tip: Oid,
}

impl Harness {
    pub fn submit(&self) -> Result<SubmitReport> {
        self.submit_with(&SubmitOptions::default())
    }

    pub fn submit_with(&self, opts: &SubmitOptions) -> Result<SubmitReport> {
        submit::run(&self.git, &self.github, &self.cfg, opts, "refs/heads/feature")
    }
}

/// A repository with one commit on the remote `main` branch.
pub fn harness() -> Harness {
    let git = FakeGit::default();
    let main_tip = git.commit(&[], "base", "Initial commit");
    git.set_remote("main", &main_tip);
    Harness {
        git,
        github: FakeGitHub::default(),
        cfg: Config {
            username: "alice".to_string(),
            remote_name: "origin".to_string(),
            default_branch: "main".to_string(),
            host: "github.com".to_string(),
            owner: "alice".to_string(),
            repo: "proj".to_string(),
            direct: false,
        },
        main_tip,
    }
}
