// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A typed capability over a Git working tree or bare repository, exposing
//! only the operations the updater needs: clone over a URL list, fetch,
//! commit enumeration, file and tree reads at a commit, checkout, reset,
//! fast-forward merge, and cleanliness checks.

use chrono::{DateTime, TimeZone, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, ErrorCode, Oid, Repository, Sort, StatusOptions};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Alias for `Result<T, GitError>`.
pub type Result<T> = std::result::Result<T, GitError>;

/// The default remote name used for all clones and fetches.
const ORIGIN: &str = "origin";

/// The error type for Git operations. Callers distinguish missing objects,
/// non-fast-forward conflicts, transport failures, and structurally invalid
/// repositories.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum GitError {
    /// Cloning failed from every configured URL.
    #[snafu(display("Failed to clone {} from any of {:?}: {}", name, urls, cause))]
    CloneFailed {
        /// The repository being cloned.
        name: String,
        /// The URLs that were tried.
        urls: Vec<String>,
        /// The last underlying failure.
        cause: git2::Error,
    },

    /// Fetching from the remote failed.
    #[snafu(display("Failed to fetch {} for {}: {}", remote, name, source))]
    FetchFailed {
        /// The repository being fetched.
        name: String,
        /// The remote that was fetched.
        remote: String,
        /// The source of the error.
        source: git2::Error,
    },

    /// An object (commit, branch, file, or tree) was not found.
    #[snafu(display("{} not found in {}", what, name))]
    NotFound {
        /// The repository.
        name: String,
        /// What was looked up.
        what: String,
    },

    /// An operation would not fast-forward or commits are not in the
    /// expected ancestry relation.
    #[snafu(display("{}: {}", name, message))]
    Conflict {
        /// The repository.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// The path does not contain a usable Git repository.
    #[snafu(display("{} is not a valid Git repository: {}", path.display(), source))]
    InvalidRepository {
        /// The path that was opened.
        path: PathBuf,
        /// The source of the error.
        source: git2::Error,
    },

    /// Any other libgit2 failure.
    #[snafu(display("Git operation {} failed in {}: {}", op, name, source))]
    GitOperation {
        /// The repository.
        name: String,
        /// The operation that failed.
        op: &'static str,
        /// The source of the error.
        source: git2::Error,
    },

    /// A commit identifier was not a 40-character hex string.
    #[snafu(display("Invalid commit id {:?}", id))]
    InvalidCommitId {
        /// The offending string.
        id: String,
    },
}

impl GitError {
    /// True when the error means "the thing does not exist" rather than "the
    /// operation failed".
    pub fn is_not_found(&self) -> bool {
        matches!(self, GitError::NotFound { .. })
    }
}

/// An opaque 40-hex commit identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    /// The commit id as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn oid(&self) -> Oid {
        // The string form is validated on construction, so this cannot fail.
        Oid::from_str(&self.0).expect("validated commit id")
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Oid> for CommitId {
    fn from(oid: Oid) -> Self {
        CommitId(oid.to_string())
    }
}

impl FromStr for CommitId {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self> {
        ensure!(
            s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit()),
            InvalidCommitIdSnafu { id: s }
        );
        Ok(CommitId(s.to_lowercase()))
    }
}

/// A Git repository on the local filesystem, which may not exist yet.
///
/// The underlying repository handle is opened per operation; this keeps the
/// type cheap to construct before the repository has been cloned and avoids
/// holding file handles across the long pauses between pipeline stages.
#[derive(Debug, Clone)]
pub struct GitRepo {
    name: String,
    path: PathBuf,
    urls: Vec<String>,
}

impl GitRepo {
    /// Creates a handle for the repository at `path`. No filesystem access
    /// happens until an operation is invoked.
    pub fn new<P: Into<PathBuf>>(path: P, name: &str, urls: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            path: path.into(),
            urls,
        }
    }

    /// The repository's name (usually `namespace/name`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The repository's location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The URLs this repository is cloned from and fetched against.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// True if `path` is the root of an existing Git repository.
    pub fn is_repository(&self) -> bool {
        Repository::open(&self.path).is_ok()
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.path).context(InvalidRepositorySnafu { path: &self.path })
    }

    fn op_err(&self, op: &'static str) -> impl FnOnce(git2::Error) -> GitError {
        let name = self.name.clone();
        move |source| GitError::GitOperation { name, op, source }
    }

    /// Initializes a new repository at `path` with the given initial branch.
    pub fn init(&self, bare: bool, initial_branch: &str) -> Result<()> {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.bare(bare).initial_head(initial_branch);
        Repository::init_opts(&self.path, &opts)
            .map(|_| ())
            .map_err(self.op_err("init"))
    }

    /// Clones the repository, trying each configured URL in order and
    /// succeeding on the first that works. With `no_checkout` the working
    /// tree is left unpopulated; with `bare` no working tree exists at all.
    pub fn clone_repository(&self, bare: bool, no_checkout: bool) -> Result<()> {
        let mut last_err = None;
        for url in &self.urls {
            debug!("{}: cloning from {}", self.name, url);
            let mut builder = RepoBuilder::new();
            builder.bare(bare);
            if no_checkout {
                let mut checkout = CheckoutBuilder::new();
                checkout.dry_run();
                builder.with_checkout(checkout);
            }
            match builder.clone(url, &self.path) {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!("{}: clone from {} failed: {}", self.name, url, err);
                    // Clear any partial state so the next URL starts clean.
                    let _ = std::fs::remove_dir_all(&self.path);
                    last_err = Some(err);
                }
            }
        }
        CloneFailedSnafu {
            name: &self.name,
            urls: self.urls.clone(),
            cause: last_err.unwrap_or_else(|| {
                git2::Error::from_str("no URLs configured for repository")
            }),
        }
        .fail()
    }

    /// Fetches from `origin`, advancing remote-tracking refs. When `branch`
    /// is given only that branch is fetched; otherwise all heads are.
    pub fn fetch(&self, branch: Option<&str>) -> Result<()> {
        let repo = self.repo()?;
        let mut remote = repo.find_remote(ORIGIN).map_err(|source| {
            if source.code() == ErrorCode::NotFound {
                GitError::NotFound {
                    name: self.name.clone(),
                    what: format!("remote {}", ORIGIN),
                }
            } else {
                GitError::GitOperation {
                    name: self.name.clone(),
                    op: "find remote",
                    source,
                }
            }
        })?;
        let refspecs: Vec<String> = match branch {
            Some(branch) => vec![format!(
                "+refs/heads/{0}:refs/remotes/{1}/{0}",
                branch, ORIGIN
            )],
            None => vec![format!("+refs/heads/*:refs/remotes/{}/*", ORIGIN)],
        };
        let refspec_refs: Vec<&str> = refspecs.iter().map(String::as_str).collect();
        remote
            .fetch(&refspec_refs, None, None)
            .context(FetchFailedSnafu {
                name: &self.name,
                remote: ORIGIN,
            })
    }

    /// The name of the branch HEAD points at, falling back to probing for
    /// conventional default branch names in a detached or unborn state.
    pub fn default_branch(&self) -> Result<String> {
        let repo = self.repo()?;
        if let Ok(head) = repo.head() {
            if head.is_branch() {
                if let Some(name) = head.shorthand() {
                    return Ok(name.to_owned());
                }
            }
        }
        for name in &["main", "master"] {
            if self.branch_exists(name, true)? {
                return Ok((*name).to_owned());
            }
        }
        NotFoundSnafu {
            name: &self.name,
            what: "default branch".to_owned(),
        }
        .fail()
    }

    /// Resolves the tip of a branch, looking first at local heads and then
    /// at `origin` remote-tracking refs.
    fn branch_tip(&self, repo: &Repository, branch: &str) -> Option<Oid> {
        repo.find_branch(branch, BranchType::Local)
            .ok()
            .or_else(|| {
                repo.find_branch(&format!("{}/{}", ORIGIN, branch), BranchType::Remote)
                    .ok()
            })
            .and_then(|b| b.get().target())
    }

    /// The commit at the tip of `branch` (or HEAD when `branch` is `None`).
    /// Returns `None` for an empty repository.
    pub fn head_commit(&self, branch: Option<&str>) -> Result<Option<CommitId>> {
        let repo = self.repo()?;
        match branch {
            Some(branch) => Ok(self.branch_tip(&repo, branch).map(CommitId::from)),
            None => match repo.head() {
                Ok(head) => Ok(head.target().map(CommitId::from)),
                Err(err)
                    if err.code() == ErrorCode::UnbornBranch
                        || err.code() == ErrorCode::NotFound =>
                {
                    Ok(None)
                }
                Err(source) => Err(self.op_err("resolve HEAD")(source)),
            },
        }
    }

    /// The commit at the tip of `branch` on the `origin` remote-tracking
    /// ref only, or `None` when the remote branch is unknown.
    pub fn remote_branch_tip(&self, branch: &str) -> Result<Option<CommitId>> {
        let repo = self.repo()?;
        Ok(repo
            .find_branch(&format!("{}/{}", ORIGIN, branch), BranchType::Remote)
            .ok()
            .and_then(|b| b.get().target())
            .map(CommitId::from))
    }

    /// True if `branch` exists locally (or, with `include_remote`, as an
    /// `origin` remote-tracking branch).
    pub fn branch_exists(&self, branch: &str, include_remote: bool) -> Result<bool> {
        let repo = self.repo()?;
        if repo.find_branch(branch, BranchType::Local).is_ok() {
            return Ok(true);
        }
        if include_remote {
            return Ok(repo
                .find_branch(&format!("{}/{}", ORIGIN, branch), BranchType::Remote)
                .is_ok());
        }
        Ok(false)
    }

    /// Lists commits after `from` (exclusive) up to `to` (inclusive), oldest
    /// first. With `from` equal to `to` the list is empty. Fails with a
    /// conflict when `from` is not an ancestor of `to`.
    pub fn commits_between(
        &self,
        from: Option<&CommitId>,
        to: &CommitId,
    ) -> Result<Vec<CommitId>> {
        let repo = self.repo()?;
        if let Some(from) = from {
            if from == to {
                return Ok(Vec::new());
            }
            let descendant = repo
                .graph_descendant_of(to.oid(), from.oid())
                .map_err(self.op_err("walk ancestry"))?;
            ensure!(
                descendant,
                ConflictSnafu {
                    name: &self.name,
                    message: format!("{} is not an ancestor of {}", from, to),
                }
            );
        }
        let mut revwalk = repo.revwalk().map_err(self.op_err("walk commits"))?;
        revwalk
            .set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)
            .map_err(self.op_err("walk commits"))?;
        revwalk.push(to.oid()).map_err(self.op_err("walk commits"))?;
        if let Some(from) = from {
            revwalk
                .hide(from.oid())
                .map_err(self.op_err("walk commits"))?;
        }
        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(CommitId::from(oid.map_err(self.op_err("walk commits"))?));
        }
        Ok(commits)
    }

    /// True when `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        let repo = self.repo()?;
        repo.graph_descendant_of(descendant.oid(), ancestor.oid())
            .map_err(self.op_err("walk ancestry"))
    }

    /// The committer timestamp of a commit.
    pub fn commit_time(&self, commit: &CommitId) -> Result<DateTime<Utc>> {
        let repo = self.repo()?;
        let commit = repo
            .find_commit(commit.oid())
            .map_err(self.op_err("find commit"))?;
        Ok(Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now))
    }

    /// Reads the contents of `path` at `commit`. Fails with `NotFound` when
    /// the file does not exist at that commit.
    pub fn read_file_at(&self, commit: &CommitId, path: &str) -> Result<Vec<u8>> {
        let repo = self.repo()?;
        let commit_obj = repo
            .find_commit(commit.oid())
            .map_err(self.op_err("find commit"))?;
        let tree = commit_obj.tree().map_err(self.op_err("read tree"))?;
        let entry = tree.get_path(Path::new(path)).map_err(|source| {
            if source.code() == ErrorCode::NotFound {
                GitError::NotFound {
                    name: self.name.clone(),
                    what: format!("{} at {}", path, commit),
                }
            } else {
                GitError::GitOperation {
                    name: self.name.clone(),
                    op: "read tree",
                    source,
                }
            }
        })?;
        let blob = entry
            .to_object(&repo)
            .and_then(|obj| obj.peel_to_blob())
            .map_err(self.op_err("read blob"))?;
        Ok(blob.content().to_vec())
    }

    /// Recursively lists the files under `path` at `commit`, relative to
    /// `path`. Fails with `NotFound` when the directory does not exist at
    /// that commit.
    pub fn list_tree_at(&self, commit: &CommitId, path: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let commit_obj = repo
            .find_commit(commit.oid())
            .map_err(self.op_err("find commit"))?;
        let root = commit_obj.tree().map_err(self.op_err("read tree"))?;
        let tree = if path.is_empty() {
            root
        } else {
            let entry = root.get_path(Path::new(path)).map_err(|source| {
                if source.code() == ErrorCode::NotFound {
                    GitError::NotFound {
                        name: self.name.clone(),
                        what: format!("{} at {}", path, commit),
                    }
                } else {
                    GitError::GitOperation {
                        name: self.name.clone(),
                        op: "read tree",
                        source,
                    }
                }
            })?;
            entry
                .to_object(&repo)
                .and_then(|obj| obj.peel_to_tree())
                .map_err(|source| GitError::NotFound {
                    name: self.name.clone(),
                    what: format!("{} at {} ({})", path, commit, source),
                })?
        };
        let mut files = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |parent, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    files.push(if parent.is_empty() {
                        name.to_owned()
                    } else {
                        format!("{}{}", parent, name)
                    });
                }
            }
            git2::TreeWalkResult::Ok
        })
        .map_err(self.op_err("walk tree"))?;
        files.sort();
        Ok(files)
    }

    /// Checks out a branch, optionally creating it at the current HEAD
    /// commit (or at the `origin` tip when the local branch is missing).
    pub fn checkout_branch(&self, branch: &str, create: bool) -> Result<()> {
        let repo = self.repo()?;
        if repo.find_branch(branch, BranchType::Local).is_err() {
            let tip = self
                .branch_tip(&repo, branch)
                .or_else(|| repo.head().ok().and_then(|h| h.target()));
            match (create || self.remote_branch_tip(branch)?.is_some(), tip) {
                (true, Some(oid)) => {
                    let commit = repo
                        .find_commit(oid)
                        .map_err(self.op_err("find commit"))?;
                    repo.branch(branch, &commit, false)
                        .map_err(self.op_err("create branch"))?;
                }
                _ => {
                    return NotFoundSnafu {
                        name: &self.name,
                        what: format!("branch {}", branch),
                    }
                    .fail()
                }
            }
        }
        repo.set_head(&format!("refs/heads/{}", branch))
            .map_err(self.op_err("set HEAD"))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))
            .map_err(self.op_err("checkout"))
    }

    /// Detaches HEAD at a commit and checks out its tree.
    pub fn checkout_commit(&self, commit: &CommitId) -> Result<()> {
        let repo = self.repo()?;
        repo.set_head_detached(commit.oid())
            .map_err(self.op_err("set HEAD"))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))
            .map_err(self.op_err("checkout"))
    }

    /// Points the current branch at `commit`, optionally resetting the
    /// working tree and index to match.
    pub fn reset(&self, commit: &CommitId, hard: bool) -> Result<()> {
        let repo = self.repo()?;
        let object = repo
            .find_object(commit.oid(), None)
            .map_err(self.op_err("find commit"))?;
        let kind = if hard {
            git2::ResetType::Hard
        } else {
            git2::ResetType::Soft
        };
        repo.reset(&object, kind, None).map_err(self.op_err("reset"))
    }

    /// Fast-forwards `branch` to `commit`. The updater never creates merge
    /// commits; a non-fast-forward is a conflict.
    pub fn merge(&self, branch: &str, commit: &CommitId) -> Result<()> {
        let repo = self.repo()?;
        let current = self.branch_tip(&repo, branch);
        if let Some(current) = current {
            if current == commit.oid() {
                return Ok(());
            }
            let ff = repo
                .graph_descendant_of(commit.oid(), current)
                .map_err(self.op_err("walk ancestry"))?;
            ensure!(
                ff,
                ConflictSnafu {
                    name: &self.name,
                    message: format!(
                        "cannot fast-forward {} from {} to {}",
                        branch, current, commit
                    ),
                }
            );
        }
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                branch_ref
                    .get_mut()
                    .set_target(commit.oid(), "fast-forward")
                    .map_err(self.op_err("move branch"))?;
            }
            Err(_) => {
                let commit_obj = repo
                    .find_commit(commit.oid())
                    .map_err(self.op_err("find commit"))?;
                repo.branch(branch, &commit_obj, false)
                    .map_err(self.op_err("create branch"))?;
            }
        }
        // Refresh the working tree when the moved branch is checked out.
        if !repo.is_bare() {
            if let Ok(head) = repo.head() {
                if head.shorthand() == Some(branch) {
                    repo.set_head(&format!("refs/heads/{}", branch))
                        .map_err(self.op_err("set HEAD"))?;
                    let mut checkout = CheckoutBuilder::new();
                    checkout.force();
                    repo.checkout_head(Some(&mut checkout))
                        .map_err(self.op_err("checkout"))?;
                }
            }
        }
        Ok(())
    }

    /// Points `branch` at `commit` unconditionally, creating or moving the
    /// branch without touching any working tree. Only used on repositories
    /// this process created itself.
    pub fn force_branch(&self, branch: &str, commit: &CommitId) -> Result<()> {
        let repo = self.repo()?;
        let commit_obj = repo
            .find_commit(commit.oid())
            .map_err(self.op_err("find commit"))?;
        repo.branch(branch, &commit_obj, true)
            .map(|_| ())
            .map_err(self.op_err("move branch"))
    }

    /// True iff there are no staged, unstaged, or untracked changes.
    pub fn is_clean(&self) -> Result<bool> {
        let repo = self.repo()?;
        if repo.is_bare() {
            return Ok(true);
        }
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(self.op_err("status"))?;
        Ok(statuses.is_empty())
    }

    /// Commits on the local `branch` that are not reachable from its
    /// `origin` remote-tracking ref. Used to refuse destructive operations
    /// on work that has not been pushed.
    pub fn unpushed_commits(&self, branch: &str) -> Result<Vec<CommitId>> {
        let repo = self.repo()?;
        let local = match repo
            .find_branch(branch, BranchType::Local)
            .ok()
            .and_then(|b| b.get().target())
        {
            Some(oid) => oid,
            None => return Ok(Vec::new()),
        };
        let remote = repo
            .find_branch(&format!("{}/{}", ORIGIN, branch), BranchType::Remote)
            .ok()
            .and_then(|b| b.get().target());
        let remote = match remote {
            Some(oid) => oid,
            None => return Ok(Vec::new()),
        };
        if local == remote {
            return Ok(Vec::new());
        }
        let mut revwalk = repo.revwalk().map_err(self.op_err("walk commits"))?;
        revwalk.push(local).map_err(self.op_err("walk commits"))?;
        revwalk.hide(remote).map_err(self.op_err("walk commits"))?;
        let mut commits = Vec::new();
        for oid in revwalk {
            commits.push(CommitId::from(oid.map_err(self.op_err("walk commits"))?));
        }
        Ok(commits)
    }

    /// Stages everything in the working tree and creates a commit on the
    /// current branch, returning the new commit's id.
    pub fn commit(&self, message: &str) -> Result<CommitId> {
        let repo = self.repo()?;
        let mut index = repo.index().map_err(self.op_err("open index"))?;
        index
            .add_all(["*"], git2::IndexAddOption::DEFAULT, None)
            .map_err(self.op_err("stage files"))?;
        index.write().map_err(self.op_err("stage files"))?;
        let tree_oid = index.write_tree().map_err(self.op_err("write tree"))?;
        let tree = repo.find_tree(tree_oid).map_err(self.op_err("write tree"))?;
        let signature = git2::Signature::now("sturdy", "sturdy@localhost")
            .map_err(self.op_err("commit"))?;
        let parent = match repo.head() {
            Ok(head) => Some(
                head.peel_to_commit()
                    .map_err(self.op_err("commit"))?,
            ),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo
            .commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &parents,
            )
            .map_err(self.op_err("commit"))?;
        Ok(CommitId::from(oid))
    }

    /// Removes the repository from disk. Missing paths are fine.
    pub fn remove_from_disk(&self) {
        if self.path.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.path) {
                warn!("{}: failed to remove {}: {}", self.name, self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn repo_with_commits(dir: &Path, n: usize) -> (GitRepo, Vec<CommitId>) {
        let repo = GitRepo::new(dir, "test/repo", Vec::new());
        repo.init(false, "main").unwrap();
        let mut commits = Vec::new();
        for i in 0..n {
            fs::write(dir.join(format!("file{}", i)), format!("contents {}", i)).unwrap();
            commits.push(repo.commit(&format!("commit {}", i)).unwrap());
        }
        (repo, commits)
    }

    #[test]
    fn commit_id_validation() {
        assert!("0123456789abcdef0123456789abcdef01234567"
            .parse::<CommitId>()
            .is_ok());
        assert!("not-a-commit".parse::<CommitId>().is_err());
        assert!("0123456789abcdef0123456789abcdef0123456".parse::<CommitId>().is_err());
    }

    #[test]
    fn commits_between_is_exclusive_inclusive() {
        let dir = TempDir::new().unwrap();
        let (repo, commits) = repo_with_commits(dir.path(), 3);
        let between = repo
            .commits_between(Some(&commits[0]), &commits[2])
            .unwrap();
        assert_eq!(between, commits[1..].to_vec());
        assert!(repo
            .commits_between(Some(&commits[2]), &commits[2])
            .unwrap()
            .is_empty());
        // Walking from a non-ancestor is refused.
        assert!(repo
            .commits_between(Some(&commits[2]), &commits[0])
            .is_err());
    }

    #[test]
    fn read_file_and_tree_at_commit() {
        let dir = TempDir::new().unwrap();
        let (repo, commits) = repo_with_commits(dir.path(), 2);
        assert_eq!(
            repo.read_file_at(&commits[0], "file0").unwrap(),
            b"contents 0".to_vec()
        );
        // file1 does not exist yet at the first commit.
        assert!(repo
            .read_file_at(&commits[0], "file1")
            .unwrap_err()
            .is_not_found());
        let files = repo.list_tree_at(&commits[1], "").unwrap();
        assert_eq!(files, vec!["file0".to_owned(), "file1".to_owned()]);
    }

    #[test]
    fn merge_fast_forwards_and_rejects_divergence() {
        let dir = TempDir::new().unwrap();
        let (repo, commits) = repo_with_commits(dir.path(), 2);
        repo.reset(&commits[0], true).unwrap();
        repo.merge("main", &commits[1]).unwrap();
        assert_eq!(
            repo.head_commit(Some("main")).unwrap(),
            Some(commits[1].clone())
        );
        // Create a divergent commit and confirm the merge is refused.
        repo.reset(&commits[0], true).unwrap();
        fs::write(dir.path().join("diverge"), "x").unwrap();
        let divergent = repo.commit("divergent").unwrap();
        assert!(repo.merge("main", &commits[1]).is_err());
        assert_eq!(
            repo.head_commit(Some("main")).unwrap(),
            Some(divergent)
        );
    }

    #[test]
    fn cleanliness_tracks_untracked_files() {
        let dir = TempDir::new().unwrap();
        let (repo, _) = repo_with_commits(dir.path(), 1);
        assert!(repo.is_clean().unwrap());
        fs::write(dir.path().join("untracked"), "x").unwrap();
        assert!(!repo.is_clean().unwrap());
    }

    #[test]
    fn checkout_commit_detaches_head() {
        let dir = TempDir::new().unwrap();
        let (repo, commits) = repo_with_commits(dir.path(), 2);
        repo.checkout_commit(&commits[0]).unwrap();
        assert_eq!(repo.head_commit(None).unwrap(), Some(commits[0].clone()));
        assert!(!dir.path().join("file1").exists());
        // The branch itself did not move.
        assert_eq!(
            repo.head_commit(Some("main")).unwrap(),
            Some(commits[1].clone())
        );
        repo.checkout_branch("main", false).unwrap();
        assert!(dir.path().join("file1").exists());
    }

    #[test]
    fn unpushed_commits_compare_against_remote_tracking() {
        let src_dir = TempDir::new().unwrap();
        let (_, commits) = repo_with_commits(src_dir.path(), 1);
        let dst_dir = TempDir::new().unwrap();
        let dst = dst_dir.path().join("clone");
        let repo = GitRepo::new(&dst, "test/clone", vec![src_dir.path().display().to_string()]);
        repo.clone_repository(false, false).unwrap();
        assert!(repo.unpushed_commits("main").unwrap().is_empty());

        fs::write(dst.join("local-only"), "x").unwrap();
        let local = repo.commit("not pushed").unwrap();
        assert_eq!(repo.unpushed_commits("main").unwrap(), vec![local]);
        assert_eq!(
            repo.remote_branch_tip("main").unwrap(),
            Some(commits[0].clone())
        );
        assert!(repo.branch_exists("main", false).unwrap());
        assert!(!repo.branch_exists("absent", true).unwrap());
    }

    #[test]
    fn clone_tries_urls_in_order() {
        let src_dir = TempDir::new().unwrap();
        let (_, commits) = repo_with_commits(src_dir.path(), 1);
        let dst_dir = TempDir::new().unwrap();
        let dst = dst_dir.path().join("clone");
        let repo = GitRepo::new(
            &dst,
            "test/clone",
            vec![
                "/nonexistent/path/to/repo".to_owned(),
                src_dir.path().display().to_string(),
            ],
        );
        repo.clone_repository(false, false).unwrap();
        assert_eq!(repo.head_commit(None).unwrap(), Some(commits[0].clone()));
    }
}
