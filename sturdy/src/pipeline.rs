// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The update pipeline: a fixed sequence of stages that validates an
//! authentication repository commit by commit, cross-checks the pinned
//! state of every target repository, and only then mutates the client's
//! repositories and watermark.
//!
//! Stage effects are ordered so that a crash at any point leaves a
//! recoverable state: target repositories advance first, then the
//! authentication repository, then the watermark. A re-run from the old
//! watermark re-validates and idempotently re-applies.

use crate::auth_repo::{AuthRepo, PinEntry, PinSchedule};
use crate::error::{self, Error, Result};
use crate::git::{CommitId, GitRepo};
use crate::lifecycle::Event;
use crate::repositories::{self, TargetRepoSpec};
use crate::verifier::{self, ExpirationBase, TrustedState};
use crate::{ExpectedRepoType, UpdateOptions};
use log::{debug, error, info, warn};
use serde::Serialize;
use snafu::{ensure, ResultExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

/// What a stage tells the pipeline driver to do next.
enum Flow {
    Continue,
    Halt,
}

/// The commit window of one run: the client's position before the run, the
/// newly validated commits, and the position after.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitsData {
    /// The watermark before the run, `None` for a fresh client.
    pub before_pull: Option<CommitId>,
    /// Commits validated and accepted by this run, oldest first.
    pub new: Vec<CommitId>,
    /// The client's position after the run.
    pub after_pull: Option<CommitId>,
}

/// The outcome for one target repository.
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    /// `changed`, `unchanged`, or `failed`.
    pub event: Event,
    /// The tip each validated branch ended at.
    pub branches: BTreeMap<String, CommitId>,
    /// The failure message when this repository caused the run to fail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The structured result of one pipeline run.
#[derive(Debug)]
pub struct UpdateOutput {
    /// The terminal event: `changed`, `unchanged`, or `failed`.
    pub event: Event,
    /// The authentication repository's name.
    pub auth_repo_name: String,
    /// The commit window of the run.
    pub commits: CommitsData,
    /// Per-target-repository outcomes.
    pub targets: BTreeMap<String, TargetOutcome>,
    /// The error a failed run terminated with.
    pub error: Option<Error>,
}

/// A private, bare clone of the remote authentication repository used for
/// all validation reads, kept isolated from the user's working tree. The
/// temporary directory is released on every exit path.
#[derive(Debug)]
struct ValidationClone {
    auth: AuthRepo,
    _dir: TempDir,
}

impl ValidationClone {
    fn acquire(url: &str) -> Result<ValidationClone> {
        let dir = TempDir::new().context(error::TempDirSnafu)?;
        let path = dir.path().join("auth_repo");
        let repo = GitRepo::new(&path, "validation", vec![url.to_owned()]);
        repo.clone_repository(true, false)?;
        let auth = AuthRepo::from_path(&path, vec![url.to_owned()], Some(dir.path()));
        Ok(ValidationClone { auth, _dir: dir })
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    error: Option<Error>,
    /// True when the user's local authentication repository existed before
    /// this run.
    existing_repo: bool,
    validation: Option<ValidationClone>,
    users_auth: Option<AuthRepo>,
    default_branch: Option<String>,
    /// The watermark in effect at the start of the run.
    last_validated: Option<CommitId>,
    /// True when the client had no watermark: every commit in the window is
    /// new.
    fresh: bool,
    /// The accepted commit window. For a client with a watermark the first
    /// entry is the watermark itself.
    commits: Vec<CommitId>,
    targets: BTreeMap<String, TargetRepoSpec>,
    target_repos: BTreeMap<String, GitRepo>,
    /// Target repositories that existed locally before this run.
    preexisting_targets: HashSet<String>,
    /// Target repositories cloned by this run (removed again if nothing is
    /// accepted).
    cloned_targets: Vec<String>,
    schedule: PinSchedule,
    /// The branch tip chosen for each `(repository, branch)` that advanced.
    new_tips: BTreeMap<(String, String), CommitId>,
    /// The `(repository, branch)` pairs whose local tips this run moved.
    targets_advanced: HashSet<(String, String)>,
    /// The repository that caused a failure, for per-repo outcome reporting.
    failed_target: Option<(String, String)>,
    excluded_active: bool,
    /// The last commit actually applied by this run.
    accepted_commit: Option<CommitId>,
    /// Number of accepted commits that are new in this run.
    accepted_new: usize,
}

/// Drives one update of one authentication repository.
pub(crate) struct UpdatePipeline<'a> {
    url: String,
    requested_name: Option<String>,
    out_of_band: Option<CommitId>,
    opts: &'a UpdateOptions,
    state: PipelineState,
}

impl<'a> UpdatePipeline<'a> {
    pub(crate) fn new(
        url: &str,
        requested_name: Option<&str>,
        out_of_band: Option<CommitId>,
        opts: &'a UpdateOptions,
    ) -> Self {
        Self {
            url: url.to_owned(),
            requested_name: requested_name.map(str::to_owned),
            out_of_band,
            opts,
            state: PipelineState::default(),
        }
    }

    /// Runs every stage in order. The first hard failure terminates the
    /// sequence; cleanup runs on every path; exactly one terminal event is
    /// produced.
    pub(crate) fn run(mut self) -> UpdateOutput {
        let stages: &[(&'static str, fn(&mut Self) -> Result<Flow>)] = &[
            ("open validation repository", Self::open_validation_repo),
            (
                "out-of-band and repository type checks",
                Self::check_anchor_and_repo_type,
            ),
            ("signed metadata verification", Self::verify_metadata_window),
            (
                "synchronize local authentication repository",
                Self::clone_or_fetch_users_repo,
            ),
            ("resolve target repositories", Self::resolve_target_repositories),
            ("target repository pre-flight", Self::preflight_targets),
            ("target repository validation", Self::validate_targets),
            ("merge and record", Self::merge_and_record),
        ];
        for (name, stage) in stages {
            if self.cancelled() {
                info!("{}: cancelled before stage {:?}", self.name(), name);
                self.state.error = Some(error::CancelledSnafu.build());
                break;
            }
            debug!("{}: stage {:?}", self.name(), name);
            match stage(&mut self) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => break,
                Err(err) => {
                    error!("{}: stage {:?} failed: {}", self.name(), name, err);
                    self.state.error = Some(err);
                    break;
                }
            }
        }
        self.cleanup();
        self.into_output()
    }

    fn name(&self) -> &str {
        self.requested_name
            .as_deref()
            .unwrap_or("authentication repository")
    }

    fn cancelled(&self) -> bool {
        self.opts
            .cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn validation(&self) -> &AuthRepo {
        &self
            .state
            .validation
            .as_ref()
            .expect("validation repository is acquired in the first stage")
            .auth
    }

    fn users_auth(&self) -> &AuthRepo {
        self.state
            .users_auth
            .as_ref()
            .expect("users repository is resolved in the first stage")
    }

    fn default_branch(&self) -> &str {
        self.state
            .default_branch
            .as_deref()
            .expect("default branch is resolved in the first stage")
    }

    fn validation_head(&self) -> Result<CommitId> {
        let branch = self.default_branch().to_owned();
        self.validation()
            .git()
            .head_commit(Some(&branch))?
            .ok_or_else(|| {
                error::InvalidAuthRepositorySnafu {
                    name: self.name(),
                    message: "remote repository has no commits",
                }
                .build()
            })
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Stage 1: clone the remote into a private temporary bare repository
    /// and resolve the repository's name and the client's prior watermark.
    fn open_validation_repo(&mut self) -> Result<Flow> {
        let validation = ValidationClone::acquire(&self.url)?;
        self.state.default_branch = Some(validation.auth.git().default_branch()?);
        self.state.validation = Some(validation);

        let head = self.validation_head()?;
        let name = match &self.requested_name {
            Some(name) => name.clone(),
            None => self.validation().info_at(&head)?,
        };
        self.requested_name = Some(name.clone());

        let users_auth = AuthRepo::new(
            &self.opts.library_dir,
            &name,
            vec![self.url.clone()],
            self.opts.conf_root.as_deref(),
        );
        self.state.existing_repo = users_auth.git().is_repository();
        self.state.last_validated = match &self.opts.validate_from {
            Some(commit) if self.opts.only_validate => Some(commit.clone()),
            _ => users_auth.last_validated_commit()?,
        };
        self.state.fresh = self.state.last_validated.is_none();
        self.state.users_auth = Some(users_auth);
        self.state.excluded_active = !self.opts.excluded_target_globs.is_empty();
        Ok(Flow::Continue)
    }

    /// Stage 2 and 3: a first-time client with an out-of-band anchor must
    /// see that anchor as the repository's first commit, and the
    /// repository's test-repo marker must agree with the caller's
    /// expectation.
    fn check_anchor_and_repo_type(&mut self) -> Result<Flow> {
        let head = self.validation_head()?;
        if self.state.fresh {
            if let Some(expected) = &self.out_of_band {
                let all = self.validation().git().commits_between(None, &head)?;
                let first = all.first().ok_or_else(|| {
                    error::InvalidAuthRepositorySnafu {
                        name: self.name(),
                        message: "remote repository has no commits",
                    }
                    .build()
                })?;
                ensure!(
                    first == expected,
                    error::OutOfBandMismatchSnafu {
                        name: self.name(),
                        expected: expected.clone(),
                        actual: first.clone(),
                    }
                );
            }
        }

        let is_test = self.validation().is_test_repo_at(&head)?;
        match self.opts.expected_repo_type {
            ExpectedRepoType::Either => {}
            ExpectedRepoType::Test => ensure!(
                is_test,
                error::UpdateTypeMismatchSnafu {
                    name: self.name(),
                    message: format!(
                        "{} is not a test repository, but a test repository was expected",
                        self.name()
                    ),
                }
            ),
            ExpectedRepoType::Official => ensure!(
                !is_test,
                error::UpdateTypeMismatchSnafu {
                    name: self.name(),
                    message: format!(
                        "{} is a test repository; expected an official repository",
                        self.name()
                    ),
                }
            ),
        }
        Ok(Flow::Continue)
    }

    /// Stage 4: walk every commit in the window in ancestry order, verifying
    /// each against the trusted state threaded from its predecessor. A
    /// failure partway truncates the window to the validated prefix; the
    /// recorded error still fails the run after the prefix is applied.
    fn verify_metadata_window(&mut self) -> Result<Flow> {
        let head = self.validation_head()?;
        let git = self.validation().git();
        let window = match &self.state.last_validated {
            Some(watermark) => {
                let mut window = vec![watermark.clone()];
                window.extend(git.commits_between(Some(watermark), &head)?);
                window
            }
            None => git.commits_between(None, &head)?,
        };
        ensure!(
            !window.is_empty(),
            error::InvalidAuthRepositorySnafu {
                name: self.name(),
                message: "remote repository has no commits",
            }
        );

        let base = if self.opts.strict {
            ExpirationBase::WallClock
        } else {
            ExpirationBase::CommitTime
        };

        let anchor_store = self.validation().metadata_at(&window[0]);
        let mut trusted = TrustedState::trust_root(&anchor_store)?;
        let mut accepted = Vec::new();
        for (index, commit) in window.iter().enumerate() {
            // A watermark commit was fully validated by an earlier run;
            // re-anchoring on its root is enough.
            if index == 0 && !self.state.fresh {
                accepted.push(commit.clone());
                continue;
            }
            let store = self.validation().metadata_at(commit);
            match verifier::verify_commit(&store, &trusted, base) {
                Ok(next) => {
                    trusted = next;
                    accepted.push(commit.clone());
                }
                Err(err) if accepted.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        "{}: validation failed at commit {}; accepting {} earlier commit(s): {}",
                        self.name(),
                        commit,
                        accepted.len(),
                        err
                    );
                    self.state.error = Some(err);
                    break;
                }
            }
        }
        info!(
            "{}: metadata validated for {} commit(s)",
            self.name(),
            accepted.len()
        );
        self.state.commits = accepted;
        Ok(Flow::Continue)
    }

    /// Stage 5: bring the user's local authentication repository into
    /// existence (clone, no checkout) or refresh its remote-tracking refs.
    /// Nothing is merged yet.
    fn clone_or_fetch_users_repo(&mut self) -> Result<Flow> {
        if self.opts.only_validate {
            return Ok(Flow::Continue);
        }
        let branch = self.default_branch().to_owned();
        let users = self.users_auth().clone();
        if self.state.existing_repo {
            users.git().fetch(None)?;
            let unpushed = users.git().unpushed_commits(&branch)?;
            if !unpushed.is_empty() {
                if self.opts.force {
                    warn!(
                        "{}: discarding {} unpushed commit(s) on {}",
                        self.name(),
                        unpushed.len(),
                        branch
                    );
                    if let Some(remote_tip) = users.git().remote_branch_tip(&branch)? {
                        users.git().checkout_branch(&branch, false)?;
                        users.git().reset(&remote_tip, true)?;
                    }
                } else {
                    return error::UnsyncedSnafu {
                        repo: self.name(),
                        branch,
                    }
                    .fail();
                }
            }
        } else {
            users.git().clone_repository(false, true)?;
        }
        Ok(Flow::Continue)
    }

    /// Stage 6: resolve the set of target repositories over the accepted
    /// window, build the pin schedule, and clone whatever is missing.
    fn resolve_target_repositories(&mut self) -> Result<Flow> {
        let excluded = crate::auth_repo::build_globset(&self.opts.excluded_target_globs)?;
        let mut targets =
            repositories::load_target_repositories(self.validation(), &self.state.commits)?;
        targets.retain(|name, _| !excluded.is_match(name));
        self.state.schedule = self
            .validation()
            .pin_schedule(&self.state.commits, &self.opts.excluded_target_globs)?;

        let targets_dir = self
            .opts
            .targets_dir
            .clone()
            .unwrap_or_else(|| self.opts.library_dir.clone());
        for (name, spec) in &targets {
            let repo = GitRepo::new(targets_dir.join(name), name, spec.urls.clone());
            if repo.is_repository() {
                self.state.preexisting_targets.insert(name.clone());
            } else if !self.opts.only_validate && self.state.schedule.contains_key(name) {
                repo.clone_repository(self.opts.bare_targets, true)?;
                self.state.cloned_targets.push(name.clone());
            }
            self.state.target_repos.insert(name.clone(), repo);
        }
        self.state.targets = targets;
        Ok(Flow::Continue)
    }

    fn allow_unauthenticated(&self, repo_name: &str) -> bool {
        self.state
            .targets
            .get(repo_name)
            .map(TargetRepoSpec::allow_unauthenticated)
            .unwrap_or(false)
    }

    /// The tip used to validate pins on a branch: the remote-tracking tip
    /// after fetch, except in validate-only mode where only local state may
    /// be consulted.
    fn validation_tip(&self, repo: &GitRepo, branch: &str) -> Result<Option<CommitId>> {
        if self.opts.only_validate {
            return Ok(repo.head_commit(Some(branch))?);
        }
        match repo.remote_branch_tip(branch)? {
            Some(tip) => Ok(Some(tip)),
            None => Ok(repo.head_commit(Some(branch))?),
        }
    }

    /// Stage 7: refuse to touch target repositories that are dirty, have
    /// local commits beyond the authenticated state, or carry unauthorized
    /// commits past the last pin; optionally verify that every pin is
    /// reachable from the remote tip.
    fn preflight_targets(&mut self) -> Result<Flow> {
        let schedule = self.state.schedule.clone();
        for (repo_name, branches) in &schedule {
            let repo = match self.state.target_repos.get(repo_name) {
                Some(repo) => repo.clone(),
                None => continue,
            };
            if !repo.is_repository() {
                ensure!(
                    !self.opts.only_validate,
                    error::TargetMismatchSnafu {
                        repo: repo_name.clone(),
                        branch: branches.keys().next().cloned().unwrap_or_default(),
                        message: "local repository does not exist; run an update first",
                    }
                );
                continue;
            }
            let allow_unauthenticated = self.allow_unauthenticated(repo_name);
            let preexisting = self.state.preexisting_targets.contains(repo_name);

            if preexisting && !self.opts.only_validate {
                if !repo.is_clean()? {
                    if self.opts.force {
                        warn!("{}: discarding uncommitted changes", repo_name);
                        if let Some(head) = repo.head_commit(None)? {
                            repo.reset(&head, true)?;
                        }
                    } else {
                        return error::UncommittedChangesSnafu {
                            repo: repo_name.clone(),
                        }
                        .fail();
                    }
                }
            }

            for (branch, pins) in branches {
                if preexisting && !self.opts.only_validate {
                    if let Err(err) = repo.fetch(Some(branch)) {
                        // The branch may not exist upstream yet; validation
                        // decides whether that matters.
                        debug!("{}: fetch of {} failed: {}", repo_name, branch, err);
                    }
                }
                let first = match pins.first() {
                    Some(first) => first,
                    None => continue,
                };
                let last = pins.last().expect("pins is non-empty");

                // A client that has validated before expects its local branch
                // at (or behind) the window's first pin; a fresh client's
                // local state is judged wholesale during pin validation.
                if !allow_unauthenticated && !self.state.fresh {
                    if let Some(local_tip) = repo.head_commit(Some(branch))? {
                        if !repo.is_ancestor(&local_tip, &first.commit)? {
                            if self.opts.force {
                                warn!(
                                    "{}: resetting {} from {} to authenticated state {}",
                                    repo_name, branch, local_tip, first.commit
                                );
                                repo.checkout_branch(branch, false)?;
                                repo.reset(&first.commit, true)?;
                            } else {
                                return error::TargetAheadSnafu {
                                    repo: repo_name.clone(),
                                    branch: branch.clone(),
                                }
                                .fail();
                            }
                        }
                    }

                    // Commits past the last pin that no pin accounts for are
                    // unauthorized on this repository.
                    if let Some(tip) = self.validation_tip(&repo, branch)? {
                        if tip != last.commit && repo.is_ancestor(&last.commit, &tip)? {
                            let extra = repo.commits_between(Some(&last.commit), &tip)?;
                            self.state.failed_target =
                                Some((repo_name.clone(), branch.clone()));
                            return error::TargetMismatchSnafu {
                                repo: repo_name.clone(),
                                branch: branch.clone(),
                                message: format!(
                                    "{} commit(s) beyond the last authenticated commit {}",
                                    extra.len(),
                                    last.commit
                                ),
                            }
                            .fail();
                        }
                    }
                }

                if !self.opts.no_upstream && !self.opts.only_validate {
                    let remote_tip = repo.remote_branch_tip(branch)?;
                    for pin in pins {
                        let reachable = match &remote_tip {
                            Some(tip) => repo.is_ancestor(&pin.commit, tip).unwrap_or(false),
                            None => false,
                        };
                        if !reachable {
                            let message = format!(
                                "pinned commit {} is not reachable from the remote tip of {}",
                                pin.commit, branch
                            );
                            if self.opts.strict {
                                self.state.failed_target =
                                    Some((repo_name.clone(), branch.clone()));
                                return error::TargetMismatchSnafu {
                                    repo: repo_name.clone(),
                                    branch: branch.clone(),
                                    message,
                                }
                                .fail();
                            }
                            warn!("{}: {}", repo_name, message);
                        }
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Stage 8 and 9: walk the accepted window's pins per repository and
    /// branch, enforcing ancestry order and the unauthenticated-commit
    /// policy. The earliest failing authentication commit truncates
    /// acceptance for the whole run.
    fn validate_targets(&mut self) -> Result<Flow> {
        // The first pin of a watermark window is the state an earlier run
        // already applied; it anchors the walk but is not re-validated.
        let window_start: Option<CommitId> = if self.state.fresh {
            None
        } else {
            self.state.commits.first().cloned()
        };
        let commit_index: HashMap<&CommitId, usize> = self
            .state
            .commits
            .iter()
            .enumerate()
            .map(|(index, commit)| (commit, index))
            .collect();

        // The auth-commit index past which nothing may be accepted, and the
        // error that set it.
        let mut cutoff: Option<(usize, String, String, Error)> = None;

        for (repo_name, branches) in &self.state.schedule {
            let repo = match self.state.target_repos.get(repo_name) {
                Some(repo) if repo.is_repository() => repo,
                _ => continue,
            };
            let allow_unauthenticated = self.allow_unauthenticated(repo_name);
            for (branch, pins) in branches {
                let tip = self.validation_tip(repo, branch)?;
                let failure = validate_branch_pins(
                    repo,
                    repo_name,
                    branch,
                    pins,
                    tip.as_ref(),
                    window_start.as_ref(),
                    allow_unauthenticated,
                );
                if let Some((pin, err)) = failure {
                    let index = commit_index
                        .get(&pin.auth_commit)
                        .copied()
                        .unwrap_or(0);
                    let earlier = cutoff
                        .as_ref()
                        .map(|(existing, ..)| index < *existing)
                        .unwrap_or(true);
                    if earlier {
                        cutoff = Some((index, repo_name.clone(), branch.clone(), err));
                    }
                }
            }
        }

        if let Some((index, repo_name, branch, err)) = cutoff {
            warn!(
                "{}: target validation failed at auth commit index {}: {}",
                self.name(),
                index,
                err
            );
            self.state.commits.truncate(index);
            self.state.failed_target = Some((repo_name, branch));
            self.state.error = Some(err);
            if self.state.commits.is_empty() {
                // Nothing can be applied; skip straight to cleanup.
                return Ok(Flow::Halt);
            }
        }

        // Choose the tip each branch advances to, considering only pins
        // within the accepted window.
        let accepted: HashSet<&CommitId> = self.state.commits.iter().collect();
        let mut new_tips = BTreeMap::new();
        for (repo_name, branches) in &self.state.schedule {
            let repo = match self.state.target_repos.get(repo_name) {
                Some(repo) if repo.is_repository() => repo,
                _ => continue,
            };
            let allow_unauthenticated = self.allow_unauthenticated(repo_name);
            for (branch, pins) in branches {
                let last_accepted = pins
                    .iter()
                    .rev()
                    .find(|pin| accepted.contains(&pin.auth_commit));
                let last_accepted = match last_accepted {
                    Some(pin) => pin.commit.clone(),
                    None => continue,
                };
                let chosen = if allow_unauthenticated && self.state.error.is_none() {
                    // The branch may carry trailing commits that are not
                    // individually authenticated; follow them.
                    match self.validation_tip(repo, branch)? {
                        Some(tip) if repo.is_ancestor(&last_accepted, &tip)? => tip,
                        _ => last_accepted,
                    }
                } else {
                    last_accepted
                };
                new_tips.insert((repo_name.clone(), branch.clone()), chosen);
            }
        }
        self.state.new_tips = new_tips;
        Ok(Flow::Continue)
    }

    /// Stage 10: apply the accepted window. Target repositories first, then
    /// the authentication repository, then the watermark.
    fn merge_and_record(&mut self) -> Result<Flow> {
        let accepted_commit = match self.state.commits.last() {
            Some(commit) => commit.clone(),
            None => return Ok(Flow::Continue),
        };
        self.state.accepted_new = if self.state.fresh {
            self.state.commits.len()
        } else {
            self.state.commits.len() - 1
        };
        self.state.accepted_commit = Some(accepted_commit.clone());

        if self.opts.only_validate {
            return Ok(Flow::Continue);
        }

        // Target repositories first. A branch can move even when no new
        // authentication commits arrived: a repository that permits
        // unauthenticated commits follows its remote tip.
        let new_tips = self.state.new_tips.clone();
        for ((repo_name, branch), tip) in &new_tips {
            let repo = match self.state.target_repos.get(repo_name) {
                Some(repo) => repo.clone(),
                None => continue,
            };
            let cloned_now = self.state.cloned_targets.iter().any(|n| n == repo_name);
            let at_tip = repo.head_commit(Some(branch))?.as_ref() == Some(tip);
            if at_tip && !cloned_now {
                continue;
            }
            if !at_tip {
                info!("{}: advancing {} to {}", repo_name, branch, tip);
            }
            if cloned_now {
                // A clone made by this run starts with its branch at the
                // remote tip and an unpopulated working tree; put both at
                // the authenticated position directly.
                if self.opts.bare_targets {
                    repo.force_branch(branch, tip)?;
                } else {
                    repo.checkout_branch(branch, true)?;
                    repo.reset(tip, true)?;
                }
            } else {
                repo.merge(branch, tip)?;
                if !self.opts.bare_targets {
                    repo.checkout_branch(branch, false)?;
                }
            }
            if !at_tip || cloned_now {
                self.state
                    .targets_advanced
                    .insert((repo_name.clone(), branch.clone()));
            }
        }

        if self.state.accepted_new == 0 {
            return Ok(Flow::Continue);
        }

        let branch = self.default_branch().to_owned();
        let users = self.users_auth();
        info!(
            "{}: advancing {} to {}",
            self.name(),
            branch,
            accepted_commit
        );
        users.git().merge(&branch, &accepted_commit)?;
        users.git().checkout_branch(&branch, false)?;

        if self.state.excluded_active {
            info!(
                "{}: exclusion globs active, not advancing the watermark",
                self.name()
            );
        } else {
            users.set_last_validated_commit(&accepted_commit)?;
        }
        Ok(Flow::Continue)
    }

    /// Releases the validation clone and removes anything this run created
    /// that a failed run must not leave behind.
    fn cleanup(&mut self) {
        self.state.validation = None;
        let failed = self.state.error.is_some();
        let nothing_applied = self.opts.only_validate
            || (self.state.accepted_new == 0 && self.state.targets_advanced.is_empty());
        if failed && nothing_applied {
            for name in &self.state.cloned_targets {
                if let Some(repo) = self.state.target_repos.get(name) {
                    debug!("removing cloned repository {}", name);
                    repo.remove_from_disk();
                }
            }
            if !self.state.existing_repo {
                if let Some(users) = &self.state.users_auth {
                    debug!("removing cloned authentication repository {}", users.name());
                    users.git().remove_from_disk();
                    let _ = std::fs::remove_dir_all(users.conf_dir());
                }
            }
        }
    }

    fn into_output(self) -> UpdateOutput {
        let state = self.state;
        let name = self
            .requested_name
            .unwrap_or_else(|| "authentication repository".to_owned());
        let event = if state.error.is_some() {
            Event::Failed
        } else if state.accepted_new > 0 || !state.targets_advanced.is_empty() {
            Event::Changed
        } else {
            Event::Unchanged
        };

        let before_pull = state.last_validated.clone();
        let new: Vec<CommitId> = if state.fresh {
            state.commits.clone()
        } else {
            state.commits.iter().skip(1).cloned().collect()
        };
        let after_pull = state.accepted_commit.clone().or_else(|| before_pull.clone());

        let mut targets = BTreeMap::new();
        for (repo_name, branches) in &state.schedule {
            let mut branch_tips = BTreeMap::new();
            let mut changed = false;
            for branch in branches.keys() {
                let key = (repo_name.clone(), branch.clone());
                if let Some(tip) = state.new_tips.get(&key) {
                    changed = changed || state.targets_advanced.contains(&key);
                    branch_tips.insert(branch.clone(), tip.clone());
                }
            }
            let failed_here = state
                .failed_target
                .as_ref()
                .map(|(failed_repo, _)| failed_repo == repo_name)
                .unwrap_or(false);
            targets.insert(
                repo_name.clone(),
                TargetOutcome {
                    event: if failed_here {
                        Event::Failed
                    } else if changed {
                        Event::Changed
                    } else {
                        Event::Unchanged
                    },
                    branches: branch_tips,
                    error: if failed_here {
                        state.error.as_ref().map(ToString::to_string)
                    } else {
                        None
                    },
                },
            );
        }

        UpdateOutput {
            event,
            auth_repo_name: name,
            commits: CommitsData {
                before_pull,
                new,
                after_pull,
            },
            targets,
            error: state.error,
        }
    }
}

/// Checks one branch's pins in order: every pin must be on the branch, each
/// a descendant of its predecessor, and (unless unauthenticated commits are
/// allowed) with no unaccounted commits between consecutive pins. Returns
/// the first failing pin and the error describing it.
fn validate_branch_pins(
    repo: &GitRepo,
    repo_name: &str,
    branch: &str,
    pins: &[PinEntry],
    tip: Option<&CommitId>,
    window_start: Option<&CommitId>,
    allow_unauthenticated: bool,
) -> Option<(PinEntry, Error)> {
    let mut previous: Option<&CommitId> = None;
    for pin in pins {
        let baseline = previous.is_none() && window_start == Some(&pin.auth_commit);
        let result = check_pin(
            repo,
            repo_name,
            branch,
            pin,
            previous,
            tip,
            baseline,
            allow_unauthenticated,
        );
        if let Err(err) = result {
            return Some((pin.clone(), err));
        }
        previous = Some(&pin.commit);
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn check_pin(
    repo: &GitRepo,
    repo_name: &str,
    branch: &str,
    pin: &PinEntry,
    previous: Option<&CommitId>,
    tip: Option<&CommitId>,
    baseline: bool,
    allow_unauthenticated: bool,
) -> Result<()> {
    let mismatch = |message: String| {
        error::TargetMismatchSnafu {
            repo: repo_name,
            branch,
            message,
        }
        .build()
    };

    let tip = tip.ok_or_else(|| mismatch(format!("branch {} does not exist", branch)))?;
    let on_branch = repo.is_ancestor(&pin.commit, tip).unwrap_or(false);
    if !on_branch {
        return Err(mismatch(format!(
            "pinned commit {} is not reachable on branch {}",
            pin.commit, branch
        )));
    }
    if baseline {
        // The position an earlier run already applied; it anchors the walk.
        return Ok(());
    }

    match previous {
        Some(previous) => {
            if !repo.is_ancestor(previous, &pin.commit)? {
                return Err(mismatch(format!(
                    "pinned commit {} is not a descendant of the previous pin {}",
                    pin.commit, previous
                )));
            }
            if !allow_unauthenticated {
                let between = repo.commits_between(Some(previous), &pin.commit)?;
                if between.len() != 1 {
                    return Err(mismatch(format!(
                        "{} commit(s) between pins {} and {} are not individually authenticated",
                        between.len().saturating_sub(1),
                        previous,
                        pin.commit
                    )));
                }
            }
        }
        None if !allow_unauthenticated => {
            // The first pin ever recorded for a branch must sit at the start
            // of a history made up entirely of pinned commits; anything
            // before it would never be authenticated.
            let history = repo.commits_between(None, &pin.commit)?;
            if history.len() != 1 {
                return Err(mismatch(format!(
                    "{} commit(s) before the first pinned commit {} are not authenticated",
                    history.len().saturating_sub(1),
                    pin.commit
                )));
            }
        }
        None => {}
    }
    Ok(())
}
