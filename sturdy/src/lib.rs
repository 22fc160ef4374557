// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sturdy authenticates the contents of Git repositories using signed
//! metadata.
//!
//! A designated *authentication repository* carries TUF-style role metadata
//! (`root`, `targets`, `snapshot`, `timestamp`, and delegated targets roles)
//! plus target files that pin other Git repositories to specific commits.
//! The updater in this crate walks every new authentication-repository
//! commit in ancestry order, reconstructs and verifies the signed metadata
//! at each commit against the state accepted for its predecessor,
//! cross-checks the pinned commit of every listed target repository,
//! fast-forwards accepted commits into the client's clones, and records a
//! durable last-validated-commit watermark — atomically, and with partial
//! progress preserved when a later commit turns out to be bad.
//!
//! The entry points are [`clone_repository`] for a client that has never
//! seen the repository, [`update_repository`] for an existing client, and
//! [`validate_repository`] to re-check local state without mutating
//! anything.
//!
//! # Testing
//!
//! Unit tests are run in the usual manner: `cargo test`. The integration
//! tests build complete signed repositories on disk and drive the updater
//! against them.

#![forbid(missing_debug_implementations, missing_copy_implementations)]
#![deny(rust_2018_idioms)]
// missing_docs is on its own line to make it easy to comment out when making changes.
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc
)]

mod auth_repo;
mod deps;
pub mod error;
pub mod git;
mod lifecycle;
mod metadata;
mod pipeline;
mod repositories;
pub mod schema;
pub mod sign;
mod store;
mod verifier;

pub use crate::auth_repo::{AuthRepo, Dependency, PinEntry, PinSchedule};
pub use crate::deps::LibraryResult;
pub use crate::error::{Error, Result};
pub use crate::git::{CommitId, GitRepo};
pub use crate::lifecycle::Event;
pub use crate::pipeline::{CommitsData, TargetOutcome, UpdateOutput};
pub use crate::repositories::TargetRepoSpec;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// What kind of repository the caller expects to be updating. A mismatch
/// with the repository's own test-repo marker fails the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRepoType {
    /// The repository must be a test repository.
    Test,
    /// The repository must not be a test repository.
    Official,
    /// Either kind is acceptable.
    Either,
}

impl Default for ExpectedRepoType {
    fn default() -> Self {
        ExpectedRepoType::Either
    }
}

/// Policy and location settings for an update run.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// The directory under which authentication repositories live, keyed by
    /// their namespaced names.
    pub library_dir: PathBuf,

    /// The directory under which target repositories live. Defaults to
    /// `library_dir`.
    pub targets_dir: Option<PathBuf>,

    /// Where per-repository client state (the watermark) is kept. Defaults
    /// to each repository's parent directory.
    pub conf_root: Option<PathBuf>,

    /// The kind of repository the caller expects.
    pub expected_repo_type: ExpectedRepoType,

    /// Perform every check but never clone, fetch, merge, or write the
    /// watermark.
    pub only_validate: bool,

    /// Validate starting from this commit instead of the stored watermark.
    /// Only honored together with `only_validate`.
    pub validate_from: Option<CommitId>,

    /// Override pre-flight cleanliness and target-ahead checks by resetting
    /// repositories to their expected state.
    pub force: bool,

    /// Treat expiration and upstream-reachability warnings as errors, and
    /// fail the run when any dependency fails.
    pub strict: bool,

    /// Clone target repositories as bare repositories.
    pub bare_targets: bool,

    /// Never contact target repositories' remotes to check that pins are
    /// reachable upstream.
    pub no_upstream: bool,

    /// Do not walk dependency authentication repositories.
    pub no_deps: bool,

    /// Target repositories whose names match any of these globs are neither
    /// cloned nor validated. When any glob is set the watermark is not
    /// advanced, since a partial view cannot vouch for the whole commit.
    pub excluded_target_globs: Vec<String>,

    /// A cancellation flag checked at stage boundaries.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl UpdateOptions {
    /// Default options for a library rooted at `library_dir`.
    pub fn new<P: Into<PathBuf>>(library_dir: P) -> Self {
        Self {
            library_dir: library_dir.into(),
            targets_dir: None,
            conf_root: None,
            expected_repo_type: ExpectedRepoType::default(),
            only_validate: false,
            validate_from: None,
            force: false,
            strict: false,
            bare_targets: false,
            no_upstream: false,
            no_deps: false,
            excluded_target_globs: Vec::new(),
            cancel: None,
        }
    }
}

/// Clones and validates an authentication repository (and its dependencies)
/// into a library a client has never populated. The repository's name is
/// read from its own signed identity file; `out_of_band` anchors first-time
/// trust to an externally distributed commit.
pub fn clone_repository(
    url: &str,
    out_of_band: Option<CommitId>,
    options: &UpdateOptions,
) -> Result<LibraryResult> {
    deps::update_with_dependencies(url, None, out_of_band, options)
}

/// Updates an existing client's authentication repository (and its
/// dependencies) from `url`. `name` may be supplied when the caller already
/// knows the repository's namespaced name; otherwise it is read from the
/// repository's signed identity file.
pub fn update_repository(
    url: &str,
    name: Option<&str>,
    options: &UpdateOptions,
) -> Result<LibraryResult> {
    deps::update_with_dependencies(url, name, None, options)
}

/// Validates a local authentication repository and its target repositories
/// without mutating any of them. `validate_from` overrides the stored
/// watermark to re-validate older history.
pub fn validate_repository(
    auth_path: &Path,
    validate_from: Option<CommitId>,
    options: &UpdateOptions,
) -> Result<LibraryResult> {
    let mut options = options.clone();
    options.only_validate = true;
    options.validate_from = validate_from;
    if let Some(library_dir) = auth_path.parent().and_then(Path::parent) {
        options.library_dir = library_dir.to_path_buf();
    }
    let name = match (
        auth_path.parent().and_then(Path::file_name),
        auth_path.file_name(),
    ) {
        (Some(namespace), Some(name)) => format!(
            "{}/{}",
            namespace.to_string_lossy(),
            name.to_string_lossy()
        ),
        _ => auth_path.to_string_lossy().into_owned(),
    };
    let url = auth_path.display().to_string();
    deps::update_with_dependencies(&url, Some(&name), None, &options)
}
