// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains the error type for this library.

#![allow(clippy::default_trait_access)]

use crate::git::{CommitId, GitError};
use snafu::Snafu;
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for update, clone, and validation runs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The update was cancelled by the caller.
    #[snafu(display("Update cancelled"))]
    Cancelled,

    /// A dependency authentication repository failed and strict mode is on.
    #[snafu(display("Dependency {} failed: {}", name, message))]
    DependencyFailed {
        /// The dependency's name.
        name: String,
        /// Why it failed.
        message: String,
    },

    /// A role's metadata was expired at the reference time used for the
    /// commit being validated.
    #[snafu(display("Metadata for role {} at commit {} expired at {}", role, commit, expires))]
    ExpiredMetadata {
        /// The role whose metadata is expired.
        role: String,
        /// The commit being validated.
        commit: CommitId,
        /// When the metadata expired.
        expires: chrono::DateTime<chrono::Utc>,
    },

    /// Failed to read a file from the client filesystem.
    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    FileRead {
        /// The file being read.
        path: PathBuf,
        /// The source of the error.
        source: std::io::Error,
    },

    /// Failed to write a file to the client filesystem.
    #[snafu(display("Failed to write {}: {}", path.display(), source))]
    FileWrite {
        /// The file being written.
        path: PathBuf,
        /// The source of the error.
        source: std::io::Error,
    },

    /// Failed to atomically replace a file on the client filesystem.
    #[snafu(display("Failed to persist {}: {}", path.display(), source))]
    FilePersist {
        /// The file being replaced.
        path: PathBuf,
        /// The source of the error.
        source: tempfile::PersistError,
    },

    /// A Git operation failed. The inner error distinguishes missing
    /// objects, conflicts, transport failures, and invalid repositories.
    #[snafu(display("{}", source))]
    #[snafu(context(false))]
    Git {
        /// The source of the error.
        source: GitError,
    },

    /// A repository's structure violates what an authentication repository
    /// must look like.
    #[snafu(display("Invalid authentication repository {}: {}", name, message))]
    InvalidAuthRepository {
        /// The repository.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// An exclusion glob pattern failed to compile.
    #[snafu(display("Invalid glob pattern {:?}: {}", pattern, source))]
    InvalidGlob {
        /// The offending pattern.
        pattern: String,
        /// The source of the error.
        source: globset::Error,
    },

    /// An auxiliary JSON document (target file, configuration, script
    /// output) failed to parse.
    #[snafu(display("Failed to parse {}: {}", what, source))]
    JsonParse {
        /// What was being parsed.
        what: String,
        /// The source of the error.
        source: serde_json::Error,
    },

    /// Failed to serialize a JSON document.
    #[snafu(display("Failed to serialize {}: {}", what, source))]
    JsonSerialize {
        /// What was being serialized.
        what: String,
        /// The source of the error.
        source: serde_json::Error,
    },

    /// A role's metadata failed schema-level verification (bad signatures,
    /// threshold not met, malformed keys).
    #[snafu(display("Invalid metadata for role {} at commit {}: {}", role, commit, source))]
    Metadata {
        /// The role being verified.
        role: String,
        /// The commit being validated.
        commit: CommitId,
        /// The source of the error.
        source: crate::schema::Error,
    },

    /// A role's metadata file was missing at a commit where it is required.
    #[snafu(display("Missing metadata for role {} at commit {}", role, commit))]
    MetadataMissing {
        /// The missing role.
        role: String,
        /// The commit being validated.
        commit: CommitId,
    },

    /// A role's metadata file failed to parse.
    #[snafu(display("Failed to parse metadata for role {} at commit {}: {}", role, commit, source))]
    MetadataParse {
        /// The role being parsed.
        role: String,
        /// The commit being validated.
        commit: CommitId,
        /// The source of the error.
        source: serde_json::Error,
    },

    /// The first commit of a newly seen authentication repository did not
    /// match the out-of-band trust anchor.
    #[snafu(display(
        "First commit {} of {} does not match out-of-band authentication commit {}",
        actual,
        name,
        expected
    ))]
    OutOfBandMismatch {
        /// The repository.
        name: String,
        /// The configured anchor.
        expected: CommitId,
        /// The actual first commit.
        actual: CommitId,
    },

    /// The root role chain could not be established from the previously
    /// trusted root to the root at the commit being validated.
    #[snafu(display("Cannot establish root chain at commit {}: {}", commit, message))]
    RootChain {
        /// The commit being validated.
        commit: CommitId,
        /// Why the chain is broken.
        message: String,
    },

    /// A role's version went backward relative to the trusted state.
    #[snafu(display(
        "Version rollback for {} at commit {}: trusted version {}, found {}",
        role,
        commit,
        trusted,
        new
    ))]
    RollbackVersion {
        /// The role that rolled back.
        role: String,
        /// The commit being validated.
        commit: CommitId,
        /// The version in the trusted state.
        trusted: u64,
        /// The version found at the commit.
        new: u64,
    },

    /// A lifecycle handler script failed or produced invalid output.
    #[snafu(display("Script {} failed: {}", script, message))]
    ScriptExecution {
        /// The script that failed.
        script: String,
        /// Why it failed.
        message: String,
    },

    /// The snapshot metadata did not match what the timestamp role signed
    /// for it.
    #[snafu(display("Snapshot metadata mismatch at commit {}: {}", commit, message))]
    SnapshotMismatch {
        /// The commit being validated.
        commit: CommitId,
        /// What did not match.
        message: String,
    },

    /// A target repository's branch is ahead of the first pinned commit in
    /// the update window.
    #[snafu(display("Repository {} branch {} is ahead of the authenticated state", repo, branch))]
    TargetAhead {
        /// The target repository.
        repo: String,
        /// The branch.
        branch: String,
    },

    /// A target file's contents did not match its signed descriptor.
    #[snafu(display("Target file {} at commit {} is invalid: {}", target, commit, message))]
    TargetFileInvalid {
        /// The target path.
        target: String,
        /// The commit being validated.
        commit: CommitId,
        /// What did not match.
        message: String,
    },

    /// A pinned commit of a target repository was missing, off-branch, out
    /// of ancestry order, or accompanied by unauthorized commits.
    #[snafu(display("Mismatch in target repository {} branch {}: {}", repo, branch, message))]
    TargetMismatch {
        /// The target repository.
        repo: String,
        /// The branch.
        branch: String,
        /// What went wrong.
        message: String,
    },

    /// Failed to create a temporary directory.
    #[snafu(display("Failed to create temporary directory: {}", source))]
    TempDir {
        /// The source of the error.
        source: std::io::Error,
    },

    /// A target repository's working tree has uncommitted changes.
    #[snafu(display("Repository {} has uncommitted changes", repo))]
    UncommittedChanges {
        /// The dirty repository.
        repo: String,
    },

    /// A delegated role signed for a path outside the patterns delegated to
    /// it.
    #[snafu(display(
        "Role {} at commit {} signs for path {} outside its delegation",
        role,
        commit,
        path
    ))]
    UnmatchedTargetPath {
        /// The delegated role.
        role: String,
        /// The commit being validated.
        commit: CommitId,
        /// The offending path.
        path: String,
    },

    /// A local branch has commits that were never pushed upstream.
    #[snafu(display("Repository {} branch {} has unpushed commits", repo, branch))]
    Unsynced {
        /// The repository.
        repo: String,
        /// The branch.
        branch: String,
    },

    /// The repository's test-repo marker disagrees with the expected
    /// repository type.
    #[snafu(display("{}", message))]
    UpdateTypeMismatch {
        /// The repository.
        name: String,
        /// A description of the mismatch.
        message: String,
    },
}
