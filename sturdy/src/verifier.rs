// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verifies the signed metadata of one authentication repository commit
//! against the trusted state carried over from its predecessor, producing
//! the trusted state for its successor.

use crate::error::{self, Result};
use crate::git::CommitId;
use crate::metadata::MetadataStore;
use crate::schema::{Role, Root, Signed, Targets};
use chrono::{DateTime, Utc};
use log::debug;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU64;

/// The state a client trusts after validating a commit, threaded into the
/// validation of the next commit. This is a plain value: there is no ambient
/// or per-process trust anywhere in the updater.
#[derive(Debug, Clone)]
pub(crate) struct TrustedState {
    /// The commit this state was derived from.
    pub(crate) commit: CommitId,
    /// The root role accepted at that commit, carrying the keys and
    /// thresholds for all top-level roles.
    pub(crate) root: Signed<Root>,
    /// The version of each metadata file listed by the accepted snapshot
    /// role, used to enforce version monotonicity.
    pub(crate) snapshot_versions: HashMap<String, NonZeroU64>,
}

/// Which clock expiration is checked against.
///
/// Historical commits are validated against their own commit time; a
/// metadata file that was valid when committed must not fail validation
/// merely because it expired later. Only the strictest callers use wall
/// clock time for the whole history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpirationBase {
    /// Compare `expires` fields against the current wall clock.
    WallClock,
    /// Compare `expires` fields against the commit's own timestamp.
    CommitTime,
}

impl TrustedState {
    /// Establishes trust at an anchor commit (trust-on-first-use): the root
    /// role at that commit must be signed by its own keys at threshold.
    pub(crate) fn trust_root(store: &MetadataStore<'_>) -> Result<Self> {
        let root = store.root()?;
        root.signed
            .verify_role(&root)
            .context(error::MetadataSnafu {
                role: "root",
                commit: store.commit().clone(),
            })?;
        Ok(Self {
            commit: store.commit().clone(),
            root,
            snapshot_versions: HashMap::new(),
        })
    }
}

/// Runs the full verification sequence for the commit `store` is bound to.
/// On success, returns the trusted state to use for the commit's successor.
pub(crate) fn verify_commit(
    store: &MetadataStore<'_>,
    prev: &TrustedState,
    base: ExpirationBase,
) -> Result<TrustedState> {
    let commit = store.commit().clone();
    let reference_time = match base {
        ExpirationBase::WallClock => Utc::now(),
        ExpirationBase::CommitTime => store.repo().commit_time(&commit)?,
    };
    debug!(
        "verifying metadata at commit {} (reference time {})",
        commit, reference_time
    );

    // Root chain.
    let root = verify_root_chain(store, prev)?;
    check_expiration(&root.signed, "root", &commit, reference_time)?;

    // Timestamp, and its binding of the snapshot file.
    let timestamp = store.timestamp()?;
    root.signed
        .verify_role(&timestamp)
        .context(error::MetadataSnafu {
            role: "timestamp",
            commit: commit.clone(),
        })?;
    check_expiration(&timestamp.signed, "timestamp", &commit, reference_time)?;
    let snapshot_meta = timestamp
        .signed
        .meta
        .get("snapshot.json")
        .context(error::SnapshotMismatchSnafu {
            commit: commit.clone(),
            message: "timestamp does not describe snapshot.json",
        })?;
    let snapshot_bytes =
        store
            .role_bytes("snapshot")?
            .context(error::MetadataMissingSnafu {
                role: "snapshot",
                commit: commit.clone(),
            })?;
    ensure!(
        snapshot_meta.length == snapshot_bytes.len() as u64
            && snapshot_meta.hashes.matches(&snapshot_bytes),
        error::SnapshotMismatchSnafu {
            commit: commit.clone(),
            message: "snapshot.json does not match the length and hashes signed by timestamp",
        }
    );

    // Snapshot, and version monotonicity against the previous trusted state.
    let snapshot = store.snapshot()?;
    root.signed
        .verify_role(&snapshot)
        .context(error::MetadataSnafu {
            role: "snapshot",
            commit: commit.clone(),
        })?;
    check_expiration(&snapshot.signed, "snapshot", &commit, reference_time)?;
    ensure!(
        snapshot.signed.version == snapshot_meta.version,
        error::SnapshotMismatchSnafu {
            commit: commit.clone(),
            message: format!(
                "snapshot version {} does not match version {} signed by timestamp",
                snapshot.signed.version, snapshot_meta.version
            ),
        }
    );
    for (file, meta) in &snapshot.signed.meta {
        if let Some(trusted_version) = prev.snapshot_versions.get(file) {
            ensure!(
                meta.version >= *trusted_version,
                error::RollbackVersionSnafu {
                    role: file.clone(),
                    commit: commit.clone(),
                    trusted: trusted_version.get(),
                    new: meta.version.get(),
                }
            );
        }
    }

    // Top-level targets and every delegated role reachable from it.
    let targets = store.targets()?;
    root.signed
        .verify_role(&targets)
        .context(error::MetadataSnafu {
            role: "targets",
            commit: commit.clone(),
        })?;
    check_expiration(&targets.signed, "targets", &commit, reference_time)?;
    check_snapshot_entry(&snapshot.signed.meta, "targets", &targets, &commit)?;

    let mut descriptors: Vec<(String, crate::schema::Target)> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert("targets".to_owned());
    let mut queue: VecDeque<(String, Signed<Targets>)> = VecDeque::new();
    queue.push_back(("targets".to_owned(), targets));
    while let Some((parent_name, parent)) = queue.pop_front() {
        for (path, descriptor) in &parent.signed.targets {
            descriptors.push((path.clone(), descriptor.clone()));
        }
        let delegations = match &parent.signed.delegations {
            Some(delegations) => delegations,
            None => continue,
        };
        for (index, role) in delegations.roles.iter().enumerate() {
            if !visited.insert(role.name.clone()) {
                debug!(
                    "{}: role {} reached through more than one delegation",
                    parent_name, role.name
                );
                continue;
            }
            let child = store.delegated_targets(&role.name)?;
            delegations
                .verify_role(&child, &role.name)
                .context(error::MetadataSnafu {
                    role: role.name.clone(),
                    commit: commit.clone(),
                })?;
            check_expiration(&child.signed, &role.name, &commit, reference_time)?;
            check_snapshot_entry(&snapshot.signed.meta, &role.name, &child, &commit)?;
            for path in child.signed.targets.keys() {
                ensure!(
                    role.paths.matched_target(path),
                    error::UnmatchedTargetPathSnafu {
                        role: role.name.clone(),
                        commit: commit.clone(),
                        path: path.clone(),
                    }
                );
                // An earlier terminating sibling that matches the path
                // preempts this role's authority over it.
                for earlier in &delegations.roles[..index] {
                    ensure!(
                        !(earlier.terminating && earlier.paths.matched_target(path)),
                        error::UnmatchedTargetPathSnafu {
                            role: role.name.clone(),
                            commit: commit.clone(),
                            path: path.clone(),
                        }
                    );
                }
            }
            queue.push_back((role.name.clone(), child));
        }
    }

    // Every in-scope target descriptor must match the file under targets/.
    for (path, descriptor) in &descriptors {
        let bytes = store
            .target_bytes(path)?
            .context(error::TargetFileInvalidSnafu {
                target: path.clone(),
                commit: commit.clone(),
                message: "file missing from targets directory",
            })?;
        ensure!(
            descriptor.matches(&bytes),
            error::TargetFileInvalidSnafu {
                target: path.clone(),
                commit: commit.clone(),
                message: format!(
                    "contents do not match signed length {} and hashes",
                    descriptor.length
                ),
            }
        );
    }

    let snapshot_versions = snapshot
        .signed
        .meta
        .iter()
        .map(|(file, meta)| (file.clone(), meta.version))
        .collect();
    Ok(TrustedState {
        commit,
        root,
        snapshot_versions,
    })
}

/// Establishes the root role to trust at the current commit. A version bump
/// must be signed both by the previously trusted keyset and by the new root
/// itself; version skips are allowed only when every intermediate root can
/// be recovered from the repository's history and chains hop by hop.
fn verify_root_chain(store: &MetadataStore<'_>, prev: &TrustedState) -> Result<Signed<Root>> {
    let commit = store.commit().clone();
    let new_root = store.root()?;
    let prev_version = prev.root.signed.version.get();
    let new_version = new_root.signed.version.get();

    if new_version < prev_version {
        return error::RollbackVersionSnafu {
            role: "root",
            commit,
            trusted: prev_version,
            new: new_version,
        }
        .fail();
    }

    if new_version == prev_version {
        // An unchanged version must still be signed by the trusted keyset.
        prev.root
            .signed
            .verify_role(&new_root)
            .context(error::MetadataSnafu {
                role: "root",
                commit,
            })?;
        return Ok(new_root);
    }

    // Collect candidate roots by version. Intermediate versions beyond the
    // direct successor live only in prior commits, so walk the history
    // between the trusted commit and this one to recover them.
    let mut by_version: HashMap<u64, Signed<Root>> = HashMap::new();
    by_version.insert(new_version, new_root);
    if new_version > prev_version + 1 {
        for intermediate in store
            .repo()
            .commits_between(Some(&prev.commit), &commit)?
        {
            if intermediate == commit {
                continue;
            }
            let intermediate_store = MetadataStore::new(store.repo(), intermediate);
            if let Some(candidate) = intermediate_store.try_load::<Root>("root")? {
                by_version
                    .entry(candidate.signed.version.get())
                    .or_insert(candidate);
            }
        }
    }

    let mut trusted = prev.root.clone();
    for version in (prev_version + 1)..=new_version {
        let candidate = by_version.get(&version).context(error::RootChainSnafu {
            commit: commit.clone(),
            message: format!("missing intermediate root version {}", version),
        })?;
        trusted
            .signed
            .verify_role(candidate)
            .context(error::MetadataSnafu {
                role: "root",
                commit: commit.clone(),
            })?;
        candidate
            .signed
            .verify_role(candidate)
            .context(error::MetadataSnafu {
                role: "root",
                commit: commit.clone(),
            })?;
        trusted = candidate.clone();
    }
    Ok(trusted)
}

fn check_expiration<T: Role>(
    role: &T,
    name: &str,
    commit: &CommitId,
    reference_time: DateTime<Utc>,
) -> Result<()> {
    ensure!(
        role.expires() > reference_time,
        error::ExpiredMetadataSnafu {
            role: name,
            commit: commit.clone(),
            expires: role.expires(),
        }
    );
    Ok(())
}

/// A targets-family role's version must agree with what the snapshot role
/// signed for its metadata file.
fn check_snapshot_entry(
    meta: &HashMap<String, crate::schema::SnapshotMeta>,
    role: &str,
    signed: &Signed<Targets>,
    commit: &CommitId,
) -> Result<()> {
    let entry = meta
        .get(&format!("{}.json", role))
        .context(error::SnapshotMismatchSnafu {
            commit: commit.clone(),
            message: format!("snapshot does not describe {}.json", role),
        })?;
    ensure!(
        entry.version == signed.signed.version,
        error::SnapshotMismatchSnafu {
            commit: commit.clone(),
            message: format!(
                "{}.json version {} does not match version {} signed by snapshot",
                role, signed.signed.version, entry.version
            ),
        }
    );
    Ok(())
}
