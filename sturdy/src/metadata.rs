// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A read-only view of the signed role metadata of an authentication
//! repository as-of one specific commit, backed by Git object reads.

use crate::error::{self, Result};
use crate::git::{CommitId, GitRepo};
use crate::schema::{role_metadata_path, target_path, Root, Signed, Snapshot, Targets, Timestamp};
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use std::cell::RefCell;
use std::collections::HashMap;

/// Signed metadata at a specific commit. File contents are cached so the
/// verifier can make repeated passes over the same roles without re-reading
/// the object store.
#[derive(Debug)]
pub(crate) struct MetadataStore<'a> {
    repo: &'a GitRepo,
    commit: CommitId,
    cache: RefCell<HashMap<String, Option<Vec<u8>>>>,
}

impl<'a> MetadataStore<'a> {
    pub(crate) fn new(repo: &'a GitRepo, commit: CommitId) -> Self {
        Self {
            repo,
            commit,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn commit(&self) -> &CommitId {
        &self.commit
    }

    pub(crate) fn repo(&self) -> &'a GitRepo {
        self.repo
    }

    /// Raw bytes of a file at this commit, cached. A file that does not
    /// exist at the commit is `None`.
    fn bytes(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.borrow().get(path) {
            return Ok(cached.clone());
        }
        let contents = match self.repo.read_file_at(&self.commit, path) {
            Ok(contents) => Some(contents),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        self.cache
            .borrow_mut()
            .insert(path.to_owned(), contents.clone());
        Ok(contents)
    }

    /// Raw bytes of a role's metadata file, or `None` if the role has no
    /// metadata at this commit.
    pub(crate) fn role_bytes(&self, role: &str) -> Result<Option<Vec<u8>>> {
        self.bytes(&role_metadata_path(role))
    }

    /// Raw bytes of a target file, or `None` if it is absent at this commit.
    pub(crate) fn target_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.bytes(&target_path(name))
    }

    /// Loads and parses a role's signed metadata, failing if the role has no
    /// metadata file at this commit.
    pub(crate) fn load<T: DeserializeOwned>(&self, role: &str) -> Result<Signed<T>> {
        self.try_load(role)?.ok_or_else(|| {
            error::MetadataMissingSnafu {
                role,
                commit: self.commit.clone(),
            }
            .build()
        })
    }

    /// Loads and parses a role's signed metadata if its file exists at this
    /// commit.
    pub(crate) fn try_load<T: DeserializeOwned>(&self, role: &str) -> Result<Option<Signed<T>>> {
        match self.role_bytes(role)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).context(
                error::MetadataParseSnafu {
                    role,
                    commit: self.commit.clone(),
                },
            )?)),
        }
    }

    pub(crate) fn root(&self) -> Result<Signed<Root>> {
        self.load("root")
    }

    pub(crate) fn snapshot(&self) -> Result<Signed<Snapshot>> {
        self.load("snapshot")
    }

    pub(crate) fn timestamp(&self) -> Result<Signed<Timestamp>> {
        self.load("timestamp")
    }

    pub(crate) fn targets(&self) -> Result<Signed<Targets>> {
        self.load("targets")
    }

    pub(crate) fn delegated_targets(&self, name: &str) -> Result<Signed<Targets>> {
        self.load(name)
    }
}
