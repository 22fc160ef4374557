// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An authentication repository: a Git repository whose contents are signed
//! role metadata plus target files pinning other repositories, together with
//! the client-side state kept about it (the last-validated-commit
//! watermark).

use crate::error::{self, Result};
use crate::git::{CommitId, GitRepo};
use crate::metadata::MetadataStore;
use crate::schema::{target_path, Target};
use crate::store::Store;
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::debug;
use serde_json::Value;
use snafu::ResultExt;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name of the watermark within the repository's configuration
/// directory.
const LAST_VALIDATED_FILENAME: &str = "last_validated_commit";

/// A target path whose presence marks a test repository.
const TEST_REPO_MARKER: &str = "test-auth-repo";

/// Target file carrying the repository's own identity.
const INFO_JSON: &str = "protected/info.json";

/// Target file enumerating dependency authentication repositories.
const DEPENDENCIES_JSON: &str = "dependencies.json";

/// A single pinned state of one target repository at one authentication
/// repository commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PinEntry {
    /// The pinned target repository commit.
    pub commit: CommitId,
    /// The authentication repository commit that pinned it.
    pub auth_commit: CommitId,
    /// Custom attributes from the target file, minus `commit` and `branch`.
    pub custom: serde_json::Map<String, Value>,
}

/// The ordered pin history of every `(repository, branch)` across a window
/// of authentication repository commits. Consecutive commits that repeat a
/// pin collapse into one entry.
pub type PinSchedule = BTreeMap<String, BTreeMap<String, Vec<PinEntry>>>;

/// A dependency authentication repository referenced from
/// `targets/dependencies.json`.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// The dependency's name (`namespace/name`).
    pub name: String,
    /// The externally distributed commit anchoring first-time trust.
    pub out_of_band: Option<CommitId>,
    /// The branch to validate.
    pub branch: Option<String>,
    /// Any other attributes, preserved for the caller.
    pub custom: serde_json::Map<String, Value>,
}

/// An authentication repository and its client-side state.
#[derive(Debug, Clone)]
pub struct AuthRepo {
    git: GitRepo,
    name: String,
    conf: Store,
}

impl AuthRepo {
    /// Creates a handle for the repository named `name` under `library_dir`.
    /// The configuration directory holding the watermark lives under
    /// `conf_root` (default: the repository's parent directory) in a
    /// directory named `_<name>` after the last path component.
    pub fn new(
        library_dir: &Path,
        name: &str,
        urls: Vec<String>,
        conf_root: Option<&Path>,
    ) -> Self {
        let path = library_dir.join(name);
        Self::with_path(path, name, urls, conf_root)
    }

    /// Creates a handle from a repository path, deriving the name from the
    /// path's last two components.
    pub fn from_path(path: &Path, urls: Vec<String>, conf_root: Option<&Path>) -> Self {
        let name = match (
            path.parent().and_then(|p| p.file_name()),
            path.file_name(),
        ) {
            (Some(namespace), Some(name)) => format!(
                "{}/{}",
                namespace.to_string_lossy(),
                name.to_string_lossy()
            ),
            _ => path.to_string_lossy().into_owned(),
        };
        Self::with_path(path.to_path_buf(), &name, urls, conf_root)
    }

    fn with_path(
        path: PathBuf,
        name: &str,
        urls: Vec<String>,
        conf_root: Option<&Path>,
    ) -> Self {
        let conf_root = conf_root
            .map(Path::to_path_buf)
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| path.clone());
        let last = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.replace('/', "_"));
        let conf = Store::new(conf_root.join(format!("_{}", last)));
        Self {
            git: GitRepo::new(path, name, urls),
            name: name.to_owned(),
            conf,
        }
    }

    /// The repository's name (`namespace/name`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying Git capability.
    pub fn git(&self) -> &GitRepo {
        &self.git
    }

    /// The repository's location on disk.
    pub fn path(&self) -> &Path {
        self.git.path()
    }

    /// The directory holding this repository's client-side state.
    pub fn conf_dir(&self) -> &Path {
        self.conf.dir()
    }

    /// A metadata view bound to one commit.
    pub(crate) fn metadata_at<'a>(&'a self, commit: &CommitId) -> MetadataStore<'a> {
        MetadataStore::new(&self.git, commit.clone())
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// The most recent commit known to have been fully validated by this
    /// client, or `None` for a client that has never validated this
    /// repository.
    pub fn last_validated_commit(&self) -> Result<Option<CommitId>> {
        match self.conf.read(LAST_VALIDATED_FILENAME)? {
            None => Ok(None),
            Some(contents) => {
                let commit = CommitId::from_str(contents.trim())?;
                Ok(Some(commit))
            }
        }
    }

    /// Durably records the watermark. The write is atomic: a crash leaves
    /// either the previous watermark or the new one.
    pub fn set_last_validated_commit(&self, commit: &CommitId) -> Result<()> {
        debug!("{}: setting last validated commit to {}", self.name, commit);
        self.conf
            .write(LAST_VALIDATED_FILENAME, commit.as_str().as_bytes())
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Reads a target file at a commit and parses it as JSON. Absent target
    /// files are `None`.
    pub fn target_json(&self, commit: &CommitId, name: &str) -> Result<Option<Value>> {
        let path = target_path(name);
        let bytes = match self.git.read_file_at(commit, &path) {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = serde_json::from_slice(&bytes).context(error::JsonParseSnafu {
            what: format!("{} at {}", path, commit),
        })?;
        Ok(Some(value))
    }

    /// The repository's self-declared identity (`namespace/name`) from
    /// `targets/protected/info.json` at a commit.
    pub fn info_at(&self, commit: &CommitId) -> Result<String> {
        let info = self.target_json(commit, INFO_JSON)?.ok_or_else(|| {
            error::InvalidAuthRepositorySnafu {
                name: self.name.clone(),
                message: format!("{} missing at commit {}", INFO_JSON, commit),
            }
            .build()
        })?;
        match (
            info.get("namespace").and_then(Value::as_str),
            info.get("name").and_then(Value::as_str),
        ) {
            (Some(namespace), Some(name)) => Ok(format!("{}/{}", namespace, name)),
            _ => error::InvalidAuthRepositorySnafu {
                name: self.name.clone(),
                message: format!("{} does not declare namespace and name", INFO_JSON),
            }
            .fail(),
        }
    }

    /// True when the repository marks itself as a test repository at the
    /// given commit.
    pub fn is_test_repo_at(&self, commit: &CommitId) -> Result<bool> {
        let store = self.metadata_at(commit);
        match store.try_load::<crate::schema::Targets>("targets")? {
            Some(targets) => Ok(targets.signed.targets.contains_key(TEST_REPO_MARKER)),
            None => Ok(false),
        }
    }

    /// Names of all targets roles at a commit: `targets` plus every
    /// delegated role reachable from it, in breadth-first order.
    pub fn all_target_roles_at(&self, commit: &CommitId) -> Result<Vec<String>> {
        let store = self.metadata_at(commit);
        let mut roles = vec!["targets".to_owned()];
        let mut seen: HashSet<String> = roles.iter().cloned().collect();
        let mut queue = VecDeque::new();
        queue.push_back(store.targets()?);
        while let Some(parent) = queue.pop_front() {
            for role in parent.signed.delegated_roles() {
                if seen.insert(role.name.clone()) {
                    roles.push(role.name.clone());
                    queue.push_back(store.delegated_targets(&role.name)?);
                }
            }
        }
        Ok(roles)
    }

    /// The role responsible for signing a target path at a commit: the
    /// deepest delegated role whose patterns match the path, with ties
    /// broken by the parent's declared order; `targets` when no delegation
    /// matches.
    pub fn role_for_target_path(&self, commit: &CommitId, path: &str) -> Result<String> {
        let store = self.metadata_at(commit);
        let mut current_name = "targets".to_owned();
        let mut current = store.targets()?;
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            let next = current
                .signed
                .delegated_roles()
                .find(|role| role.paths.matched_target(path))
                .map(|role| role.name.clone());
            match next {
                Some(name) if seen.insert(name.clone()) => {
                    current = store.delegated_targets(&name)?;
                    current_name = name;
                }
                _ => return Ok(current_name),
            }
        }
    }

    /// The signed descriptor for a target path at a commit, along with the
    /// target file's JSON body when it parses as JSON. The body is what
    /// carries a repository pin; its length and hashes are bound by the
    /// descriptor.
    pub fn target_descriptor(
        &self,
        commit: &CommitId,
        path: &str,
    ) -> Result<Option<(Target, Option<Value>)>> {
        let role = self.role_for_target_path(commit, path)?;
        let store = self.metadata_at(commit);
        let targets = store.delegated_targets(&role)?;
        let descriptor = match targets.signed.target(path) {
            Some(descriptor) => descriptor.clone(),
            None => return Ok(None),
        };
        let body = self.target_json(commit, path)?;
        Ok(Some((descriptor, body)))
    }

    /// The dependency authentication repositories declared at a commit.
    /// A missing `dependencies.json` means no dependencies.
    pub fn dependencies_at(&self, commit: &CommitId) -> Result<Vec<Dependency>> {
        let value = match self.target_json(commit, DEPENDENCIES_JSON)? {
            Some(value) => value,
            None => return Ok(Vec::new()),
        };
        let entries = match value.get("dependencies").and_then(Value::as_object) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let mut dependencies = Vec::new();
        for (name, entry) in entries {
            let mut custom = entry.as_object().cloned().unwrap_or_default();
            let out_of_band = match custom
                .remove("out-of-band-authentication")
                .and_then(|v| v.as_str().map(str::to_owned))
            {
                Some(commit) => Some(CommitId::from_str(&commit)?),
                None => None,
            };
            let branch = custom
                .remove("branch")
                .and_then(|v| v.as_str().map(str::to_owned));
            dependencies.push(Dependency {
                name: name.clone(),
                out_of_band,
                branch,
                custom,
            });
        }
        Ok(dependencies)
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Builds the pin history for every `(repository, branch)` across a
    /// window of authentication repository commits, oldest first. Names
    /// matching any of the `excluded` globs are skipped entirely.
    pub fn pin_schedule(
        &self,
        commits: &[CommitId],
        excluded: &[String],
    ) -> Result<PinSchedule> {
        let excluded = build_globset(excluded)?;
        let default_branch = self.git.default_branch()?;
        let mut schedule: PinSchedule = BTreeMap::new();
        let mut previous: BTreeMap<String, (CommitId, String)> = BTreeMap::new();
        for auth_commit in commits {
            for (repo_name, target) in self.repository_targets_at(auth_commit)? {
                if excluded.is_match(&repo_name) {
                    continue;
                }
                let mut body = match target {
                    Some(body) => body,
                    None => continue,
                };
                let pinned = match body
                    .remove("commit")
                    .and_then(|v| v.as_str().map(str::to_owned))
                {
                    Some(commit) => CommitId::from_str(&commit)?,
                    None => continue,
                };
                let branch = body
                    .remove("branch")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_else(|| default_branch.clone());
                if previous.get(&repo_name) == Some(&(pinned.clone(), branch.clone())) {
                    continue;
                }
                previous.insert(repo_name.clone(), (pinned.clone(), branch.clone()));
                schedule
                    .entry(repo_name)
                    .or_default()
                    .entry(branch)
                    .or_default()
                    .push(PinEntry {
                        commit: pinned,
                        auth_commit: auth_commit.clone(),
                        custom: body,
                    });
            }
        }
        Ok(schedule)
    }

    /// The target files at one commit that correspond to repositories
    /// listed in `repositories.json`, as parsed JSON bodies. Repositories
    /// listed but without a target file are included with `None` so callers
    /// can tell "unreferenced" apart from "never listed".
    fn repository_targets_at(
        &self,
        commit: &CommitId,
    ) -> Result<Vec<(String, Option<serde_json::Map<String, Value>>)>> {
        let listed = match self.target_json(commit, crate::repositories::REPOSITORIES_JSON)? {
            Some(value) => match value.get("repositories").and_then(Value::as_object) {
                Some(repositories) => repositories
                    .keys()
                    .cloned()
                    .collect::<Vec<String>>(),
                None => return Ok(Vec::new()),
            },
            // repositories.json might not exist at the initial commits.
            None => return Ok(Vec::new()),
        };
        let store = self.metadata_at(commit);
        let mut pinned_paths: HashSet<String> = HashSet::new();
        for role in self.all_target_roles_at(commit)? {
            let targets = store.delegated_targets(&role)?;
            pinned_paths.extend(targets.signed.targets.keys().cloned());
        }
        let mut result = Vec::new();
        for name in listed {
            if !pinned_paths.contains(&name) {
                result.push((name, None));
                continue;
            }
            let body = self
                .target_json(commit, &name)?
                .and_then(|v| v.as_object().cloned());
            result.push((name, body));
        }
        Ok(result)
    }

    /// True when `commit` was ever pinned for `target_name` across this
    /// repository's history on the default branch.
    pub fn is_commit_authenticated(&self, target_name: &str, commit: &CommitId) -> Result<bool> {
        let branch = self.git.default_branch()?;
        let head = match self.git.head_commit(Some(&branch))? {
            Some(head) => head,
            None => return Ok(false),
        };
        for auth_commit in self.git.commits_between(None, &head)? {
            if let Some(body) = self.target_json(&auth_commit, target_name)? {
                if body.get("commit").and_then(Value::as_str) == Some(commit.as_str()) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Compiles exclusion globs, failing on a malformed pattern.
pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).context(error::InvalidGlobSnafu { pattern })?;
        builder.add(glob);
    }
    builder.build().context(error::InvalidGlobSnafu {
        pattern: patterns.join(","),
    })
}
