// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolves the set of target repositories an authentication repository
//! manages, from `targets/repositories.json` and `targets/mirrors.json` at a
//! window of commits.

use crate::auth_repo::AuthRepo;
use crate::error::Result;
use crate::git::CommitId;
use log::warn;
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// Target file naming the managed repositories.
pub(crate) const REPOSITORIES_JSON: &str = "repositories.json";

/// Target file holding mirror URL templates.
pub(crate) const MIRRORS_JSON: &str = "mirrors.json";

/// The custom attribute permitting commits that are not individually
/// pinned.
const ALLOW_UNAUTHENTICATED: &str = "allow-unauthenticated-commits";

/// One target repository as declared by the authentication repository: its
/// name, the URLs it can be cloned from, and its custom attributes.
#[derive(Debug, Clone)]
pub struct TargetRepoSpec {
    /// The repository's name (`namespace/name`).
    pub name: String,
    /// Clone/fetch URLs, in the order they should be tried.
    pub urls: Vec<String>,
    /// Custom attributes from `repositories.json`.
    pub custom: serde_json::Map<String, Value>,
}

impl TargetRepoSpec {
    /// True when commits that are not individually pinned are permitted on
    /// this repository's branches.
    pub fn allow_unauthenticated(&self) -> bool {
        self.custom
            .get(ALLOW_UNAUTHENTICATED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Produces the deduplicated set of target repositories declared across a
/// window of commits. When a repository is declared at several commits, the
/// most recent declaration wins.
pub(crate) fn load_target_repositories(
    auth: &AuthRepo,
    commits: &[CommitId],
) -> Result<BTreeMap<String, TargetRepoSpec>> {
    let mut repositories = BTreeMap::new();
    for commit in commits {
        let declared = match auth.target_json(commit, REPOSITORIES_JSON)? {
            Some(value) => value,
            None => continue,
        };
        let declared = match declared.get("repositories").and_then(Value::as_object) {
            Some(declared) => declared.clone(),
            None => continue,
        };
        let mirrors = mirror_templates(auth, commit)?;
        for (name, entry) in declared {
            let custom = entry
                .get("custom")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let urls = repository_urls(&name, &entry, &mirrors);
            repositories.insert(
                name.clone(),
                TargetRepoSpec {
                    name,
                    urls,
                    custom,
                },
            );
        }
    }
    Ok(repositories)
}

/// Mirror URL templates at a commit. A missing `mirrors.json` means no
/// templates.
fn mirror_templates(auth: &AuthRepo, commit: &CommitId) -> Result<Vec<String>> {
    Ok(auth
        .target_json(commit, MIRRORS_JSON)?
        .and_then(|value| value.get("mirrors").cloned())
        .and_then(|mirrors| {
            mirrors.as_array().map(|array| {
                array
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
        })
        .unwrap_or_default())
}

/// The URLs for one repository: its explicit `urls` list when present,
/// otherwise every mirror template with `{org_name}` and `{repo_name}`
/// substituted from the repository's namespaced name.
fn repository_urls(name: &str, entry: &Value, mirrors: &[String]) -> Vec<String> {
    if let Some(urls) = entry.get("urls").and_then(Value::as_array) {
        return urls
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
    }
    let (org_name, repo_name) = match name.split_once('/') {
        Some(split) => split,
        None => ("", name),
    };
    mirrors
        .iter()
        .map(|template| {
            template
                .replace("{org_name}", org_name)
                .replace("{repo_name}", repo_name)
        })
        .inspect(|url| {
            if !url.contains("://") {
                return;
            }
            if let Err(err) = Url::parse(url) {
                warn!("mirror for {} produced an unparsable URL {:?}: {}", name, url, err);
            }
        })
        .collect()
}
