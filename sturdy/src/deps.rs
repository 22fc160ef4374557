// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Walks the dependency graph of authentication repositories breadth-first,
//! running an independent update pipeline for every repository reachable
//! from the one the caller named.

use crate::auth_repo::{AuthRepo, Dependency};
use crate::error::{self, Result};
use crate::git::CommitId;
use crate::lifecycle::{self, Event};
use crate::pipeline::{UpdateOutput, UpdatePipeline};
use crate::UpdateOptions;
use log::{info, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// The result of updating an authentication repository and every dependency
/// reachable from it.
#[derive(Debug)]
pub struct LibraryResult {
    /// The terminal event of the run as a whole.
    pub event: Event,
    /// The outcome for the repository the caller named.
    pub root: UpdateOutput,
    /// Outcomes for dependency repositories, keyed by name. Cycles are
    /// skipped, so each repository appears at most once.
    pub dependencies: BTreeMap<String, UpdateOutput>,
}

impl LibraryResult {
    /// True when the root repository and (in strict mode) every dependency
    /// updated successfully.
    pub fn succeeded(&self) -> bool {
        self.event.succeeded()
    }
}

/// One repository waiting to be updated during the walk.
struct QueuedRepo {
    name: Option<String>,
    url: String,
    out_of_band: Option<CommitId>,
}

/// Runs the pipeline for the named repository, then for each of its
/// dependencies in breadth-first order. Each repository runs an independent
/// pipeline; a dependency's failure does not abort its siblings.
pub(crate) fn update_with_dependencies(
    url: &str,
    name: Option<&str>,
    out_of_band: Option<CommitId>,
    opts: &UpdateOptions,
) -> Result<LibraryResult> {
    let root = run_one(url, name, out_of_band, opts);
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(root.auth_repo_name.clone());

    let mut dependencies = BTreeMap::new();
    let mut queue: VecDeque<QueuedRepo> = VecDeque::new();
    if !opts.no_deps {
        enqueue_children(&root, url, &mut queue, opts);
    }

    while let Some(next) = queue.pop_front() {
        let display_name = next.name.clone().unwrap_or_else(|| next.url.clone());
        if !visited.insert(display_name.clone()) {
            warn!(
                "dependency {} already updated in this run, skipping",
                display_name
            );
            continue;
        }
        info!("updating dependency {}", display_name);
        let output = run_one(&next.url, next.name.as_deref(), next.out_of_band, opts);
        if !opts.no_deps {
            enqueue_children(&output, &next.url, &mut queue, opts);
        }
        dependencies.insert(output.auth_repo_name.clone(), output);
    }

    let failed_child = dependencies
        .iter()
        .find(|(_, child)| child.event == Event::Failed)
        .map(|(name, child)| {
            (
                name.clone(),
                child
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "update failed".to_owned()),
            )
        });
    if opts.strict {
        if let Some((name, message)) = failed_child {
            return Ok(LibraryResult {
                event: Event::Failed,
                root: UpdateOutput {
                    event: Event::Failed,
                    error: Some(error::DependencyFailedSnafu { name, message }.build()),
                    ..root
                },
                dependencies,
            });
        }
    }
    Ok(LibraryResult {
        event: root.event,
        root,
        dependencies,
    })
}

/// Runs one pipeline and dispatches lifecycle handlers for its outcome. A
/// handler failure turns the run's outcome into a failure.
fn run_one(
    url: &str,
    name: Option<&str>,
    out_of_band: Option<CommitId>,
    opts: &UpdateOptions,
) -> UpdateOutput {
    let mut output = UpdatePipeline::new(url, name, out_of_band, opts).run();
    if !opts.only_validate {
        let auth = AuthRepo::new(
            &opts.library_dir,
            &output.auth_repo_name,
            vec![url.to_owned()],
            opts.conf_root.as_deref(),
        );
        if auth.git().is_repository() {
            if let Err(err) = lifecycle::handle_repo_event(&auth, &output, &opts.library_dir) {
                warn!("{}: lifecycle dispatch failed: {}", output.auth_repo_name, err);
                output.event = Event::Failed;
                output.error = Some(err);
            }
        }
    }
    output
}

/// Reads the dependencies declared at a finished run's accepted commit and
/// queues them for updating.
fn enqueue_children(
    output: &UpdateOutput,
    parent_url: &str,
    queue: &mut VecDeque<QueuedRepo>,
    opts: &UpdateOptions,
) {
    let accepted = match &output.commits.after_pull {
        Some(commit) => commit.clone(),
        None => return,
    };
    let auth = AuthRepo::new(
        &opts.library_dir,
        &output.auth_repo_name,
        vec![parent_url.to_owned()],
        opts.conf_root.as_deref(),
    );
    let reader = if auth.git().is_repository() {
        auth
    } else {
        // Validate-only runs may not have a local clone; there is nothing
        // safe to read dependencies from.
        return;
    };
    let dependencies = match reader.dependencies_at(&accepted) {
        Ok(dependencies) => dependencies,
        Err(err) => {
            warn!(
                "{}: could not read dependencies: {}",
                output.auth_repo_name, err
            );
            return;
        }
    };
    for dependency in dependencies {
        match dependency_url(&dependency, parent_url, &output.auth_repo_name) {
            Some(url) => queue.push_back(QueuedRepo {
                name: Some(dependency.name),
                url,
                out_of_band: dependency.out_of_band,
            }),
            None => warn!(
                "{}: cannot derive a URL for dependency {}, skipping",
                output.auth_repo_name, dependency.name
            ),
        }
    }
}

/// The URL a dependency is reachable at: an explicit `urls` attribute when
/// present, otherwise the parent's URL with the repository name swapped.
fn dependency_url(dependency: &Dependency, parent_url: &str, parent_name: &str) -> Option<String> {
    if let Some(urls) = dependency.custom.get("urls").and_then(Value::as_array) {
        if let Some(url) = urls.iter().find_map(Value::as_str) {
            return Some(url.to_owned());
        }
    }
    let normalized = parent_url.trim_end_matches('/');
    for suffix in &[format!("{}.git", parent_name), parent_name.to_owned()] {
        if let Some(base) = normalized.strip_suffix(suffix.as_str()) {
            let tail = if suffix.ends_with(".git") {
                format!("{}.git", dependency.name)
            } else {
                dependency.name.clone()
            };
            return Some(format!("{}{}", base, tail));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::dependency_url;
    use crate::auth_repo::Dependency;

    fn dependency(name: &str, custom: serde_json::Value) -> Dependency {
        Dependency {
            name: name.to_owned(),
            out_of_band: None,
            branch: None,
            custom: custom.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn explicit_urls_win() {
        let dep = dependency("ns/child", serde_json::json!({ "urls": ["file:///x"] }));
        assert_eq!(
            dependency_url(&dep, "https://host/ns/parent", "ns/parent"),
            Some("file:///x".to_owned())
        );
    }

    #[test]
    fn derived_from_parent_url() {
        let dep = dependency("ns/child", serde_json::json!({}));
        assert_eq!(
            dependency_url(&dep, "https://host/ns/parent", "ns/parent"),
            Some("https://host/ns/child".to_owned())
        );
        assert_eq!(
            dependency_url(&dep, "https://host/ns/parent.git", "ns/parent"),
            Some("https://host/ns/child.git".to_owned())
        );
        assert_eq!(dependency_url(&dep, "https://elsewhere/x", "ns/parent"), None);
    }
}
