// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dispatches lifecycle handler scripts after an update run. Scripts live
//! inside the authentication repository under
//! `targets/scripts/repo/<event>/`, are enumerated at the accepted commit
//! (never from the working tree), receive a JSON payload on stdin, and may
//! return persistent and transient state on stdout.

use crate::auth_repo::AuthRepo;
use crate::error::{self, Result};
use crate::git::CommitId;
use crate::pipeline::UpdateOutput;
use crate::store::Store;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

/// The per-library-root configuration file, read once per process.
const CONFIG_FILE: &str = "config.json";

/// The per-library-root persistent state file, rewritten after every
/// handler script that returns persistent data.
const PERSISTENT_FILE: &str = "persistent.json";

/// Repository-stage handler scripts live under this target path.
const SCRIPTS_ROOT: &str = "targets/scripts/repo";

/// Lifecycle events observed by handler scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// The run finished without error (emitted for both changed and
    /// unchanged outcomes).
    Succeeded,
    /// The run finished without error and moved state forward.
    Changed,
    /// The run finished without error and nothing changed.
    Unchanged,
    /// The run failed.
    Failed,
    /// Emitted after every run, success or failure.
    Completed,
}

forward_display_to_serde!(Event);
forward_from_str_to_serde!(Event);

impl Event {
    /// True for the success-family events.
    pub fn succeeded(self) -> bool {
        matches!(self, Event::Succeeded | Event::Changed | Event::Unchanged)
    }
}

fn config_db() -> &'static Mutex<HashMap<PathBuf, Value>> {
    static CONFIG_DB: OnceLock<Mutex<HashMap<PathBuf, Value>>> = OnceLock::new();
    CONFIG_DB.get_or_init(|| Mutex::new(HashMap::new()))
}

fn dispatch_locks() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The configuration for a library root, read once per process and cached.
/// A missing or malformed file is an empty configuration.
fn get_config(library_root: &Path) -> Value {
    let mut db = config_db().lock().unwrap_or_else(|e| e.into_inner());
    db.entry(library_root.to_path_buf())
        .or_insert_with(|| {
            std::fs::read(library_root.join(CONFIG_FILE))
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                .unwrap_or_else(|| json!({}))
        })
        .clone()
}

/// The persistent state for a library root, read fresh at dispatch time.
/// A missing or malformed file is empty state.
fn get_persistent(library_root: &Path) -> Value {
    std::fs::read(library_root.join(PERSISTENT_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_else(|| json!({}))
}

/// Runs the repository-stage handler scripts for a finished update run.
/// Dispatchers for the same library root run serially even when pipelines
/// run in parallel.
pub(crate) fn handle_repo_event(
    auth: &AuthRepo,
    output: &UpdateOutput,
    library_root: &Path,
) -> Result<()> {
    let lock = {
        let mut locks = dispatch_locks().lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(library_root.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    };
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    // Scripts are read from the accepted commit: the last commit this run
    // validated for success events, the pre-run watermark for failures. A
    // client with no validated commit has nothing trustworthy to execute.
    let script_commit = match &output.commits.after_pull {
        Some(commit) => commit.clone(),
        None => {
            debug!(
                "{}: no validated commit, skipping lifecycle scripts",
                auth.name()
            );
            return Ok(());
        }
    };

    let mut data = json!({
        "update": {
            "changed": output.event == Event::Changed,
            "event": format!("event/{}", if output.event.succeeded() { Event::Succeeded } else { Event::Failed }),
            "repo_name": output.auth_repo_name,
            "error_msg": output.error.as_ref().map(ToString::to_string).unwrap_or_default(),
            "auth_repo": {
                "data": {
                    "name": auth.name(),
                    "path": auth.path().display().to_string(),
                    "urls": auth.git().urls(),
                },
                "commits": output.commits,
            },
            "target_repos": output.targets,
        },
        "state": {
            "transient": {},
            "persistent": get_persistent(library_root),
        },
        "config": get_config(library_root),
    });

    let ordered = if output.event.succeeded() {
        vec![output.event, Event::Succeeded, Event::Completed]
    } else {
        vec![Event::Failed, Event::Completed]
    };
    for event in ordered {
        execute_scripts(auth, &script_commit, event, &mut data, library_root)?;
    }
    Ok(())
}

/// Executes the scripts for one event in lexicographic filename order,
/// threading transient state between them and persisting persistent state
/// after each.
fn execute_scripts(
    auth: &AuthRepo,
    commit: &CommitId,
    event: Event,
    data: &mut Value,
    library_root: &Path,
) -> Result<()> {
    let scripts_dir = format!("{}/{}", SCRIPTS_ROOT, event);
    let names = match auth.git().list_tree_at(commit, &scripts_dir) {
        Ok(names) => names,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let names: Vec<String> = names.into_iter().filter(|n| !n.contains('/')).collect();
    if names.is_empty() {
        return Ok(());
    }

    // Materialize script contents from the object store into a private
    // directory; the working tree could contain a newer, unvalidated copy.
    let dir = TempDir::new().context(error::TempDirSnafu)?;
    for name in &names {
        let script_path = format!("{}/{}", scripts_dir, name);
        let contents = auth.git().read_file_at(commit, &script_path)?;
        let on_disk = dir.path().join(name);
        std::fs::write(&on_disk, contents).context(error::FileWriteSnafu { path: &on_disk })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&on_disk, std::fs::Permissions::from_mode(0o755));
        }
    }

    let persistent_store = Store::new(library_root);
    for name in &names {
        let path = dir.path().join(name);
        debug!("{}: running {} handler {}", auth.name(), event, name);
        let output = run_script(&path, data)?;
        if let Some(output) = output {
            let transient = output.get("transient").cloned().unwrap_or_else(|| json!({}));
            let persistent = output
                .get("persistent")
                .cloned()
                .unwrap_or_else(|| json!({}));
            persistent_store.write_json(PERSISTENT_FILE, &persistent)?;
            data["state"]["transient"] = transient;
            data["state"]["persistent"] = persistent;
        }
    }
    Ok(())
}

/// Runs one handler script, passing the payload on stdin. Returns the
/// parsed stdout, or `None` when the script printed nothing.
fn run_script(path: &Path, data: &Value) -> Result<Option<Value>> {
    let script = path.display().to_string();
    let payload = data.to_string();
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            error::ScriptExecutionSnafu {
                script: script.clone(),
                message: err.to_string(),
            }
            .build()
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        // A script is free to ignore its stdin and exit; a broken pipe here
        // is not an error.
        if let Err(err) = stdin.write_all(payload.as_bytes()) {
            warn!("handler {} did not read its payload: {}", script, err);
        }
    }
    let result = child.wait_with_output().map_err(|err| {
        error::ScriptExecutionSnafu {
            script: script.clone(),
            message: err.to_string(),
        }
        .build()
    })?;
    if !result.status.success() {
        return error::ScriptExecutionSnafu {
            script,
            message: format!(
                "exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            ),
        }
        .fail();
    }
    let stdout = String::from_utf8_lossy(&result.stdout);
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(stdout).map_err(|err| {
        error::ScriptExecutionSnafu {
            script,
            message: format!("invalid JSON on stdout: {}", err),
        }
        .build()
    })?;
    Ok(Some(value))
}
