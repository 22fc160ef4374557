// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persists small pieces of client-side state (the last-validated-commit
//! watermark, per-library-root persistent data) with atomic replacement
//! semantics: write to a temporary file, fsync, rename.

use crate::error::{self, Result};
use log::debug;
use serde::Serialize;
use snafu::ResultExt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A directory holding client state files.
#[derive(Debug, Clone)]
pub(crate) struct Store {
    dir: PathBuf,
}

impl Store {
    pub(crate) fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads a state file as a string. A missing file is `None`.
    pub(crate) fn read(&self, file: &str) -> Result<Option<String>> {
        let path = self.dir.join(file);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(error::FileReadSnafu { path }),
        }
    }

    /// Atomically replaces a state file's contents. The write is durable
    /// before the rename happens so a crash leaves either the old or the new
    /// contents, never a mix.
    pub(crate) fn write(&self, file: &str, contents: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir).context(error::FileWriteSnafu { path: &self.dir })?;
        let path = self.dir.join(file);
        debug!("writing {}", path.display());
        let mut temp =
            NamedTempFile::new_in(&self.dir).context(error::FileWriteSnafu { path: &path })?;
        temp.write_all(contents)
            .context(error::FileWriteSnafu { path: &path })?;
        temp.as_file()
            .sync_all()
            .context(error::FileWriteSnafu { path: &path })?;
        temp.persist(&path)
            .context(error::FilePersistSnafu { path: &path })?;
        Ok(())
    }

    /// Atomically replaces a state file with a JSON document.
    pub(crate) fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let contents = serde_json::to_vec_pretty(value).context(error::JsonSerializeSnafu {
            what: file.to_owned(),
        })?;
        self.write(file, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::Store;
    use tempfile::TempDir;

    #[test]
    fn read_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        assert_eq!(store.read("absent").unwrap(), None);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("nested"));
        store.write("watermark", b"abc123").unwrap();
        assert_eq!(store.read("watermark").unwrap().unwrap(), "abc123");
        store.write("watermark", b"def456").unwrap();
        assert_eq!(store.read("watermark").unwrap().unwrap(), "def456");
        // No temporary files are left behind after a successful write.
        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "watermark")
            .collect();
        assert!(leftovers.is_empty());
    }
}
