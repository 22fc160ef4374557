// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

// An integration test might want to use some, but not all of, the symbols
// herein. To do so would cause compiler warnings for unused code, so we
// suppress them.
#![allow(unused)]

use chrono::{DateTime, TimeZone, Utc};
use ring::signature::Ed25519KeyPair;
use sturdy::git::{CommitId, GitRepo};
use sturdy::schema::decoded::{Decoded, Hex};
use sturdy::schema::key::Key;
use sturdy::schema::{
    DelegatedRole, Delegations, Hashes, PathSet, Role, RoleKeys, RoleType, Root, Signature,
    Signed, Snapshot, SnapshotMeta, Target, Targets, Timestamp, TimestampMeta,
};
use sturdy::sign::Sign;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

/// A signing key for one metadata role in a fixture repository.
pub struct RoleKey {
    pair: Ed25519KeyPair,
}

impl RoleKey {
    pub fn generate() -> Self {
        let rng = ring::rand::SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Self {
            pair: Ed25519KeyPair::from_pkcs8(document.as_ref()).unwrap(),
        }
    }

    pub fn key(&self) -> Key {
        self.pair.tuf_key()
    }

    pub fn keyid(&self) -> Decoded<Hex> {
        self.key().key_id().unwrap()
    }

    pub fn sign_role<T: Role>(&self, role: &T) -> Signature {
        let rng = ring::rand::SystemRandom::new();
        let canonical = role.canonical_form().unwrap();
        let sig = Sign::sign(&self.pair, &canonical, &rng).unwrap();
        Signature {
            keyid: self.keyid(),
            sig: Decoded::from(sig),
            scheme: None,
        }
    }
}

/// Builds a complete, signed authentication repository on disk, committing
/// a coherent set of role metadata and target files each time `commit` is
/// called.
pub struct AuthRepoFixture {
    pub repo: GitRepo,
    pub path: PathBuf,
    root_key: RoleKey,
    targets_key: RoleKey,
    snapshot_key: RoleKey,
    timestamp_key: RoleKey,
    delegated_key: Option<RoleKey>,
    version: u64,
    expires: DateTime<Utc>,
    target_files: BTreeMap<String, Vec<u8>>,
}

impl AuthRepoFixture {
    pub fn create(path: &Path, namespace: &str, name: &str) -> Self {
        fs::create_dir_all(path).unwrap();
        let repo = GitRepo::new(path, &format!("{}/{}", namespace, name), Vec::new());
        repo.init(false, "main").unwrap();
        let mut fixture = Self {
            repo,
            path: path.to_path_buf(),
            root_key: RoleKey::generate(),
            targets_key: RoleKey::generate(),
            snapshot_key: RoleKey::generate(),
            timestamp_key: RoleKey::generate(),
            delegated_key: None,
            version: 0,
            expires: Utc.with_ymd_and_hms(2035, 1, 1, 0, 0, 0).unwrap(),
        target_files: BTreeMap::new(),
        };
        fixture.set_target_json(
            "protected/info.json",
            serde_json::json!({ "namespace": namespace, "name": name }),
        );
        fixture
    }

    /// Delegate every `ns/*` target path to a dedicated role named `pins`.
    pub fn with_delegated_pins_role(mut self) -> Self {
        self.delegated_key = Some(RoleKey::generate());
        self
    }

    pub fn set_target_bytes(&mut self, name: &str, bytes: Vec<u8>) {
        self.target_files.insert(name.to_owned(), bytes);
    }

    pub fn set_target_json(&mut self, name: &str, value: serde_json::Value) {
        self.set_target_bytes(name, serde_json::to_vec_pretty(&value).unwrap());
    }

    /// Declares the managed repositories. Each entry is
    /// `(name, url, allow_unauthenticated)`.
    pub fn set_repositories(&mut self, repositories: &[(&str, &str, bool)]) {
        let mut map = serde_json::Map::new();
        for (name, url, allow) in repositories {
            let mut entry = serde_json::json!({ "urls": [url] });
            if *allow {
                entry["custom"] = serde_json::json!({ "allow-unauthenticated-commits": true });
            }
            map.insert((*name).to_owned(), entry);
        }
        self.set_target_json(
            "repositories.json",
            serde_json::json!({ "repositories": map }),
        );
    }

    /// Declares dependency authentication repositories. Each entry is
    /// `(name, out_of_band_commit)`.
    pub fn set_dependencies(&mut self, dependencies: &[(&str, &CommitId)]) {
        let mut map = serde_json::Map::new();
        for (name, commit) in dependencies {
            map.insert(
                (*name).to_owned(),
                serde_json::json!({
                    "out-of-band-authentication": commit.as_str(),
                    "branch": "main"
                }),
            );
        }
        self.set_target_json(
            "dependencies.json",
            serde_json::json!({ "dependencies": map }),
        );
    }

    /// Pins a target repository's branch to a commit.
    pub fn pin(&mut self, repo: &str, branch: &str, commit: &CommitId) {
        self.set_target_json(
            repo,
            serde_json::json!({ "commit": commit.as_str(), "branch": branch }),
        );
    }

    pub fn commit(&mut self, message: &str) -> CommitId {
        self.write_all(false);
        self.repo.commit(message).unwrap()
    }

    /// Like `commit`, but flips a byte of the timestamp role's signature
    /// before committing, producing metadata that fails verification.
    pub fn commit_with_bad_timestamp(&mut self, message: &str) -> CommitId {
        self.write_all(true);
        self.repo.commit(message).unwrap()
    }

    pub fn head(&self) -> CommitId {
        self.repo.head_commit(Some("main")).unwrap().unwrap()
    }

    pub fn url(&self) -> String {
        self.path.display().to_string()
    }

    fn write_all(&mut self, corrupt_timestamp: bool) {
        self.version += 1;
        let version = NonZeroU64::new(self.version).unwrap();

        for (name, bytes) in &self.target_files {
            let on_disk = self.path.join("targets").join(name);
            fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
            fs::write(on_disk, bytes).unwrap();
        }

        // Root: all four role keys at threshold one.
        let mut keys = HashMap::new();
        let mut roles = HashMap::new();
        for (role, key) in &[
            (RoleType::Root, &self.root_key),
            (RoleType::Targets, &self.targets_key),
            (RoleType::Snapshot, &self.snapshot_key),
            (RoleType::Timestamp, &self.timestamp_key),
        ] {
            keys.insert(key.keyid(), key.key());
            roles.insert(
                *role,
                RoleKeys {
                    keyids: vec![key.keyid()],
                    threshold: NonZeroU64::new(1).unwrap(),
                    _extra: HashMap::new(),
                },
            );
        }
        let root = Root {
            spec_version: "1.0.0".to_owned(),
            consistent_snapshot: false,
            version: NonZeroU64::new(1).unwrap(),
            expires: self.expires,
            keys,
            roles,
            _extra: HashMap::new(),
        };
        self.write_signed("root", &root, &self.root_key);

        // Targets, optionally delegating ns/* paths to a `pins` role.
        let mut top_level: HashMap<String, Target> = HashMap::new();
        let mut delegated: HashMap<String, Target> = HashMap::new();
        for (name, bytes) in &self.target_files {
            let descriptor = Target::from_bytes(bytes);
            if self.delegated_key.is_some() && name.starts_with("ns/") {
                delegated.insert(name.clone(), descriptor);
            } else {
                top_level.insert(name.clone(), descriptor);
            }
        }
        let delegations = self.delegated_key.as_ref().map(|key| Delegations {
            keys: {
                let mut keys = HashMap::new();
                keys.insert(key.keyid(), key.key());
                keys
            },
            roles: vec![DelegatedRole {
                name: "pins".to_owned(),
                keyids: vec![key.keyid()],
                threshold: NonZeroU64::new(1).unwrap(),
                paths: PathSet::Paths(vec!["ns/*".to_owned()]),
                terminating: false,
            }],
        });
        let targets = Targets {
            spec_version: "1.0.0".to_owned(),
            version,
            expires: self.expires,
            targets: top_level,
            delegations,
            _extra: HashMap::new(),
        };
        self.write_signed("targets", &targets, &self.targets_key);

        let mut snapshot_meta = HashMap::new();
        snapshot_meta.insert(
            "targets.json".to_owned(),
            SnapshotMeta {
                length: None,
                hashes: None,
                version,
                _extra: HashMap::new(),
            },
        );
        if let Some(key) = &self.delegated_key {
            let pins = Targets {
                spec_version: "1.0.0".to_owned(),
                version,
                expires: self.expires,
                targets: delegated,
                delegations: None,
                _extra: HashMap::new(),
            };
            self.write_signed("pins", &pins, key);
            snapshot_meta.insert(
                "pins.json".to_owned(),
                SnapshotMeta {
                    length: None,
                    hashes: None,
                    version,
                    _extra: HashMap::new(),
                },
            );
        }

        let snapshot = Snapshot {
            spec_version: "1.0.0".to_owned(),
            version,
            expires: self.expires,
            meta: snapshot_meta,
            _extra: HashMap::new(),
        };
        let snapshot_bytes = self.write_signed("snapshot", &snapshot, &self.snapshot_key);

        let snapshot_descriptor = Target::from_bytes(&snapshot_bytes);
        let mut timestamp_meta = HashMap::new();
        timestamp_meta.insert(
            "snapshot.json".to_owned(),
            TimestampMeta {
                length: snapshot_bytes.len() as u64,
                hashes: snapshot_descriptor.hashes,
                version,
                _extra: HashMap::new(),
            },
        );
        let timestamp = Timestamp {
            spec_version: "1.0.0".to_owned(),
            version,
            expires: self.expires,
            meta: timestamp_meta,
            _extra: HashMap::new(),
        };
        let mut signature = self.timestamp_key.sign_role(&timestamp);
        if corrupt_timestamp {
            let mut bytes = signature.sig.bytes().to_vec();
            bytes[0] ^= 0xff;
            signature.sig = Decoded::from(bytes);
        }
        let signed = Signed {
            signed: timestamp,
            signatures: vec![signature],
        };
        self.write_metadata_file("timestamp", &serde_json::to_vec_pretty(&signed).unwrap());
    }

    fn write_signed<T: Role + serde::Serialize>(
        &self,
        role: &str,
        value: &T,
        key: &RoleKey,
    ) -> Vec<u8> {
        let signed = Signed {
            signed: value,
            signatures: vec![key.sign_role(value)],
        };
        let bytes = serde_json::to_vec_pretty(&signed).unwrap();
        self.write_metadata_file(role, &bytes);
        bytes
    }

    fn write_metadata_file(&self, role: &str, bytes: &[u8]) {
        let dir = self.path.join("metadata");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.json", role)), bytes).unwrap();
    }
}

/// A plain Git repository standing in for a managed target repository.
pub struct TargetRepoFixture {
    pub repo: GitRepo,
    pub path: PathBuf,
}

impl TargetRepoFixture {
    pub fn create(path: &Path, name: &str) -> Self {
        fs::create_dir_all(path).unwrap();
        let repo = GitRepo::new(path, name, Vec::new());
        repo.init(false, "main").unwrap();
        Self {
            repo,
            path: path.to_path_buf(),
        }
    }

    pub fn commit_file(&self, file: &str, contents: &str, message: &str) -> CommitId {
        fs::write(self.path.join(file), contents).unwrap();
        self.repo.commit(message).unwrap()
    }

    pub fn head(&self) -> CommitId {
        self.repo.head_commit(Some("main")).unwrap().unwrap()
    }

    pub fn url(&self) -> String {
        self.path.display().to_string()
    }
}
