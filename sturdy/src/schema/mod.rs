// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the signed metadata role objects stored in an authentication
//! repository's `metadata/` directory.

mod de;
pub mod decoded;
mod error;
pub mod key;
mod spki;
mod verify;

pub use crate::schema::error::{Error, Result};

use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use chrono::{DateTime, Utc};
use globset::Glob;
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::HashMap;
use std::num::NonZeroU64;

/// The directory within an authentication repository that holds role
/// metadata.
pub const METADATA_DIRECTORY: &str = "metadata";

/// The directory within an authentication repository that holds target files.
pub const TARGETS_DIRECTORY: &str = "targets";

/// Path of a role's metadata file relative to the repository root.
pub fn role_metadata_path(role: &str) -> String {
    format!("{}/{}.json", METADATA_DIRECTORY, role)
}

/// Path of a target file relative to the repository root.
pub fn target_path(name: &str) -> String {
    format!("{}/{}", TARGETS_DIRECTORY, name)
}

/// The type of a top-level metadata role.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    /// The root role delegates trust to specific keys trusted for all other
    /// top-level roles used in the system.
    Root,
    /// The snapshot role signs a metadata file that provides information
    /// about the latest version of all targets metadata on the repository.
    Snapshot,
    /// The targets role's signature indicates which target files are trusted
    /// by clients.
    Targets,
    /// The timestamp role is used to prevent an adversary from replaying an
    /// out-of-date signed metadata file whose signature has not yet expired.
    Timestamp,
}

forward_display_to_serde!(RoleType);
forward_from_str_to_serde!(RoleType);

impl RoleType {
    /// The conventional name of the role's metadata file, without extension.
    pub fn name(self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Snapshot => "snapshot",
            RoleType::Targets => "targets",
            RoleType::Timestamp => "timestamp",
        }
    }
}

/// Common trait implemented by all roles.
pub trait Role: Serialize {
    /// The type of role this object represents.
    const TYPE: RoleType;

    /// Determines when metadata should be considered expired and no longer
    /// trusted by clients.
    fn expires(&self) -> DateTime<Utc>;

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    fn version(&self) -> NonZeroU64;

    /// A deterministic JSON serialization used as the signature input for a
    /// metadata object. This must match the canonical form produced by the
    /// signing side bit-for-bit.
    fn canonical_form(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu {
                what: "role".to_owned(),
            })?;
        Ok(data)
    }
}

/// A signed metadata object.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role that is signed.
    pub signed: T,
    /// A list of signatures and their key IDs.
    pub signatures: Vec<Signature>,
}

/// A signature and the key ID that made it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// The key ID (listed in root.json) that made this signature.
    pub keyid: Decoded<Hex>,
    /// A hex-encoded signature of the canonical JSON form of a role.
    pub sig: Decoded<Hex>,
    /// The scheme the signature was made with, when it differs from the
    /// key's advertised scheme.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The root role is the trust anchor. It indicates which keys are authorized
/// for all top-level roles, including the root role itself. Revocation and
/// replacement of top-level role keys is done by changing the keys listed for
/// the roles in this file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "root")]
pub struct Root {
    /// The version number of the metadata specification this file follows.
    pub spec_version: String,

    /// A boolean indicating whether the repository supports consistent
    /// snapshots. Authentication repositories pin metadata by commit rather
    /// than by filename version prefixes, so this is normally `false`.
    pub consistent_snapshot: bool,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer
    /// trusted by clients.
    pub expires: DateTime<Utc>,

    /// The public keys for all top-level roles. The KEYID must be correct for
    /// the specified KEY; clients MUST calculate each KEYID to verify this.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// A list of roles, the keys associated with each role, and the threshold
    /// of signatures used for each role.
    pub roles: HashMap<RoleType, RoleKeys>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this
    /// `HashMap::new()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// Represents the key IDs used for a role and the threshold of signatures
/// required to validate it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    /// The key IDs used for the role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: NonZeroU64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Root {
    /// An iterator over the keys for a given role.
    pub fn keys(&self, role: RoleType) -> impl Iterator<Item = &Key> {
        self.roles
            .get(&role)
            .map(|role_keys| role_keys.keyids.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |keyid| self.keys.get(keyid))
    }

    /// The key set and threshold for a given role, if the role is listed.
    pub fn role_keys(&self, role: RoleType) -> Option<&RoleKeys> {
        self.roles.get(&role)
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The snapshot role lists the version numbers of the top-level targets
/// metadata and all delegated targets metadata, which the verifier uses to
/// enforce version monotonicity from one commit to the next.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "snapshot")]
pub struct Snapshot {
    /// The version number of the metadata specification this file follows.
    pub spec_version: String,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer
    /// trusted by clients.
    pub expires: DateTime<Utc>,

    /// Version information for each targets metadata file, keyed by its file
    /// name (e.g. `targets.json`).
    pub meta: HashMap<String, SnapshotMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// Describes one metadata file listed in `snapshot.json`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SnapshotMeta {
    /// The integer length in bytes of the metadata file. Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    /// One or more hashes of the metadata file. Optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// A dictionary of cryptographic hashes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Hashes {
    /// The SHA-256 digest.
    pub sha256: Decoded<Hex>,

    /// The SHA-512 digest, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<Decoded<Hex>>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Hashes {
    /// Checks `data` against every digest present.
    pub fn matches(&self, data: &[u8]) -> bool {
        if digest(&SHA256, data).as_ref() != self.sha256.bytes() {
            return false;
        }
        if let Some(sha512) = &self.sha512 {
            if digest(&ring::digest::SHA512, data).as_ref() != sha512.bytes() {
                return false;
            }
        }
        true
    }
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Represents a `targets.json` file, either the top-level targets role or a
/// delegated targets role (which has the same shape).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "targets")]
pub struct Targets {
    /// The version number of the metadata specification this file follows.
    pub spec_version: String,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer
    /// trusted by clients.
    pub expires: DateTime<Utc>,

    /// Target descriptors, keyed by target path relative to the `targets/`
    /// directory.
    pub targets: HashMap<String, Target>,

    /// Describes subsets of the targets for which responsibility is delegated
    /// to another role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// A target descriptor: the length, hashes, and custom attributes of one
/// target file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Target {
    /// The integer length in bytes of the target file.
    pub length: u64,

    /// Hashes of the target file contents.
    pub hashes: Hashes,

    /// Application-defined attributes. For repository targets this includes
    /// the pinned `commit` and `branch`.
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Target {
    /// Builds a descriptor for in-memory target file contents.
    pub fn from_bytes(data: &[u8]) -> Target {
        Target {
            length: data.len() as u64,
            hashes: Hashes {
                sha256: Decoded::from(digest(&SHA256, data).as_ref().to_vec()),
                sha512: None,
                _extra: HashMap::new(),
            },
            custom: HashMap::new(),
            _extra: HashMap::new(),
        }
    }

    /// Checks target file contents against this descriptor.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.length == data.len() as u64 && self.hashes.matches(data)
    }
}

impl Targets {
    /// Looks up a target descriptor in this role only (no delegation
    /// traversal).
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    /// The delegated roles declared by this role, in declaration order.
    pub fn delegated_roles(&self) -> impl Iterator<Item = &DelegatedRole> {
        self.delegations
            .as_ref()
            .map(|d| d.roles.as_slice())
            .unwrap_or(&[])
            .iter()
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

/// Delegations are found in a targets metadata file. They name the keys and
/// path patterns of each delegated role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Delegations {
    /// The public keys used to verify signatures of delegated targets roles.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// The list of delegated roles, in order of precedence.
    pub roles: Vec<DelegatedRole>,
}

/// One role delegated by a targets metadata file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DelegatedRole {
    /// The name of the delegated role, which is also the stem of its metadata
    /// file name.
    pub name: String,

    /// The key IDs used by this role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: NonZeroU64,

    /// The paths governed by this role.
    #[serde(flatten)]
    pub paths: PathSet,

    /// Indicates whether subsequent delegations should be considered for
    /// paths this role's patterns match.
    pub terminating: bool,
}

/// Specifies the target paths that a delegated role controls.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum PathSet {
    /// Shell-style path patterns that the role is trusted to provide.
    #[serde(rename = "paths")]
    Paths(Vec<String>),

    /// SHA-256 digest prefixes that succinctly describe a set of target
    /// paths: a path is covered when the hex digest of the path starts with
    /// one of the listed prefixes.
    #[serde(rename = "path_hash_prefixes")]
    PathHashPrefixes(Vec<String>),
}

impl PathSet {
    /// Given a target path, determines if this set matches it.
    pub fn matched_target(&self, target: &str) -> bool {
        match self {
            Self::Paths(paths) => paths.iter().any(|path| Self::matched_path(path, target)),
            Self::PathHashPrefixes(prefixes) => prefixes
                .iter()
                .any(|prefix| Self::matched_prefix(prefix, target)),
        }
    }

    fn matched_prefix(prefix: &str, target: &str) -> bool {
        let hash = hex::encode(digest(&SHA256, target.as_bytes()));
        hash.starts_with(prefix)
    }

    fn matched_path(wildcardpath: &str, target: &str) -> bool {
        match Glob::new(wildcardpath) {
            Ok(glob) => glob.compile_matcher().is_match(target),
            Err(_) => false,
        }
    }

    /// Returns a Vec representation of the `PathSet`.
    pub fn vec(&self) -> &Vec<String> {
        match self {
            PathSet::Paths(x) | PathSet::PathHashPrefixes(x) => x,
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The timestamp role binds the snapshot metadata's hash and length, limiting
/// how long a client can be kept unaware of interference with updates.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "timestamp")]
pub struct Timestamp {
    /// The version number of the metadata specification this file follows.
    pub spec_version: String,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer
    /// trusted by clients.
    pub expires: DateTime<Utc>,

    /// Metadata file information; this MUST describe only the snapshot
    /// metadata file.
    pub meta: HashMap<String, TimestampMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// Describes the snapshot metadata file in a `timestamp.json` file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimestampMeta {
    /// The integer length in bytes of the snapshot metadata file.
    pub length: u64,

    /// The hashes of the snapshot metadata file.
    pub hashes: Hashes,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata
    /// file with a version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_set_globs() {
        let set = PathSet::Paths(vec!["ns/*".to_owned(), "exact".to_owned()]);
        assert!(set.matched_target("ns/repo"));
        assert!(set.matched_target("exact"));
        assert!(!set.matched_target("other/repo"));
    }

    #[test]
    fn path_hash_prefix_matches_hex_digest() {
        let target = "ns/repo";
        let prefix = hex::encode(ring::digest::digest(
            &ring::digest::SHA256,
            target.as_bytes(),
        ));
        let set = PathSet::PathHashPrefixes(vec![prefix[..8].to_owned()]);
        assert!(set.matched_target(target));
        assert!(!set.matched_target("ns/other"));
    }

    #[test]
    fn signed_envelope_preserves_unknown_fields() {
        let value = serde_json::json!({
            "signed": {
                "_type": "timestamp",
                "spec_version": "1.0.0",
                "version": 3,
                "expires": "2031-01-01T00:00:00Z",
                "meta": {
                    "snapshot.json": {
                        "length": 12,
                        "hashes": { "sha256": "aa" },
                        "version": 3
                    }
                },
                "x-vendor-field": "kept"
            },
            "signatures": []
        });
        let signed: Signed<Timestamp> = serde_json::from_value(value).unwrap();
        assert_eq!(
            signed.signed._extra.get("x-vendor-field"),
            Some(&Value::String("kept".to_owned()))
        );
        let out = serde_json::to_value(&signed).unwrap();
        assert_eq!(out["signed"]["x-vendor-field"], "kept");
        assert_eq!(out["signed"]["_type"], "timestamp");
    }

    #[test]
    fn target_descriptor_round_trip() {
        let target = Target::from_bytes(b"{\"commit\": \"abc\"}");
        assert!(target.matches(b"{\"commit\": \"abc\"}"));
        assert!(!target.matches(b"{\"commit\": \"abd\"}"));
    }
}
