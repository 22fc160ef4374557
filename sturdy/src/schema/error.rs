// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for metadata schema objects.

use snafu::Snafu;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for metadata schema operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// A duplicate key ID was present in a key map.
    #[snafu(display("Duplicate key ID: {}", keyid))]
    DuplicateKeyId {
        /// The duplicated key ID.
        keyid: String,
    },

    /// Unable to decode a hex-encoded string.
    #[snafu(display("Invalid hex string: {}", source))]
    HexDecode {
        /// The source of the error.
        source: hex::FromHexError,
    },

    /// A key ID in a key map did not match the ID calculated from the key itself.
    #[snafu(display("Invalid key ID {}: calculated {}", keyid, calculated))]
    InvalidKeyId {
        /// The key ID as listed in the metadata.
        keyid: String,
        /// The key ID calculated from the public key.
        calculated: String,
    },

    /// Failed to serialize a metadata object to canonical JSON.
    #[snafu(display("Failed to serialize {} to JSON: {}", what, source))]
    JsonSerialization {
        /// What was being serialized.
        what: String,
        /// The source of the error.
        source: serde_json::Error,
    },

    /// A delegated role was not listed by its delegating parent.
    #[snafu(display("Role {} is not delegated by its parent", name))]
    RoleNotDelegated {
        /// The role name.
        name: String,
    },

    /// A role was looked up by a name that does not exist.
    #[snafu(display("Role {} not found", name))]
    RoleNotFound {
        /// The role name.
        name: String,
    },

    /// A key map entry failed to parse as PEM.
    #[snafu(display("Invalid PEM string: {}", source))]
    PemDecode {
        /// The source of the error.
        source: pem::PemError,
    },

    /// The DER contents of a public key were not a well-formed
    /// SubjectPublicKeyInfo wrapping an RSA key.
    #[snafu(display("Invalid SubjectPublicKeyInfo document: {}", reason))]
    SpkiDecode {
        /// What was malformed.
        reason: &'static str,
    },

    /// A role did not reach its signature threshold.
    #[snafu(display(
        "Signature threshold of {} not met for role {} ({} valid signatures)",
        threshold,
        role,
        valid
    ))]
    SignatureThreshold {
        /// The role being verified.
        role: String,
        /// The number of signatures required.
        threshold: u64,
        /// The number of valid signatures found.
        valid: u64,
    },

    /// A target path signed for by a delegated role does not match any of the
    /// role's path patterns.
    #[snafu(display("Role {} is not authorized to sign for path {}", role, path))]
    UnmatchedPath {
        /// The delegated role.
        role: String,
        /// The offending target path.
        path: String,
    },
}
