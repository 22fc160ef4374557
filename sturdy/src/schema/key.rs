// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public key objects and signature verification for individual keys.

use crate::schema::decoded::{Decoded, Hex, RsaPem};
use crate::schema::error::{self, Result};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, SHA256};
use ring::signature::VerificationAlgorithm;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::{ensure, ResultExt};
use std::collections::HashMap;

/// A public key as listed in root metadata or a delegations object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "keytype")]
pub enum Key {
    /// An RSA key.
    #[serde(rename = "rsa")]
    Rsa {
        /// The RSA key.
        keyval: RsaKey,
        /// Denotes the key's signature scheme.
        scheme: RsaScheme,
        /// Extra arguments found during deserialization, preserved verbatim
        /// because they are part of the signature input.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
    /// An Ed25519 key.
    #[serde(rename = "ed25519")]
    Ed25519 {
        /// The Ed25519 key.
        keyval: Ed25519Key,
        /// Denotes the key's signature scheme.
        scheme: Ed25519Scheme,
        /// Extra arguments found during deserialization, preserved verbatim
        /// because they are part of the signature input.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
}

/// Signature schemes for RSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum RsaScheme {
    /// `rsa-pkcs1v15-sha256`, the default scheme in this ecosystem.
    #[serde(rename = "rsa-pkcs1v15-sha256")]
    RsaPkcs1v15Sha256,
    /// `rsassa-pss-sha256`.
    #[serde(rename = "rsassa-pss-sha256")]
    RsassaPssSha256,
}

forward_display_to_serde!(RsaScheme);
forward_from_str_to_serde!(RsaScheme);

/// An RSA public key, PEM-encoded in SubjectPublicKeyInfo form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RsaKey {
    /// The public key.
    pub public: Decoded<RsaPem>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// Signature schemes for Ed25519 keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Ed25519Scheme {
    /// `ed25519`.
    #[serde(rename = "ed25519")]
    Ed25519,
}

forward_display_to_serde!(Ed25519Scheme);
forward_from_str_to_serde!(Ed25519Scheme);

/// An Ed25519 public key, hex-encoded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Ed25519Key {
    /// The public key.
    pub public: Decoded<Hex>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Key {
    /// Verifies a signature over `msg` made by this key. A signature may
    /// advertise its own scheme; when `scheme` is given it must name a
    /// scheme this key's type supports, otherwise the signature does not
    /// verify. Without an override, the key's advertised scheme is used.
    pub fn verify(&self, msg: &[u8], signature: &[u8], scheme: Option<&str>) -> bool {
        match self {
            Key::Rsa {
                keyval,
                scheme: advertised,
                ..
            } => {
                let scheme = match scheme {
                    None => *advertised,
                    Some(name) => match name.parse::<RsaScheme>() {
                        Ok(scheme) => scheme,
                        Err(_) => return false,
                    },
                };
                let alg: &dyn VerificationAlgorithm = match scheme {
                    RsaScheme::RsaPkcs1v15Sha256 => {
                        &ring::signature::RSA_PKCS1_2048_8192_SHA256
                    }
                    RsaScheme::RsassaPssSha256 => &ring::signature::RSA_PSS_2048_8192_SHA256,
                };
                ring::signature::UnparsedPublicKey::new(alg, &keyval.public)
                    .verify(msg, signature)
                    .is_ok()
            }
            Key::Ed25519 { keyval, .. } => {
                if let Some(name) = scheme {
                    if name.parse::<Ed25519Scheme>().is_err() {
                        return false;
                    }
                }
                ring::signature::UnparsedPublicKey::new(
                    &ring::signature::ED25519,
                    &keyval.public,
                )
                .verify(msg, signature)
                .is_ok()
            }
        }
    }

    /// Calculates the key ID: the SHA-256 digest of the key's canonical JSON
    /// form.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        self.serialize(&mut ser).context(error::JsonSerializationSnafu {
            what: "public key".to_owned(),
        })?;
        Ok(Decoded::from(digest(&SHA256, &buf).as_ref().to_vec()))
    }

    /// Confirms that a listed key ID is the one this key hashes to. Key IDs
    /// are how signatures and role key sets refer to keys, so an entry whose
    /// ID disagrees with its key must be rejected.
    pub fn check_key_id(&self, keyid: &Decoded<Hex>) -> Result<()> {
        let calculated = self.key_id()?;
        ensure!(
            keyid == &calculated,
            error::InvalidKeyIdSnafu {
                keyid: hex::encode(keyid),
                calculated: hex::encode(&calculated),
            }
        );
        Ok(())
    }
}
