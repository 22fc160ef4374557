// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Threshold signature verification for signed role objects.

use crate::schema::decoded::{Decoded, Hex};
use crate::schema::error::{self, Result};
use crate::schema::key::Key;
use crate::schema::{DelegatedRole, Delegations, Role, RoleKeys, Root, Signed, Targets};
use snafu::OptionExt;
use std::collections::{HashMap, HashSet};

impl Root {
    /// Verifies that a signed role reaches the signature threshold the root
    /// role requires for roles of its type.
    pub fn verify_role<T: Role>(&self, role: &Signed<T>) -> Result<()> {
        let role_keys = self
            .roles
            .get(&T::TYPE)
            .context(error::RoleNotFoundSnafu {
                name: T::TYPE.to_string(),
            })?;
        verify_threshold(
            &T::TYPE.to_string(),
            &role.signed.canonical_form()?,
            &role.signatures,
            role_keys,
            &self.keys,
        )
    }
}

impl Delegations {
    /// Verifies that a signed delegated targets role reaches the signature
    /// threshold declared for it by this delegations object.
    pub fn verify_role(&self, role: &Signed<Targets>, name: &str) -> Result<()> {
        let delegated = self
            .role(name)
            .context(error::RoleNotDelegatedSnafu { name })?;
        verify_threshold(
            name,
            &role.signed.canonical_form()?,
            &role.signatures,
            &delegated.keys(),
            &self.keys,
        )
    }

    /// Returns the named role if this object delegates to it.
    pub fn role(&self, name: &str) -> Option<&DelegatedRole> {
        self.roles.iter().find(|role| role.name == name)
    }
}

impl DelegatedRole {
    /// Returns a `RoleKeys` representation of the role.
    pub fn keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keyids.clone(),
            threshold: self.threshold,
            _extra: HashMap::new(),
        }
    }
}

/// Counts valid signatures over `canonical` made by distinct keys in
/// `role_keys`, and fails unless the threshold is met. Signatures by keys
/// outside the role's key set are ignored rather than rejected.
fn verify_threshold(
    role: &str,
    canonical: &[u8],
    signatures: &[crate::schema::Signature],
    role_keys: &RoleKeys,
    keys: &HashMap<Decoded<Hex>, Key>,
) -> Result<()> {
    let mut valid = HashSet::new();
    for signature in signatures {
        if !role_keys.keyids.contains(&signature.keyid) {
            continue;
        }
        if valid.contains(&signature.keyid) {
            continue;
        }
        if let Some(key) = keys.get(&signature.keyid) {
            if key.verify(canonical, &signature.sig, signature.scheme.as_deref()) {
                valid.insert(signature.keyid.clone());
            }
        }
    }
    if (valid.len() as u64) < role_keys.threshold.get() {
        return error::SignatureThresholdSnafu {
            role,
            threshold: role_keys.threshold.get(),
            valid: valid.len() as u64,
        }
        .fail();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Signature, Timestamp, TimestampMeta};
    use chrono::{TimeZone, Utc};
    use ring::signature::KeyPair;
    use std::num::NonZeroU64;

    // RFC 8032 test vector seed and public key.
    const SEED: [u8; 32] = hex_literal::hex!(
        "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60"
    );
    const PUBLIC: [u8; 32] = hex_literal::hex!(
        "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"
    );

    fn test_key() -> (ring::signature::Ed25519KeyPair, Key) {
        let keypair =
            ring::signature::Ed25519KeyPair::from_seed_and_public_key(&SEED, &PUBLIC).unwrap();
        let key: Key = serde_json::from_value(serde_json::json!({
            "keytype": "ed25519",
            "scheme": "ed25519",
            "keyval": { "public": hex::encode(keypair.public_key().as_ref()) }
        }))
        .unwrap();
        (keypair, key)
    }

    fn test_timestamp() -> Timestamp {
        Timestamp {
            spec_version: "1.0.0".to_owned(),
            version: NonZeroU64::new(1).unwrap(),
            expires: Utc.with_ymd_and_hms(2033, 1, 1, 0, 0, 0).unwrap(),
            meta: maplit::hashmap! {
                "snapshot.json".to_owned() => TimestampMeta {
                    length: 4,
                    hashes: crate::schema::Hashes {
                        sha256: crate::schema::decoded::Decoded::from(vec![0u8; 32]),
                        sha512: None,
                        _extra: HashMap::new(),
                    },
                    version: NonZeroU64::new(1).unwrap(),
                    _extra: HashMap::new(),
                },
            },
            _extra: HashMap::new(),
        }
    }

    #[test]
    fn threshold_met_and_missed() {
        let (keypair, key) = test_key();
        let keyid = key.key_id().unwrap();
        let timestamp = test_timestamp();
        let canonical = timestamp.canonical_form().unwrap();
        let sig = keypair.sign(&canonical);

        let signed = Signed {
            signed: timestamp,
            signatures: vec![Signature {
                keyid: keyid.clone(),
                sig: Decoded::from(sig.as_ref().to_vec()),
                scheme: None,
            }],
        };

        let role_keys = RoleKeys {
            keyids: vec![keyid.clone()],
            threshold: NonZeroU64::new(1).unwrap(),
            _extra: HashMap::new(),
        };
        let keys = maplit::hashmap! { keyid.clone() => key };

        verify_threshold(
            "timestamp",
            &signed.signed.canonical_form().unwrap(),
            &signed.signatures,
            &role_keys,
            &keys,
        )
        .unwrap();

        // A corrupted signature must not count toward the threshold.
        let mut corrupted = signed;
        let mut sig_bytes = corrupted.signatures[0].sig.bytes().to_vec();
        sig_bytes[0] ^= 0xff;
        corrupted.signatures[0].sig = Decoded::from(sig_bytes);
        assert!(verify_threshold(
            "timestamp",
            &corrupted.signed.canonical_form().unwrap(),
            &corrupted.signatures,
            &role_keys,
            &keys,
        )
        .is_err());
    }

    #[test]
    fn signature_scheme_override_must_match_the_key_type() {
        let (keypair, key) = test_key();
        let keyid = key.key_id().unwrap();
        let timestamp = test_timestamp();
        let canonical = timestamp.canonical_form().unwrap();
        let sig = keypair.sign(&canonical);

        let role_keys = RoleKeys {
            keyids: vec![keyid.clone()],
            threshold: NonZeroU64::new(1).unwrap(),
            _extra: HashMap::new(),
        };
        let keys = maplit::hashmap! { keyid.clone() => key };
        let mut signatures = vec![Signature {
            keyid,
            sig: Decoded::from(sig.as_ref().to_vec()),
            scheme: Some("ed25519".to_owned()),
        }];

        verify_threshold("timestamp", &canonical, &signatures, &role_keys, &keys).unwrap();

        // A scheme belonging to another key type cannot vouch for this
        // signature.
        signatures[0].scheme = Some("rsa-pkcs1v15-sha256".to_owned());
        assert!(
            verify_threshold("timestamp", &canonical, &signatures, &role_keys, &keys).is_err()
        );
    }
}
