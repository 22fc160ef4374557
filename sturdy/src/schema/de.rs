// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deserialization helpers for the stricter-than-serde parts of the
//! metadata format.

use crate::schema::decoded::{Decoded, Hex};
use crate::schema::error;
use crate::schema::key::Key;
use serde::de::{Error as _, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Deserializes a key map, rejecting any entry whose key ID is not the ID
/// its key hashes to and any key ID that appears twice. Key IDs are how the
/// rest of the metadata names keys, so a map that lies about them must never
/// load.
pub(super) fn deserialize_keys<'de, D>(
    deserializer: D,
) -> Result<HashMap<Decoded<Hex>, Key>, D::Error>
where
    D: Deserializer<'de>,
{
    struct KeyMapVisitor;

    impl<'de> Visitor<'de> for KeyMapVisitor {
        type Value = HashMap<Decoded<Hex>, Key>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a map of key IDs to public keys")
        }

        fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut keys = HashMap::new();
            while let Some((keyid, key)) = access.next_entry::<Decoded<Hex>, Key>()? {
                key.check_key_id(&keyid).map_err(M::Error::custom)?;
                let id = keyid.to_string();
                if keys.insert(keyid, key).is_some() {
                    return Err(M::Error::custom(
                        error::DuplicateKeyIdSnafu { keyid: id }.build(),
                    ));
                }
            }
            Ok(keys)
        }
    }

    deserializer.deserialize_map(KeyMapVisitor)
}

/// Collects unrecognized fields into a map, dropping the `_type` tag that
/// serde's internally-tagged representation would otherwise duplicate.
pub(super) fn extra_skip_type<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut map = HashMap::deserialize(deserializer)?;
    map.remove("_type");
    Ok(map)
}
