// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides [`Decoded`], a wrapper around strings that are decoded into bytes
//! during deserialization. The original encoded string is preserved so that
//! re-serialized metadata is byte-identical to its signature input.

use crate::schema::error::{self, Result};
use crate::schema::spki;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;

/// A method of encoding bytes as a string.
pub trait Encode {
    /// Encode bytes as a string.
    fn encode(b: &[u8]) -> String;
}

/// A method of decoding a string into bytes.
pub trait Decode {
    /// Decode a string into bytes.
    fn decode(s: &str) -> Result<Vec<u8>>;
}

/// Hexadecimal encoding, as used by key IDs and signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex;

impl Encode for Hex {
    fn encode(b: &[u8]) -> String {
        hex::encode(b)
    }
}

impl Decode for Hex {
    fn decode(s: &str) -> Result<Vec<u8>> {
        hex::decode(s).context(error::HexDecodeSnafu)
    }
}

/// An RSA public key in PEM-encoded SubjectPublicKeyInfo form. Decoding
/// produces the DER-encoded `RSAPublicKey` suitable for signature
/// verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsaPem;

impl Decode for RsaPem {
    fn decode(s: &str) -> Result<Vec<u8>> {
        let pem = pem::parse(s).context(error::PemDecodeSnafu)?;
        spki::rsa_public_key_from_spki(pem.contents())
    }
}

/// A wrapper around a `String` that contains an encoding of bytes, decoded
/// eagerly during deserialization. The original string is kept for
/// serialization so that signed objects round-trip exactly.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    bytes: Vec<u8>,
    original: String,
    spooky: PhantomData<T>,
}

impl<T> Decoded<T> {
    /// The decoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T: Encode> From<Vec<u8>> for Decoded<T> {
    fn from(bytes: Vec<u8>) -> Self {
        let original = T::encode(&bytes);
        Self {
            bytes,
            original,
            spooky: PhantomData,
        }
    }
}

impl<T> fmt::Display for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl<T> Deref for Decoded<T> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> AsRef<[u8]> for Decoded<T> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

// Equality, ordering, and hashing are all based on the decoded bytes, not the
// original string, so that two different encodings of the same key compare
// equal.

impl<T> PartialEq for Decoded<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> Eq for Decoded<T> {}

impl<T> PartialOrd for Decoded<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Decoded<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl<T> Hash for Decoded<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<'de, T: Decode> Deserialize<'de> for Decoded<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let original = String::deserialize(deserializer)?;
        Ok(Self {
            bytes: T::decode(&original).map_err(serde::de::Error::custom)?,
            original,
            spooky: PhantomData,
        })
    }
}

impl<T> Serialize for Decoded<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::{Decoded, Hex};

    #[test]
    fn hex_round_trip() {
        let decoded: Decoded<Hex> = serde_json::from_str("\"00ff2a\"").unwrap();
        assert_eq!(decoded.bytes(), &[0x00, 0xff, 0x2a]);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), "\"00ff2a\"");
    }

    #[test]
    fn equality_ignores_case() {
        let a: Decoded<Hex> = serde_json::from_str("\"00AB\"").unwrap();
        let b: Decoded<Hex> = serde_json::from_str("\"00ab\"").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!(serde_json::from_str::<Decoded<Hex>>("\"zz\"").is_err());
    }
}
