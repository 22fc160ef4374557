// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Sign` trait which abstracts over the method of signing with
//! different key types, and the `SignerProvider` seam through which key
//! storage backends (keystore files, hardware tokens) hand loaded signing
//! keys to callers. The updater itself never signs; these types exist for
//! the authoring side of the ecosystem and for building signed fixtures in
//! tests.

use crate::schema::decoded::Decoded;
use crate::schema::key::{Ed25519Scheme, Key};
use ring::rand::SecureRandom;
use ring::signature::KeyPair;
use std::collections::HashMap;
use std::fmt::Debug;

/// A boxed error type for signing backends, which are free to fail in
/// backend-specific ways.
pub type SignError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// This trait must be implemented for each type of key with which you will
/// sign things.
pub trait Sign: Debug + Send + Sync {
    /// Returns the decoded key along with its scheme and other metadata.
    fn tuf_key(&self) -> Key;

    /// Signs the supplied message.
    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>, SignError>;
}

/// Maps a role name to its loaded signing keys. Key storage backends
/// implement this; the rest of the system consumes keys only through it.
pub trait SignerProvider: Debug {
    /// Returns the signers available for a role, in no particular order.
    fn signers_for(&self, role: &str) -> Result<Vec<Box<dyn Sign>>, SignError>;
}

/// Implements the Sign trait for ED25519.
impl Sign for ring::signature::Ed25519KeyPair {
    fn tuf_key(&self) -> Key {
        use crate::schema::key::Ed25519Key;

        Key::Ed25519 {
            keyval: Ed25519Key {
                public: Decoded::from(KeyPair::public_key(self).as_ref().to_vec()),
                _extra: HashMap::new(),
            },
            scheme: Ed25519Scheme::Ed25519,
            _extra: HashMap::new(),
        }
    }

    fn sign(&self, msg: &[u8], _rng: &dyn SecureRandom) -> Result<Vec<u8>, SignError> {
        let signature = self.sign(msg);
        Ok(signature.as_ref().to_vec())
    }
}
