// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonicalization parity: the signature input computed for a parsed
//! metadata file must match the canonical form produced by the signing side
//! bit-for-bit, including unknown extension fields.

use sturdy::schema::{Role, Signed, Timestamp};

/// A timestamp envelope as a producer would write it, with whitespace and
/// key order scrambled and an extension field present.
const SIGNED_FILE: &str = r#"{
  "signatures": [],
  "signed": {
    "version": 7,
    "spec_version": "1.0.0",
    "_type": "timestamp",
    "x-extension": "preserved",
    "meta": {
      "snapshot.json": {
        "version": 7,
        "length": 4,
        "hashes": { "sha256": "aabb" }
      }
    },
    "expires": "2030-01-01T00:00:00Z"
  }
}"#;

/// The canonical form: keys sorted, no insignificant whitespace.
const CANONICAL: &str = concat!(
    r#"{"_type":"timestamp","expires":"2030-01-01T00:00:00Z","#,
    r#""meta":{"snapshot.json":{"hashes":{"sha256":"aabb"},"length":4,"version":7}},"#,
    r#""spec_version":"1.0.0","version":7,"x-extension":"preserved"}"#
);

#[test]
fn canonical_form_matches_known_good_output() {
    let signed: Signed<Timestamp> = serde_json::from_str(SIGNED_FILE).unwrap();
    let canonical = signed.signed.canonical_form().unwrap();
    assert_eq!(String::from_utf8(canonical).unwrap(), CANONICAL);
}

#[test]
fn canonical_form_is_stable_across_reserialization() {
    let signed: Signed<Timestamp> = serde_json::from_str(SIGNED_FILE).unwrap();
    let reserialized = serde_json::to_string(&signed).unwrap();
    let reparsed: Signed<Timestamp> = serde_json::from_str(&reserialized).unwrap();
    assert_eq!(
        signed.signed.canonical_form().unwrap(),
        reparsed.signed.canonical_form().unwrap()
    );
}
