// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Just enough DER to unwrap an RSA `SubjectPublicKeyInfo` document into the
//! `RSAPublicKey` that signature verification wants.
//!
//! ```text
//! SubjectPublicKeyInfo ::= SEQUENCE {
//!     algorithm        SEQUENCE { OID rsaEncryption, NULL },
//!     subjectPublicKey BIT STRING { RSAPublicKey } }
//! ```

use crate::schema::error::{self, Result};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OID: u8 = 0x06;
const TAG_BIT_STRING: u8 = 0x03;

/// DER encoding of OID 1.2.840.113549.1.1.1 (rsaEncryption).
const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

/// Extracts the DER-encoded `RSAPublicKey` from a DER-encoded
/// `SubjectPublicKeyInfo` document.
pub(super) fn rsa_public_key_from_spki(der: &[u8]) -> Result<Vec<u8>> {
    let (spki, rest) = read_tlv(der, TAG_SEQUENCE, "SubjectPublicKeyInfo")?;
    if !rest.is_empty() {
        return error::SpkiDecodeSnafu {
            reason: "trailing data after SubjectPublicKeyInfo",
        }
        .fail();
    }

    let (algorithm, spki) = read_tlv(spki, TAG_SEQUENCE, "AlgorithmIdentifier")?;
    let (oid, _) = read_tlv(algorithm, TAG_OID, "algorithm OID")?;
    if oid != OID_RSA_ENCRYPTION {
        return error::SpkiDecodeSnafu {
            reason: "algorithm OID is not rsaEncryption",
        }
        .fail();
    }

    let (bit_string, rest) = read_tlv(spki, TAG_BIT_STRING, "subjectPublicKey")?;
    if !rest.is_empty() {
        return error::SpkiDecodeSnafu {
            reason: "trailing data after subjectPublicKey",
        }
        .fail();
    }
    // The first octet of a BIT STRING is the count of unused bits, which must
    // be zero for a DER-encoded key.
    match bit_string.split_first() {
        Some((0, key)) => Ok(key.to_vec()),
        _ => error::SpkiDecodeSnafu {
            reason: "subjectPublicKey has unused bits",
        }
        .fail(),
    }
}

/// Reads one TLV element, returning its contents and whatever follows it.
fn read_tlv<'a>(input: &'a [u8], tag: u8, what: &'static str) -> Result<(&'a [u8], &'a [u8])> {
    let err = |reason| error::SpkiDecodeSnafu { reason }.fail();
    let (&actual_tag, input) = match input.split_first() {
        Some(split) => split,
        None => return err("unexpected end of input"),
    };
    if actual_tag != tag {
        return error::SpkiDecodeSnafu { reason: what }.fail();
    }
    let (&first, input) = match input.split_first() {
        Some(split) => split,
        None => return err("unexpected end of input"),
    };
    let (length, input) = if first < 0x80 {
        (first as usize, input)
    } else {
        // Long-form length: the low bits of the first octet give the number
        // of length octets that follow.
        let octets = (first & 0x7f) as usize;
        if octets == 0 || octets > 4 || input.len() < octets {
            return err("invalid long-form length");
        }
        let mut length = 0usize;
        for &b in &input[..octets] {
            length = (length << 8) | b as usize;
        }
        (length, &input[octets..])
    };
    if input.len() < length {
        return err("length exceeds input");
    }
    Ok(input.split_at(length))
}

#[cfg(test)]
mod tests {
    use super::rsa_public_key_from_spki;

    #[test]
    fn rejects_non_sequence() {
        assert!(rsa_public_key_from_spki(&[0x02, 0x01, 0x00]).is_err());
    }

    #[test]
    fn rejects_wrong_oid() {
        // SEQUENCE { SEQUENCE { OID 1.2.840.10045.2.1 }, BIT STRING {} }
        let der = [
            0x30, 0x0e, 0x30, 0x09, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x03,
            0x01, 0x00,
        ];
        assert!(rsa_public_key_from_spki(&der).is_err());
    }

    #[test]
    fn unwraps_rsa_key() {
        // A syntactically valid SPKI wrapping the placeholder key bytes 0xAA 0xBB.
        let der = [
            0x30, 0x14, 0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01,
            0x01, 0x05, 0x00, 0x03, 0x03, 0x00, 0xaa, 0xbb,
        ];
        assert_eq!(rsa_public_key_from_spki(&der).unwrap(), vec![0xaa, 0xbb]);
    }
}
