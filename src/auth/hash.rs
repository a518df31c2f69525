// Copyright 2026 The Bedrock Relay Project
// SPDX-License-Identifier: Apache-2.0

// Digest primitives for request signing.
//
// Thin wrappers over sha2/hmac so the signing code reads like the
// signing algorithm instead of hasher plumbing. All functions are pure.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest of `data`, hex-encoded (64 lowercase chars).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// HMAC-SHA256 of `message` under `key`, as raw bytes.
///
/// HMAC-SHA256 accepts keys of any length, so `new_from_slice` cannot
/// fail for this algorithm.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// HMAC-SHA256 of `message` under `key`, hex-encoded.
pub fn hmac_hex(key: &[u8], message: &[u8]) -> String {
    hex::encode(hmac_sha256(key, message))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
