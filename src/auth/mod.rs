// Copyright 2026 The Bedrock Relay Project
// SPDX-License-Identifier: Apache-2.0

// Request authentication -- AWS Signature Version 4.
//
// Responsibilities:
// - SHA-256 / HMAC-SHA256 digest primitives
// - Canonical request assembly (path, sorted query, sorted signed headers)
// - Time-scoped signature and Authorization header derivation
//
// Verification is the remote endpoint's job; this module only produces
// signatures.

mod hash;
mod sigv4;

pub use hash::{hmac_hex, hmac_sha256, sha256_hex};
pub use sigv4::{
    format_amz_date, Credential, CredentialError, RequestSigner, SignError, ALGORITHM,
};
