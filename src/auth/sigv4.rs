// Copyright 2026 The Bedrock Relay Project
// SPDX-License-Identifier: Apache-2.0

// AWS Signature Version 4 request signing.
//
// Produces the Authorization / x-amz-* header set that authenticates an
// HTTP request to an AWS endpoint without a shared-secret header. The
// verifier reconstructs the exact same canonical bytes, so every step here
// is a wire-compatibility requirement:
//
// 1. Canonical request: METHOD, URI path, sorted query, sorted lowercased
//    signed headers, signed-header-name list, payload hash.
// 2. String to sign: algorithm, timestamp, credential scope, canonical
//    request hash.
// 3. Signing key: four chained HMAC operations over date/region/service.
// 4. Signature: HMAC of the string to sign under the derived key.

use std::collections::BTreeMap;
use std::fmt;

use axum::http::{Method, Uri};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::hash::{hmac_hex, hmac_sha256, sha256_hex};

/// The only algorithm this signer speaks.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Fixed terminator of every credential scope.
const SCOPE_TERMINATOR: &str = "aws4_request";

/// Percent-encoding set for canonical query components: everything except
/// the RFC 3986 unreserved characters.
const SIGV4_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Long-lived or temporary AWS credentials, supplied per signing operation.
///
/// Never stored by the signer; a temporary credential carries a session
/// token that must join the signed header set.
#[derive(Clone)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credential {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read credentials from the standard AWS environment variables, the
    /// same ones a managed runtime injects for its execution role.
    pub fn from_env() -> Result<Self, CredentialError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| CredentialError::Missing("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| CredentialError::Missing("AWS_SECRET_ACCESS_KEY"))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// Secret material must never leak through Debug formatting or logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("missing credential environment variable: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Errors from signing. A URI without an authority cannot produce a `host`
/// header and therefore cannot be signed.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("cannot sign request: URI has no authority: {uri}")]
    MissingAuthority { uri: String },
}

/// Signs requests for one region/service pair.
///
/// `sign_at` is a pure function of its arguments: for a fixed timestamp the
/// emitted headers are byte-identical across invocations. `sign` is the
/// production wrapper that stamps the current UTC second.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    region: String,
    service: String,
}

impl RequestSigner {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Sign with the current UTC time.
    pub fn sign(
        &self,
        method: &Method,
        uri: &Uri,
        extra_headers: &[(&str, &str)],
        body: &[u8],
        credential: &Credential,
    ) -> Result<BTreeMap<String, String>, SignError> {
        self.sign_at(method, uri, extra_headers, body, credential, Utc::now())
    }

    /// Sign with an explicit timestamp.
    ///
    /// Returns the headers to attach to the outgoing request: `authorization`,
    /// `x-amz-date`, `x-amz-content-sha256`, and `x-amz-security-token` for
    /// temporary credentials. `host` and any `extra_headers` are part of the
    /// signed set but are expected to be placed on the request by the HTTP
    /// client itself; adding a header to the request without adding it here
    /// (or vice versa) invalidates the signature.
    pub fn sign_at(
        &self,
        method: &Method,
        uri: &Uri,
        extra_headers: &[(&str, &str)],
        body: &[u8],
        credential: &Credential,
        timestamp: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, SignError> {
        let host = uri
            .authority()
            .ok_or_else(|| SignError::MissingAuthority {
                uri: uri.to_string(),
            })?
            .as_str();

        let amz_date = format_amz_date(timestamp);
        let date_stamp = &amz_date[..8];
        let payload_hash = sha256_hex(body);

        // Headers included in the signature. BTreeMap keeps them sorted by
        // name, which is exactly the order the canonical form requires.
        let mut signed_set: BTreeMap<String, String> = BTreeMap::new();
        signed_set.insert("host".to_string(), host.to_string());
        signed_set.insert("x-amz-date".to_string(), amz_date.clone());
        signed_set.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        if let Some(token) = &credential.session_token {
            signed_set.insert("x-amz-security-token".to_string(), token.clone());
        }
        for (name, value) in extra_headers {
            signed_set.insert(name.to_ascii_lowercase(), value.to_string());
        }

        let signed_header_names = signed_set
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = signed_set
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let canonical_uri = match uri.path() {
            "" => "/",
            path => path,
        };
        let canonical_query = canonical_query_string(uri.query().unwrap_or(""));

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_header_names}\n{payload_hash}",
            method = method.as_str(),
        );

        let credential_scope = format!(
            "{date_stamp}/{region}/{service}/{SCOPE_TERMINATOR}",
            region = self.region,
            service = self.service,
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{hash}",
            hash = sha256_hex(canonical_request.as_bytes()),
        );

        let signing_key = derive_signing_key(
            &credential.secret_access_key,
            date_stamp,
            &self.region,
            &self.service,
        );
        let signature = hmac_hex(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "{ALGORITHM} Credential={access_key}/{credential_scope}, SignedHeaders={signed_header_names}, Signature={signature}",
            access_key = credential.access_key_id,
        );

        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), authorization);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("x-amz-content-sha256".to_string(), payload_hash);
        if let Some(token) = &credential.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }
        Ok(headers)
    }
}

// ---------------------------------------------------------------------------
// Canonical form helpers
// ---------------------------------------------------------------------------

/// UTC timestamp in ISO 8601 basic form, second precision: `YYYYMMDDTHHMMSSZ`.
pub fn format_amz_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Canonical query string: pairs sorted by key (ties broken by value),
/// strictly percent-encoded, joined with `&`. The input is the raw query
/// as it appears in the URI; it is decoded and re-encoded so the canonical
/// bytes do not depend on how the caller encoded it.
pub(crate) fn canonical_query_string(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, SIGV4_ENCODE),
                utf8_percent_encode(v, SIGV4_ENCODE),
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Derive the signing key: four chained HMAC operations binding the key to
/// the date, region, and service named in the credential scope.
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
