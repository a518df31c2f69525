// Copyright 2026 The Bedrock Relay Project
// SPDX-License-Identifier: Apache-2.0

// Signed outbound HTTP -- JSON in, JSON out.
//
// Wraps a reqwest client so every call is SigV4-signed before it leaves the
// process. One request, one response; no retries. Non-2xx statuses carry the
// raw response body back to the caller, which owns error classification.

use std::io::Read as _;
use std::time::Duration;

use axum::http::{Method, Uri};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use reqwest::header::HeaderMap;

use crate::auth::{Credential, RequestSigner, SignError};

const CONTENT_TYPE_JSON: &str = "application/json";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The endpoint answered with a non-2xx status. The body is preserved
    /// verbatim for caller-side classification.
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client that signs every request with the configured credential.
pub struct SignedHttpClient {
    http: reqwest::Client,
    signer: RequestSigner,
    credential: Credential,
    timeout: Option<Duration>,
}

impl SignedHttpClient {
    pub fn new(http: reqwest::Client, signer: RequestSigner, credential: Credential) -> Self {
        Self {
            http,
            signer,
            credential,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// POST a JSON payload to `uri` and parse the JSON response.
    ///
    /// The `content-type` header is part of the signed set -- it is attached
    /// to the request exactly as signed.
    pub async fn post_json(
        &self,
        uri: &Uri,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| ClientError::Decode(format!("payload serialization failed: {e}")))?;

        let signed_headers = self.signer.sign(
            &Method::POST,
            uri,
            &[("content-type", CONTENT_TYPE_JSON)],
            &body,
            &self.credential,
        )?;

        let mut request = self
            .http
            .post(uri.to_string())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(body);
        for (name, value) in &signed_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(e.to_string())
            } else {
                ClientError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let raw = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let raw = maybe_decompress(&headers, raw)?;

        if !status.is_success() {
            return Err(ClientError::UpstreamStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&raw).into_owned(),
            });
        }

        serde_json::from_slice(&raw)
            .map_err(|e| ClientError::Decode(format!("response is not valid JSON: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Response decompression
// ---------------------------------------------------------------------------

fn content_encoding_is(headers: &HeaderMap, encoding: &str) -> bool {
    headers
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case(encoding))
        .unwrap_or(false)
}

/// Decompress the body if Content-Encoding says so, so classification and
/// JSON parsing always see plain bytes.
fn maybe_decompress(headers: &HeaderMap, body: Bytes) -> Result<Bytes, ClientError> {
    let mut decompressed = Vec::new();
    if content_encoding_is(headers, "gzip") {
        GzDecoder::new(&body[..])
            .read_to_end(&mut decompressed)
            .map_err(|e| ClientError::Decode(format!("gzip decompression failed: {e}")))?;
        Ok(Bytes::from(decompressed))
    } else if content_encoding_is(headers, "deflate") {
        DeflateDecoder::new(&body[..])
            .read_to_end(&mut decompressed)
            .map_err(|e| ClientError::Decode(format!("deflate decompression failed: {e}")))?;
        Ok(Bytes::from(decompressed))
    } else {
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
