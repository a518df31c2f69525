// Model backend boundary.
//
// Responsibilities:
// - InferenceRequest parsing and validation (modelId + message required)
// - ModelBackend trait: one buffered call or one delta stream per request
// - Normalization of the tolerated backend response shapes into a single
//   InferenceOutput
// - BackendError: the stable failure taxonomy every backend maps into

use std::pin::Pin;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::Value;

pub mod bedrock;

pub use bedrock::BedrockBackend;

// ---------------------------------------------------------------------------
// Request model
// ---------------------------------------------------------------------------

/// A validated inference request. `model_id` is opaque and forwarded to the
/// backend unchanged.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model_id: String,
    pub message: String,
    pub stream: bool,
}

/// Why a request body failed validation. Both are client errors.
#[derive(Debug, thiserror::Error)]
pub enum RequestParseError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing required fields: modelId and message")]
    MissingFields,
}

impl InferenceRequest {
    /// Parse and validate a request body.
    ///
    /// `stream` defaults to false; empty strings count as missing.
    pub fn parse(body: &Bytes) -> Result<Self, RequestParseError> {
        let root: Value = serde_json::from_slice(body)
            .map_err(|e| RequestParseError::InvalidJson(e.to_string()))?;

        let model_id = root
            .get("modelId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let message = root
            .get("message")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        let (Some(model_id), Some(message)) = (model_id, message) else {
            return Err(RequestParseError::MissingFields);
        };

        Ok(Self {
            model_id: model_id.to_string(),
            message: message.to_string(),
            stream: root.get("stream").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Response model
// ---------------------------------------------------------------------------

/// Canonical result of one buffered inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub text: String,
    pub usage: Option<Value>,
    pub stop_reason: Option<String>,
}

/// The response shapes backends are known to produce. Deployments front the
/// model with different relays, so the body is one of:
///
/// - the Converse shape: `{output: {message: {content: [{text}]}}, usage, stopReason}`
/// - a flat `{output: "<text>"}`
/// - bare content blocks: `{content: [{text}]}`
/// - a single `{message: "<text>"}`
///
/// Anything else is not an inference result.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Converse {
        output: ConverseOutput,
        usage: Option<Value>,
        #[serde(rename = "stopReason")]
        stop_reason: Option<String>,
    },
    Direct {
        output: String,
        usage: Option<Value>,
        #[serde(rename = "stopReason")]
        stop_reason: Option<String>,
    },
    ContentBlocks { content: Vec<ContentBlock> },
    Message { message: String },
}

#[derive(Debug, Deserialize)]
pub struct ConverseOutput {
    pub message: ConverseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ConverseMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(default)]
    pub text: Option<String>,
}

fn join_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

impl ResponsePayload {
    /// Collapse whichever shape arrived into the canonical output record.
    pub fn normalize(self) -> InferenceOutput {
        match self {
            ResponsePayload::Converse {
                output,
                usage,
                stop_reason,
            } => InferenceOutput {
                text: join_text(&output.message.content),
                usage,
                stop_reason,
            },
            ResponsePayload::Direct {
                output,
                usage,
                stop_reason,
            } => InferenceOutput {
                text: output,
                usage,
                stop_reason,
            },
            ResponsePayload::ContentBlocks { content } => InferenceOutput {
                text: join_text(&content),
                usage: None,
                stop_reason: None,
            },
            ResponsePayload::Message { message } => InferenceOutput {
                text: message,
                usage: None,
                stop_reason: None,
            },
        }
    }
}

/// Parse and normalize a backend response body.
pub fn normalize_response(value: Value) -> Result<InferenceOutput, BackendError> {
    let payload: ResponsePayload = serde_json::from_value(value)
        .map_err(|_| BackendError::Other("unexpected response format from model backend".into()))?;
    Ok(payload.normalize())
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Stable classification of backend failures. Each variant pins the HTTP
/// status surfaced to the caller; the carried string is the user-visible
/// message and never contains credential material.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BackendError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    ModelNotFound(String),

    #[error("{0}")]
    Throttled(String),

    #[error("{0}")]
    ModelTimeout(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn status(&self) -> StatusCode {
        match self {
            BackendError::Validation(_) => StatusCode::BAD_REQUEST,
            BackendError::AccessDenied(_) => StatusCode::FORBIDDEN,
            BackendError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            BackendError::Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
            BackendError::ModelTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BackendError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            BackendError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The backend-native exception identity, for the `errorType` field of
    /// error envelopes. Unclassified failures carry none.
    pub fn error_type(&self) -> Option<&'static str> {
        match self {
            BackendError::Validation(_) => Some("ValidationException"),
            BackendError::AccessDenied(_) => Some("AccessDeniedException"),
            BackendError::ModelNotFound(_) => Some("ResourceNotFoundException"),
            BackendError::Throttled(_) => Some("ThrottlingException"),
            BackendError::ModelTimeout(_) => Some("ModelTimeoutException"),
            BackendError::QuotaExceeded(_) => Some("ServiceQuotaExceededException"),
            BackendError::Other(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Ordered source of text deltas, terminated by the end of the stream.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// One model backend. Implementations must be Send + Sync so handlers can
/// share them via `Arc`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Run one buffered inference call.
    async fn converse(&self, request: &InferenceRequest) -> Result<InferenceOutput, BackendError>;

    /// Open a delta stream for one inference call. Errors raised before any
    /// delta is produced surface from this call; later failures arrive as
    /// stream items.
    async fn converse_stream(&self, request: &InferenceRequest)
        -> Result<DeltaStream, BackendError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
