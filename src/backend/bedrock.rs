// Amazon Bedrock Converse adapter.
//
// Speaks the Converse HTTP API through the signed client:
// POST {endpoint}/model/{modelId}/converse with a single user message and
// the configured inference parameters. Bedrock error bodies are classified
// into the stable BackendError taxonomy here, in one place.

use async_trait::async_trait;
use axum::http::Uri;
use futures_util::stream;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde_json::{json, Value};

use super::{
    normalize_response, BackendError, DeltaStream, InferenceOutput, InferenceRequest, ModelBackend,
};
use crate::client::{ClientError, SignedHttpClient};

/// Model identifiers carry `.` and `:`; encode everything else so the path
/// bytes sent are the path bytes signed.
const PATH_SEGMENT_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Inference parameters forwarded on every Converse call.
#[derive(Debug, Clone, Copy)]
pub struct InferenceDefaults {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for InferenceDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            temperature: 0.3,
        }
    }
}

pub struct BedrockBackend {
    client: SignedHttpClient,
    endpoint: String,
    inference: InferenceDefaults,
}

impl BedrockBackend {
    pub fn new(client: SignedHttpClient, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            client,
            endpoint,
            inference: InferenceDefaults::default(),
        }
    }

    pub fn with_inference_defaults(mut self, inference: InferenceDefaults) -> Self {
        self.inference = inference;
        self
    }

    fn converse_uri(&self, model_id: &str) -> Result<Uri, BackendError> {
        let encoded = utf8_percent_encode(model_id, PATH_SEGMENT_ENCODE);
        format!("{}/model/{}/converse", self.endpoint, encoded)
            .parse()
            .map_err(|_| BackendError::Validation(format!("invalid model identifier: {model_id}")))
    }

    fn converse_body(&self, request: &InferenceRequest) -> Value {
        json!({
            "messages": [
                {
                    "role": "user",
                    "content": [{"text": request.message}],
                }
            ],
            "inferenceConfig": {
                "maxTokens": self.inference.max_tokens,
                "temperature": self.inference.temperature,
            },
        })
    }
}

#[async_trait]
impl ModelBackend for BedrockBackend {
    async fn converse(&self, request: &InferenceRequest) -> Result<InferenceOutput, BackendError> {
        let uri = self.converse_uri(&request.model_id)?;
        let body = self.converse_body(request);
        let response = self
            .client
            .post_json(&uri, &body)
            .await
            .map_err(classify_client_error)?;
        normalize_response(response)
    }

    // The streaming Converse API frames its response in a binary event
    // stream; decoding that is provider plumbing this relay does not take
    // on. The adapter satisfies the delta-stream contract by emitting the
    // buffered result as one delta.
    async fn converse_stream(
        &self,
        request: &InferenceRequest,
    ) -> Result<DeltaStream, BackendError> {
        let output = self.converse(request).await?;
        let deltas = if output.text.is_empty() {
            Vec::new()
        } else {
            vec![Ok(output.text)]
        };
        Ok(Box::pin(stream::iter(deltas)))
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn classify_client_error(error: ClientError) -> BackendError {
    match error {
        ClientError::Timeout(_) => {
            BackendError::ModelTimeout("Model timed out. Please try again.".into())
        }
        ClientError::UpstreamStatus { status, body } => classify_upstream(status, &body),
        ClientError::Sign(e) => BackendError::Other(e.to_string()),
        ClientError::Transport(msg) | ClientError::Decode(msg) => BackendError::Other(msg),
    }
}

/// Map a non-2xx Bedrock response to the taxonomy.
///
/// Error bodies look like `{"message": "...", "__type": "...#ThrottlingException"}`;
/// the exception name wins, the status code is the fallback.
fn classify_upstream(status: u16, body: &str) -> BackendError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let exception = parsed
        .as_ref()
        .and_then(|v| v.get("__type").or_else(|| v.get("errorType")))
        .and_then(Value::as_str)
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("Message")))
        .and_then(Value::as_str)
        .map(str::to_string);

    match exception.as_deref() {
        Some("ValidationException") => BackendError::Validation(format!(
            "Validation error: {}",
            message.unwrap_or_else(|| "invalid request".into())
        )),
        Some("AccessDeniedException") => BackendError::AccessDenied(
            "Access denied. Check IAM permissions for bedrock:InvokeModel".into(),
        ),
        Some("ResourceNotFoundException") => BackendError::ModelNotFound(
            "Model not found. Check if the model is available in your region.".into(),
        ),
        Some("ThrottlingException") => {
            BackendError::Throttled("Rate limit exceeded. Please try again later.".into())
        }
        Some("ModelTimeoutException") => {
            BackendError::ModelTimeout("Model timed out. Please try again.".into())
        }
        Some("ServiceQuotaExceededException") => {
            BackendError::QuotaExceeded("Service quota exceeded. Please try again later.".into())
        }
        _ => classify_by_status(status, message),
    }
}

fn classify_by_status(status: u16, message: Option<String>) -> BackendError {
    let message =
        message.unwrap_or_else(|| format!("model backend returned status {status}"));
    match status {
        400 => BackendError::Validation(message),
        401 | 403 => BackendError::AccessDenied(message),
        404 => BackendError::ModelNotFound(message),
        408 | 504 => BackendError::ModelTimeout(message),
        429 => BackendError::Throttled(message),
        _ => BackendError::Other(message),
    }
}

// ---------------------------------------------------------------------------
// Region inference
// ---------------------------------------------------------------------------

/// Infer the signing region from an endpoint authority.
///
/// Recognizes `<id>.lambda-url.<region>.on.aws` function URLs and
/// `<service>.<region>.amazonaws.com` regional endpoints.
pub fn infer_region(authority: &str) -> Option<String> {
    const PATTERNS: [&str; 2] = [
        r"lambda-url\.([a-z0-9-]+)\.on\.aws",
        r"\.([a-z]{2}(?:-[a-z]+)+-\d)\.amazonaws\.com",
    ];
    for pattern in PATTERNS {
        let captured = Regex::new(pattern)
            .ok()
            .and_then(|re| re.captures(authority).and_then(|c| c.get(1).map(|m| m.as_str().to_string())));
        if captured.is_some() {
            return captured;
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
