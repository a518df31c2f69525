// Copyright 2026 The Bedrock Relay Project
// SPDX-License-Identifier: Apache-2.0

// Inference proxy -- the HTTP surface.
//
// Responsibilities:
// - OPTIONS preflight short-circuit (CORS headers, no body processing)
// - Front-door shared-secret gate, checked before any backend work
// - Request validation (modelId + message required)
// - Buffered dispatch: one JSON response per invocation
// - Streaming dispatch: SSE relay, with clean error envelopes for failures
//   that happen before the stream commits
// - Fire-and-forget usage counters, /track, /stats, /healthz

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::backend::{BackendError, DeltaStream, InferenceRequest, ModelBackend};
use crate::config::AuthMode;
use crate::relay::{self, BufferedSink, ChannelSink, RelayOutcome, StreamingMode};
use crate::usage::UsageRecorder;

/// Header a trusted front door uses to prove the request came through it.
pub const FRONT_DOOR_SECRET_HEADER: &str = "x-front-door-secret";

/// Upper bound on inbound request bodies.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// CORS header set answered on every response, errors included. Browsers
/// talk to the relay directly, so the signing headers must be allowed.
const CORS_HEADERS: [(&str, &str); 3] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "POST, OPTIONS"),
    (
        "access-control-allow-headers",
        "Content-Type, Authorization, X-Amz-Date, X-Amz-Security-Token, X-Amz-Content-Sha256",
    ),
];

fn apply_cors(response: &mut Response) {
    for (name, value) in CORS_HEADERS {
        response
            .headers_mut()
            .insert(name, HeaderValue::from_static(value));
    }
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// The single error shape surfaced to callers: `{error, errorType?}` at the
/// status the taxonomy dictates. Emitted exactly once per failed request.
#[derive(Debug)]
pub struct ErrorEnvelope {
    pub status: StatusCode,
    pub message: String,
    pub error_type: Option<String>,
}

impl ErrorEnvelope {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            error_type: None,
        }
    }

    fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "Forbidden: direct access not allowed".to_string(),
            error_type: None,
        }
    }

    fn from_backend(error: &BackendError) -> Self {
        Self {
            status: error.status(),
            message: error.to_string(),
            error_type: error.error_type().map(str::to_string),
        }
    }
}

impl IntoResponse for ErrorEnvelope {
    fn into_response(self) -> Response {
        let body = match &self.error_type {
            Some(error_type) => json!({ "error": self.message, "errorType": error_type }),
            None => json!({ "error": self.message }),
        };
        let mut response = (self.status, axum::Json(body)).into_response();
        apply_cors(&mut response);
        response
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn ModelBackend>,
    pub usage: Arc<dyn UsageRecorder>,
    pub auth: AuthMode,
    pub streaming: StreamingMode,
}

/// Build the axum router with all relay routes.
///
/// The backend and usage recorder are injected -- no side effects, no
/// hard-coded clients.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/invoke", post(invoke).options(preflight))
        .route("/track", post(track).options(preflight))
        .route("/stats", get(stats))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Heartbeat endpoint: GET /healthz -> 200 OK
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Preflight requests are answered before any validation or auth logic.
async fn preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_cors(&mut response);
    response
}

async fn stats(State(state): State<AppState>) -> Response {
    let mut response = axum::Json(state.usage.snapshot()).into_response();
    apply_cors(&mut response);
    response
}

/// Analytics events. Counting must never matter to the caller beyond the
/// acknowledgement, so the handler does nothing but record.
async fn track(State(state): State<AppState>, body: Bytes) -> Response {
    let event = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("eventType")?.as_str().map(str::to_string));

    match event {
        Some(event) => {
            state.usage.record(&event);
            let mut response = axum::Json(json!({ "ok": true })).into_response();
            apply_cors(&mut response);
            response
        }
        None => ErrorEnvelope::invalid_request("Missing required field: eventType").into_response(),
    }
}

/// Main invocation handler.
async fn invoke(State(state): State<AppState>, request: Request<Body>) -> Response {
    // Front-door gate first: a capability check, independent of the signed
    // deployment variant, and cheaper than anything that follows.
    if let AuthMode::FrontDoorSecret { secret } = &state.auth {
        let presented = request
            .headers()
            .get(FRONT_DOOR_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            tracing::warn!("unauthorized request: invalid or missing front door secret");
            return ErrorEnvelope::forbidden().into_response();
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return ErrorEnvelope::invalid_request(format!("failed to read request body: {e}"))
                .into_response()
        }
    };

    let inference_request = match InferenceRequest::parse(&body) {
        Ok(parsed) => parsed,
        Err(e) => return ErrorEnvelope::invalid_request(e.to_string()).into_response(),
    };

    let request_id = Uuid::new_v4().to_string();
    tracing::debug!(
        request_id = %request_id,
        model = %inference_request.model_id,
        stream = inference_request.stream,
        "invoking model"
    );
    state.usage.record("invoke");

    if inference_request.stream {
        handle_streaming(&state, &inference_request, &request_id).await
    } else {
        handle_buffered(&state, &inference_request, &request_id).await
    }
}

// ---------------------------------------------------------------------------
// Buffered path
// ---------------------------------------------------------------------------

async fn handle_buffered(
    state: &AppState,
    request: &InferenceRequest,
    request_id: &str,
) -> Response {
    let start = Instant::now();
    match state.backend.converse(request).await {
        Ok(output) => {
            tracing::info!(
                request_id = %request_id,
                model = %request.model_id,
                output_chars = output.text.chars().count(),
                latency_ms = start.elapsed().as_secs_f64() * 1000.0,
                "invocation completed"
            );

            let mut body = json!({ "output": output.text });
            if let Some(usage) = output.usage {
                body["usage"] = usage;
            }
            if let Some(stop_reason) = output.stop_reason {
                body["stopReason"] = stop_reason.into();
            }
            let mut response = axum::Json(body).into_response();
            apply_cors(&mut response);
            response
        }
        Err(error) => {
            tracing::info!(
                request_id = %request_id,
                model = %request.model_id,
                status = error.status().as_u16(),
                error = %error,
                "invocation failed"
            );
            ErrorEnvelope::from_backend(&error).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming path
// ---------------------------------------------------------------------------

async fn handle_streaming(
    state: &AppState,
    request: &InferenceRequest,
    request_id: &str,
) -> Response {
    let mut source = match state.backend.converse_stream(request).await {
        Ok(source) => source,
        Err(error) => {
            tracing::info!(
                request_id = %request_id,
                status = error.status().as_u16(),
                error = %error,
                "stream setup failed"
            );
            return ErrorEnvelope::from_backend(&error).into_response();
        }
    };

    // Pull the first event before committing to text/event-stream: up to
    // this point a failure can still be a clean error envelope. Afterwards
    // the transport is committed and only terminal frames are possible.
    let source: DeltaStream = match source.next().await {
        Some(Err(error)) => {
            tracing::info!(
                request_id = %request_id,
                status = error.status().as_u16(),
                error = %error,
                "stream failed before first delta"
            );
            return ErrorEnvelope::from_backend(&error).into_response();
        }
        Some(Ok(first_delta)) => {
            Box::pin(futures_util::stream::iter([Ok(first_delta)]).chain(source))
        }
        None => Box::pin(futures_util::stream::empty()),
    };

    match state.streaming {
        StreamingMode::Incremental => {
            let (tx, rx) = mpsc::channel::<Bytes>(64);
            let request_id = request_id.to_string();
            tokio::spawn(async move {
                let mut sink = ChannelSink::new(tx);
                match relay::relay(source, &mut sink).await {
                    RelayOutcome::Completed { full_text } => tracing::info!(
                        request_id = %request_id,
                        output_chars = full_text.chars().count(),
                        "stream completed"
                    ),
                    RelayOutcome::ClientGone => tracing::debug!(
                        request_id = %request_id,
                        "client disconnected; remaining deltas discarded"
                    ),
                    RelayOutcome::Failed { error, .. } => tracing::warn!(
                        request_id = %request_id,
                        error = %error,
                        "stream failed after first delta"
                    ),
                }
            });

            let body =
                Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>));
            event_stream_response(body)
        }
        StreamingMode::Buffered => {
            // Nothing reaches the wire until the relay finishes, so a source
            // failure can still become a clean envelope here.
            let mut sink = BufferedSink::new();
            match relay::relay(source, &mut sink).await {
                RelayOutcome::Failed { error, .. } => {
                    tracing::info!(
                        request_id = %request_id,
                        status = error.status().as_u16(),
                        error = %error,
                        "buffered stream failed"
                    );
                    ErrorEnvelope::from_backend(&error).into_response()
                }
                _ => event_stream_response(Body::from(sink.into_body())),
            }
        }
    }
}

fn event_stream_response(body: Body) -> Response {
    let mut response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response();
    apply_cors(&mut response);
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceOutput;
    use crate::usage::InMemoryUsage;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt; // for oneshot

    // -----------------------------------------------------------------------
    // Test backends
    // -----------------------------------------------------------------------

    /// Backend scripted with a fixed outcome per mode; counts invocations so
    /// gate ordering is observable.
    struct ScriptedBackend {
        deltas: Vec<Result<String, BackendError>>,
        buffered: Result<InferenceOutput, BackendError>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn ok(text: &str) -> Self {
            Self {
                deltas: vec![Ok(text.to_string())],
                buffered: Ok(InferenceOutput {
                    text: text.to_string(),
                    usage: Some(json!({"inputTokens": 1, "outputTokens": 2})),
                    stop_reason: Some("end_turn".to_string()),
                }),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(error: BackendError) -> Self {
            Self {
                deltas: vec![Err(error.clone())],
                buffered: Err(error),
                calls: AtomicUsize::new(0),
            }
        }

        fn streaming(deltas: Vec<Result<String, BackendError>>) -> Self {
            Self {
                deltas,
                buffered: Ok(InferenceOutput {
                    text: String::new(),
                    usage: None,
                    stop_reason: None,
                }),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn converse(
            &self,
            _request: &InferenceRequest,
        ) -> Result<InferenceOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.buffered.clone()
        }

        async fn converse_stream(
            &self,
            _request: &InferenceRequest,
        ) -> Result<DeltaStream, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(futures_util::stream::iter(self.deltas.clone())))
        }
    }

    fn app_with(backend: Arc<ScriptedBackend>, auth: AuthMode, streaming: StreamingMode) -> Router {
        build_router(AppState {
            backend,
            usage: Arc::new(InMemoryUsage::new()),
            auth,
            streaming,
        })
    }

    fn app(backend: Arc<ScriptedBackend>) -> Router {
        app_with(backend, AuthMode::Signed, StreamingMode::Incremental)
    }

    fn invoke_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/invoke")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_frames(response: Response) -> Vec<Value> {
        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap();
        std::str::from_utf8(&bytes)
            .unwrap()
            .split("\n\n")
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| serde_json::from_str(chunk.strip_prefix("data: ").unwrap()).unwrap())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Test 1: OPTIONS preflight short-circuits
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn options_preflight_returns_200_without_touching_backend() {
        let backend = Arc::new(ScriptedBackend::ok("unused"));
        // Even a configured secret must not gate the preflight.
        let router = app_with(
            backend.clone(),
            AuthMode::FrontDoorSecret {
                secret: "s".into(),
            },
            StreamingMode::Incremental,
        );

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/invoke")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert_eq!(backend.call_count(), 0);

        let bytes = axum::body::to_bytes(response.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: validation gate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn missing_message_returns_400_and_no_backend_call() {
        let backend = Arc::new(ScriptedBackend::ok("unused"));
        let response = app(backend.clone())
            .oneshot(invoke_request(r#"{"modelId":"x"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backend.call_count(), 0);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Missing required fields: modelId and message");
    }

    #[tokio::test]
    async fn invalid_json_body_returns_400() {
        let backend = Arc::new(ScriptedBackend::ok("unused"));
        let response = app(backend)
            .oneshot(invoke_request("not json {{{"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    // -----------------------------------------------------------------------
    // Test 3: front-door secret gate precedes everything
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn wrong_secret_returns_403_with_zero_backend_calls() {
        let backend = Arc::new(ScriptedBackend::ok("unused"));
        let router = app_with(
            backend.clone(),
            AuthMode::FrontDoorSecret {
                secret: "expected".into(),
            },
            StreamingMode::Incremental,
        );

        let request = Request::builder()
            .method("POST")
            .uri("/invoke")
            .header(FRONT_DOOR_SECRET_HEADER, "wrong")
            .body(Body::from(r#"{"modelId":"m","message":"hi"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn absent_secret_returns_403() {
        let backend = Arc::new(ScriptedBackend::ok("unused"));
        let router = app_with(
            backend.clone(),
            AuthMode::FrontDoorSecret {
                secret: "expected".into(),
            },
            StreamingMode::Incremental,
        );

        let response = router
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn matching_secret_admits_the_request() {
        let backend = Arc::new(ScriptedBackend::ok("hello"));
        let router = app_with(
            backend.clone(),
            AuthMode::FrontDoorSecret {
                secret: "expected".into(),
            },
            StreamingMode::Incremental,
        );

        let request = Request::builder()
            .method("POST")
            .uri("/invoke")
            .header(FRONT_DOOR_SECRET_HEADER, "expected")
            .body(Body::from(r#"{"modelId":"m","message":"hi"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn signed_mode_enforces_no_gate() {
        let backend = Arc::new(ScriptedBackend::ok("hello"));
        let response = app(backend)
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // -----------------------------------------------------------------------
    // Test 4: buffered response shape
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn buffered_invocation_returns_output_usage_and_stop_reason() {
        let backend = Arc::new(ScriptedBackend::ok("translated text"));
        let response = app(backend)
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );

        let body = body_json(response).await;
        assert_eq!(body["output"], "translated text");
        assert_eq!(body["usage"]["outputTokens"], 2);
        assert_eq!(body["stopReason"], "end_turn");
    }

    // -----------------------------------------------------------------------
    // Test 5: error mapping table
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn backend_errors_map_to_taxonomy_statuses() {
        let table = [
            (BackendError::Validation("v".into()), 400, Some("ValidationException")),
            (BackendError::AccessDenied("a".into()), 403, Some("AccessDeniedException")),
            (BackendError::ModelNotFound("n".into()), 404, Some("ResourceNotFoundException")),
            (BackendError::Throttled("t".into()), 429, Some("ThrottlingException")),
            (BackendError::ModelTimeout("m".into()), 504, Some("ModelTimeoutException")),
            (BackendError::QuotaExceeded("q".into()), 429, Some("ServiceQuotaExceededException")),
            (BackendError::Other("boom".into()), 500, None),
        ];

        for (error, expected_status, expected_type) in table {
            let backend = Arc::new(ScriptedBackend::failing(error.clone()));
            let response = app(backend)
                .oneshot(invoke_request(r#"{"modelId":"m","message":"hi"}"#))
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), expected_status, "for {error:?}");

            let body = body_json(response).await;
            assert!(body["error"].is_string());
            match expected_type {
                Some(t) => assert_eq!(body["errorType"], t),
                None => assert!(body.get("errorType").is_none()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Test 6: streaming happy path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn streaming_invocation_relays_deltas_and_sentinel() {
        let backend = Arc::new(ScriptedBackend::streaming(vec![
            Ok("The ".into()),
            Ok("answer".into()),
        ]));
        let response = app(backend)
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi","stream":true}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );

        let frames = body_frames(response).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["text"], "The ");
        assert_eq!(frames[1]["text"], "answer");
        assert_eq!(frames[2]["done"], true);
        assert_eq!(frames[2]["fullText"], "The answer");
    }

    #[tokio::test]
    async fn streaming_with_empty_source_emits_bare_sentinel() {
        let backend = Arc::new(ScriptedBackend::streaming(Vec::new()));
        let response = app(backend)
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi","stream":true}"#))
            .await
            .unwrap();

        let frames = body_frames(response).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["fullText"], "");
    }

    // -----------------------------------------------------------------------
    // Test 7: the streaming error asymmetry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn error_before_first_delta_is_a_clean_envelope() {
        let backend = Arc::new(ScriptedBackend::streaming(vec![Err(
            BackendError::Throttled("Rate limit exceeded. Please try again later.".into()),
        )]));
        let response = app(backend)
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi","stream":true}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["errorType"], "ThrottlingException");
    }

    #[tokio::test]
    async fn error_after_first_delta_becomes_terminal_frame() {
        let backend = Arc::new(ScriptedBackend::streaming(vec![
            Ok("partial ".into()),
            Err(BackendError::ModelTimeout("Model timed out.".into())),
        ]));
        let response = app(backend)
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi","stream":true}"#))
            .await
            .unwrap();

        // The stream already committed, so this is a 200 with an error event.
        assert_eq!(response.status(), StatusCode::OK);
        let frames = body_frames(response).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["text"], "partial ");
        assert_eq!(frames[1]["error"], "Model timed out.");
        assert_eq!(frames[1]["done"], true);
    }

    #[tokio::test]
    async fn buffered_sink_mode_turns_mid_stream_error_into_envelope() {
        // With the buffering sink nothing reaches the wire until the relay
        // finishes, so even a late failure is a clean envelope.
        let backend = Arc::new(ScriptedBackend::streaming(vec![
            Ok("partial ".into()),
            Err(BackendError::ModelTimeout("Model timed out.".into())),
        ]));
        let router = app_with(backend, AuthMode::Signed, StreamingMode::Buffered);
        let response = router
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi","stream":true}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = body_json(response).await;
        assert_eq!(body["errorType"], "ModelTimeoutException");
    }

    #[tokio::test]
    async fn buffered_sink_mode_emits_whole_stream_as_one_body() {
        let backend = Arc::new(ScriptedBackend::streaming(vec![
            Ok("a".into()),
            Ok("b".into()),
        ]));
        let router = app_with(backend, AuthMode::Signed, StreamingMode::Buffered);
        let response = router
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi","stream":true}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let frames = body_frames(response).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2]["fullText"], "ab");
    }

    // -----------------------------------------------------------------------
    // Usage endpoints
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn track_and_stats_roundtrip() {
        let usage = Arc::new(InMemoryUsage::new());
        let router = build_router(AppState {
            backend: Arc::new(ScriptedBackend::ok("unused")),
            usage: usage.clone(),
            auth: AuthMode::Signed,
            streaming: StreamingMode::Incremental,
        });

        let request = Request::builder()
            .method("POST")
            .uri("/track")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"eventType":"contest_page_opened"}"#))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats_request = Request::builder()
            .method("GET")
            .uri("/stats")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(stats_request).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["contest_page_opened"], 1);
    }

    #[tokio::test]
    async fn track_without_event_type_is_rejected() {
        let router = app(Arc::new(ScriptedBackend::ok("unused")));
        let request = Request::builder()
            .method("POST")
            .uri("/track")
            .body(Body::from(r#"{}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invoke_increments_usage_counter() {
        let usage = Arc::new(InMemoryUsage::new());
        let router = build_router(AppState {
            backend: Arc::new(ScriptedBackend::ok("hello")),
            usage: usage.clone(),
            auth: AuthMode::Signed,
            streaming: StreamingMode::Incremental,
        });

        router
            .oneshot(invoke_request(r#"{"modelId":"m","message":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(usage.snapshot()["invoke"], 1);
    }

    #[tokio::test]
    async fn heartbeat_returns_200() {
        let router = app(Arc::new(ScriptedBackend::ok("unused")));
        let request = Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // -----------------------------------------------------------------------
    // Concurrency: requests are independent
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn concurrent_requests_handled_independently() {
        let backend = Arc::new(ScriptedBackend::ok("hello"));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let router = app(backend.clone());
            handles.push(tokio::spawn(async move {
                let response = router
                    .oneshot(invoke_request(r#"{"modelId":"m","message":"hi"}"#))
                    .await
                    .unwrap();
                response.status()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }
        assert_eq!(backend.call_count(), 10);
    }
}
