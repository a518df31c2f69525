// Stream relay -- incremental event emission.
//
// Turns an ordered source of text deltas into wire-level event frames and
// forwards each one as soon as it is produced. Guarantees:
// - frame order equals production order; nothing dropped or duplicated
// - exactly one terminal sentinel on successful completion, even for an
//   empty source
// - a closed sink stops consumption; remaining deltas are discarded
//
// The sink is abstract so hosting models without incremental HTTP
// responses can buffer all frames into one body instead. That trade-off is
// a configuration choice, never a silent fallback.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use crate::backend::{BackendError, DeltaStream};

// ---------------------------------------------------------------------------
// Frame grammar
// ---------------------------------------------------------------------------

/// One incremental text delta: `data: {"text": <delta>}\n\n`.
pub fn text_frame(delta: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", json!({ "text": delta })))
}

/// Terminal sentinel carrying the full concatenated text, so a client that
/// missed chunks can still recover the complete result.
pub fn sentinel_frame(full_text: &str) -> Bytes {
    Bytes::from(format!(
        "data: {}\n\n",
        json!({ "done": true, "fullText": full_text })
    ))
}

/// Terminal error event for failures after the stream has started.
pub fn error_frame(message: &str) -> Bytes {
    Bytes::from(format!(
        "data: {}\n\n",
        json!({ "error": message, "done": true })
    ))
}

// ---------------------------------------------------------------------------
// Frame sinks
// ---------------------------------------------------------------------------

/// The consumer of this sink is gone; no further frames can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Ordered frame consumer. `send` fails only when delivery has become
/// impossible, which the relay treats as client disconnect.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed>;
}

/// True incremental delivery: frames go into a channel whose receiver feeds
/// the live HTTP response body.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }
}

/// Buffer-then-flush fallback: collects every frame and hands them back as
/// one body. Loses incrementality, keeps the wire format.
#[derive(Default)]
pub struct BufferedSink {
    frames: Vec<Bytes>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// All frames concatenated, in emission order.
    pub fn into_body(self) -> Bytes {
        let mut body = Vec::new();
        for frame in &self.frames {
            body.extend_from_slice(frame);
        }
        Bytes::from(body)
    }
}

#[async_trait]
impl FrameSink for BufferedSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.frames.push(frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// How streaming responses are delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// Forward each frame as it is produced.
    Incremental,
    /// Collect all frames and send them as one body.
    Buffered,
}

/// How a relay run ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Source exhausted; sentinel delivered.
    Completed { full_text: String },
    /// The sink closed mid-run; remaining deltas were discarded.
    ClientGone,
    /// The source failed after the stream began. A terminal error frame was
    /// attempted; `partial_text` is what had been relayed.
    Failed {
        partial_text: String,
        error: BackendError,
    },
}

/// Forward every delta from `source` into `sink`, then terminate the stream.
pub async fn relay(mut source: DeltaStream, sink: &mut dyn FrameSink) -> RelayOutcome {
    let mut full_text = String::new();

    while let Some(item) = source.next().await {
        match item {
            Ok(delta) => {
                if sink.send(text_frame(&delta)).await.is_err() {
                    return RelayOutcome::ClientGone;
                }
                full_text.push_str(&delta);
            }
            Err(error) => {
                // The transport has already committed to a stream; a clean
                // error envelope is no longer possible. Best effort.
                let _ = sink.send(error_frame(&error.to_string())).await;
                return RelayOutcome::Failed {
                    partial_text: full_text,
                    error,
                };
            }
        }
    }

    if sink.send(sentinel_frame(&full_text)).await.is_err() {
        return RelayOutcome::ClientGone;
    }
    RelayOutcome::Completed { full_text }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
