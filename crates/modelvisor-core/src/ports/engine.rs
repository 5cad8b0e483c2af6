//! The engine contract.
//!
//! Every engine, whether it runs in-process or behind a child process,
//! implements [`EngineInterface`]. Callers hand over a JSON request and a
//! [`ResponseSink`]; the engine answers by pushing `(status, payload)` pairs
//! into the sink. Failures never cross the boundary as `Err`: they arrive
//! as a payload with `has_error` set in the status envelope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::EngineKind;

/// Status half of every engine response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub is_done: bool,
    pub has_error: bool,
    pub is_stream: bool,
    pub status_code: u16,
}

impl StatusEnvelope {
    /// Final, non-streamed response with the given HTTP-style code.
    pub const fn complete(status_code: u16) -> Self {
        Self {
            is_done: true,
            has_error: status_code != 200,
            is_stream: false,
            status_code,
        }
    }

    /// Intermediate streamed chunk.
    pub const fn chunk() -> Self {
        Self {
            is_done: false,
            has_error: false,
            is_stream: true,
            status_code: 200,
        }
    }

    /// Terminal streamed response.
    pub const fn stream_end(status_code: u16) -> Self {
        Self {
            is_done: true,
            has_error: status_code != 200,
            is_stream: true,
            status_code,
        }
    }
}

/// `{"status": message}`
pub fn status_body(message: impl Into<String>) -> Value {
    json!({ "status": message.into() })
}

/// `{"error": message}`
pub fn error_body(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

/// One message delivered through a [`ResponseSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub status: StatusEnvelope,
    pub body: Value,
}

/// Caller-visible engine failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Model already loaded!")]
    AlreadyLoaded(String),

    #[error("Model {0} has not been loaded yet.")]
    NotLoaded(String),

    #[error("Model {0} is still loading")]
    Loading(String),

    #[error("Unable to find an available port")]
    PortExhaustion { attempts: u16 },

    #[error("Fail to spawn process: {0}")]
    SpawnFailure(String),

    #[error("Wait for server up timeout")]
    HealthCheckTimeout { model: String, probes: u32 },

    #[error("Model {0} exited before becoming ready")]
    ExitedDuringStartup(String),

    #[error("Unable to kill process of model {0}")]
    TerminationFailure(String),

    #[error("Backend request failed: {0}")]
    TransportFailure(String),

    #[error("Template render failed: {0}")]
    TransformRender(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Status code carried in the envelope for this failure.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::NotLoaded(_) => 400,
            Self::AlreadyLoaded(_) | Self::Loading(_) => 409,
            Self::PortExhaustion { .. }
            | Self::SpawnFailure(_)
            | Self::HealthCheckTimeout { .. }
            | Self::ExitedDuringStartup(_)
            | Self::TerminationFailure(_)
            | Self::TransportFailure(_)
            | Self::TransformRender(_)
            | Self::Unavailable(_) => 500,
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::InvalidRequest(format!("Missing required field: {field}"))
    }
}

/// Receiving half of a [`ResponseSink::channel`].
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::Receiver<EngineResponse>,
}

impl ResponseStream {
    /// Next response, or `None` once every sink clone has been dropped.
    pub async fn recv(&mut self) -> Option<EngineResponse> {
        self.rx.recv().await
    }

    /// Drain until the terminal (`is_done`) response or channel close.
    pub async fn collect_until_done(&mut self) -> Vec<EngineResponse> {
        let mut out = Vec::new();
        while let Some(response) = self.rx.recv().await {
            let done = response.status.is_done;
            out.push(response);
            if done {
                break;
            }
        }
        out
    }
}

/// Bounded channel carrying engine responses to the caller.
///
/// Replaces a raw write callback: the producing task awaits capacity, so a
/// slow consumer applies backpressure to the relay.
#[derive(Debug, Clone)]
pub struct ResponseSink {
    tx: mpsc::Sender<EngineResponse>,
}

impl ResponseSink {
    pub fn channel(capacity: usize) -> (Self, ResponseStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ResponseStream { rx })
    }

    /// Adapt a two-argument callback. Must be called inside a Tokio runtime;
    /// the callback runs on a dedicated task in arrival order.
    pub fn from_callback<F>(mut callback: F) -> Self
    where
        F: FnMut(StatusEnvelope, Value) + Send + 'static,
    {
        let (sink, mut stream) = Self::channel(32);
        tokio::spawn(async move {
            while let Some(response) = stream.recv().await {
                callback(response.status, response.body);
            }
        });
        sink
    }

    /// Deliver one response. A caller that went away is not an error.
    pub async fn send(&self, status: StatusEnvelope, body: Value) {
        if self.tx.send(EngineResponse { status, body }).await.is_err() {
            tracing::debug!("Response receiver dropped");
        }
    }

    /// Final successful response.
    pub async fn ok(&self, body: Value) {
        self.send(StatusEnvelope::complete(200), body).await;
    }

    /// Final error response for `err`.
    pub async fn fail(&self, err: &EngineError) {
        self.send(
            StatusEnvelope::complete(err.status_code()),
            error_body(err.to_string()),
        )
        .await;
    }

    /// Terminal error for a stream that already started.
    pub async fn fail_stream(&self, err: &EngineError) {
        self.send(
            StatusEnvelope::stream_end(err.status_code()),
            error_body(err.to_string()),
        )
        .await;
    }
}

/// Uniform engine contract.
///
/// Each operation takes the caller's JSON request and answers through the
/// sink: exactly once for non-streamed calls, once per chunk plus one
/// terminal `is_done` message for streamed chat completions.
#[async_trait]
pub trait EngineInterface: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> EngineKind;

    async fn handle_chat_completion(&self, request: Value, sink: ResponseSink);

    async fn handle_embedding(&self, request: Value, sink: ResponseSink);

    async fn load_model(&self, request: Value, sink: ResponseSink);

    async fn unload_model(&self, request: Value, sink: ResponseSink);

    async fn get_model_status(&self, request: Value, sink: ResponseSink);

    /// List running models. Engines without a model table answer with an
    /// empty list.
    async fn get_models(&self, _request: Value, sink: ResponseSink) {
        sink.ok(json!({ "object": "list", "data": [] })).await;
    }
}
