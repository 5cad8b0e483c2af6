//! Typed views over JSON engine requests.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

use modelvisor_core::EngineError;

/// The `model` field, required by every operation.
pub fn require_model(request: &Value) -> Result<String, EngineError> {
    request
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| EngineError::missing_field("model"))
}

/// Whether a chat request asks for a streamed response.
pub fn wants_stream(request: &Value) -> bool {
    request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Body of a `LoadModel` call.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadModelRequest {
    pub model: String,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Template applied to outbound request bodies.
    #[serde(default)]
    pub transform_request: Option<String>,
    /// Template applied to inbound response bodies.
    #[serde(default)]
    pub transform_response: Option<String>,
    /// Backend-specific options.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoadModelRequest {
    pub fn parse(request: Value) -> Result<Self, EngineError> {
        let model = require_model(&request)?;
        let mut parsed: Self = serde_json::from_value(request)
            .map_err(|e| EngineError::InvalidRequest(format!("Invalid load request: {e}")))?;
        parsed.model = model;
        Ok(parsed)
    }

    pub fn require_model_path(&self) -> Result<&PathBuf, EngineError> {
        self.model_path
            .as_ref()
            .ok_or_else(|| EngineError::missing_field("model_path"))
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(Value::as_u64)
    }
}
