//! Request/response body templating.
//!
//! Templates see the body as `input_request` and must render JSON, e.g.
//! `{"prompt": {{ input_request.messages | tojson }}}`. A template that
//! fails to render (or renders invalid JSON) is logged and the body is
//! relayed unchanged.

use minijinja::{Environment, context};
use serde_json::Value;
use tracing::warn;

use modelvisor_core::EngineError;

/// Templates configured for one model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformTemplates {
    pub request: Option<String>,
    pub response: Option<String>,
}

impl TransformTemplates {
    pub fn apply_request(&self, model: &str, body: Value) -> Value {
        apply(self.request.as_deref(), model, "request", body)
    }

    pub fn apply_response(&self, model: &str, body: Value) -> Value {
        apply(self.response.as_deref(), model, "response", body)
    }
}

/// Render `template` against `input` and parse the output as JSON.
pub fn render(template: &str, input: &Value) -> Result<Value, EngineError> {
    let env = Environment::new();
    let rendered = env
        .render_str(template, context! { input_request => input })
        .map_err(|e| EngineError::TransformRender(e.to_string()))?;
    serde_json::from_str(&rendered)
        .map_err(|e| EngineError::TransformRender(format!("output is not JSON: {e}")))
}

fn apply(template: Option<&str>, model: &str, direction: &str, body: Value) -> Value {
    let Some(template) = template else {
        return body;
    };
    match render(template, &body) {
        Ok(transformed) => transformed,
        Err(e) => {
            warn!(model, direction, error = %e, "Transform failed, relaying untransformed body");
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_with_tojson() {
        let out = render(
            r#"{"prompt": {{ input_request.messages | tojson }}, "n": 1}"#,
            &json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .unwrap();
        assert_eq!(out["prompt"][0]["content"], "hi");
        assert_eq!(out["n"], 1);
    }

    #[test]
    fn broken_template_falls_back_to_original() {
        let templates = TransformTemplates {
            request: Some("{{ input_request.messages | tojson ".to_string()),
            response: Some("not json at all".to_string()),
        };
        let body = json!({"messages": []});

        assert_eq!(templates.apply_request("m1", body.clone()), body);
        assert_eq!(templates.apply_response("m1", body.clone()), body);
    }

    #[test]
    fn absent_template_is_identity() {
        let body = json!({"a": 1});
        assert_eq!(TransformTemplates::default().apply_request("m1", body.clone()), body);
    }
}
