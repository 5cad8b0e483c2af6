//! Loopback HTTP transport to engine subprocesses.
//!
//! The adapter only depends on status codes, JSON bodies and the stream
//! sentinel, so the transport is a narrow trait. [`HttpTransport`] is the
//! production implementation over `reqwest`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use modelvisor_core::EngineError;

/// Raw body chunks of a streamed backend response.
pub type ChunkStream = BoxStream<'static, Result<Bytes, EngineError>>;

#[async_trait]
pub trait BackendTransport: Send + Sync + fmt::Debug {
    /// Single liveness probe; `true` only on a success status.
    async fn probe(&self, port: u16, path: &str) -> bool;

    /// POST `body` and return the backend's status code and JSON reply.
    async fn post_json(
        &self,
        port: u16,
        path: &str,
        body: &Value,
    ) -> Result<(u16, Value), EngineError>;

    /// POST `body` and return the response body as a chunk stream.
    async fn post_stream(
        &self,
        port: u16,
        path: &str,
        body: &Value,
    ) -> Result<ChunkStream, EngineError>;
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    host: String,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            host: "127.0.0.1".to_string(),
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{port}{path}", self.host)
    }
}

fn transport_err(e: &reqwest::Error) -> EngineError {
    EngineError::TransportFailure(e.to_string())
}

#[async_trait]
impl BackendTransport for HttpTransport {
    async fn probe(&self, port: u16, path: &str) -> bool {
        match self
            .client
            .get(self.url(port, path))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(port, error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn post_json(
        &self,
        port: u16,
        path: &str,
        body: &Value,
    ) -> Result<(u16, Value), EngineError> {
        let response = self
            .client
            .post(self.url(port, path))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_err(&e))?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| transport_err(&e))?;
        let json = serde_json::from_str(&text).map_err(|e| {
            EngineError::TransportFailure(format!("backend returned non-JSON body: {e}"))
        })?;
        Ok((status, json))
    }

    async fn post_stream(
        &self,
        port: u16,
        path: &str,
        body: &Value,
    ) -> Result<ChunkStream, EngineError> {
        let response = self
            .client
            .post(self.url(port, path))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_err(&e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::TransportFailure(format!(
                "backend returned {status}: {detail}"
            )));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| transport_err(&e)))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn probe_reflects_status() {
        let port = serve(
            Router::new()
                .route("/health", get(|| async { "ok" }))
                .route("/busy", get(|| async { StatusCode::SERVICE_UNAVAILABLE })),
        )
        .await;
        let transport = HttpTransport::default();

        assert!(transport.probe(port, "/health").await);
        assert!(!transport.probe(port, "/busy").await);
    }

    #[tokio::test]
    async fn probe_on_closed_port_is_false() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!HttpTransport::default().probe(port, "/health").await);
    }

    #[tokio::test]
    async fn post_json_passes_status_through() {
        let port = serve(Router::new().route(
            "/v1/embeddings",
            post(|axum::Json(body): axum::Json<Value>| async move {
                (
                    StatusCode::BAD_REQUEST,
                    axum::Json(json!({"echo": body["input"]})),
                )
            }),
        ))
        .await;

        let (status, body) = HttpTransport::default()
            .post_json(port, "/v1/embeddings", &json!({"input": "hi"}))
            .await
            .unwrap();
        assert_eq!(status, 400);
        assert_eq!(body["echo"], "hi");
    }

    #[tokio::test]
    async fn post_stream_yields_body_chunks() {
        let port = serve(Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let chunks = futures_util::stream::iter(vec![
                    Ok::<_, std::io::Error>("data: a\n\n"),
                    Ok("data: [DONE]\n\n"),
                ]);
                Body::from_stream(chunks)
            }),
        ))
        .await;

        let mut stream = HttpTransport::default()
            .post_stream(port, "/v1/chat/completions", &json!({"stream": true}))
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8(collected).unwrap();
        assert!(text.contains("data: a"));
        assert!(text.contains("[DONE]"));
    }
}
