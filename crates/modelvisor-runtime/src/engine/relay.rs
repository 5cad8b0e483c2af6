//! Streamed response relay.
//!
//! Backend bodies arrive as arbitrary transport chunks. SSE bodies are
//! reassembled into whole events (terminated by a blank line) and each
//! event's `data:` payload becomes one `is_done=false` message. Plain bodies
//! are forwarded one message per chunk. Bytes of a multi-byte character or
//! of an unfinished event are held back until the rest arrives.
//!
//! The `[DONE]` sentinel ends the stream with exactly one `is_done=true`
//! message carrying an empty payload. A transport error before the sentinel
//! ends it with an error.

use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tracing::{debug, warn};

use modelvisor_core::{ResponseSink, StatusEnvelope};

use super::transform::TransformTemplates;
use crate::transport::ChunkStream;

/// Marks the end of a streamed completion.
pub const STREAM_SENTINEL: &str = "[DONE]";

const SSE_FIELDS: [&str; 4] = ["data:", "event:", "id:", "retry:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Sse,
    Plain,
}

/// Decide the framing from the first bytes of the body. `None` while the
/// buffered prefix could still turn out to be an SSE field name.
fn detect_framing(buf: &[u8]) -> Option<Framing> {
    let start = buf.iter().position(|b| !b.is_ascii_whitespace())?;
    let head = &buf[start..];
    if head.starts_with(b":") || SSE_FIELDS.iter().any(|f| head.starts_with(f.as_bytes())) {
        return Some(Framing::Sse);
    }
    if SSE_FIELDS.iter().any(|f| f.as_bytes().starts_with(head)) {
        return None;
    }
    Some(Framing::Plain)
}

/// End of the first complete SSE event and the length of its delimiter.
fn event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// `data:` payload of one SSE event; comments and other fields are dropped.
fn event_payload(event: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(event);
    let data: Vec<&str> = text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

/// Reassembles payloads from transport chunks.
#[derive(Debug, Default)]
struct EventDecoder {
    buf: BytesMut,
    framing: Option<Framing>,
}

impl EventDecoder {
    /// Payloads completed by `chunk`.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        if self.framing.is_none() {
            self.framing = detect_framing(&self.buf);
        }
        match self.framing {
            None => Vec::new(),
            Some(Framing::Sse) => self.complete_events(),
            Some(Framing::Plain) => self.plain_text().into_iter().collect(),
        }
    }

    /// Whatever is still buffered once the body has ended.
    fn finish(mut self) -> Vec<String> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        match self.framing {
            Some(Framing::Sse) => {
                let mut payloads = self.complete_events();
                let rest = self.buf.split();
                payloads.extend(event_payload(&rest));
                payloads
            }
            None | Some(Framing::Plain) => {
                let rest = self.buf.split();
                let text = String::from_utf8_lossy(&rest);
                if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![text.into_owned()]
                }
            }
        }
    }

    fn complete_events(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        while let Some((end, delimiter)) = event_boundary(&self.buf) {
            let event = self.buf.split_to(end);
            self.buf.advance(delimiter);
            payloads.extend(event_payload(&event));
        }
        payloads
    }

    /// Buffered text up to the last complete character.
    fn plain_text(&mut self) -> Option<String> {
        let end = match std::str::from_utf8(&self.buf) {
            Ok(_) => self.buf.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.buf.len(),
        };
        let bytes = self.buf.split_to(end);
        let text = String::from_utf8_lossy(&bytes);
        if text.trim().is_empty() {
            None
        } else {
            Some(text.into_owned())
        }
    }
}

fn chunk_body(model: &str, payload: &str, transforms: &TransformTemplates) -> Value {
    if transforms.response.is_some()
        && let Ok(parsed) = serde_json::from_str::<Value>(payload)
    {
        let transformed = transforms.apply_response(model, parsed);
        return json!({ "data": transformed.to_string() });
    }
    json!({ "data": payload })
}

/// Forward `payloads` into `sink`. Returns `true` once the sentinel is seen.
async fn forward(
    model: &str,
    payloads: Vec<String>,
    sink: &ResponseSink,
    transforms: &TransformTemplates,
    forwarded: &mut usize,
) -> bool {
    for payload in payloads {
        if payload.trim() == STREAM_SENTINEL {
            debug!(model, forwarded = *forwarded, "Stream complete");
            sink.send(StatusEnvelope::stream_end(200), json!({})).await;
            return true;
        }
        sink.send(StatusEnvelope::chunk(), chunk_body(model, &payload, transforms))
            .await;
        *forwarded += 1;
    }
    false
}

/// Forward `chunks` into `sink` until the sentinel, an error, or EOF.
pub async fn relay_stream(
    model: &str,
    mut chunks: ChunkStream,
    sink: &ResponseSink,
    transforms: &TransformTemplates,
) {
    let mut decoder = EventDecoder::default();
    let mut forwarded = 0usize;
    while let Some(next) = chunks.next().await {
        match next {
            Ok(bytes) => {
                let payloads = decoder.push(&bytes);
                if forward(model, payloads, sink, transforms, &mut forwarded).await {
                    return;
                }
            }
            Err(e) => {
                warn!(model, forwarded, error = %e, "Stream relay failed");
                sink.fail_stream(&e).await;
                return;
            }
        }
    }

    if forward(model, decoder.finish(), sink, transforms, &mut forwarded).await {
        return;
    }
    warn!(model, forwarded, "Backend closed stream without sentinel");
    sink.send(StatusEnvelope::stream_end(200), json!({})).await;
}
