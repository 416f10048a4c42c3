//! Minimal SSE client for integration tests.
//!
//! Speaks just enough of the event-stream wire format to assert on frames:
//! `id:` / `event:` / `data:` fields, multi-line data, frame separation by
//! a blank line. Comments and `retry:` hints are ignored.

use bk_protocol::ConnectAck;
use futures_util::StreamExt;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Sent as the `sse-session-id` cookie.
    pub session_id: Option<String>,
    /// Sent as the `Last-Event-ID` header.
    pub last_event_id: Option<String>,
}

#[derive(Debug)]
pub enum SseClientError {
    Connect(String),
    /// Non-2xx response; carries the HTTP status code.
    Status(u16),
    Transport(String),
    /// The server closed the stream.
    Closed,
    Timeout,
    /// A frame arrived but was not the expected `connected` acknowledgement.
    Protocol(String),
}

impl fmt::Display for SseClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SseClientError::Connect(s) => write!(f, "connect error: {}", s),
            SseClientError::Status(code) => write!(f, "unexpected status: {}", code),
            SseClientError::Transport(s) => write!(f, "transport error: {}", s),
            SseClientError::Closed => write!(f, "stream closed"),
            SseClientError::Timeout => write!(f, "timed out waiting for a frame"),
            SseClientError::Protocol(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for SseClientError {}

// ---------------------------------------------------------------------------
// SseClient
// ---------------------------------------------------------------------------

type ByteStream = Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;

pub struct SseClient {
    stream: ByteStream,
    buffer: String,
}

impl std::fmt::Debug for SseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseClient")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl SseClient {
    /// Open an event-stream connection to `url` (typically `http://…/events`).
    pub async fn connect(url: &str, opts: ConnectOptions) -> Result<Self, SseClientError> {
        let client = reqwest::Client::new();
        let mut request = client.get(url).header("Accept", "text/event-stream");
        if let Some(session_id) = &opts.session_id {
            request = request.header("Cookie", format!("sse-session-id={session_id}"));
        }
        if let Some(last) = &opts.last_event_id {
            request = request.header("Last-Event-ID", last.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| SseClientError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SseClientError::Status(response.status().as_u16()));
        }
        Ok(SseClient {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        })
    }

    /// Next complete frame, waiting up to `timeout`.
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<SseFrame, SseClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.pop_buffered_frame() {
                return Ok(frame);
            }
            let chunk = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| SseClientError::Timeout)?;
            match chunk {
                None => return Err(SseClientError::Closed),
                Some(Err(e)) => return Err(SseClientError::Transport(e.to_string())),
                Some(Ok(bytes)) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
            }
        }
    }

    /// Next frame that is not a heartbeat.
    pub async fn next_data_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<SseFrame, SseClientError> {
        loop {
            let frame = self.next_frame(timeout).await?;
            let is_heartbeat = frame
                .event
                .as_deref()
                .is_some_and(|e| e.starts_with("heartbeat"));
            if !is_heartbeat {
                return Ok(frame);
            }
        }
    }

    /// Read the mandatory `connected` acknowledgement frame.
    pub async fn connect_ack(&mut self, timeout: Duration) -> Result<ConnectAck, SseClientError> {
        let frame = self.next_frame(timeout).await?;
        if frame.event.as_deref() != Some("connected") {
            return Err(SseClientError::Protocol(format!(
                "expected connected ack, got {:?}",
                frame.event
            )));
        }
        serde_json::from_str(&frame.data)
            .map_err(|e| SseClientError::Protocol(format!("bad ack payload: {e}")))
    }

    fn pop_buffered_frame(&mut self) -> Option<SseFrame> {
        let end = self.buffer.find("\n\n")?;
        let raw: String = self.buffer.drain(..end + 2).collect();
        Some(parse_frame(&raw))
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

fn parse_frame(raw: &str) -> SseFrame {
    let mut id = None;
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if let Some(value) = field_value(line, "id") {
            id = Some(value.to_owned());
        } else if let Some(value) = field_value(line, "event") {
            event = Some(value.to_owned());
        } else if let Some(value) = field_value(line, "data") {
            data_lines.push(value);
        }
        // Comments (":...") and retry hints are ignored.
    }
    SseFrame {
        id,
        event,
        data: data_lines.join("\n"),
    }
}

/// `"data: x"` / `"data:x"` → `Some("x")` for field name `"data"`.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
