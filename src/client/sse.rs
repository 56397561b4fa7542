//! Incremental server-sent-events decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::push`] buffers them and
//! yields whole frames once a blank-line boundary is seen. [`decode_event`]
//! turns a frame into a [`StreamEvent`].

use crate::client::events::StreamEvent;
use crate::error::StreamError;
use crate::protocol::{
    ChatMessage, FragmentPayload, StreamErrorPayload, EVENT_COMPLETE, EVENT_ERROR, EVENT_TOKEN,
};

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// One raw SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// Value of the `event:` field; `message` when absent.
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every complete frame it finishes.
    ///
    /// The size cap applies to the unterminated remainder, not the chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, StreamError> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((pos, delim_len)) = find_event_boundary(&self.buffer[consumed..]) {
            let raw = &self.buffer[consumed..consumed + pos];
            let text = std::str::from_utf8(raw)
                .map_err(|_| StreamError::Protocol("invalid UTF-8 in SSE stream".into()))?;
            if let Some(frame) = parse_frame(text) {
                frames.push(frame);
            }
            consumed += pos + delim_len;
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > MAX_SSE_BUFFER_BYTES {
            return Err(StreamError::Protocol(
                "SSE buffer exceeded maximum size (4 MiB)".into(),
            ));
        }
        Ok(frames)
    }

    /// Bytes buffered without a terminating boundary yet.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

/// Parse one frame; comment-only frames (keep-alives) yield `None`.
fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = String::new();
    let mut found_data = false;

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => {
                if found_data {
                    data.push('\n');
                }
                data.push_str(value);
                found_data = true;
            }
            _ => {}
        }
    }

    if event.is_none() && !found_data {
        return None;
    }
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".into()),
        data,
    })
}

/// Decode a frame into a stream event. Unknown event names are skipped.
pub fn decode_event(frame: &SseFrame) -> Result<Option<StreamEvent>, StreamError> {
    let event = match frame.event.as_str() {
        EVENT_TOKEN => {
            let payload: FragmentPayload = parse_json(&frame.data)?;
            StreamEvent::Fragment(payload.content)
        }
        EVENT_COMPLETE => {
            let message: ChatMessage = parse_json(&frame.data)?;
            StreamEvent::Complete(message)
        }
        EVENT_ERROR => {
            let payload: StreamErrorPayload = parse_json(&frame.data)?;
            StreamEvent::Error {
                kind: payload.kind,
                message: payload.message,
            }
        }
        other => {
            tracing::debug!(event = other, "ignoring unknown SSE event");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn parse_json<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, StreamError> {
    serde_json::from_str(data).map_err(|e| StreamError::Protocol(format!("invalid event payload: {e}")))
}
