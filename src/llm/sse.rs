//! Incremental decoding of `data:`-framed server-sent event bodies.
//!
//! Network reads can end anywhere, including in the middle of a line or of
//! a multi-byte character.  [`StreamBuffer`] keeps the unterminated tail
//! between reads and only hands out complete lines, so the decoded
//! fragment sequence does not depend on how the body was chunked.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{GenQueueError, Result};

const EVENT_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Bytes received but not yet terminated by a newline.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    pending: Vec<u8>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them, without
    /// line terminators.  The trailing partial line stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Take whatever is left once the body has ended.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        let line = bytes.strip_suffix(b"\r").unwrap_or(&bytes);
        Some(String::from_utf8_lossy(line).into_owned())
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One JSON frame of an image stream.
#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub data: Vec<ImageDatum>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ImageDatum {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub b64_json: Option<String>,
}

impl ImageDatum {
    fn into_fragment(self) -> Option<String> {
        match (self.url, self.b64_json) {
            (Some(url), _) if !url.is_empty() => Some(url),
            (_, Some(b64)) if !b64.is_empty() => Some(format!("data:image/png;base64,{b64}")),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Done,
}

/// Interpret one complete line.  Returns `None` for lines that are not
/// events (comments, blank keep-alives, other fields) and for event payloads
/// that fail to parse, which are logged and skipped.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let payload = line.trim().strip_prefix(EVENT_PREFIX)?.trim();
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => Some(StreamEvent::Chunk(chunk)),
        Err(e) => {
            warn!(err = %e, len = payload.len(), "skipping malformed stream chunk");
            None
        }
    }
}

fn upstream_error(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Object(map) => {
            let message = map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string);
            Some(message.unwrap_or_else(|| serde_json::Value::Object(map).to_string()))
        }
        other => Some(other.to_string()),
    }
}

/// Turns a chunked body into an ordered list of result fragments.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: StreamBuffer,
    fragments: Vec<String>,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read.  Fails only when the stream reports an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.done {
            return Ok(());
        }
        for line in self.buffer.push(bytes) {
            self.handle_line(&line)?;
            if self.done {
                break;
            }
        }
        Ok(())
    }

    /// True once the `[DONE]` sentinel has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Flush the unterminated tail and return the fragments, or
    /// [`GenQueueError::NoResultProduced`] if there are none.
    pub fn finish(mut self) -> Result<Vec<String>> {
        if !self.done {
            if let Some(rest) = self.buffer.take_remainder() {
                self.handle_line(&rest)?;
            }
        }
        if self.fragments.is_empty() {
            return Err(GenQueueError::NoResultProduced);
        }
        Ok(self.fragments)
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        match parse_line(line) {
            Some(StreamEvent::Done) => {
                debug!(fragments = self.fragments.len(), "stream done sentinel");
                self.done = true;
            }
            Some(StreamEvent::Chunk(chunk)) => {
                if let Some(message) = chunk.error.and_then(upstream_error) {
                    return Err(GenQueueError::Upstream(message));
                }
                self.fragments
                    .extend(chunk.data.into_iter().filter_map(ImageDatum::into_fragment));
            }
            None => {}
        }
        Ok(())
    }
}
