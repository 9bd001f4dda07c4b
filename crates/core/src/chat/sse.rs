//! Incremental decoder for the streaming chat response body.
//!
//! The body is a line-oriented, `data:`-tagged event stream delivered in
//! arbitrary chunks. The decoder carries at most one partial line across
//! chunk boundaries, so splitting the body anywhere (including mid-line or
//! mid-UTF-8-sequence) produces the same delta sequence as decoding it
//! whole. Undecodable lines are keep-alive noise and are dropped, never
//! surfaced.

use super::api::StreamChunk;

/// Terminator payload marking the end of the stream.
const DONE_PAYLOAD: &str = "[DONE]";

/// Streaming decoder state.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    /// Bytes after the last newline seen so far.
    pending: Vec<u8>,
    /// Set once the `[DONE]` terminator has been observed.
    done: bool,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the content deltas completed by it.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        if self.done {
            return deltas;
        }

        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..pos]);
            if let Some(delta) = self.decode_line(line.trim_end_matches('\r')) {
                deltas.push(delta);
            }
            if self.done {
                break;
            }
        }

        deltas
    }

    /// Gives any still-pending partial line one last parse attempt. Called
    /// once at end of stream.
    pub(crate) fn finish(&mut self) -> Vec<String> {
        if self.done || self.pending.is_empty() {
            self.pending.clear();
            return Vec::new();
        }

        let line = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&line);
        self.decode_line(line.trim_end_matches('\r'))
            .into_iter()
            .collect()
    }

    /// Returns whether the terminator has been observed.
    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Decodes one complete line into a content delta, if it carries one.
    fn decode_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        let payload = line.strip_prefix("data:")?.trim_start();

        if payload == DONE_PAYLOAD {
            self.done = true;
            return None;
        }

        // Malformed payloads are keep-alive noise, not errors.
        let chunk: StreamChunk = serde_json::from_str(payload).ok()?;
        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
    }
}
