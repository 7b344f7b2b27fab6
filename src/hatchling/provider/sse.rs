//! Minimal framer for `text/event-stream` responses.
//!
//! OpenAI's streaming Chat Completions endpoint is the only SSE consumer in
//! this crate, so this framer only extracts `data: ` lines — it does not
//! attempt `event:`/`id:`/retry handling. Events are delimited by a blank
//! line per the SSE spec.

use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;

use super::ProviderError;

/// Sentinel OpenAI sends in place of a final JSON chunk.
pub const DONE: &str = "[DONE]";

/// Pull-based reader that turns a byte stream into a sequence of `data: `
/// payloads, buffering partial lines across chunk boundaries.
pub struct SseReader<S> {
    inner: S,
    buffer: Vec<u8>,
}

impl<S> SseReader<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Returns the next event's `data` payload, or `None` once the
    /// underlying stream and buffer are both exhausted.
    pub async fn next_data(&mut self) -> Option<Result<String, ProviderError>> {
        loop {
            if let Some(event) = Self::take_event(&mut self.buffer) {
                if let Some(data) = Self::extract_data(&event) {
                    return Some(Ok(data));
                }
                continue;
            }
            match self.inner.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Some(Err(ProviderError::Transport(e))),
                None => {
                    if self.buffer.is_empty() {
                        return None;
                    }
                    let tail = std::mem::take(&mut self.buffer);
                    return Self::extract_data(&tail).map(Ok);
                }
            }
        }
    }

    /// Drains one complete `\n\n`-delimited event off the front of `buffer`,
    /// if one is fully present.
    fn take_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
        let event: Vec<u8> = buffer.drain(..pos + 2).collect();
        Some(event)
    }

    fn extract_data(event: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(event);
        let mut data = String::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }
        if data.is_empty() {
            None
        } else {
            Some(data)
        }
    }
}
