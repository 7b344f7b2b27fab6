//! Minimal framer for newline-delimited JSON responses (Ollama's
//! `/api/chat` wire format).

use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;

use super::ProviderError;

/// Pull-based reader that splits a byte stream on `\n`, buffering partial
/// lines across chunk boundaries.
pub struct NdjsonReader<S> {
    inner: S,
    buffer: Vec<u8>,
}

impl<S> NdjsonReader<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Returns the next non-empty line, or `None` once the stream and
    /// buffer are both exhausted.
    pub async fn next_line(&mut self) -> Option<Result<String, ProviderError>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let trimmed = String::from_utf8_lossy(&line[..line.len() - 1])
                    .trim()
                    .to_string();
                if trimmed.is_empty() {
                    continue;
                }
                return Some(Ok(trimmed));
            }
            match self.inner.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Some(Err(ProviderError::Transport(e))),
                None => {
                    if self.buffer.is_empty() {
                        return None;
                    }
                    let tail = std::mem::take(&mut self.buffer);
                    let trimmed = String::from_utf8_lossy(&tail).trim().to_string();
                    if trimmed.is_empty() {
                        return None;
                    }
                    return Some(Ok(trimmed));
                }
            }
        }
    }
}
