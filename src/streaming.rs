//! Generic Server-Sent-Events line parsing, shared by every provider adapter's
//! streaming decoder (spec §4.3/§9: "treat the provider SSE parser as a decoder that
//! yields `CompletionChunk` values"). Vendor-specific chunk shapes are translated by
//! each adapter in `backends::*`; this module only handles the transport framing: event
//! boundaries, blank-line skipping, and the `data: [DONE]` sentinel.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

/// One `data: ...` line's payload, or `None` for the terminal `[DONE]` sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

/// Buffer-driven SSE event splitter. Vendors send one JSON object per `data:` line; this
/// parser only needs to find line boundaries, not full event blocks (unlike a generic SSE
/// client, these vendors never use multi-line `data:` blocks for a single event).
#[derive(Default)]
pub struct SseLineSplitter {
    buffer: String,
}

impl SseLineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning any complete `data: ...` lines found so far. Malformed
    /// (non-UTF8) input is logged and skipped rather than treated as fatal (spec §4.3).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        let text = match std::str::from_utf8(chunk) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "skipping non-UTF8 SSE chunk");
                return Vec::new();
            }
        };
        self.buffer.push_str(text);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if let Some(parsed) = Self::parse_line(&line) {
                lines.push(parsed);
            }
        }
        lines
    }

    fn parse_line(line: &str) -> Option<SseLine> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let payload = line.strip_prefix("data:")?.trim();
        if payload == "[DONE]" {
            Some(SseLine::Done)
        } else if payload.is_empty() {
            None
        } else {
            Some(SseLine::Data(payload.to_string()))
        }
    }
}

/// Adapt a raw reqwest byte stream into a stream of `SseLine`s, stopping at `[DONE]`.
/// Network errors are forwarded as `Err`; malformed lines are already filtered out by
/// the splitter and never surfaced as errors (spec §4.3: "malformed lines are logged and
/// skipped, not fatal").
pub fn sse_lines(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = anyhow::Result<SseLine>> + Send {
    let mut splitter = SseLineSplitter::new();
    let mut done = false;

    byte_stream
        .map(move |chunk| match chunk {
            Ok(bytes) => Ok(splitter.push(&bytes)),
            Err(e) => Err(anyhow::anyhow!(e)),
        })
        .flat_map(|result| {
            futures_util::stream::iter(match result {
                Ok(lines) => lines.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            })
        })
        .take_while(move |line| {
            let keep = !done;
            if matches!(line, Ok(SseLine::Done)) {
                done = true;
            }
            std::future::ready(keep)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_single_event_per_push() {
        let mut splitter = SseLineSplitter::new();
        let lines = splitter.push(b"data: {\"a\":1}\n");
        assert_eq!(lines, vec![SseLine::Data("{\"a\":1}".into())]);
    }

    #[test]
    fn recognizes_done_sentinel() {
        let mut splitter = SseLineSplitter::new();
        let lines = splitter.push(b"data: [DONE]\n");
        assert_eq!(lines, vec![SseLine::Done]);
    }

    #[test]
    fn skips_blank_lines() {
        let mut splitter = SseLineSplitter::new();
        let lines = splitter.push(b"\n\ndata: x\n\n");
        assert_eq!(lines, vec![SseLine::Data("x".into())]);
    }

    #[test]
    fn buffers_incomplete_lines_across_pushes() {
        let mut splitter = SseLineSplitter::new();
        assert!(splitter.push(b"data: partial").is_empty());
        let lines = splitter.push(b"-line\n");
        assert_eq!(lines, vec![SseLine::Data("partial-line".into())]);
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut splitter = SseLineSplitter::new();
        let lines = splitter.push(b"event: message\ndata: x\n");
        assert_eq!(lines, vec![SseLine::Data("x".into())]);
    }
}
