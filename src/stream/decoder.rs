/// Incremental decoder turning transport chunks into JSON event objects.
///
/// Handles SSE bodies (`data: <json>` lines, ignorable `event:` lines, a
/// `[DONE]` sentinel) and newline-delimited JSON bodies. Chunk boundaries
/// may fall anywhere, including inside a UTF-8 sequence when bytes are fed.
use memchr::memchr_iter;
use serde_json::Value;

use crate::util::take_utf8_prefix;

/// Pending payload text beyond this size is dropped.
pub const DEFAULT_MAX_PENDING: usize = 4 * 1024 * 1024;

const DONE_SENTINEL: &str = "[DONE]";

/// Body framing used by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events.
    Sse,
    /// One JSON document per line.
    Ndjson,
}

pub struct ChunkDecoder {
    framing: Framing,
    buffer: String,
    read_offset: usize,
    utf8_tail: Vec<u8>,
    pending: String,
    max_pending: usize,
    done: bool,
}

impl ChunkDecoder {
    /// Decoder for SSE bodies.
    #[must_use]
    pub fn new() -> Self {
        Self::with_framing(Framing::Sse)
    }

    /// Decoder for newline-delimited JSON bodies.
    #[must_use]
    pub fn ndjson() -> Self {
        Self::with_framing(Framing::Ndjson)
    }

    #[must_use]
    pub fn with_framing(framing: Framing) -> Self {
        Self {
            framing,
            buffer: String::new(),
            read_offset: 0,
            utf8_tail: Vec::new(),
            pending: String::new(),
            max_pending: DEFAULT_MAX_PENDING,
            done: false,
        }
    }

    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    #[must_use]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// True once the `[DONE]` sentinel was seen.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a text chunk and return the objects it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<Value> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw bytes. An incomplete trailing UTF-8 sequence waits for the next call.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        self.feed_bytes_into(chunk, &mut out);
        out
    }

    pub fn feed_bytes_into(&mut self, chunk: &[u8], out: &mut Vec<Value>) {
        if self.utf8_tail.is_empty() {
            if let Ok(text) = std::str::from_utf8(chunk) {
                self.feed_into(text, out);
                return;
            }
        }
        self.utf8_tail.extend_from_slice(chunk);
        let text = take_utf8_prefix(&mut self.utf8_tail);
        self.feed_into(&text, out);
    }

    /// Feed a text chunk and append completed objects into `out`.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<Value>) {
        if self.done {
            return;
        }
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &buffer.as_bytes()[scan_start..]) {
            if self.done {
                break;
            }
            let line_end = scan_start + rel_pos;
            let line = &buffer[processed_up_to..line_end];
            self.process_line(line.strip_suffix('\r').unwrap_or(line), out);
            processed_up_to = line_end + 1;
        }
        self.buffer = buffer;

        self.read_offset = processed_up_to;
        if self.done || self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Interpret the unterminated trailing line and retry pending content.
    ///
    /// Whatever still does not parse is dropped.
    pub fn finish(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        self.finish_into(&mut out);
        out
    }

    pub fn finish_into(&mut self, out: &mut Vec<Value>) {
        if !self.utf8_tail.is_empty() {
            let tail = String::from_utf8_lossy(&self.utf8_tail).into_owned();
            self.utf8_tail.clear();
            self.feed_into(&tail, out);
        }
        let buffer = std::mem::take(&mut self.buffer);
        if !self.done && self.read_offset < buffer.len() {
            let line = &buffer[self.read_offset..];
            self.process_line(line.strip_suffix('\r').unwrap_or(line), out);
        }
        self.read_offset = 0;
        if !self.pending.is_empty() {
            tracing::debug!(
                bytes = self.pending.len(),
                "dropping unparseable trailing stream content"
            );
            self.pending.clear();
        }
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<Value>) {
        let payload = match self.framing {
            Framing::Sse => {
                if line.is_empty() || line.starts_with(':') {
                    return;
                }
                if let Some(value) = line.strip_prefix("data:") {
                    value.strip_prefix(' ').unwrap_or(value)
                } else if line.starts_with("event:")
                    || line.starts_with("id:")
                    || line.starts_with("retry:")
                {
                    return;
                } else {
                    line
                }
            }
            Framing::Ndjson => line,
        };

        if payload.trim().is_empty() {
            return;
        }
        if payload.trim() == DONE_SENTINEL {
            self.done = true;
            return;
        }
        self.push_payload(payload, out);
    }

    fn push_payload(&mut self, payload: &str, out: &mut Vec<Value>) {
        if self.pending.is_empty() {
            if let Ok(value) = serde_json::from_str::<Value>(payload) {
                out.push(value);
                return;
            }
            self.pending.push_str(payload);
        } else {
            self.pending.push('\n');
            self.pending.push_str(payload);
            if let Ok(value) = serde_json::from_str::<Value>(&self.pending) {
                out.push(value);
                self.pending.clear();
                return;
            }
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(payload) {
                tracing::debug!(
                    bytes = self.pending.len() - payload.len() - 1,
                    "dropping unparseable stream payload"
                );
                self.pending.clear();
                out.push(value);
                return;
            }
        }

        if self.pending.len() > self.max_pending {
            tracing::warn!(
                bytes = self.pending.len(),
                limit = self.max_pending,
                "pending stream payload exceeded limit; dropping"
            );
            self.pending.clear();
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_data_line() {
        let mut decoder = ChunkDecoder::new();
        let objects = decoder.feed("data: {\"a\":1}\n\n");
        assert_eq!(objects, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_parse_event_lines_ignored() {
        let mut decoder = ChunkDecoder::new();
        let objects = decoder.feed(
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: ping\ndata: {\"type\":\"ping\"}\n\n",
        );
        assert_eq!(
            objects,
            vec![json!({"type": "message_start"}), json!({"type": "ping"})]
        );
    }

    #[test]
    fn test_parse_split_across_feeds() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed("data: {\"te").is_empty());
        assert!(decoder.feed("xt\":\"hel").is_empty());
        let objects = decoder.feed("lo\"}\n");
        assert_eq!(objects, vec![json!({"text": "hello"})]);
    }

    #[test]
    fn test_parse_done_stops_decoding() {
        let mut decoder = ChunkDecoder::new();
        let objects = decoder.feed("data: {\"a\":1}\n\ndata: [DONE]\n\ndata: {\"b\":2}\n\n");
        assert_eq!(objects, vec![json!({"a": 1})]);
        assert!(decoder.is_done());
        assert!(decoder.feed("data: {\"c\":3}\n").is_empty());
    }

    #[test]
    fn test_parse_crlf_lines() {
        let mut decoder = ChunkDecoder::new();
        let objects = decoder.feed("data: {\"a\":1}\r\n\r\n");
        assert_eq!(objects, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_unparseable_payload_is_retained() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed("data: {\"a\":\n").is_empty());
        let objects = decoder.feed("data: 1}\n");
        assert_eq!(objects, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_pending_limit_drops_payload() {
        let mut decoder = ChunkDecoder::new().with_max_pending(8);
        assert!(decoder.feed("data: {\"aaaaaaaaaa\n").is_empty());
        let objects = decoder.feed("data: {\"b\":2}\n");
        assert_eq!(objects, vec![json!({"b": 2})]);
    }

    #[test]
    fn test_finish_parses_unterminated_line() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed("data: {\"a\":1}").is_empty());
        assert_eq!(decoder.finish(), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_finish_drops_garbage() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed("data: {\"a\":\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_ndjson_lines() {
        let mut decoder = ChunkDecoder::ndjson();
        let objects = decoder.feed("{\"done\":false}\n{\"do");
        assert_eq!(objects, vec![json!({"done": false})]);
        let objects = decoder.feed("ne\":true}\n");
        assert_eq!(objects, vec![json!({"done": true})]);
    }

    #[test]
    fn test_bytes_split_inside_utf8() {
        let body = "data: {\"t\":\"€\"}\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xe2).unwrap() + 1;
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.feed_bytes(&body[..split]).is_empty());
        let objects = decoder.feed_bytes(&body[split..]);
        assert_eq!(objects, vec![json!({"t": "€"})]);
    }

    #[test]
    fn test_bare_json_error_body() {
        let mut decoder = ChunkDecoder::new();
        let objects = decoder.feed("{\"error\":{\"message\":\"overloaded\"}}\n");
        assert_eq!(objects, vec![json!({"error": {"message": "overloaded"}})]);
    }
}
