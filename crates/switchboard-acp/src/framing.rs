//! Newline-delimited JSON frame decoding.

use serde_json::Value;
use tracing::warn;

/// Accumulates raw stdout bytes and yields one JSON value per complete line.
///
/// The trailing fragment after the last newline is kept for the next chunk.
/// Blank lines are skipped; lines that fail to parse are logged and dropped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every value completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(value) = parse_line(&line) {
                values.push(value);
            }
        }
        values
    }

    /// Parse whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(line = %trimmed, error = %e, "Dropping malformed frame");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_line_is_buffered() {
        let mut decoder = LineDecoder::new();
        let first = decoder.feed(b"{\"a\":1}\n{\"b\":");
        assert_eq!(first, vec![json!({"a": 1})]);
        assert_eq!(decoder.buffered_len(), 5);

        let second = decoder.feed(b"2}\n");
        assert_eq!(second, vec![json!({"b": 2})]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_blank_and_malformed_lines_are_dropped() {
        let mut decoder = LineDecoder::new();
        let values = decoder.feed(b"\n   \nnot json\n{\"ok\":true}\r\n");
        assert_eq!(values, vec![json!({"ok": true})]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        let values = decoder.feed(b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n");
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = LineDecoder::new();
        let mut values = Vec::new();
        for byte in b"{\"text\":\"h\xc3\xa9llo\"}\n" {
            values.extend(decoder.feed(&[*byte]));
        }
        assert_eq!(values, vec![json!({"text": "héllo"})]);
    }

    #[test]
    fn test_finish_flushes_trailing_fragment() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"{\"tail\":true}").is_empty());
        assert_eq!(decoder.finish(), Some(json!({"tail": true})));
        assert_eq!(decoder.finish(), None);
    }
}
