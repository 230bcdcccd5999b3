//! Newline framing over a byte stream
//!
//! [`FrameDecoder`] accumulates arbitrary read chunks and yields every
//! complete line. A trailing fragment stays buffered until the chunk that
//! finishes it arrives.

use bytes::BytesMut;
use tracing::warn;

/// Byte that terminates every frame on the wire
pub const FRAME_DELIMITER: u8 = b'\n';

/// Incremental splitter for newline-delimited frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to contain no delimiter
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain all frames it completes, in arrival order.
    ///
    /// Blank lines are skipped, a trailing `\r` is stripped, and frames that
    /// are not valid UTF-8 are logged and dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == FRAME_DELIMITER)
        {
            let end = self.scanned + offset;
            let line = self.buffer.split_to(end + 1);
            self.scanned = 0;

            let line = &line[..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match std::str::from_utf8(line) {
                Ok(text) => frames.push(text.to_owned()),
                Err(e) => warn!("Dropping frame that is not valid UTF-8: {}", e),
            }
        }
        self.scanned = self.buffer.len();

        frames
    }

    /// Number of buffered bytes belonging to an incomplete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a message as a single wire frame
pub fn encode_frame(message: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.len() + 1);
    frame.extend_from_slice(message.as_bytes());
    frame.push(FRAME_DELIMITER);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_trailing_fragment_is_retained() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"first\nsec");
        assert_eq!(frames, vec!["first"]);
        assert_eq!(decoder.pending(), 3);

        let frames = decoder.push(b"ond\n");
        assert_eq!(frames, vec!["second"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_frame_split_at_every_position() {
        let message = r#"{"type":"invoke","correlationId":42,"tool":"Sample:ping","parameters":{"text":"héllo"}}"#;
        let wire = encode_frame(message);

        for split in 0..=wire.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push(&wire[..split]);
            frames.extend(decoder.push(&wire[split..]));
            assert_eq!(frames, vec![message.to_string()], "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in b"one\ntwo\nthree\n" {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"alpha\r\n\n   \nbeta\n");
        assert_eq!(frames, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_invalid_utf8_dropped() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"\xff\xfe\nok\n");
        assert_eq!(frames, vec!["ok"]);
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(encode_frame("abc"), b"abc\n".to_vec());
    }
}
