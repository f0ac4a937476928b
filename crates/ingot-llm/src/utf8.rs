//! UTF-8 re-framing of tokenizer output.
//!
//! Individual token pieces are raw bytes and may end mid code point. The
//! stream re-framer emits only complete code points, carries incomplete
//! suffixes into the next piece, and flushes a single U+FFFD replacement at
//! end of stream if bytes remain.

/// Incremental UTF-8 decoder for byte fragments.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// New re-framer with no pending bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning the complete code points now available.
    ///
    /// Invalid start or continuation bytes are skipped one byte at a time; a
    /// trailing incomplete sequence stays buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        if bytes.is_empty() && self.pending.is_empty() {
            return String::new();
        }

        let input: Vec<u8> = if self.pending.is_empty() {
            bytes.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            joined
        };

        let mut complete = String::with_capacity(input.len());
        let mut i = 0usize;
        while i < input.len() {
            let len = match utf8_len(input[i]) {
                Some(len) => len,
                None => {
                    // Invalid start byte.
                    i += 1;
                    continue;
                }
            };
            if i + len > input.len() {
                self.pending = input[i..].to_vec();
                break;
            }
            match std::str::from_utf8(&input[i..i + len]) {
                Ok(s) => {
                    complete.push_str(s);
                    i += len;
                }
                Err(_) => i += 1,
            }
        }
        complete
    }

    /// Flush at end of stream: a single U+FFFD if an incomplete sequence is
    /// still buffered, the empty string otherwise.
    pub fn flush(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            "\u{FFFD}".to_string()
        }
    }

    /// Whether bytes are waiting for the rest of their code point.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn utf8_len(first: u8) -> Option<usize> {
    match first {
        b if b & 0x80 == 0x00 => Some(1),
        b if b & 0xE0 == 0xC0 => Some(2),
        b if b & 0xF0 == 0xE0 => Some(3),
        b if b & 0xF8 == 0xF0 => Some(4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_straight_through() {
        let mut s = Utf8Stream::new();
        assert_eq!(s.push(b"hello"), "hello");
        assert!(!s.has_pending());
        assert_eq!(s.flush(), "");
    }

    #[test]
    fn reassembles_code_point_split_across_pushes() {
        // U+00E9 (é) is 0xC3 0xA9.
        let mut s = Utf8Stream::new();
        assert_eq!(s.push(&[0xC3]), "");
        assert!(s.has_pending());
        assert_eq!(s.push(&[0xA9, b'!']), "é!");
        assert!(!s.has_pending());
    }

    #[test]
    fn reassembles_four_byte_emoji_byte_by_byte() {
        let emoji = "🦀".as_bytes();
        let mut s = Utf8Stream::new();
        let mut out = String::new();
        for b in emoji {
            out.push_str(&s.push(&[*b]));
        }
        assert_eq!(out, "🦀");
        assert_eq!(s.flush(), "");
    }

    #[test]
    fn flush_replaces_dangling_suffix_with_replacement_char() {
        let mut s = Utf8Stream::new();
        assert_eq!(s.push(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(s.flush(), "\u{FFFD}");
        assert!(!s.has_pending());
        // flush is idempotent once drained
        assert_eq!(s.flush(), "");
    }

    #[test]
    fn invalid_start_bytes_are_skipped() {
        let mut s = Utf8Stream::new();
        // 0xFF can never start a sequence; stray continuation 0x80 likewise.
        assert_eq!(s.push(&[b'x', 0xFF, 0x80, b'y']), "xy");
    }

    #[test]
    fn invalid_continuation_resyncs_on_next_byte() {
        let mut s = Utf8Stream::new();
        // 0xC3 expects a continuation; 'a' is not one, so the 0xC3 is
        // dropped and 'a' survives.
        assert_eq!(s.push(&[0xC3, b'a']), "a");
    }

    #[test]
    fn concatenated_output_matches_input_modulo_incomplete_suffix() {
        let text = "naïve 🚀 done";
        let bytes = text.as_bytes();
        for split in 0..bytes.len() {
            let mut s = Utf8Stream::new();
            let mut out = String::new();
            out.push_str(&s.push(&bytes[..split]));
            out.push_str(&s.push(&bytes[split..]));
            out.push_str(&s.flush());
            assert_eq!(out, text, "split at byte {}", split);
        }
    }
}
