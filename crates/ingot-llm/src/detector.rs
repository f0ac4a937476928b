//! Streaming tool-call detection.
//!
//! The detector watches the decoded character stream for a brace-balanced
//! top-level JSON object. It is deliberately not a JSON parser: two scanner
//! states (string-skip with escapes, brace depth) and O(1) lookahead are
//! enough, and they keep the streaming latency contract intact.
//!
//! While `collecting` is set the orchestrator withholds the stream from the
//! caller's token sink; tool-call JSON is never user-visible text.

/// A complete tool call recognized in the stream.
///
/// `payload` is always the canonical envelope
/// `{"tool_calls":[{"name":…,"arguments":…}]}`; bare calls are wrapped
/// before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedToolCall {
    /// Name of the first tool in the payload, or `"tool"` when absent.
    pub name: String,
    /// Canonicalized envelope JSON, byte-for-byte as emitted by the model
    /// apart from the wrapping of bare calls.
    pub payload: String,
}

/// Stateful accumulator for tool-call JSON in a character stream.
///
/// Invariants: `collecting` implies `depth >= 1`; when not collecting the
/// buffer is empty and the depth is zero.
#[derive(Debug, Default)]
pub struct ToolCallDetector {
    buf: String,
    depth: i32,
    collecting: bool,
    in_string: bool,
    escaped: bool,
}

impl ToolCallDetector {
    /// New idle detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a candidate object is currently being buffered.
    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Buffered bytes since the opening brace.
    pub fn buffer(&self) -> &str {
        &self.buf
    }

    /// Consume a decoded chunk. Returns true once a complete top-level
    /// object has been buffered.
    ///
    /// Braces inside string literals never touch the depth counter; the
    /// string-skip state survives chunk boundaries, so fragments split
    /// mid-string or mid-escape are handled.
    pub fn accumulate(&mut self, chunk: &str) -> bool {
        for c in chunk.chars() {
            if !self.collecting {
                if c == '{' {
                    self.collecting = true;
                    self.depth = 1;
                    self.in_string = false;
                    self.escaped = false;
                    self.buf.clear();
                    self.buf.push(c);
                }
                continue;
            }

            self.buf.push(c);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Interpret the buffered object as a tool call.
    ///
    /// An object qualifies iff it contains the `"tool_calls"` key, or both
    /// `"name"` and `"arguments"`. The latter is wrapped into the envelope
    /// so downstream consumers see a single shape.
    pub fn extract(&self) -> Option<DetectedToolCall> {
        let has_envelope = self.buf.contains("\"tool_calls\"");
        let is_bare = self.buf.contains("\"name\"") && self.buf.contains("\"arguments\"");
        if !has_envelope && !is_bare {
            return None;
        }

        let name = extract_name(&self.buf).unwrap_or_else(|| "tool".to_string());
        let payload = if has_envelope {
            self.buf.clone()
        } else {
            format!("{{\"tool_calls\":[{}]}}", self.buf)
        };
        Some(DetectedToolCall { name, payload })
    }

    /// Return to the idle state, clearing the buffer.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.depth = 0;
        self.collecting = false;
        self.in_string = false;
        self.escaped = false;
    }
}

/// Quoted value of the first `"name"` key in `buf`.
fn extract_name(buf: &str) -> Option<String> {
    let key = buf.find("\"name\"")?;
    let colon = buf[key + 6..].find(':')? + key + 6;
    let q1 = buf[colon + 1..].find('"')? + colon + 1;
    let q2 = buf[q1 + 1..].find('"')? + q1 + 1;
    Some(buf[q1 + 1..q2].to_string())
}
