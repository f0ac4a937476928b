//! Stop-string detection.
//!
//! Stop strings come from two sources: markers recognized in the active chat
//! template, and a fixed safety net that catches models generating past
//! their turn in plain `User:`/`Assistant:` transcripts. The streaming
//! matcher releases text as early as possible, holding back only a suffix
//! that could still grow into a stop string, and strips the stop string
//! itself from the delivered text.

use tracing::info;

/// Safety-net stop strings applied regardless of template.
pub const FALLBACK_STOPS: [&str; 4] = ["\nUser:", "\nHuman:", "\n### User", "\n<|user|>"];

/// Derive stop strings from a chat template's turn markers, then append the
/// safety-net list.
pub fn stop_strings_for_template(template: Option<&str>) -> Vec<String> {
    let mut stops: Vec<String> = Vec::new();
    let mut matched = false;

    if let Some(t) = template {
        if t.contains("<start_of_turn>") {
            stops.push("<end_of_turn>".into());
            stops.push("<start_of_turn>".into());
            matched = true;
        } else if t.contains("<|im_start|>") {
            stops.push("<|im_end|>".into());
            stops.push("<|im_start|>".into());
            matched = true;
        } else if t.contains("<|start_header_id|>") {
            stops.push("<|eot_id|>".into());
            stops.push("<|start_header_id|>".into());
            matched = true;
        } else if t.contains("<|assistant|>") {
            stops.push("<|end|>".into());
            stops.push("<|user|>".into());
            matched = true;
        } else if t.contains("[INST]") {
            stops.push("</s>".into());
            stops.push("[INST]".into());
            matched = true;
        } else if t.contains("<|END_OF_TURN_TOKEN|>") {
            stops.push("<|END_OF_TURN_TOKEN|>".into());
            stops.push("<|START_OF_TURN_TOKEN|>".into());
            matched = true;
        }
    }

    stops.extend(FALLBACK_STOPS.iter().map(|s| s.to_string()));

    if matched {
        info!(count = stops.len(), "stop strings derived from chat template");
    } else {
        info!(count = stops.len(), "no template markers matched, using fallback stop strings");
    }
    stops
}

/// Result of feeding one chunk into the [`StopMatcher`].
#[derive(Debug, PartialEq, Eq)]
pub enum StopScan {
    /// Releasable text; no stop string seen yet.
    Text(String),
    /// A stop string was observed. Carries the text preceding it; the stop
    /// string itself is stripped. Generation should end as if the decoder
    /// had emitted end-of-turn.
    Hit(String),
}

/// Streaming stop-string scanner with cross-chunk holdback.
#[derive(Debug)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

impl StopMatcher {
    /// New matcher over the given stop strings.
    pub fn new(stops: Vec<String>) -> Self {
        Self {
            stops,
            pending: String::new(),
        }
    }

    /// Feed a chunk. Text that can no longer participate in a stop-string
    /// match is released; the rest is held back for the next call.
    pub fn scan(&mut self, chunk: &str) -> StopScan {
        self.pending.push_str(chunk);

        if let Some(idx) = self
            .stops
            .iter()
            .filter_map(|s| self.pending.find(s.as_str()))
            .min()
        {
            let text = self.pending[..idx].to_string();
            self.pending.clear();
            return StopScan::Hit(text);
        }

        let hold = self.holdback_len();
        let release = self.pending.len() - hold;
        let text = self.pending[..release].to_string();
        self.pending.drain(..release);
        StopScan::Text(text)
    }

    /// Release whatever is still held back (end of stream without a hit).
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Longest suffix of the pending buffer that is a proper prefix of some
    /// stop string. Stop strings are ASCII, so the split is always a char
    /// boundary.
    fn holdback_len(&self) -> usize {
        let p = self.pending.as_bytes();
        let mut best = 0usize;
        for stop in &self.stops {
            let s = stop.as_bytes();
            let max = s.len().saturating_sub(1).min(p.len());
            for n in (best + 1..=max).rev() {
                if p[p.len() - n..] == s[..n] {
                    best = n;
                    break;
                }
            }
        }
        best
    }
}
