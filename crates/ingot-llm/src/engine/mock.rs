//! Scripted engine for testing orchestration without a model.
//!
//! Each pushed turn is a sequence of byte chunks delivered to the `emit`
//! callback exactly as a real decoder would hand over token pieces,
//! including fragments that split UTF-8 sequences or JSON mid-token. Call
//! history (rendered prompts, turns begun) is recorded for verification.

use std::collections::VecDeque;

use crate::chat::ChatMessage;
use crate::engine::{FinishReason, StreamControl, TextEngine};
use crate::error::LlmResult;
use crate::stop::{stop_strings_for_template, FALLBACK_STOPS};
use crate::template::plain_render;

/// One scripted generation turn.
#[derive(Debug, Clone)]
pub struct MockTurn {
    /// Byte chunks streamed to the callback, in order.
    pub chunks: Vec<Vec<u8>>,
    /// When set, the turn reports cancellation after this many chunks.
    pub cancel_after: Option<usize>,
}

/// Deterministic [`TextEngine`] driven by scripted turns.
#[derive(Debug, Default)]
pub struct MockEngine {
    turns: VecDeque<MockTurn>,
    rendered_prompts: Vec<String>,
    turns_begun: usize,
    system_prompt: String,
    stops: Vec<String>,
}

impl MockEngine {
    /// New engine with the fallback stop strings and no scripted turns.
    pub fn new() -> Self {
        Self {
            stops: FALLBACK_STOPS.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Use the stop strings a real engine would derive from `template`.
    pub fn with_template_stops(mut self, template: &str) -> Self {
        self.stops = stop_strings_for_template(Some(template));
        self
    }

    /// Set the system message returned to the orchestrator.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Script a turn that streams `text` as one chunk.
    pub fn push_text_turn(&mut self, text: &str) {
        self.turns.push_back(MockTurn {
            chunks: vec![text.as_bytes().to_vec()],
            cancel_after: None,
        });
    }

    /// Script a turn from explicit byte chunks.
    pub fn push_chunked_turn(&mut self, chunks: Vec<Vec<u8>>) {
        self.turns.push_back(MockTurn {
            chunks,
            cancel_after: None,
        });
    }

    /// Script a turn that is cancelled after `after` chunks.
    pub fn push_cancelled_turn(&mut self, chunks: Vec<Vec<u8>>, after: usize) {
        self.turns.push_back(MockTurn {
            chunks,
            cancel_after: Some(after),
        });
    }

    /// Prompts rendered so far, one per turn.
    pub fn rendered_prompts(&self) -> &[String] {
        &self.rendered_prompts
    }

    /// How many turns the orchestrator has begun.
    pub fn turns_begun(&self) -> usize {
        self.turns_begun
    }
}

impl TextEngine for MockEngine {
    fn begin_turn(&mut self) -> LlmResult<()> {
        self.turns_begun += 1;
        Ok(())
    }

    fn render_prompt(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> LlmResult<String> {
        Ok(plain_render(messages, add_generation_prompt))
    }

    fn system_message(&self) -> String {
        self.system_prompt.clone()
    }

    fn stop_strings(&self) -> Vec<String> {
        self.stops.clone()
    }

    fn complete(
        &mut self,
        prompt: &str,
        _max_tokens: u32,
        emit: &mut dyn FnMut(&[u8]) -> StreamControl,
    ) -> LlmResult<FinishReason> {
        self.rendered_prompts.push(prompt.to_string());

        let Some(turn) = self.turns.pop_front() else {
            return Ok(FinishReason::EndOfTurn);
        };

        for (i, chunk) in turn.chunks.iter().enumerate() {
            if turn.cancel_after == Some(i) {
                return Ok(FinishReason::Stopped);
            }
            if emit(chunk) == StreamControl::Stop {
                return Ok(FinishReason::EndOfTurn);
            }
        }
        if turn.cancel_after == Some(turn.chunks.len()) {
            return Ok(FinishReason::Stopped);
        }
        Ok(FinishReason::EndOfTurn)
    }
}
