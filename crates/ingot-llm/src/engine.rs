//! The decoder seam.
//!
//! The orchestrator drives a [`TextEngine`]: one implementation wraps
//! llama.cpp ([`llama::LlamaEngine`]), one is a scripted double for tests
//! ([`mock::MockEngine`]). The engine is synchronous from the orchestrator's
//! point of view; decoded token pieces are pushed as raw bytes into the
//! `emit` callback in production order.

pub mod llama;
pub mod mock;

use crate::chat::ChatMessage;
use crate::error::LlmResult;

/// Flow decision returned by the orchestrator's byte callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    /// Keep generating.
    Continue,
    /// End the turn at this token boundary.
    Stop,
}

/// Why a turn's generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model emitted end-of-turn, or the callback asked to stop.
    EndOfTurn,
    /// The per-turn token budget was exhausted.
    Budget,
    /// The cancellation flag was observed.
    Stopped,
}

/// A synchronous decoder session capable of one generation turn at a time.
pub trait TextEngine {
    /// Prepare for a fresh turn: clear decoder caches, rebuild the sampler
    /// chain from the cached parameters (with a fresh grammar clone when a
    /// constraint is active), and reset the canonical grammar state.
    fn begin_turn(&mut self) -> LlmResult<()>;

    /// Render the conversation through the active chat template.
    fn render_prompt(&self, messages: &[ChatMessage], add_generation_prompt: bool)
        -> LlmResult<String>;

    /// The system message content for a new conversation, including the tool
    /// preamble when tool calling is enabled.
    fn system_message(&self) -> String;

    /// Stop strings derived from the active chat template plus the safety
    /// net.
    fn stop_strings(&self) -> Vec<String>;

    /// Run one generation turn: prefill `prompt`, then stream up to
    /// `max_tokens` new tokens as raw byte pieces into `emit`.
    fn complete(
        &mut self,
        prompt: &str,
        max_tokens: u32,
        emit: &mut dyn FnMut(&[u8]) -> StreamControl,
    ) -> LlmResult<FinishReason>;
}
