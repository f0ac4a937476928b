//! Error taxonomy for generation and the tool loop.

use thiserror::Error;

/// Errors surfaced by the engine and the multi-turn orchestrator.
///
/// Grammar-build problems are deliberately absent: they are demoted to
/// warnings and generation proceeds unconstrained.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The engine has no loaded model or context.
    #[error("model not initialized")]
    ModelNotLoaded,

    /// The prompt could not be tokenized.
    #[error("tokenization failed")]
    Tokenization,

    /// The prompt (or the generation position) exceeds the context window.
    #[error("context overflow - shorten your prompt")]
    ContextOverflow,

    /// A decode step failed inside the backend.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Chat-template resolution or rendering failed.
    #[error("chat template error: {0}")]
    Template(String),

    /// The tool catalog was rejected at enable time.
    #[error("invalid tool catalog: {0}")]
    Catalog(String),

    /// The detector buffered a complete object that is not a usable call.
    #[error("tool call parse failure")]
    ToolCallParse,

    /// The conversation used up its round budget without a text turn.
    #[error("max rounds exceeded: {0}")]
    MaxRoundsExceeded(u32),

    /// Anything else reported by the decoder backend.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience result alias used throughout the crate.
pub type LlmResult<T> = Result<T, LlmError>;
