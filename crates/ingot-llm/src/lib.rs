//! # Ingot LLM
//!
//! Tool-calling orchestration for on-device GGUF inference over llama.cpp.
//!
//! The crate turns a raw token stream into a reliable multi-turn
//! function-calling protocol:
//!
//! - grammar-constrained decoding via a cached, clone-on-attach GBNF
//!   constraint ([`constraint`], [`sampler`])
//! - streaming tool-call detection on the decoded character stream
//!   ([`detector`])
//! - a cooperative multi-turn loop that alternates model turns and tool
//!   executions ([`orchestrator`])
//! - the supporting plumbing real decoders need: UTF-8 re-framing
//!   ([`utf8`]), stop-string detection ([`stop`]), chat-template selection
//!   ([`template`])
//!
//! The decoder seam is the [`engine::TextEngine`] trait; the production
//! implementation is [`engine::llama::LlamaEngine`], and
//! [`engine::mock::MockEngine`] drives the orchestrator in tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ingot_llm::engine::llama::{LlamaEngine, LlamaEngineConfig};
//! use ingot_llm::orchestrator::{ToolLoop, ToolLoopConfig};
//! # use ingot_llm::orchestrator::{GenerationSink, ToolExecutor, ToolOutcome};
//! # use ingot_llm::{DetectedToolCall, LlmResult};
//! # struct Host;
//! # #[async_trait::async_trait]
//! # impl ToolExecutor for Host {
//! #     async fn execute(&self, call: &DetectedToolCall) -> LlmResult<ToolOutcome> {
//! #         Ok(ToolOutcome { tool_name: call.name.clone(), payload: "{}".into(), is_error: false })
//! #     }
//! # }
//! # async fn demo(sink: &mut dyn GenerationSink) -> LlmResult<()> {
//! let mut engine = LlamaEngine::new(LlamaEngineConfig {
//!     model_path: "model.gguf".into(),
//!     ..Default::default()
//! })?;
//! engine.enable_tools(r#"[{"type":"function","function":{"name":"get_weather","parameters":{"type":"object","properties":{"location":{"type":"string"}},"required":["location"]}}}]"#)?;
//!
//! let mut agent = ToolLoop::new(engine, Host, ToolLoopConfig::default());
//! agent.run("weather in London?", sink).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chat;
pub mod constraint;
pub mod detector;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod sampler;
pub mod stop;
pub mod template;
pub mod utf8;

pub use chat::{ChatMessage, Role};
pub use constraint::{GrammarCache, GrammarMode};
pub use detector::{DetectedToolCall, ToolCallDetector};
pub use engine::{FinishReason, StreamControl, TextEngine};
pub use error::{LlmError, LlmResult};
pub use orchestrator::{GenerationSink, ToolExecutor, ToolLoop, ToolLoopConfig, ToolOutcome};
pub use sampler::SamplerParams;
