//! Multi-turn tool-calling orchestration.
//!
//! [`ToolLoop`] drives one complete user turn: it assembles the message
//! list, runs per-round generation with the decoder's cache cleared and the
//! full history re-encoded each round, routes decoded characters into the
//! tool-call detector and the caller's sinks, executes detected calls
//! through the caller-supplied [`ToolExecutor`], and stops on a plain-text
//! reply, a parse failure, cancellation, or the round budget.
//!
//! Ordering guarantees: within a round, visible text reaches the sink in
//! decode order; bytes inside a detected tool call are withheld entirely.
//! The tool result for round `r` is appended to the history before round
//! `r + 1` is prefilled.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::chat::ChatMessage;
use crate::detector::{DetectedToolCall, ToolCallDetector};
use crate::engine::{FinishReason, StreamControl, TextEngine};
use crate::error::{LlmError, LlmResult};
use crate::stop::{StopMatcher, StopScan};
use crate::utf8::Utf8Stream;

/// Result of executing one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Name of the executed tool.
    pub tool_name: String,
    /// Result payload handed back to the model.
    pub payload: String,
    /// Marks a failed execution; the payload then describes the failure.
    pub is_error: bool,
}

/// Caller-supplied tool dispatcher. May suspend.
///
/// A returned error does not terminate the conversation: it is recorded as
/// an error tool message and the loop continues.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one detected call and produce the result payload.
    async fn execute(&self, call: &DetectedToolCall) -> LlmResult<ToolOutcome>;
}

/// Streaming event sinks supplied by the caller, invoked on the
/// orchestrator task.
pub trait GenerationSink {
    /// Visible text, in decode order.
    fn on_token(&mut self, text: &str);
    /// A complete tool call was recognized, before execution.
    fn on_tool_call(&mut self, call: &DetectedToolCall);
    /// Terminal error; the conversation is over.
    fn on_error(&mut self, message: &str);
    /// Terminal text turn; carries the accumulated visible text.
    fn on_done(&mut self, final_text: &str);
}

/// Round and token budgets for one user turn.
#[derive(Debug, Clone, Copy)]
pub struct ToolLoopConfig {
    /// Maximum generation rounds per user turn.
    pub max_rounds: u32,
    /// Token budget per round.
    pub max_tokens_per_turn: u32,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_tokens_per_turn: 512,
        }
    }
}

/// How a generation round concluded, as seen by the router.
enum TurnEvent {
    /// Generation ran to its natural end.
    None,
    /// The detector produced a usable call.
    Call(DetectedToolCall),
    /// The detector completed an object that is not a usable call.
    ParseFailure,
    /// A stop string ended the turn.
    StopHit,
}

/// Multi-turn orchestrator over an engine and a tool executor.
pub struct ToolLoop<E, X> {
    engine: E,
    executor: X,
    config: ToolLoopConfig,
}

impl<E: TextEngine, X: ToolExecutor> ToolLoop<E, X> {
    /// Create a loop over the given engine and executor.
    pub fn new(engine: E, executor: X, config: ToolLoopConfig) -> Self {
        Self {
            engine,
            executor,
            config,
        }
    }

    /// Shared access to the engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Exclusive access to the engine (catalog changes between user turns).
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Run one complete user turn.
    ///
    /// Terminal outcomes are delivered through `sink`; errors are also
    /// returned for programmatic use. Cancellation terminates with
    /// `on_done` carrying the text accumulated so far, not `on_error`.
    pub async fn run(&mut self, user_msg: &str, sink: &mut dyn GenerationSink) -> LlmResult<()> {
        match self.run_inner(user_msg, sink).await {
            Ok(()) => Ok(()),
            Err(e) => {
                sink.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    async fn run_inner(
        &mut self,
        user_msg: &str,
        sink: &mut dyn GenerationSink,
    ) -> LlmResult<()> {
        let mut messages = vec![
            ChatMessage::system(self.engine.system_message()),
            ChatMessage::user(user_msg),
        ];

        for round in 0..self.config.max_rounds {
            debug!(round, history = messages.len(), "starting generation round");
            self.engine.begin_turn()?;
            let prompt = self.engine.render_prompt(&messages, true)?;

            let mut detector = ToolCallDetector::new();
            let mut utf8 = Utf8Stream::new();
            let mut stops = StopMatcher::new(self.engine.stop_strings());
            let mut text = String::new();
            let mut event = TurnEvent::None;

            let max_tokens = self.config.max_tokens_per_turn;
            let finish = {
                let mut on_bytes = |bytes: &[u8]| -> StreamControl {
                    let chunk = utf8.push(bytes);
                    if chunk.is_empty() {
                        return StreamControl::Continue;
                    }
                    route_chunk(&chunk, &mut detector, &mut stops, &mut text, sink, &mut event)
                };
                self.engine.complete(&prompt, max_tokens, &mut on_bytes)?
            };

            // End-of-stream housekeeping: a dangling UTF-8 suffix becomes a
            // replacement character and flows through the same routing.
            if matches!(event, TurnEvent::None) {
                let remainder = utf8.flush();
                if !remainder.is_empty() {
                    route_chunk(&remainder, &mut detector, &mut stops, &mut text, sink, &mut event);
                }
            }

            if finish == FinishReason::Stopped {
                let tail = stops.flush();
                if !tail.is_empty() && !detector.is_collecting() {
                    sink.on_token(&tail);
                    text.push_str(&tail);
                }
                info!("generation cancelled");
                sink.on_done(&text);
                return Ok(());
            }

            match event {
                TurnEvent::Call(call) => {
                    info!(tool = %call.name, round, "tool call detected");
                    sink.on_tool_call(&call);

                    let content = match self.executor.execute(&call).await {
                        Ok(outcome) if outcome.is_error => {
                            warn!(tool = %outcome.tool_name, "tool reported an error");
                            format!("Error: {}", outcome.payload)
                        }
                        Ok(outcome) => outcome.payload,
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "tool execution failed");
                            format!("Error: {e}")
                        }
                    };

                    messages.push(ChatMessage::assistant(call.payload.clone()));
                    messages.push(ChatMessage::tool(content));
                }
                TurnEvent::ParseFailure => {
                    warn!("detector completed an object that is not a tool call");
                    return Err(LlmError::ToolCallParse);
                }
                TurnEvent::StopHit | TurnEvent::None => {
                    let tail = stops.flush();
                    if !tail.is_empty() && !detector.is_collecting() {
                        sink.on_token(&tail);
                        text.push_str(&tail);
                    }
                    info!(rounds = round + 1, "conversation finished with text turn");
                    sink.on_done(&text);
                    return Ok(());
                }
            }
        }

        Err(LlmError::MaxRoundsExceeded(self.config.max_rounds))
    }
}

/// Route one decoded chunk into the detector and, when not collecting, the
/// stop matcher and the caller's sink.
///
/// While the detector is collecting, nothing reaches the sink: tool-call
/// JSON is never user-visible text.
fn route_chunk(
    chunk: &str,
    detector: &mut ToolCallDetector,
    stops: &mut StopMatcher,
    text: &mut String,
    sink: &mut dyn GenerationSink,
    event: &mut TurnEvent,
) -> StreamControl {
    if detector.accumulate(chunk) {
        *event = match detector.extract() {
            Some(call) => TurnEvent::Call(call),
            None => TurnEvent::ParseFailure,
        };
        return StreamControl::Stop;
    }

    if detector.is_collecting() {
        return StreamControl::Continue;
    }

    match stops.scan(chunk) {
        StopScan::Text(t) => {
            if !t.is_empty() {
                sink.on_token(&t);
                text.push_str(&t);
            }
            StreamControl::Continue
        }
        StopScan::Hit(t) => {
            if !t.is_empty() {
                sink.on_token(&t);
                text.push_str(&t);
            }
            *event = TurnEvent::StopHit;
            StreamControl::Stop
        }
    }
}
