//! End-to-end orchestration tests against the scripted mock engine: tool
//! round trips, bare-call wrapping, plain-text passthrough, round budgets,
//! executor failures, and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ingot_llm::engine::mock::MockEngine;
use ingot_llm::{
    DetectedToolCall, GenerationSink, LlmError, LlmResult, ToolExecutor, ToolLoop, ToolLoopConfig,
    ToolOutcome,
};

const WEATHER_CALL: &str =
    r#"{"tool_calls":[{"name":"get_weather","arguments":{"location":"London"}}]}"#;

/// Sink that records every event for assertions.
#[derive(Default)]
struct RecordingSink {
    tokens: Vec<String>,
    tool_calls: Vec<DetectedToolCall>,
    errors: Vec<String>,
    done: Option<String>,
}

impl GenerationSink for RecordingSink {
    fn on_token(&mut self, text: &str) {
        self.tokens.push(text.to_string());
    }

    fn on_tool_call(&mut self, call: &DetectedToolCall) {
        self.tool_calls.push(call.clone());
    }

    fn on_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    fn on_done(&mut self, final_text: &str) {
        self.done = Some(final_text.to_string());
    }
}

/// Executor returning a fixed payload, counting invocations.
struct FixedExecutor {
    payload: String,
    calls: Arc<AtomicUsize>,
}

impl FixedExecutor {
    fn new(payload: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                payload: payload.to_string(),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl ToolExecutor for FixedExecutor {
    async fn execute(&self, call: &DetectedToolCall) -> LlmResult<ToolOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutcome {
            tool_name: call.name.clone(),
            payload: self.payload.clone(),
            is_error: false,
        })
    }
}

/// Executor that always fails.
struct FailingExecutor;

#[async_trait]
impl ToolExecutor for FailingExecutor {
    async fn execute(&self, _call: &DetectedToolCall) -> LlmResult<ToolOutcome> {
        Err(LlmError::Backend("tool host unavailable".into()))
    }
}

fn engine_with_system() -> MockEngine {
    MockEngine::new().with_system_prompt("You are a function-calling assistant.")
}

#[tokio::test]
async fn single_tool_round_trip() {
    let mut engine = engine_with_system();
    engine.push_text_turn(WEATHER_CALL);
    engine.push_text_turn("It is 15 degrees in London.");

    let (executor, calls) = FixedExecutor::new(r#"{"temperature":15}"#);
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("weather in London?", &mut sink).await.unwrap();

    assert_eq!(sink.tool_calls.len(), 1);
    assert_eq!(sink.tool_calls[0].name, "get_weather");
    assert_eq!(sink.tool_calls[0].payload, WEATHER_CALL);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.done.as_deref(), Some("It is 15 degrees in London."));
    assert!(sink.errors.is_empty());

    // Two rounds ran: the tool round and the text round.
    assert_eq!(agent.engine().turns_begun(), 2);

    // The second prompt carries the assistant tool-call JSON and the tool
    // result appended in order.
    let prompts = agent.engine().rendered_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains(WEATHER_CALL));
    assert!(prompts[1].contains(r#"Tool: {"temperature":15}"#));
    let call_pos = prompts[1].find(WEATHER_CALL).unwrap();
    let result_pos = prompts[1].find(r#"{"temperature":15}"#).unwrap();
    assert!(call_pos < result_pos);
}

#[tokio::test]
async fn tool_call_json_is_never_forwarded_as_text() {
    let mut engine = engine_with_system();
    // The call arrives in fragments, split inside JSON string values.
    engine.push_chunked_turn(vec![
        b"{\"tool_calls\":[{\"na".to_vec(),
        b"me\":\"get_weather\",\"arguments\":{\"location\":\"Lon".to_vec(),
        b"don\"}}]}".to_vec(),
    ]);
    engine.push_text_turn("done");

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("weather?", &mut sink).await.unwrap();

    let streamed: String = sink.tokens.concat();
    assert!(!streamed.contains("tool_calls"));
    assert!(!streamed.contains('{'));
    assert_eq!(sink.done.as_deref(), Some("done"));
}

#[tokio::test]
async fn bare_call_is_wrapped_before_delivery() {
    let mut engine = engine_with_system();
    engine.push_text_turn(r#"{"name":"get_weather","arguments":{"location":"London"}}"#);
    engine.push_text_turn("ok");

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("weather?", &mut sink).await.unwrap();

    assert_eq!(sink.tool_calls[0].payload, WEATHER_CALL);
    // The wrapped payload is well-formed JSON with the canonical envelope.
    let value: serde_json::Value = serde_json::from_str(&sink.tool_calls[0].payload).unwrap();
    assert_eq!(value["tool_calls"][0]["name"], "get_weather");
}

#[tokio::test]
async fn embedded_braces_in_string_arguments_survive() {
    let payload = r#"{"tool_calls":[{"name":"echo","arguments":{"text":"{not a brace}"}}]}"#;
    let mut engine = engine_with_system();
    engine.push_text_turn(payload);
    engine.push_text_turn("echoed");

    let (executor, calls) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("echo", &mut sink).await.unwrap();

    assert_eq!(sink.tool_calls.len(), 1);
    assert_eq!(sink.tool_calls[0].name, "echo");
    assert_eq!(sink.tool_calls[0].payload, payload);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plain_text_passes_through_untouched() {
    let mut engine = engine_with_system();
    engine.push_text_turn("Hello, Sam.");

    let (executor, calls) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("greet me", &mut sink).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(sink.tool_calls.is_empty());
    assert_eq!(sink.tokens.concat(), "Hello, Sam.");
    assert_eq!(sink.done.as_deref(), Some("Hello, Sam."));
}

#[tokio::test]
async fn stop_string_ends_turn_and_is_stripped() {
    let mut engine = engine_with_system().with_template_stops("<|im_start|>user<|im_end|>");
    engine.push_chunked_turn(vec![
        b"All done.".to_vec(),
        b"<|im_".to_vec(),
        b"end|>leaked".to_vec(),
    ]);

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("finish up", &mut sink).await.unwrap();

    assert_eq!(sink.done.as_deref(), Some("All done."));
    assert!(!sink.tokens.concat().contains("<|im_end|>"));
    assert!(!sink.tokens.concat().contains("leaked"));
}

#[tokio::test]
async fn split_utf8_sequences_are_reframed() {
    let mut engine = engine_with_system();
    let bytes = "héllo 🦀".as_bytes().to_vec();
    // Deliver one byte per "token piece".
    engine.push_chunked_turn(bytes.iter().map(|b| vec![*b]).collect());

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("say hi", &mut sink).await.unwrap();

    assert_eq!(sink.done.as_deref(), Some("héllo 🦀"));
}

#[tokio::test]
async fn dangling_utf8_suffix_flushes_replacement_char() {
    let mut engine = engine_with_system();
    // "ok" then the first two bytes of a three-byte sequence, never finished.
    engine.push_chunked_turn(vec![b"ok".to_vec(), vec![0xE2, 0x82]]);

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("hi", &mut sink).await.unwrap();

    assert_eq!(sink.done.as_deref(), Some("ok\u{FFFD}"));
}

#[tokio::test]
async fn round_budget_exhaustion_reports_error() {
    let mut engine = engine_with_system();
    engine.push_text_turn(WEATHER_CALL);
    engine.push_text_turn(WEATHER_CALL);
    // A third turn is scripted but must never run.
    engine.push_text_turn("unreachable");

    let (executor, calls) = FixedExecutor::new("{}");
    let config = ToolLoopConfig {
        max_rounds: 2,
        ..Default::default()
    };
    let mut agent = ToolLoop::new(engine, executor, config);
    let mut sink = RecordingSink::default();

    let err = agent.run("loop forever", &mut sink).await.unwrap_err();
    assert!(matches!(err, LlmError::MaxRoundsExceeded(2)));
    assert_eq!(sink.errors, vec!["max rounds exceeded: 2"]);
    assert!(sink.done.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // No third prefill happened.
    assert_eq!(agent.engine().turns_begun(), 2);
}

#[tokio::test]
async fn executor_failure_becomes_tool_message_and_loop_continues() {
    let mut engine = engine_with_system();
    engine.push_text_turn(WEATHER_CALL);
    engine.push_text_turn("recovered");

    let mut agent = ToolLoop::new(engine, FailingExecutor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("weather?", &mut sink).await.unwrap();

    assert_eq!(sink.done.as_deref(), Some("recovered"));
    assert!(sink.errors.is_empty());
    let prompts = agent.engine().rendered_prompts();
    assert!(prompts[1].contains("Error: backend error: tool host unavailable"));
}

#[tokio::test]
async fn completed_object_that_is_not_a_call_fails_parse() {
    let mut engine = engine_with_system();
    engine.push_text_turn(r#"{"weather":"sunny"}"#);

    let (executor, calls) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    let err = agent.run("weather?", &mut sink).await.unwrap_err();
    assert!(matches!(err, LlmError::ToolCallParse));
    assert_eq!(sink.errors, vec!["tool call parse failure"]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_terminates_with_done_not_error() {
    let mut engine = engine_with_system();
    engine.push_cancelled_turn(vec![b"partial answ".to_vec()], 1);

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("long task", &mut sink).await.unwrap();

    assert!(sink.errors.is_empty());
    assert_eq!(sink.done.as_deref(), Some("partial answ"));
}

#[tokio::test]
async fn history_grows_by_two_entries_per_executed_call() {
    let mut engine = engine_with_system();
    engine.push_text_turn(WEATHER_CALL);
    engine.push_text_turn(WEATHER_CALL);
    engine.push_text_turn("final text");

    let (executor, _) = FixedExecutor::new(r#"{"ok":true}"#);
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("go", &mut sink).await.unwrap();

    // Prompts grow by exactly two transcript lines per executed call:
    // the assistant call JSON and the tool result.
    let prompts = agent.engine().rendered_prompts();
    assert_eq!(prompts.len(), 3);
    let lines = |p: &str| p.lines().count();
    assert_eq!(lines(&prompts[1]), lines(&prompts[0]) + 2);
    assert_eq!(lines(&prompts[2]), lines(&prompts[1]) + 2);
}

#[tokio::test]
async fn system_message_leads_the_conversation() {
    let mut engine = engine_with_system();
    engine.push_text_turn("hi");

    let (executor, _) = FixedExecutor::new("{}");
    let mut agent = ToolLoop::new(engine, executor, ToolLoopConfig::default());
    let mut sink = RecordingSink::default();

    agent.run("hello", &mut sink).await.unwrap();

    let prompts = agent.engine().rendered_prompts();
    assert!(prompts[0].starts_with("System: You are a function-calling assistant.\nUser: hello\n"));
    assert!(prompts[0].ends_with("Assistant: "));
}
