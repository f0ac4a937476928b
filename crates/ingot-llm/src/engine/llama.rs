//! llama.cpp-backed engine.
//!
//! Owns the backend, the model, the canonical grammar constraint, and the
//! per-turn sampler chain. A fresh context is created for every turn, which
//! realizes the clear-cache-and-reprefill policy directly: there is no
//! position state to carry across rounds.
//!
//! Grammar ownership: the canonical compiled grammar lives in the
//! [`GrammarCache`] and is never attached to a chain. Each turn's chain
//! receives a clone; `chain_simple` takes ownership of its stages and the
//! backend frees them when the chain is dropped. Grammar handles are not
//! reference-counted, so attaching the canonical instance itself would
//! double-free.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chat::ChatMessage;
use crate::constraint::{GrammarCache, GrammarMode, LAZY_TRIGGER_PATTERN};
use crate::engine::{FinishReason, StreamControl, TextEngine};
use crate::error::{LlmError, LlmResult};
use crate::sampler::{plan_chain, SamplerParams, SamplerStage};
use crate::stop::stop_strings_for_template;
use crate::template::{fallback_template_for_arch, tool_preamble, TOOL_SYSTEM_PROMPT};

/// Default context size in tokens.
const DEFAULT_CONTEXT_SIZE: u32 = 4096;

/// Default logical batch size for prefill.
const DEFAULT_BATCH_SIZE: usize = 512;

/// Headroom kept between the prompt and the context end.
const CONTEXT_HEADROOM: i32 = 8;

/// Configuration for [`LlamaEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaEngineConfig {
    /// Path to the GGUF model file.
    pub model_path: PathBuf,
    /// Decode threads; defaults to physical cores minus one.
    pub n_threads: Option<i32>,
    /// Layers offloaded to the GPU. CPU-only deployments keep 0.
    pub n_gpu_layers: u32,
    /// Context size in tokens.
    pub ctx_size: u32,
    /// Logical batch size for prefill.
    pub batch_size: usize,
    /// Sampling parameters, cached for per-turn chain rebuilds.
    pub sampler: SamplerParams,
    /// Preferred grammar activation mode.
    pub grammar_mode: GrammarMode,
    /// Whether to attempt the parameter-aware grammar before the generic
    /// fallback.
    pub use_typed_grammar: bool,
    /// Base system prompt when tool calling is disabled.
    pub system_prompt: String,
    /// Jinja chat template overriding the model's built-in one.
    pub chat_template_override: Option<String>,
}

impl Default for LlamaEngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            n_threads: None,
            n_gpu_layers: 0,
            ctx_size: DEFAULT_CONTEXT_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            sampler: SamplerParams::default(),
            grammar_mode: GrammarMode::Lazy,
            use_typed_grammar: true,
            system_prompt: String::new(),
            chat_template_override: None,
        }
    }
}

/// Timing and token counts for the last completed turn.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GenerationMetrics {
    /// Tokens in the prefilled prompt.
    pub prompt_tokens: u32,
    /// Tokens generated this turn.
    pub generated_tokens: u32,
    /// Milliseconds until the first generated token.
    pub time_to_first_token_ms: u64,
    /// Total turn duration in milliseconds.
    pub total_time_ms: u64,
    /// Generation throughput.
    pub tokens_per_second: f32,
}

/// Model identity and dimensions, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    /// `general.architecture` metadata, when present.
    pub architecture: Option<String>,
    /// `general.name` metadata, when present.
    pub name: Option<String>,
    /// Vocabulary size.
    pub n_vocab: i32,
    /// Training context length.
    pub n_ctx_train: u32,
    /// Embedding width.
    pub n_embd: i32,
    /// The chat template in effect (override, built-in, or fallback).
    pub chat_template: String,
    /// Coarse template family detected from turn markers.
    pub template_family: Option<&'static str>,
}

impl ModelInfo {
    /// JSON rendering of the report, the shape diagnostic front-ends read.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Cancellation handle shared with the engine's generation loop.
///
/// Setting the flag ends the current round at the next token boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Request cancellation.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Synchronous llama.cpp decoder session.
pub struct LlamaEngine {
    backend: LlamaBackend,
    model: LlamaModel,
    config: LlamaEngineConfig,
    n_threads: i32,
    chain: Option<LlamaSampler>,
    grammar: GrammarCache<LlamaSampler>,
    tools_json: String,
    tools_enabled: bool,
    system_prompt: String,
    stop: StopHandle,
    metrics: GenerationMetrics,
}

impl std::fmt::Debug for LlamaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaEngine")
            .field("model_path", &self.config.model_path)
            .field("ctx_size", &self.config.ctx_size)
            .field("tools_enabled", &self.tools_enabled)
            .finish()
    }
}

impl LlamaEngine {
    /// Load the model and prepare a session.
    pub fn new(config: LlamaEngineConfig) -> LlmResult<Self> {
        let n_threads = config
            .n_threads
            .unwrap_or_else(|| (num_cpus::get_physical().saturating_sub(1)).max(1) as i32);

        info!(
            path = %config.model_path.display(),
            threads = n_threads,
            ctx = config.ctx_size,
            "loading GGUF model"
        );

        let backend = LlamaBackend::init().map_err(|e| LlmError::Backend(e.to_string()))?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &model_params)
            .map_err(|e| LlmError::Backend(format!("failed to load model: {e}")))?;

        info!(
            n_ctx_train = model.n_ctx_train(),
            n_vocab = model.n_vocab(),
            "model loaded"
        );

        let grammar = GrammarCache::new(config.grammar_mode, config.use_typed_grammar);
        let system_prompt = config.system_prompt.clone();
        let mut engine = Self {
            backend,
            model,
            config,
            n_threads,
            chain: None,
            grammar,
            tools_json: String::new(),
            tools_enabled: false,
            system_prompt,
            stop: StopHandle::default(),
            metrics: GenerationMetrics::default(),
        };
        engine.warmup();
        Ok(engine)
    }

    /// Handle for cancelling the in-flight round from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Metrics for the last completed turn.
    pub fn last_metrics(&self) -> GenerationMetrics {
        self.metrics
    }

    /// Whether this model can drive the tool-calling protocol: true iff a
    /// chat template can be resolved for it.
    pub fn supports_tool_calling(&self) -> bool {
        !self.resolved_template().is_empty()
    }

    /// Install a tool catalog and switch the session into tool-calling mode.
    ///
    /// Catalog problems are reported here, synchronously: an empty payload
    /// or one with no extractable tool names is rejected. Individual
    /// malformed tool entries are dropped later by the schema parser and do
    /// not fail enablement. Grammar compilation happens lazily on the next
    /// turn and never fails enablement either.
    pub fn enable_tools(&mut self, tools_json: &str) -> LlmResult<()> {
        if tools_json.trim().is_empty() {
            return Err(LlmError::Catalog("empty tool catalog".into()));
        }
        if !self.supports_tool_calling() {
            return Err(LlmError::Catalog("no usable chat template".into()));
        }
        if ingot_grammar::extract_tool_names(tools_json).is_empty() {
            return Err(LlmError::Catalog("no usable tool definitions".into()));
        }

        self.tools_json = tools_json.to_string();
        self.tools_enabled = true;
        self.system_prompt = TOOL_SYSTEM_PROMPT.to_string();
        info!(bytes = tools_json.len(), "tool calling enabled");
        Ok(())
    }

    /// Retire the catalog and return to plain generation.
    pub fn disable_tools(&mut self) {
        self.tools_json.clear();
        self.tools_enabled = false;
        self.system_prompt = self.config.system_prompt.clone();
        self.grammar.clear();
        info!("tool calling disabled");
    }

    /// Whether tool calling is currently enabled.
    pub fn tools_enabled(&self) -> bool {
        self.tools_enabled
    }

    /// Force a grammar rebuild on the next turn even if the catalog text is
    /// unchanged.
    pub fn invalidate_grammar(&mut self) {
        self.grammar.invalidate();
    }

    /// Replace the sampling parameters used for subsequent turns.
    pub fn set_sampler_params(&mut self, params: SamplerParams) {
        self.config.sampler = params;
    }

    /// Model identity and dimensions.
    pub fn model_info(&self) -> ModelInfo {
        let template = self.resolved_template();
        let template_family = if template.contains("<|im_start|>") {
            Some("chatml")
        } else if template.contains("<start_of_turn>") {
            Some("gemma")
        } else if template.contains("[INST]") {
            Some("llama")
        } else if template.contains("<|system|>") || template.contains("<|assistant|>") {
            Some("phi")
        } else {
            None
        };

        ModelInfo {
            architecture: self.model.meta_val_str("general.architecture").ok(),
            name: self.model.meta_val_str("general.name").ok(),
            n_vocab: self.model.n_vocab(),
            n_ctx_train: self.model.n_ctx_train(),
            n_embd: self.model.n_embd(),
            chat_template: template,
            template_family,
        }
    }

    /// The chat template in effect: override, then built-in, then the
    /// architecture fallback.
    fn resolved_template(&self) -> String {
        if let Some(t) = &self.config.chat_template_override {
            if !t.is_empty() {
                return t.clone();
            }
        }
        if let Ok(t) = self.model.meta_val_str("tokenizer.chat_template") {
            if !t.is_empty() {
                return t;
            }
        }
        let arch = self
            .model
            .meta_val_str("general.architecture")
            .unwrap_or_default();
        debug!(arch = %arch, "no chat template in model, using architecture fallback");
        fallback_template_for_arch(&arch).to_string()
    }

    /// Rebuild the canonical grammar if the catalog changed, then compose
    /// this turn's sampler chain from the cached parameters.
    fn rebuild_chain(&mut self) {
        if self.tools_enabled {
            let model = &self.model;
            self.grammar.update_if_needed(&self.tools_json, |gbnf, mode| {
                compile_grammar(model, gbnf, mode)
            });
        }

        // Clones copy the canonical grammar's streaming state, so reset it
        // before deriving this turn's clone.
        if let Some(canonical) = self.grammar.canonical_mut() {
            canonical.reset();
        }

        let with_grammar = self.tools_enabled && self.grammar.canonical().is_some();
        let stages = plan_chain(&self.config.sampler, with_grammar);
        let mut samplers: Vec<LlamaSampler> = Vec::with_capacity(stages.len());
        for stage in stages {
            let sampler = match stage {
                SamplerStage::Grammar => match self.grammar.canonical() {
                    Some(canonical) => canonical.clone(),
                    None => continue,
                },
                SamplerStage::Mirostat { tau, eta, seed } => {
                    LlamaSampler::mirostat(self.model.n_vocab(), seed, tau, eta, 100)
                }
                SamplerStage::Temp(t) => LlamaSampler::temp(t),
                SamplerStage::TopK(k) => LlamaSampler::top_k(k),
                SamplerStage::TopP(p) => LlamaSampler::top_p(p, 1),
                SamplerStage::MinP(p) => LlamaSampler::min_p(p, 1),
                SamplerStage::Dist(seed) => LlamaSampler::dist(seed),
                SamplerStage::Greedy => LlamaSampler::greedy(),
            };
            samplers.push(sampler);
        }

        let p = &self.config.sampler;
        debug!(
            top_k = p.top_k,
            top_p = p.top_p,
            temp = p.temperature,
            min_p = p.min_p,
            mirostat = p.mirostat,
            grammar = with_grammar,
            "sampler chain rebuilt"
        );
        self.chain = Some(LlamaSampler::chain_simple(samplers));
    }

    /// Decode a single space token through a throwaway context to validate
    /// the decode path right after load.
    fn warmup(&mut self) {
        let Some(space) = self.space_token() else {
            return;
        };
        let params = self.context_params();
        let Ok(mut ctx) = self.model.new_context(&self.backend, params) else {
            warn!("warmup context creation failed");
            return;
        };
        let mut batch = LlamaBatch::new(1, 1);
        if batch.add(space, 0, &[0], true).is_ok() {
            if let Err(e) = ctx.decode(&mut batch) {
                warn!(error = %e, "warmup decode failed");
            }
        }
    }

    fn context_params(&self) -> LlamaContextParams {
        LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.config.ctx_size))
            .with_n_batch(self.config.batch_size as u32)
            .with_n_threads(self.n_threads)
            .with_n_threads_batch(self.n_threads)
    }

    fn space_token(&self) -> Option<LlamaToken> {
        self.model
            .str_to_token(" ", AddBos::Never)
            .ok()
            .and_then(|toks| toks.first().copied())
    }
}

/// Compile a GBNF string in the requested activation mode.
fn compile_grammar(model: &LlamaModel, gbnf: &str, mode: GrammarMode) -> Option<LlamaSampler> {
    match mode {
        GrammarMode::Strict => LlamaSampler::grammar(model, gbnf, "root").ok(),
        GrammarMode::Lazy => {
            let trigger_tokens: &[LlamaToken] = &[];
            LlamaSampler::grammar_lazy_patterns(
                model,
                gbnf,
                "root",
                &[LAZY_TRIGGER_PATTERN],
                trigger_tokens,
            )
            .ok()
        }
    }
}

impl TextEngine for LlamaEngine {
    fn begin_turn(&mut self) -> LlmResult<()> {
        self.stop.clear();
        self.rebuild_chain();
        Ok(())
    }

    fn render_prompt(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> LlmResult<String> {
        let template_str = self.resolved_template();
        let template = LlamaChatTemplate::new(&template_str)
            .map_err(|e| LlmError::Template(e.to_string()))?;

        let mut chat = Vec::with_capacity(messages.len());
        for msg in messages {
            chat.push(
                LlamaChatMessage::new(msg.role.as_str().to_string(), msg.content.clone())
                    .map_err(|e| LlmError::Template(e.to_string()))?,
            );
        }

        self.model
            .apply_chat_template(&template, &chat, add_generation_prompt)
            .map_err(|e| LlmError::Template(e.to_string()))
    }

    fn system_message(&self) -> String {
        if self.tools_enabled && !self.tools_json.is_empty() {
            let mut system = String::with_capacity(self.system_prompt.len() + self.tools_json.len() + 256);
            system.push_str(&self.system_prompt);
            system.push('\n');
            system.push_str(&tool_preamble(&self.tools_json));
            system
        } else {
            self.system_prompt.clone()
        }
    }

    fn stop_strings(&self) -> Vec<String> {
        stop_strings_for_template(Some(&self.resolved_template()))
    }

    fn complete(
        &mut self,
        prompt: &str,
        max_tokens: u32,
        emit: &mut dyn FnMut(&[u8]) -> StreamControl,
    ) -> LlmResult<FinishReason> {
        let start = Instant::now();
        self.metrics = GenerationMetrics::default();

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|_| LlmError::Tokenization)?;
        if tokens.is_empty() {
            return Err(LlmError::Tokenization);
        }
        self.metrics.prompt_tokens = tokens.len() as u32;

        let ctx_size = self.config.ctx_size as i32;
        let available = ctx_size - tokens.len() as i32 - CONTEXT_HEADROOM;
        if available <= 0 {
            return Err(LlmError::ContextOverflow);
        }
        let budget = if max_tokens > 0 { max_tokens as i32 } else { 128 };
        let to_generate = budget.min(available);

        let params = self.context_params();
        let mut ctx = self
            .model
            .new_context(&self.backend, params)
            .map_err(|e| LlmError::Backend(format!("failed to create context: {e}")))?;

        // Prefill in batch-size chunks; only the last token keeps logits.
        let batch_size = self.config.batch_size;
        let mut batch = LlamaBatch::new(batch_size, 1);
        let mut pos: i32 = 0;
        for chunk in tokens.chunks(batch_size) {
            batch.clear();
            for (k, tok) in chunk.iter().enumerate() {
                let global = pos as usize + k;
                let wants_logits = global == tokens.len() - 1;
                batch
                    .add(*tok, global as i32, &[0], wants_logits)
                    .map_err(|e| LlmError::Decode(e.to_string()))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| LlmError::Decode(e.to_string()))?;
            pos += chunk.len() as i32;
        }
        debug!(prompt_tokens = tokens.len(), "prefill complete");

        let chain = self.chain.as_mut().ok_or(LlmError::ModelNotLoaded)?;
        let space = self
            .model
            .str_to_token(" ", AddBos::Never)
            .ok()
            .and_then(|toks| toks.first().copied());

        let mut finish = FinishReason::Budget;
        let mut first_token_seen = false;

        for i in 0..to_generate {
            if self.stop.is_set() {
                finish = FinishReason::Stopped;
                break;
            }

            let cur_pos = tokens.len() as i32 + i;
            if cur_pos >= ctx_size - 1 {
                return Err(LlmError::ContextOverflow);
            }

            let mut tok = chain.sample(&ctx, -1);
            chain.accept(tok);

            // An end-of-turn token at position 0 is a degenerate sample;
            // substitute a space and keep going.
            if i == 0 && self.model.is_eog_token(tok) {
                match space {
                    Some(s) => tok = s,
                    None => {
                        finish = FinishReason::EndOfTurn;
                        break;
                    }
                }
            }

            if self.model.is_eog_token(tok) {
                finish = FinishReason::EndOfTurn;
                break;
            }

            if !first_token_seen {
                self.metrics.time_to_first_token_ms = start.elapsed().as_millis() as u64;
                first_token_seen = true;
            }
            self.metrics.generated_tokens += 1;

            let bytes = self
                .model
                .token_to_bytes(tok, Special::Plaintext)
                .map_err(|e| LlmError::Decode(e.to_string()))?;
            if emit(&bytes) == StreamControl::Stop {
                finish = FinishReason::EndOfTurn;
                break;
            }

            batch.clear();
            batch
                .add(tok, cur_pos, &[0], true)
                .map_err(|e| LlmError::Decode(e.to_string()))?;
            ctx.decode(&mut batch)
                .map_err(|e| LlmError::Decode(e.to_string()))?;
        }

        self.metrics.total_time_ms = start.elapsed().as_millis() as u64;
        if self.metrics.total_time_ms > 0 && self.metrics.generated_tokens > 0 {
            self.metrics.tokens_per_second =
                self.metrics.generated_tokens as f32 * 1000.0 / self.metrics.total_time_ms as f32;
        }
        debug!(
            generated = self.metrics.generated_tokens,
            tps = self.metrics.tokens_per_second,
            "turn finished"
        );

        Ok(finish)
    }
}
