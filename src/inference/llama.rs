//! llama.cpp backend
//!
//! Implements [`InferenceBackend`] and [`Tokenizer`] on top of `llama-cpp-2`.
//! Each `generate` call creates its own context, so one loaded model can
//! serve several streams at once.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::engine::{EngineError, InferenceBackend, Tokenizer};
use crate::inference::streaming::{CheckpointSignal, StopCheckpoint};
use crate::types::request::{GenerationRequest, SamplingParams, TokenId};

/// Smallest context window handed to llama.cpp
const MIN_CONTEXT_SIZE: u32 = 2048;
const BATCH_SIZE: usize = 512;

/// A loaded GGUF model
pub struct LlamaCppBackend {
    backend: LlamaBackend,
    model: LlamaModel,
    context_size: u32,
    seed: u32,
}

impl LlamaCppBackend {
    /// Initializes llama.cpp and loads a GGUF model
    ///
    /// llama.cpp can only be initialized once per process.
    pub fn load<P: AsRef<Path>>(
        path: P,
        gpu_layers: u32,
        context_size: u32,
    ) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let backend = LlamaBackend::init().map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx)",
            path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(Self {
            backend,
            model,
            context_size,
            seed: 0,
        })
    }

    /// Fixes the sampling seed (0 = random per generation)
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    fn sampler(&self, params: &SamplingParams) -> LlamaSampler {
        let seed = if self.seed == 0 { rand_seed() } else { self.seed };
        if params.temperature < 0.01 {
            LlamaSampler::greedy()
        } else {
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(sampler_top_k(params.top_k)),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(seed),
            ])
        }
    }

    fn run(
        &self,
        ctx: &mut LlamaContext,
        prompt_tokens: Vec<LlamaToken>,
        params: &SamplingParams,
        checkpoint: &mut dyn StopCheckpoint,
    ) -> Result<Vec<TokenId>, EngineError> {
        let mut batch = LlamaBatch::new(prompt_tokens.len().max(BATCH_SIZE), 1);
        let last = prompt_tokens.len().saturating_sub(1);
        for (i, token) in prompt_tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| failed("Failed to add token to batch", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| failed("Failed to decode prompt", e))?;

        let mut sampler = self.sampler(params);
        let mut tokens: Vec<TokenId> = prompt_tokens.iter().map(|t| t.0 as TokenId).collect();
        let mut n_decoded = prompt_tokens.len() as i32;

        for _ in 0..params.max_new_tokens {
            let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
            sampler.accept(new_token);
            tokens.push(new_token.0 as TokenId);

            match checkpoint.on_step(&tokens) {
                CheckpointSignal::Continue => {}
                CheckpointSignal::Stop => break,
                CheckpointSignal::Abort(reason) => {
                    return Err(EngineError::GenerationFailed(reason))
                }
            }

            if self.model.is_eog_token(new_token) {
                tracing::debug!("End of generation token encountered");
                break;
            }

            batch.clear();
            batch
                .add(new_token, n_decoded, &[0], true)
                .map_err(|e| failed("Failed to add token to batch", e))?;
            ctx.decode(&mut batch)
                .map_err(|e| failed("Failed to decode", e))?;
            n_decoded += 1;
        }

        Ok(tokens)
    }
}

impl InferenceBackend for LlamaCppBackend {
    fn generate(
        &self,
        request: &GenerationRequest,
        checkpoint: &mut dyn StopCheckpoint,
    ) -> Result<Vec<TokenId>, EngineError> {
        let params = request.params();
        if params.num_beams > 1 {
            return Err(EngineError::GenerationFailed(format!(
                "beam search ({} beams) is not supported by the llama.cpp backend",
                params.num_beams
            )));
        }
        if (params.repetition_penalty - 1.0).abs() > f32::EPSILON {
            tracing::debug!(
                "Repetition penalty {} is not applied by the llama.cpp sampler chain",
                params.repetition_penalty
            );
        }

        let n_ctx = self
            .context_size
            .min(self.model.n_ctx_train())
            .max(MIN_CONTEXT_SIZE);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_ctx);

        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| failed("Failed to create context", e))?;

        let prompt_tokens = self
            .model
            .str_to_token(request.prompt(), AddBos::Always)
            .map_err(|e| failed("Failed to tokenize", e))?;
        tracing::debug!("Tokenized prompt into {} tokens", prompt_tokens.len());

        self.run(&mut ctx, prompt_tokens, params, checkpoint)
    }
}

impl Tokenizer for LlamaCppBackend {
    fn decode(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        let mut bytes = Vec::new();
        for &token in tokens {
            let piece = self
                .model
                .token_to_bytes(LlamaToken::new(token as i32), Special::Tokenize)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
            bytes.extend_from_slice(&piece);
        }
        // Decoding the whole sequence keeps multi-byte characters intact
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> TokenId {
        self.model.token_eos().0 as TokenId
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token as i32))
    }
}

/// llama.cpp takes `top_k` as an `i32`
fn sampler_top_k(top_k: u32) -> i32 {
    i32::try_from(top_k).unwrap_or(i32::MAX)
}

fn failed(context: &str, error: impl std::fmt::Display) -> EngineError {
    EngineError::GenerationFailed(format!("{}: {}", context, error))
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
