//! Scripted backend and tokenizer for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::inference::engine::{EngineError, InferenceBackend, Tokenizer};
use crate::inference::streaming::{CheckpointSignal, StopCheckpoint};
use crate::types::request::{GenerationRequest, TokenId};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
/// Stands for the whole echoed prompt
pub const PROMPT: TokenId = 3;
/// End-of-turn, also ends generation
pub const EOT: TokenId = 4;

/// Decodes `BOS`, `EOS`, `EOT` and `PROMPT` specially, every other id as ` w{id}`
pub struct WordTokenizer {
    prompt_text: String,
}

impl WordTokenizer {
    pub const EOS_TEXT: &'static str = "</s>";
    pub const EOT_TEXT: &'static str = "<|eot|>";

    pub fn new() -> Self {
        Self::with_prompt_text("")
    }

    pub fn with_prompt_text(prompt_text: impl Into<String>) -> Self {
        Self {
            prompt_text: prompt_text.into(),
        }
    }
}

impl Tokenizer for WordTokenizer {
    fn decode(&self, tokens: &[TokenId]) -> Result<String, EngineError> {
        let mut out = String::new();
        for &token in tokens {
            match token {
                BOS => out.push_str("<s>"),
                EOS => out.push_str(Self::EOS_TEXT),
                EOT => out.push_str(Self::EOT_TEXT),
                PROMPT => out.push_str(&self.prompt_text),
                0 => return Err(EngineError::Decode("unknown token 0".to_string())),
                id => out.push_str(&format!(" w{}", id)),
            }
        }
        Ok(out)
    }

    fn eos_token_id(&self) -> TokenId {
        EOS
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS || token == EOT
    }
}

/// Emits a fixed token script, one checkpoint per token
pub struct ScriptedBackend {
    script: Vec<TokenId>,
    step_delay: Duration,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    shrink_at: Option<usize>,
    calls: AtomicUsize,
    checkpoints: AtomicUsize,
    finished: AtomicBool,
}

impl ScriptedBackend {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            step_delay: Duration::ZERO,
            fail_at: None,
            panic_at: None,
            shrink_at: None,
            calls: AtomicUsize::new(0),
            checkpoints: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail with an out-of-memory error before generating step `step`
    pub fn fail_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn panic_at(mut self, step: usize) -> Self {
        self.panic_at = Some(step);
        self
    }

    /// Hand the checkpoint a truncated sequence at step `step`
    pub fn shrink_at(mut self, step: usize) -> Self {
        self.shrink_at = Some(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn run(
        &self,
        request: &GenerationRequest,
        checkpoint: &mut dyn StopCheckpoint,
    ) -> Result<Vec<TokenId>, EngineError> {
        let mut tokens = vec![BOS, PROMPT];
        let limit = request.params().max_new_tokens as usize;

        for (step, &token) in self.script.iter().take(limit).enumerate() {
            if self.fail_at == Some(step) {
                return Err(EngineError::GenerationFailed(
                    "CUDA out of memory".to_string(),
                ));
            }
            if self.panic_at == Some(step) {
                panic!("simulated backend panic");
            }

            tokens.push(token);
            let snapshot: &[TokenId] = if self.shrink_at == Some(step) {
                &tokens[..1]
            } else {
                &tokens
            };

            self.checkpoints.fetch_add(1, Ordering::SeqCst);
            match checkpoint.on_step(snapshot) {
                CheckpointSignal::Continue => {}
                CheckpointSignal::Stop => break,
                CheckpointSignal::Abort(reason) => {
                    return Err(EngineError::GenerationFailed(reason))
                }
            }
            if token == EOS || token == EOT {
                break;
            }
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
        }

        Ok(tokens)
    }
}

impl InferenceBackend for ScriptedBackend {
    fn generate(
        &self,
        request: &GenerationRequest,
        checkpoint: &mut dyn StopCheckpoint,
    ) -> Result<Vec<TokenId>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.run(request, checkpoint);
        self.finished.store(true, Ordering::SeqCst);
        result
    }
}
