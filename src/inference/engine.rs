//! Generation invoker
//!
//! Turns a [`GenerationRequest`] into exactly one call into the inference
//! backend, either as a single blocking run or as a stream handed off to the
//! streaming bridge.

use std::sync::Arc;
use std::thread;

use thiserror::Error;

use crate::inference::streaming::{CancelHandle, StopCheckpoint, StreamHandle};
use crate::prompter::Prompter;
use crate::types::config::InvokerConfig;
use crate::types::request::{ConfigError, GenerationRequest, SamplingParams, TokenId};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid generation config: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

/// The model-inference collaborator
///
/// `generate` blocks until generation ends. Implementations must call
/// `checkpoint.on_step` after every generation step with the full token
/// sequence so far (prompt included), and honour its answer:
/// `Stop` ends generation and returns the tokens so far, `Abort` ends it
/// with [`EngineError::GenerationFailed`].
pub trait InferenceBackend: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest,
        checkpoint: &mut dyn StopCheckpoint,
    ) -> Result<Vec<TokenId>, EngineError>;
}

/// The tokenizer collaborator
pub trait Tokenizer: Send + Sync {
    /// Decodes a whole token sequence
    fn decode(&self, tokens: &[TokenId]) -> Result<String, EngineError>;

    fn eos_token_id(&self) -> TokenId;

    /// Whether `token` ends generation
    ///
    /// Models with end-of-turn tokens should override this.
    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == self.eos_token_id()
    }
}

/// Result of [`Invoker::inference`]
pub enum InferenceOutput {
    /// Final text of a non-streaming run (or the dev mode echo)
    Complete(String),
    /// Lazy sequence of response snapshots
    Streaming(StreamHandle),
}

/// Wraps the backend with a fixed parameter set per request
pub struct Invoker {
    backend: Arc<dyn InferenceBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    config: InvokerConfig,
}

impl Invoker {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            config,
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Runs generation to completion and decodes the result once
    pub fn run_once(&self, request: &GenerationRequest) -> Result<String, EngineError> {
        self.run_once_cancellable(request, &CancelHandle::new())
    }

    /// Like [`Self::run_once`], but stops early once `cancel` is set
    pub fn run_once_cancellable(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
    ) -> Result<String, EngineError> {
        request.params().validate()?;
        let mut checkpoint = cancel.clone();
        let tokens = self
            .backend
            .generate(request, &mut checkpoint)
            .inspect_err(|e| tracing::error!("Generation failed: {}", e))?;
        tracing::debug!("Generated sequence of {} tokens", tokens.len());
        self.tokenizer.decode(&tokens)
    }

    /// Starts a streaming generation
    pub fn start_stream(&self, request: GenerationRequest) -> Result<StreamHandle, EngineError> {
        self.start_stream_with(request, CancelHandle::new())
    }

    /// Starts a streaming generation sharing `cancel` with the caller
    pub fn start_stream_with(
        &self,
        request: GenerationRequest,
        cancel: CancelHandle,
    ) -> Result<StreamHandle, EngineError> {
        request.params().validate()?;
        let mut handle = StreamHandle::with_cancel_handle(
            Arc::clone(&self.backend),
            Arc::clone(&self.tokenizer),
            request,
            cancel,
        );
        handle.start()?;
        Ok(handle)
    }

    /// Renders the prompt and dispatches to a one-shot or streaming run
    ///
    /// Every text produced goes through [`Prompter::get_response`]. Blocks
    /// the caller for non-streaming runs and in dev mode.
    pub fn inference(
        &self,
        prompter: Arc<Prompter>,
        variables: &[String],
        params: SamplingParams,
        stream: bool,
        cancel: CancelHandle,
    ) -> Result<InferenceOutput, EngineError> {
        let prompt = prompter.generate_prompt(variables);

        if self.config.ui_dev_mode {
            let message = format!(
                "Currently in UI dev mode, not running actual inference.\n\nYour prompt is:\n\n{}",
                prompt
            );
            tracing::info!("{}", message);
            thread::sleep(self.config.dev_mode_delay());
            return Ok(InferenceOutput::Complete(message));
        }

        let request = GenerationRequest::new(prompt, params, stream)?;

        if request.is_streaming() {
            let extractor = Arc::clone(&prompter);
            let handle = self
                .start_stream_with(request, cancel)?
                .with_response_extractor(Arc::new(move |decoded: &str| {
                    extractor.get_response(decoded)
                }));
            return Ok(InferenceOutput::Streaming(handle));
        }

        let output = self.run_once_cancellable(&request, &cancel)?;
        Ok(InferenceOutput::Complete(prompter.get_response(&output)))
    }
}
