//! LLM inference
//!
//! This module wraps the inference backend: the generation invoker, the
//! streaming bridge and, behind the `llama` feature, a llama.cpp backend.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
#[cfg(test)]
pub(crate) mod mock;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{EngineError, InferenceBackend, InferenceOutput, Invoker, Tokenizer};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use streaming::{
    CancelHandle, CheckpointSignal, FinishReason, PartialResult, StopCheckpoint, StreamHandle,
    StreamState, StreamToken,
};
