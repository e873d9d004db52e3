//! LoRA Tuner Library
//!
//! Generation core for the LoRA tuner panel: prompt templates, the
//! generation invoker and the cancellable token streaming bridge.

pub mod app;
pub mod inference;
pub mod prompter;
pub mod storage;
pub mod telemetry;
pub mod types;
