//! Control surface
//!
//! The state a UI front-end drives: one active generation per output slot,
//! stop requests, prompt previews and dropdown selections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::inference::{CancelHandle, EngineError, FinishReason, InferenceOutput, Invoker};
use crate::prompter::{TemplateRegistry, NONE_TEMPLATE};
use crate::storage::settings::{AppSettings, DEFAULT_LORA_MODEL};
use crate::types::request::{ConfigError, SamplingParams};

/// Where partial and final outputs are rendered
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Replaces the slot's content with `text`
    async fn render(&self, slot: &str, text: String);
}

/// Outcome of one [`AppState::generate`] call
#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub id: Uuid,
    pub slot: String,
    /// Number of texts rendered
    pub items: usize,
    /// `None` for a completed non-streaming run
    pub finish_reason: Option<FinishReason>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Dropdown contents and current values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selections {
    pub lora_models: Vec<String>,
    pub lora_model: String,
    pub templates: Vec<String>,
    pub template: String,
}

struct ActiveGeneration {
    id: Uuid,
    cancel: CancelHandle,
}

type ActiveSlots = Arc<DashMap<String, ActiveGeneration>>;

/// Frees the slot once its generation has stopped, unless it was replaced
///
/// Owned by whatever currently runs the generation: the blocking task, the
/// stream's worker, or the `generate` future itself.
struct SlotGuard {
    active: ActiveSlots,
    slot: String,
    id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.slot, |_, active| active.id == self.id);
    }
}

/// Cancels the generation if the `generate` future is dropped early
struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Global application state shared by the UI handlers
pub struct AppState {
    invoker: Arc<Invoker>,
    templates: TemplateRegistry,
    settings: AppSettings,
    active: ActiveSlots,
}

impl AppState {
    pub fn new(invoker: Arc<Invoker>, settings: AppSettings) -> Self {
        tracing::info!("AppState initialized");
        Self {
            invoker,
            templates: TemplateRegistry::new(),
            settings,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Runs one generation into `slot`
    ///
    /// An active generation on the same slot is cancelled first. Invalid
    /// parameters are rejected before anything is cancelled or started.
    ///
    /// Dropping the returned future cancels the generation. The slot stays
    /// busy until the backend has actually stopped.
    pub async fn generate(
        &self,
        slot: &str,
        template: &str,
        variables: Vec<String>,
        params: SamplingParams,
        stream: bool,
        sink: &dyn OutputSink,
    ) -> Result<GenerationSummary, EngineError> {
        let prompter = Arc::new(self.templates.prompter(template)?);
        params.validate()?;

        let id = Uuid::new_v4();
        let cancel = CancelHandle::new();
        let previous = self.active.insert(
            slot.to_string(),
            ActiveGeneration {
                id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(slot, previous = %previous.id, "Cancelling active generation");
            previous.cancel.cancel();
        }
        let guard = SlotGuard {
            active: Arc::clone(&self.active),
            slot: slot.to_string(),
            id,
        };
        let _cancel_on_drop = CancelOnDrop(cancel.clone());

        let started_at = Utc::now();
        let start = Instant::now();

        let invoker = Arc::clone(&self.invoker);
        let call_cancel = cancel.clone();
        let (output, _guard) = tokio::task::spawn_blocking(move || {
            match invoker.inference(prompter, &variables, params, stream, call_cancel) {
                Ok(InferenceOutput::Streaming(mut handle)) => {
                    // The slot is freed once the stream's worker has been joined
                    handle.on_closed(move || drop(guard));
                    (Ok(InferenceOutput::Streaming(handle)), None)
                }
                other => (other, Some(guard)),
            }
        })
        .await
        .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let (items, finish_reason) = match output? {
            InferenceOutput::Complete(_) if cancel.is_cancelled() => {
                (0, Some(FinishReason::Cancelled))
            }
            InferenceOutput::Complete(text) => {
                sink.render(slot, text).await;
                (1, None)
            }
            InferenceOutput::Streaming(mut handle) => {
                let mut items = 0;
                let mut failure = None;
                while let Some(item) = handle.next_text().await {
                    match item {
                        // Nothing is rendered once a stop was requested
                        Ok(_) if cancel.is_cancelled() => break,
                        Ok(text) => {
                            sink.render(slot, text).await;
                            items += 1;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                handle.shutdown().await;
                if let Some(e) = failure {
                    return Err(e);
                }
                let reason = handle
                    .finish_reason()
                    .or_else(|| cancel.is_cancelled().then_some(FinishReason::Cancelled));
                (items, reason)
            }
        };

        let summary = GenerationSummary {
            id,
            slot: slot.to_string(),
            items,
            finish_reason,
            started_at,
            elapsed: start.elapsed(),
        };
        tracing::info!(
            slot,
            items,
            reason = ?summary.finish_reason,
            "Generation finished in {:.2}s",
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }

    /// Stops the slot's active generation
    ///
    /// Returns `false` if nothing is running or a stop was already requested.
    pub fn stop(&self, slot: &str) -> bool {
        match self.active.get(slot) {
            Some(active) => {
                let first = active.cancel.cancel();
                if first {
                    tracing::info!(slot, "Stop requested");
                }
                first
            }
            None => false,
        }
    }

    pub fn is_generating(&self, slot: &str) -> bool {
        self.active.contains_key(slot)
    }

    /// Renders the prompt without generating anything
    pub fn prompt_preview(
        &self,
        template: &str,
        variables: &[String],
    ) -> Result<String, ConfigError> {
        self.templates.render(template, variables)
    }

    /// Refreshes dropdown contents, keeping valid current values
    pub fn reload_selections(
        &self,
        current_lora: Option<&str>,
        current_template: Option<&str>,
    ) -> Selections {
        let templates = self.templates.available_template_names();
        let template = current_template
            .filter(|name| templates.iter().any(|t| t == name))
            .map(str::to_string)
            .or_else(|| templates.first().cloned())
            .unwrap_or_else(|| NONE_TEMPLATE.to_string());

        // Custom adapter names are allowed
        let lora_model = current_lora
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_LORA_MODEL.to_string());

        Selections {
            lora_models: vec![DEFAULT_LORA_MODEL.to_string()],
            lora_model,
            templates,
            template,
        }
    }
}
