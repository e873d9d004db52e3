//! Settings storage
//!
//! Manages persistence of the panel's generation defaults.

use crate::prompter::TemplateRegistry;
use crate::storage::{get_data_dir, StorageError};
use crate::types::config::InvokerConfig;
use crate::types::request::SamplingParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// LoRA model selected when nothing else is
pub const DEFAULT_LORA_MODEL: &str = "tloen/alpaca-lora-7b";

/// Prompt template selected when nothing else is
pub const DEFAULT_PROMPT_TEMPLATE: &str = "alpaca";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Temperature parameter for text generation (0.01 - 1.99)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter (0 - 200)
    pub top_k: u32,
    /// Beam count (1 - 4)
    pub num_beams: u32,
    /// Repetition penalty (0.01 - 2.5)
    pub repetition_penalty: f32,
    /// Maximum number of new tokens (1 - 4096)
    pub max_new_tokens: u32,
    /// Stream tokens as they are generated
    #[serde(default = "default_stream_output")]
    pub stream_output: bool,
    /// Selected prompt template
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    /// Selected LoRA model
    #[serde(default = "default_lora_model")]
    pub lora_model: String,
    /// Echo prompts instead of running the model
    #[serde(default)]
    pub ui_dev_mode: bool,
    /// Simulated latency of a dev mode response
    #[serde(default = "default_dev_mode_delay_ms")]
    pub dev_mode_delay_ms: u64,
}

fn default_stream_output() -> bool {
    true
}

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

fn default_lora_model() -> String {
    DEFAULT_LORA_MODEL.to_string()
}

fn default_dev_mode_delay_ms() -> u64 {
    1000
}

impl Default for AppSettings {
    fn default() -> Self {
        let params = SamplingParams::default();
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            num_beams: params.num_beams,
            repetition_penalty: params.repetition_penalty,
            max_new_tokens: params.max_new_tokens,
            stream_output: default_stream_output(),
            prompt_template: default_prompt_template(),
            lora_model: default_lora_model(),
            ui_dev_mode: false,
            dev_mode_delay_ms: default_dev_mode_delay_ms(),
        }
    }
}

impl AppSettings {
    /// Validate settings values
    ///
    /// Clamps every parameter into the range the panel's sliders allow and
    /// replaces a template the built-in registry does not know.
    pub fn validate(&mut self) {
        self.validate_with(&TemplateRegistry::default());
    }

    /// Like [`Self::validate`], checking the template against `templates`
    pub fn validate_with(&mut self, templates: &TemplateRegistry) {
        if !self.temperature.is_finite() {
            self.temperature = SamplingParams::default().temperature;
        }
        self.temperature = self.temperature.clamp(0.01, 1.99);

        if !self.top_p.is_finite() {
            self.top_p = SamplingParams::default().top_p;
        }
        self.top_p = self.top_p.clamp(0.0, 1.0);

        self.top_k = self.top_k.min(200);
        self.num_beams = self.num_beams.clamp(1, 4);

        if !self.repetition_penalty.is_finite() {
            self.repetition_penalty = SamplingParams::default().repetition_penalty;
        }
        self.repetition_penalty = self.repetition_penalty.clamp(0.01, 2.5);

        self.max_new_tokens = self.max_new_tokens.clamp(1, 4096);

        if !templates.contains(&self.prompt_template) {
            tracing::warn!(
                "Unknown prompt template {:?}, using {}",
                self.prompt_template,
                DEFAULT_PROMPT_TEMPLATE
            );
            self.prompt_template = default_prompt_template();
        }
        if self.lora_model.trim().is_empty() {
            self.lora_model = default_lora_model();
        }
    }

    /// Sampling parameters for a new request
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            num_beams: self.num_beams,
            repetition_penalty: self.repetition_penalty,
            max_new_tokens: self.max_new_tokens,
        }
    }

    pub fn invoker_config(&self) -> InvokerConfig {
        InvokerConfig {
            ui_dev_mode: self.ui_dev_mode,
            dev_mode_delay_ms: self.dev_mode_delay_ms,
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> AppSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            AppSettings::default()
        }
    }
}

/// Load and validate settings from `path`
pub fn load_settings_from(path: &Path) -> Result<AppSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(AppSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: AppSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &AppSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`, creating its parent directory
pub fn save_settings_to(settings: &AppSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
