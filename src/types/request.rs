//! Generation request types
//!
//! Sampling parameters and the immutable request handed to the invoker.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token identifier produced by the tokenizer
pub type TokenId = u32;

/// Rejected generation configuration
///
/// Raised synchronously, before any worker is started.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("temperature must be finite and above 0, got {0}")]
    InvalidTemperature(f32),

    #[error("top_p must be within [0, 1], got {0}")]
    InvalidTopP(f32),

    #[error("num_beams must be at least 1")]
    InvalidBeamCount,

    #[error("repetition_penalty must be finite and above 0, got {0}")]
    InvalidRepetitionPenalty(f32),

    #[error("max_new_tokens must be at least 1")]
    InvalidMaxNewTokens,

    #[error("Unknown prompt template: {0}")]
    UnknownTemplate(String),
}

/// Sampling parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling (higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Number of beams for beam search (1 = no beam search)
    pub num_beams: u32,
    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,
    /// Maximum number of tokens to generate after the prompt
    pub max_new_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 1,
            repetition_penalty: 1.2,
            max_new_tokens: 128,
        }
    }
}

impl SamplingParams {
    /// Checks every parameter, returning the first violation found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ConfigError::InvalidTopP(self.top_p));
        }
        if self.num_beams == 0 {
            return Err(ConfigError::InvalidBeamCount);
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(ConfigError::InvalidRepetitionPenalty(
                self.repetition_penalty,
            ));
        }
        if self.max_new_tokens == 0 {
            return Err(ConfigError::InvalidMaxNewTokens);
        }
        Ok(())
    }
}

/// A validated, immutable generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    params: SamplingParams,
    stream: bool,
}

impl GenerationRequest {
    /// Builds a request, rejecting invalid sampling parameters
    pub fn new(
        prompt: impl Into<String>,
        params: SamplingParams,
        stream: bool,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            prompt: prompt.into(),
            params,
            stream,
        })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Whether the caller asked for incremental output
    pub fn is_streaming(&self) -> bool {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        let params = SamplingParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.top_k, 40);
        assert_eq!(params.max_new_tokens, 128);
    }

    #[test]
    fn test_rejects_invalid_params() {
        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ConfigError::InvalidTemperature(0.0))
        );

        let params = SamplingParams {
            top_p: 1.5,
            ..Default::default()
        };
        assert_eq!(params.validate(), Err(ConfigError::InvalidTopP(1.5)));

        let params = SamplingParams {
            num_beams: 0,
            ..Default::default()
        };
        assert_eq!(params.validate(), Err(ConfigError::InvalidBeamCount));

        let params = SamplingParams {
            repetition_penalty: f32::NAN,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidRepetitionPenalty(_))
        ));

        let params = SamplingParams {
            max_new_tokens: 0,
            ..Default::default()
        };
        assert_eq!(params.validate(), Err(ConfigError::InvalidMaxNewTokens));
    }

    #[test]
    fn test_request_construction() {
        let request = GenerationRequest::new("Hello", SamplingParams::default(), true)
            .expect("valid request");
        assert_eq!(request.prompt(), "Hello");
        assert!(request.is_streaming());

        let bad = SamplingParams {
            top_p: -0.1,
            ..Default::default()
        };
        assert!(GenerationRequest::new("Hello", bad, false).is_err());
    }

    #[test]
    fn test_params_serialization() {
        let params = SamplingParams::default();
        let json = serde_json::to_string(&params).expect("Failed to serialize");
        let deserialized: SamplingParams =
            serde_json::from_str(&json).expect("Failed to deserialize");
        assert_eq!(params, deserialized);
    }
}
