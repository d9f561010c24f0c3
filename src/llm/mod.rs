mod ollama;
pub mod orchestrator;

pub use ollama::OllamaClient;
pub use orchestrator::{GenerationRequest, ModelOrchestrator, RetryPolicy};

use crate::config::ModelConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Sampling options sent with every generation call
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerateOptions {
    /// Context window size in tokens
    pub num_ctx: u32,
    /// Maximum tokens to generate
    pub num_predict: u32,
    pub temperature: f32,
}

impl GenerateOptions {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            num_ctx: config.context_window,
            num_predict: config.max_output_tokens,
            temperature: config.temperature,
        }
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from_config(&ModelConfig::default())
    }
}

/// Transport and availability failures reported by a model backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to reach model backend: {0}")]
    Unreachable(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("empty response from model")]
    EmptyResponse,

    #[error("model backend returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode model backend response: {0}")]
    Decode(String),
}

/// A text-generation service that can list and run models
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifiers of the models the backend can serve right now
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Run `prompt` against `model`, returning the fully drained response
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, BackendError>;
}
