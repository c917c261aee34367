//! Text-completion boundary.
//!
//! Everything past this module sees a [`CompletionResult`]; response envelopes are
//! decoded once inside the client implementation.

pub mod openai;

use crate::config::env_parse;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use openai::{OpenAiClient, OpenAiConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: Some(100),
        }
    }
}

impl ModelParams {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            temperature: env_parse::<f32>("OPENAI_TEMPERATURE")
                .filter(|t| (0.0..=2.0).contains(t))
                .unwrap_or(defaults.temperature),
            max_tokens: match env_parse::<u32>("OPENAI_MAX_TOKENS") {
                Some(0) => None,
                Some(limit) => Some(limit),
                None => defaults.max_tokens,
            },
        }
    }

    /// Batch extraction answers with a JSON object, so the single-line token cap is lifted.
    pub fn for_batch(self) -> Self {
        Self {
            max_tokens: None,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub params: ModelParams,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn new(prompt: String, params: ModelParams, timeout: Duration) -> Self {
        Self {
            prompt,
            params,
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionErrorKind {
    Config,
    Transport,
    Upstream,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion api key is not configured")]
    MissingApiKey,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("completion endpoint returned HTTP {0}")]
    Status(u16),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CompletionError {
    pub fn kind(&self) -> CompletionErrorKind {
        match self {
            Self::MissingApiKey => CompletionErrorKind::Config,
            Self::Transport(_) | Self::Status(_) => CompletionErrorKind::Transport,
            Self::Upstream(_) | Self::InvalidResponse(_) => CompletionErrorKind::Upstream,
        }
    }
}

pub type CompletionResult = Result<String, CompletionError>;

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Fails with [`CompletionError::MissingApiKey`] when no call could ever succeed.
    fn ensure_configured(&self) -> Result<(), CompletionError>;

    async fn complete(&self, request: &CompletionRequest) -> CompletionResult;
}
