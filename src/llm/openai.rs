use super::{CompletionError, CompletionRequest, CompletionResult, CompletionService};
use crate::{config::env_string, http::build_client, metrics};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl OpenAiConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            api_key: env_string("OPENAI_API_KEY"),
            model: env_string("OPENAI_MODEL").unwrap_or_else(|| "gpt-4".into()),
        }
    }
}

pub struct OpenAiClient {
    http: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig, connect_timeout: Duration) -> Self {
        // Per-request timeouts are applied on each call; this is only the ceiling.
        Self {
            http: build_client(Duration::from_secs(120), connect_timeout),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    fn ensure_configured(&self) -> Result<(), CompletionError> {
        match self.config.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(()),
            _ => Err(CompletionError::MissingApiKey),
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        self.ensure_configured()?;
        let api_key = self.config.api_key.as_deref().unwrap_or_default();

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
        };

        let started = Instant::now();
        let result = async {
            let response = self
                .http
                .post(self.endpoint())
                .bearer_auth(api_key)
                .timeout(request.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|err| CompletionError::Transport(err.to_string()))?;

            let status = response.status();
            let raw = response
                .text()
                .await
                .map_err(|err| CompletionError::Transport(err.to_string()))?;
            decode_envelope(status.as_u16(), &raw)
        }
        .await;

        let elapsed_ms = started.elapsed().as_millis();
        metrics::completion_elapsed(result.is_ok(), elapsed_ms);
        debug!(
            target = "catmatch.llm",
            model = %self.config.model,
            prompt_chars = request.prompt.chars().count(),
            elapsed_ms = elapsed_ms as u64,
            ok = result.is_ok(),
            "completion_finished"
        );
        result
    }
}

/// Maps a raw HTTP exchange onto a [`CompletionResult`].
///
/// An `error` envelope wins over the status code so upstream messages are kept even on
/// 4xx responses.
pub(crate) fn decode_envelope(status: u16, raw: &str) -> CompletionResult {
    if raw.trim().is_empty() {
        return Err(if (200..300).contains(&status) {
            CompletionError::InvalidResponse("empty body".into())
        } else {
            CompletionError::Status(status)
        });
    }

    match serde_json::from_str::<Envelope>(raw) {
        Ok(Envelope::Failure { error }) => Err(CompletionError::Upstream(
            error
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "unspecified upstream error".into()),
        )),
        Ok(Envelope::Success { choices }) if (200..300).contains(&status) => choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::InvalidResponse("missing message content".into())),
        Ok(Envelope::Success { .. }) => Err(CompletionError::Status(status)),
        Err(_) if !(200..300).contains(&status) => Err(CompletionError::Status(status)),
        Err(err) => Err(CompletionError::InvalidResponse(err.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Failure { error: UpstreamFailure },
    Success { choices: Vec<Choice> },
}

#[derive(Debug, Deserialize)]
struct UpstreamFailure {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
