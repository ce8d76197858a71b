use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{ChatRequest, LanguageModel};
use crate::config::LlmConfig;
use crate::http;

/// Chat through an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiChat {
    base_url: Url,
    api_key: String,
    model: String,
    agent: ureq::Agent,
    retry_attempts: u32,
    backoff: Duration,
}

impl std::fmt::Debug for OpenAiChat {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
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

impl OpenAiChat {
    #[inline]
    pub fn new(base_url: Url, api_key: String, config: &LlmConfig) -> Self {
        Self {
            base_url,
            api_key,
            model: config.model.clone(),
            agent: http::agent(Duration::from_secs(config.timeout_secs)),
            retry_attempts: config.retry_attempts,
            backoff: Duration::from_secs(1),
        }
    }

    #[inline]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.base_url.as_str().trim_end_matches('/')
        )
    }
}

impl LanguageModel for OpenAiChat {
    #[inline]
    fn model_name(&self) -> &str {
        &self.model
    }

    #[inline]
    fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = self.completions_url();

        let body = CompletionBody {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let body =
            serde_json::to_string(&body).context("Failed to serialize completion request")?;
        let authorization = format!("Bearer {}", self.api_key);

        debug!("Sending completion request to {} with model {}", url, self.model);

        let response_text = http::with_retry(&url, self.retry_attempts, self.backoff, || {
            self.agent
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", &authorization)
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
        .context("Completion request failed")?;

        let response: CompletionResponse = serde_json::from_str(&response_text)
            .context("Failed to parse completion response")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("Completion response contained no message")
    }
}
