use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{ChatRequest, LanguageModel};
use crate::config::LlmConfig;
use crate::http;

/// Chat through Ollama's `/api/chat`, asking for a JSON-formatted reply.
#[derive(Debug, Clone)]
pub struct OllamaChat {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
    retry_attempts: u32,
    backoff: Duration,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    stream: bool,
    format: &'static str,
    options: Options,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OllamaChat {
    #[inline]
    pub fn new(base_url: Url, config: &LlmConfig) -> Self {
        Self {
            base_url,
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
}

impl LanguageModel for OllamaChat {
    #[inline]
    fn model_name(&self) -> &str {
        &self.model
    }

    #[inline]
    fn complete(&self, request: &ChatRequest) -> Result<String> {
        let url = self
            .base_url
            .join("/api/chat")
            .context("Failed to build chat URL")?;

        let body = ChatBody {
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
            stream: false,
            format: "json",
            options: Options {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };
        let body = serde_json::to_string(&body).context("Failed to serialize chat request")?;

        debug!("Sending chat request to {} with model {}", url, self.model);

        let response_text =
            http::with_retry(url.as_str(), self.retry_attempts, self.backoff, || {
                self.agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&body)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Chat request to Ollama failed")?;

        let response: ChatResponse =
            serde_json::from_str(&response_text).context("Failed to parse chat response")?;

        debug!("Received {} characters from model", response.message.content.len());
        Ok(response.message.content)
    }
}
