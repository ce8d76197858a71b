// Language model clients
// One blocking chat-completion call per request, behind the LanguageModel trait

pub mod ollama;
pub mod openai;


use anyhow::{Context, Result};

use crate::config::{Config, LlmProvider};

pub use ollama::OllamaChat;
pub use openai::OpenAiChat;

/// A single-turn chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A chat model that answers one prompt with free text.
///
/// Errors are service failures: network, authentication, quota or timeout.
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// Create the language model selected by `llm.provider`.
#[inline]
pub fn create_language_model(config: &Config) -> Result<Box<dyn LanguageModel>> {
    let endpoint = config
        .llm
        .endpoint(&config.ollama)
        .context("Failed to resolve language model endpoint")?;

    match config.llm.provider {
        LlmProvider::Ollama => Ok(Box::new(OllamaChat::new(endpoint, &config.llm))),
        LlmProvider::Openai => {
            let api_key = std::env::var(&config.llm.api_key_env).with_context(|| {
                format!(
                    "Environment variable {} must hold the API key",
                    config.llm.api_key_env
                )
            })?;
            Ok(Box::new(OpenAiChat::new(endpoint, api_key, &config.llm)))
        }
    }
}
