
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use itertools::Itertools;

use super::{
    Config, ConfigError, CorpusConfig, EmbeddingConfig, EmbeddingProvider, LlmConfig, LlmProvider,
    OllamaConfig,
};

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 PathPilot Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir);

    eprintln!("{}", style("Ollama Configuration").bold().yellow());
    eprintln!("Configure the Ollama instance used for embeddings and local chat models.");
    eprintln!();
    configure_ollama(&mut config.ollama)?;

    eprintln!();
    eprintln!("{}", style("Embedding Configuration").bold().yellow());
    configure_embedding(&mut config.embedding)?;

    eprintln!();
    eprintln!("{}", style("Language Model Configuration").bold().yellow());
    configure_llm(&mut config.llm)?;

    eprintln!();
    eprintln!("{}", style("Indexed Directories").bold().yellow());
    configure_corpus(&mut config.corpus)?;

    config.executor.confirm = Confirm::new()
        .with_prompt("Ask for confirmation before executing each action?")
        .default(config.executor.confirm)
        .interact()?;

    if config.embedding.provider == EmbeddingProvider::Ollama
        || config.llm.provider == LlmProvider::Ollama
    {
        eprintln!();
        eprintln!("{}", style("Testing configuration...").yellow());

        if test_ollama_connection(&config.ollama) {
            eprintln!("{}", style("✓ Ollama connection successful!").green());
        } else {
            eprintln!(
                "{}",
                style("⚠ Warning: Could not connect to Ollama").yellow()
            );
            eprintln!("You can continue, but make sure Ollama is running before indexing.");
        }
    }

    if let Err(e) = config.require_credentials() {
        eprintln!("{} {e}", style("⚠ Warning:").yellow());
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    match config.ollama_url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());

    eprintln!();
    eprintln!("{}", style("Embeddings:").bold().yellow());
    eprintln!(
        "  Provider: {}",
        style(format!("{:?}", config.embedding.provider)).cyan()
    );
    eprintln!("  Model: {}", style(&config.embedding.model).cyan());
    eprintln!("  Dimension: {}", style(config.embedding.dimension).cyan());

    eprintln!();
    eprintln!("{}", style("Language Model:").bold().yellow());
    eprintln!(
        "  Provider: {}",
        style(format!("{:?}", config.llm.provider)).cyan()
    );
    eprintln!("  Model: {}", style(&config.llm.model).cyan());
    match config.llm.endpoint(&config.ollama) {
        Ok(url) => eprintln!("  Endpoint: {}", style(url).cyan()),
        Err(e) => eprintln!("  Endpoint: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Temperature: {}", style(config.llm.temperature).cyan());
    if config.llm.provider == LlmProvider::Openai {
        eprintln!("  API key variable: {}", style(&config.llm.api_key_env).cyan());
    }

    eprintln!();
    eprintln!("{}", style("Index:").bold().yellow());
    eprintln!("  Top K: {}", style(config.index.top_k).cyan());
    eprintln!("  Batch Size: {}", style(config.index.batch_size).cyan());
    eprintln!(
        "  Rebuild Ratio: {}",
        style(config.index.rebuild_stale_ratio).cyan()
    );
    eprintln!("  Location: {}", style(config.index_dir().display()).cyan());

    eprintln!();
    eprintln!("{}", style("Roots:").bold().yellow());
    let roots = config.corpus.resolve_roots();
    if roots.is_empty() {
        eprintln!("  {}", style("(none found)").dim());
    }
    for root in roots {
        eprintln!("  {}", style(root.display()).cyan());
    }
    eprintln!(
        "  Confirm actions: {}",
        style(config.executor.confirm).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Config {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No existing configuration found. Using defaults.").yellow()
            );
            Config {
                base_dir: config_dir.to_path_buf(),
                ..Config::default()
            }
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            config
        },
    )
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols
        .get(protocol_index)
        .copied()
        .unwrap_or("http")
        .to_string();

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = OllamaConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..OllamaConfig::default()
            };
            temp_config.validate()
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let batch_size: u32 = Input::new()
        .with_prompt("Texts per embedding request")
        .default(ollama.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 1000 {
                Err("Batch size must be 1000 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    ollama.set_protocol(protocol)?;
    ollama.set_host(host)?;
    ollama.set_port(port)?;
    ollama.set_batch_size(batch_size)?;

    Ok(())
}

fn configure_embedding(embedding: &mut EmbeddingConfig) -> Result<()> {
    let providers = &["ollama", "hashed (offline, no model needed)"];
    let provider_index = Select::new()
        .with_prompt("Embedding provider")
        .default(usize::from(embedding.provider == EmbeddingProvider::Hashed))
        .items(providers)
        .interact()?;

    embedding.provider = if provider_index == 1 {
        EmbeddingProvider::Hashed
    } else {
        EmbeddingProvider::Ollama
    };

    if embedding.provider == EmbeddingProvider::Ollama {
        let model: String = Input::new()
            .with_prompt("Embedding model")
            .default(embedding.model.clone())
            .validate_with(|input: &String| non_empty(input))
            .interact_text()?;
        embedding.set_model(model)?;
    }

    let dimension: u32 = Input::new()
        .with_prompt("Embedding dimension")
        .default(embedding.dimension)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if (64..=4096).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 64 and 4096")
            }
        })
        .interact_text()?;
    embedding.set_dimension(dimension)?;

    Ok(())
}

fn configure_llm(llm: &mut LlmConfig) -> Result<()> {
    let providers = &["ollama", "openai-compatible (Groq, OpenAI, ...)"];
    let provider_index = Select::new()
        .with_prompt("Language model provider")
        .default(usize::from(llm.provider == LlmProvider::Openai))
        .items(providers)
        .interact()?;

    llm.provider = if provider_index == 1 {
        LlmProvider::Openai
    } else {
        LlmProvider::Ollama
    };

    let model: String = Input::new()
        .with_prompt("Model")
        .default(llm.model.clone())
        .validate_with(|input: &String| non_empty(input))
        .interact_text()?;
    llm.set_model(model)?;

    if llm.provider == LlmProvider::Openai {
        let base_url: String = Input::new()
            .with_prompt("API base URL")
            .default(
                llm.base_url
                    .clone()
                    .unwrap_or_else(|| LlmConfig::DEFAULT_OPENAI_BASE_URL.to_string()),
            )
            .validate_with(|input: &String| -> Result<(), String> {
                url::Url::parse(input)
                    .map(|_| ())
                    .map_err(|e| format!("Invalid URL: {e}"))
            })
            .interact_text()?;
        llm.base_url = Some(base_url);

        llm.api_key_env = Input::new()
            .with_prompt("Environment variable holding the API key")
            .default(llm.api_key_env.clone())
            .validate_with(|input: &String| non_empty(input))
            .interact_text()?;
    } else {
        llm.base_url = None;
    }

    let temperature: f32 = Input::new()
        .with_prompt("Temperature")
        .default(llm.temperature)
        .validate_with(|input: &f32| -> Result<(), &str> {
            if (0.0..=2.0).contains(input) {
                Ok(())
            } else {
                Err("Temperature must be between 0.0 and 2.0")
            }
        })
        .interact_text()?;
    llm.set_temperature(temperature)?;

    Ok(())
}

fn configure_corpus(corpus: &mut CorpusConfig) -> Result<()> {
    let current = corpus.roots.iter().map(|root| root.display()).join(", ");

    let roots: String = Input::new()
        .with_prompt("Directories to index (comma separated, empty for your user folders)")
        .default(current)
        .allow_empty(true)
        .validate_with(|input: &String| -> Result<(), String> {
            parse_roots(input).map(|_| ())
        })
        .interact_text()?;

    corpus.roots = parse_roots(&roots).map_err(anyhow::Error::msg)?;
    Ok(())
}

fn parse_roots(input: &str) -> Result<Vec<PathBuf>, String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let path = PathBuf::from(part);
            if path.is_absolute() {
                Ok(path)
            } else {
                Err(format!("{part} is not an absolute path"))
            }
        })
        .collect()
}

fn non_empty(input: &str) -> Result<(), &'static str> {
    if input.trim().is_empty() {
        Err("Value cannot be empty")
    } else {
        Ok(())
    }
}

fn test_ollama_connection(ollama: &OllamaConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        ollama.protocol, ollama.host, ollama.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) => (400..500).contains(&code),
        Err(_) => false,
    }
}
