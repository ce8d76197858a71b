// Configuration management module
// Loads, validates and interactively edits the TOML settings file

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    Config, ConfigError, CorpusConfig, EmbeddingConfig, EmbeddingProvider, ExecutorConfig,
    IndexConfig, LlmConfig, LlmProvider, OllamaConfig,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
