use thiserror::Error;

pub type Result<T> = std::result::Result<T, PilotError>;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Index error: {0}")]
    Index(#[from] index::IndexError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] synthesis::SynthesisError),

    #[error("Execution error: {0}")]
    Execution(#[from] executor::ExecutionError),

    #[error("Input error: {0}")]
    Transcription(#[from] input::TranscriptionError),

    #[error("Assistant is not ready (currently {0})")]
    NotReady(orchestrator::AssistantState),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PilotError {
    /// Short text for the person at the terminal. The full chain goes to the log.
    #[inline]
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(e) => format!("Configuration problem: {e}"),
            Self::Index(index::IndexError::Embedding(_)) => {
                "Could not reach the embedding model. Is it running?".to_string()
            }
            Self::Index(_) => "The path index is unavailable. Try `pathpilot index build`.".to_string(),
            Self::Synthesis(synthesis::SynthesisError::InvalidResponse { reason, .. }) => {
                format!("The model's answer was not a usable action ({reason}). Try rephrasing.")
            }
            Self::Synthesis(synthesis::SynthesisError::ServiceFailure(_)) => {
                "The language model could not be reached. Please try again.".to_string()
            }
            Self::Execution(e) if e.partially_applied() && e.step() > 1 => format!(
                "{e}. Steps 1 to {} were applied, step {} may be partly applied, and nothing has been undone.",
                e.step() - 1,
                e.step()
            ),
            Self::Execution(e) if e.partially_applied() => {
                format!("{e}. The step may be partly applied and nothing has been undone.")
            }
            Self::Execution(e) => format!("{e}. Nothing was changed."),
            Self::Transcription(e) => e.to_string(),
            Self::NotReady(state) => format!("The assistant is busy ({state})."),
            Self::Io(e) => format!("I/O failure: {e}"),
            Self::Other(e) => e.to_string(),
        }
    }
}

pub mod action;
pub mod commands;
pub mod config;
pub mod corpus;
pub mod embeddings;
pub mod executor;
pub mod http;
pub mod index;
pub mod input;
pub mod llm;
pub mod orchestrator;
pub mod synthesis;
