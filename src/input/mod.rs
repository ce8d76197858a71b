//! Where user requests come from.
//!
//! The assistant only sees [`RequestSource`]. Errors follow the taxonomy of a
//! speech front end so a transcribing source can be dropped in without
//! touching the session loop.

use std::io::BufRead;

use console::Term;
use dialoguer::Input;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    #[error("No input device available")]
    NoMicrophone,

    #[error("Timed out waiting for input")]
    CaptureTimeout,

    #[error("Could not understand the request")]
    Unintelligible,

    #[error("Input service error: {0}")]
    Service(String),
}

impl TranscriptionError {
    /// Whether asking again may succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CaptureTimeout | Self::Unintelligible)
    }
}

/// A stream of natural-language requests.
pub trait RequestSource {
    /// The next request, or `None` once the user is done.
    fn next_request(&mut self) -> Result<Option<String>, TranscriptionError>;
}

/// Words that end a session.
const EXIT_WORDS: [&str; 2] = ["exit", "quit"];

/// Trim `line` and map it to a request.
fn interpret(line: &str) -> Result<Option<String>, TranscriptionError> {
    let request = line.trim();
    if request.is_empty() {
        return Err(TranscriptionError::Unintelligible);
    }

    if EXIT_WORDS
        .iter()
        .any(|word| request.eq_ignore_ascii_case(word))
    {
        debug!("Received exit command");
        return Ok(None);
    }

    Ok(Some(request.to_string()))
}

/// Prompts on the terminal.
#[derive(Debug)]
pub struct ConsoleSource {
    term: Term,
    prompt: String,
}

impl ConsoleSource {
    #[inline]
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
            prompt: "What should I do".to_string(),
        }
    }

    #[inline]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

impl Default for ConsoleSource {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSource for ConsoleSource {
    #[inline]
    fn next_request(&mut self) -> Result<Option<String>, TranscriptionError> {
        if !self.term.is_term() {
            return Err(TranscriptionError::NoMicrophone);
        }

        let line: String = Input::new()
            .with_prompt(self.prompt.as_str())
            .allow_empty(true)
            .interact_text_on(&self.term)
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;

        interpret(&line)
    }
}

/// Reads one request per line, for piped input.
#[derive(Debug)]
pub struct LineSource<R> {
    reader: R,
}

impl<R: BufRead> LineSource<R> {
    #[inline]
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> RequestSource for LineSource<R> {
    #[inline]
    fn next_request(&mut self) -> Result<Option<String>, TranscriptionError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;

        if read == 0 {
            return Ok(None);
        }

        interpret(&line)
    }
}
