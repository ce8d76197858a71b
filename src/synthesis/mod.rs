//! Turns a request plus retrieved paths into a validated [`ActionDescriptor`].

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::fmt::Write as _;

use anyhow::Result as AnyResult;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::action::{ActionDescriptor, Capability, Operation};
use crate::config::Config;
use crate::index::RetrievalHit;
use crate::llm::{ChatRequest, LanguageModel, create_language_model};

const SYSTEM_PROMPT: &str = r#"You translate filesystem requests into a single JSON action.

Respond with ONLY a JSON object with exactly these fields:
- "operations": non-empty array of steps, executed in order
- "explanation": one or two sentences describing what the action does
- "capabilities": array of the permissions the steps need, chosen from
  "create", "write", "read", "move", "delete"

Each step is an object whose "op" field is one of:
- {"op": "create_file", "path": P, "content": TEXT, "overwrite": false}   needs create (and write when overwrite is true)
- {"op": "create_dir", "path": P}                                          needs create
- {"op": "write_file", "path": P, "content": TEXT, "append": false}        needs write
- {"op": "read_file", "path": P}                                           needs read
- {"op": "move", "from": P, "to": P}                                       needs move
- {"op": "copy", "from": P, "to": P}                                       needs read and create
- {"op": "delete", "path": P, "recursive": false}                          needs delete

Rules:
- Use absolute paths. Anchor them on the context paths that match the request.
- Declare every capability the steps need and nothing else.
- Never invent operations outside this list."#;

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The model answered, but not with a usable action.
    #[error("Model response is not a valid action: {reason}")]
    InvalidResponse { reason: String, raw: String },

    #[error("Language model request failed: {0}")]
    ServiceFailure(#[source] anyhow::Error),
}

/// Wire shape of a descriptor before validation.
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    operations: Vec<Operation>,
    explanation: String,
    capabilities: BTreeSet<Capability>,
}

pub struct ActionSynthesizer {
    model: Box<dyn LanguageModel>,
    temperature: f32,
    max_tokens: u32,
}

impl std::fmt::Debug for ActionSynthesizer {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSynthesizer")
            .field("model", &self.model.model_name())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl ActionSynthesizer {
    #[inline]
    pub fn new(model: Box<dyn LanguageModel>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model,
            temperature,
            max_tokens,
        }
    }

    #[inline]
    pub fn from_config(config: &Config) -> AnyResult<Self> {
        Ok(Self::new(
            create_language_model(config)?,
            config.llm.temperature,
            config.llm.max_tokens,
        ))
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Ask the model for an action grounded in `context`.
    #[inline]
    pub fn synthesize(
        &self,
        request: &str,
        context: &[RetrievalHit],
    ) -> Result<ActionDescriptor, SynthesisError> {
        let chat = self.prompt(request, context);

        debug!(
            "Synthesizing action with {} for request with {} context paths",
            self.model.model_name(),
            context.len()
        );

        let raw = self
            .model
            .complete(&chat)
            .map_err(SynthesisError::ServiceFailure)?;

        parse_descriptor(&raw).inspect_err(|e| warn!("{e}"))
    }

    /// The chat request sent for `request`.
    #[inline]
    pub fn prompt(&self, request: &str, context: &[RetrievalHit]) -> ChatRequest {
        ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: user_prompt(request, context),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

fn user_prompt(request: &str, context: &[RetrievalHit]) -> String {
    let mut prompt = String::from("Context (paths on this machine, most similar first):\n");
    for (rank, hit) in context.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "{}. {} (similarity {:.2})",
            rank + 1,
            hit.path,
            hit.similarity()
        );
    }
    let _ = write!(prompt, "\nUser request: {}", request.trim());
    prompt
}

/// Parse and validate the first JSON object in a model reply that has the
/// shape of an action.
#[inline]
pub fn parse_descriptor(raw: &str) -> Result<ActionDescriptor, SynthesisError> {
    let invalid = |reason: String| SynthesisError::InvalidResponse {
        reason,
        raw: raw.to_string(),
    };

    // Reported when no candidate fits: the error of the longest one.
    let mut closest: Option<(usize, serde_json::Error)> = None;

    for object in json_object_candidates(raw) {
        match serde_json::from_str::<RawDescriptor>(object) {
            Ok(parsed) => {
                let descriptor = ActionDescriptor {
                    operations: parsed.operations,
                    explanation: parsed.explanation.trim().to_string(),
                    capabilities: parsed.capabilities,
                };
                descriptor.validate().map_err(invalid)?;
                return Ok(descriptor);
            }
            Err(e) => {
                if closest.as_ref().is_none_or(|(len, _)| object.len() > *len) {
                    closest = Some((object.len(), e));
                }
            }
        }
    }

    Err(invalid(match closest {
        Some((_, e)) => format!("malformed action: {e}"),
        None => "no JSON object found".to_string(),
    }))
}

/// The first balanced `{...}` span of `text`.
#[inline]
pub fn extract_json_object(text: &str) -> Option<&str> {
    json_object_candidates(text).next()
}

/// Every balanced `{...}` span of `text`, ordered by opening brace. Nested
/// spans are yielded after the span that encloses them.
#[inline]
pub fn json_object_candidates(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .filter(|&(_, c)| c == '{')
        .filter_map(|(start, _)| balanced_object(text.get(start..)?))
}

/// The balanced object at the start of `text`, which begins with `{`.
///
/// Braces inside JSON strings (including escaped quotes) are not counted.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return text.get(..=offset);
                }
            }
            _ => {}
        }
    }

    None
}
