use std::fmt::Write;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CompletionError;

const DEFAULT_INSTRUCTION: &str = "You match food ingredient names to entries in a nutrition \
database. Pick the candidate that is the same food as the ingredient, preferring plain, \
unprocessed forms over branded, dried, or baby-food variants. Answer with the candidate id \
only, or `none` if no candidate is the same food.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCandidate {
    pub id: i64,
    pub name: String,
}

/// What the model is asked: pick one of `candidates` for `cleaned_name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub cleaned_name: String,
    pub candidates: Vec<CompletionCandidate>,
    pub instruction: String,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(cleaned_name: impl Into<String>, candidates: Vec<CompletionCandidate>) -> Self {
        Self {
            cleaned_name: cleaned_name.into(),
            candidates,
            instruction: DEFAULT_INSTRUCTION.to_string(),
        }
    }

    /// User-turn text listing the candidates.
    #[must_use]
    pub fn prompt(&self) -> String {
        let mut out = format!("Ingredient: {}\nCandidates:\n", self.cleaned_name);
        for c in &self.candidates {
            let _ = writeln!(out, "{}: {}", c.id, c.name);
        }
        out
    }

    #[must_use]
    pub fn offers(&self, id: i64) -> bool {
        self.candidates.iter().any(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionChoice {
    Candidate(i64),
    None,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn choose(&self, request: &CompletionRequest)
    -> Result<CompletionChoice, CompletionError>;
}

/// Parse a model answer: a bare id, `none`, or `{"id": ...}`.
pub fn parse_choice(text: &str) -> Result<CompletionChoice, CompletionError> {
    let trimmed = text
        .trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '.')
        .trim();

    if trimmed.eq_ignore_ascii_case("none") || trimmed.eq_ignore_ascii_case("null") {
        return Ok(CompletionChoice::None);
    }
    if let Ok(id) = trimmed.parse::<i64>() {
        return Ok(CompletionChoice::Candidate(id));
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        match value.get("id") {
            Some(serde_json::Value::Null) => return Ok(CompletionChoice::None),
            Some(serde_json::Value::Number(n)) => {
                if let Some(id) = n.as_i64() {
                    return Ok(CompletionChoice::Candidate(id));
                }
            }
            Some(serde_json::Value::String(s)) if s.eq_ignore_ascii_case("none") => {
                return Ok(CompletionChoice::None);
            }
            _ => {}
        }
    }
    Err(CompletionError::InvalidModelResponse(text.chars().take(200).collect()))
}
