use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::conversation::Conversation;
use crate::llm::LanguageModel;
use crate::prompt::fill_template;

/// A typed mention extracted from text, pending normalization.
///
/// `name` is kept as raw JSON because extractors can emit non-string names;
/// only string names are linkable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: serde_json::Value,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, name: impl Into<serde_json::Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }

    pub fn name_str(&self) -> Option<&str> {
        self.name.as_str()
    }
}

fn inline_code_regex() -> &'static Regex {
    static INLINE: OnceLock<Regex> = OnceLock::new();
    INLINE.get_or_init(|| Regex::new(r"`(.+)`").expect("valid inline code regex"))
}

fn fenced_block_regex() -> &'static Regex {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    FENCED.get_or_init(|| Regex::new(r"(?s)```(?:json)?(.+)```").expect("valid fenced block regex"))
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn parse_json(s: &str) -> Option<serde_json::Value> {
    serde_json::from_str(s.trim()).ok()
}

/// JSON wrapped in single backticks, e.g. `` `{"a": 1}` ``.
pub fn extract_inline_json(s: &str) -> Option<serde_json::Value> {
    let candidate = inline_code_regex()
        .captures(s)
        .and_then(|c| c.get(1))
        .map_or(s, |m| m.as_str());
    parse_json(candidate)
}

/// JSON inside a fenced code block, optionally tagged `json`.
pub fn extract_multi_line_json(s: &str) -> Option<serde_json::Value> {
    let candidate = fenced_block_regex()
        .captures(s)
        .and_then(|c| c.get(1))
        .map_or(s, |m| m.as_str());
    parse_json(candidate)
}

/// Best-effort JSON extraction from free-form model output.
///
/// Tries inline code, fenced blocks, then the raw string; empty results
/// (`{}`, `[]`, `""`, `0`, `null`) count as misses.
pub fn extract_json(s: &str) -> Option<serde_json::Value> {
    [
        extract_inline_json(s),
        extract_multi_line_json(s),
        parse_json(s),
    ]
    .into_iter()
    .flatten()
    .find(is_truthy)
}

/// Converts a `{type: name | [names]}` object into entities.
///
/// String names are trimmed and dropped when empty; other scalar names are kept as-is.
pub fn entities_from_json(data: &serde_json::Value) -> Vec<Entity> {
    let Some(object) = data.as_object() else {
        return vec![];
    };

    let mut entities = Vec::new();
    for (entity_type, names) in object {
        let names: Vec<&serde_json::Value> = match names {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        for name in names {
            match name {
                serde_json::Value::String(s) => {
                    let trimmed = s.trim();
                    if !trimmed.is_empty() {
                        entities.push(Entity::new(entity_type.clone(), trimmed));
                    }
                }
                serde_json::Value::Null => {}
                other => entities.push(Entity::new(entity_type.clone(), other.clone())),
            }
        }
    }
    entities
}

pub const DEFAULT_EXTRACTOR_PROMPT: &str = r#"Extract the named entities mentioned in the text below.

Text:
{text}

Answer with a single JSON object mapping each entity type to a list of names,
for example {"Person": ["Alice"], "Organization": ["Acme Corp"]}.
Answer with {} when there are no entities."#;

/// LLM-driven entity extraction.
pub struct Extractor {
    llm: Arc<dyn LanguageModel>,
    prompt_template: String,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LanguageModel>, prompt_template: impl Into<String>) -> Self {
        Self {
            llm,
            prompt_template: prompt_template.into(),
        }
    }

    fn format_prompt(&self, text: &str) -> String {
        fill_template(&self.prompt_template, &[("text", text)])
    }

    /// Extracts entities from the last message of `conversation`.
    pub async fn run(&self, conversation: &Conversation) -> Result<Vec<Entity>> {
        let text = conversation
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        self.extract(text).await
    }

    pub async fn extract(&self, text: &str) -> Result<Vec<Entity>> {
        let content = self.format_prompt(text);
        tracing::debug!(content = %content, "Formatted extraction prompt");

        let response = self.llm.response(&Conversation::from_user(content)).await?;
        tracing::debug!(response = %response, "LLM response for extraction");

        let Some(data) = extract_json(&response) else {
            tracing::warn!(response = %response, "No JSON found in extraction response");
            return Ok(vec![]);
        };

        let entities = entities_from_json(&data);
        tracing::info!(entities = ?entities, "LLM extracted entities");
        Ok(entities)
    }
}
