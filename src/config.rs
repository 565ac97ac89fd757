//! Configuration loading for the entity linker.
//!
//! Centralizes environment variable reading into a single struct.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::linker::VerificationPolicy;
use crate::vector_search::qdrant::QdrantConfig;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_LLM_MODEL: &str = "llama3.1";
pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";
pub const DEFAULT_COLLECTION: &str = "entities";
pub const DEFAULT_QDRANT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:3046";
pub const DEFAULT_HTTP_ENDPOINT: &str = "/mcp";

/// Service configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub ollama_url: String,
    pub embedding_model: String,
    pub llm_model: String,

    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection: String,
    /// Named vector to search; `None` uses the collection's default vector.
    pub vector_name: Option<String>,
    pub qdrant_timeout_secs: u64,

    /// Default number of candidates per entity
    pub top_k: usize,
    pub score_threshold: f32,
    pub skip_llm_confidence: Option<f32>,
    pub cross_search_types: HashMap<String, Vec<String>>,
    pub verify_timeout_secs: Option<u64>,

    pub prompts_dir: PathBuf,
    pub http_bind: String,
    pub http_endpoint: String,
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let cross_search_types: HashMap<String, Vec<String>> = match non_empty(lookup("LINK_CROSS_SEARCH_TYPES")) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring invalid LINK_CROSS_SEARCH_TYPES");
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        Self {
            ollama_url: non_empty(lookup("OLLAMA_URL"))
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            embedding_model: non_empty(lookup("OLLAMA_EMBEDDING_MODEL"))
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            llm_model: non_empty(lookup("OLLAMA_LLM_MODEL"))
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            qdrant_url: non_empty(lookup("QDRANT_URL"))
                .unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string()),
            qdrant_api_key: non_empty(lookup("QDRANT_API_KEY")),
            collection: non_empty(lookup("QDRANT_COLLECTION"))
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            vector_name: non_empty(lookup("QDRANT_VECTOR_NAME")),
            qdrant_timeout_secs: parse_or(lookup("QDRANT_TIMEOUT_SECS"), DEFAULT_QDRANT_TIMEOUT_SECS),
            top_k: parse_or(lookup("LINK_TOP_K"), DEFAULT_TOP_K),
            score_threshold: parse_or(lookup("LINK_SCORE_THRESHOLD"), DEFAULT_SCORE_THRESHOLD),
            skip_llm_confidence: lookup("LINK_SKIP_LLM_CONFIDENCE")
                .and_then(|s| s.trim().parse::<f32>().ok())
                .filter(|confidence| *confidence > 0.0),
            cross_search_types,
            verify_timeout_secs: lookup("LINK_VERIFY_TIMEOUT_SECS")
                .and_then(|s| s.trim().parse().ok())
                .filter(|secs| *secs > 0),
            prompts_dir: PathBuf::from(
                non_empty(lookup("PROMPTS_DIR")).unwrap_or_else(|| "./prompts".to_string()),
            ),
            http_bind: non_empty(lookup("MCP_HTTP_BIND"))
                .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string()),
            http_endpoint: non_empty(lookup("MCP_HTTP_ENDPOINT"))
                .unwrap_or_else(|| DEFAULT_HTTP_ENDPOINT.to_string()),
        }
    }

    pub fn qdrant(&self) -> QdrantConfig {
        QdrantConfig {
            base_url: self.qdrant_url.clone(),
            api_key: self.qdrant_api_key.clone(),
            collection: self.collection.clone(),
            vector_name: self.vector_name.clone(),
            timeout: Duration::from_secs(self.qdrant_timeout_secs),
        }
    }

    pub fn verification_policy(&self) -> VerificationPolicy {
        VerificationPolicy {
            call_timeout: self.verify_timeout_secs.map(Duration::from_secs),
            isolate_failures: false,
        }
    }

    /// Build a summary string for startup logs
    pub fn summary(&self) -> String {
        format!(
            "OLLAMA={} LLM={} EMBED={} QDRANT={} COLLECTION={} TOP_K={} THRESHOLD={}",
            self.ollama_url,
            self.llm_model,
            self.embedding_model,
            self.qdrant_url,
            self.collection,
            self.top_k,
            self.score_threshold
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Load a prompt template from `prompts_dir/file_name` or fall back to `default`.
pub fn load_prompt_template(prompts_dir: &Path, file_name: &str, default: &str) -> String {
    let prompt_path = prompts_dir.join(file_name);
    match std::fs::read_to_string(&prompt_path) {
        Ok(template) if !template.trim().is_empty() => {
            tracing::info!("Loaded prompt from {}", prompt_path.display());
            template
        }
        _ => {
            tracing::info!(
                "Using default prompt (no external file found at {})",
                prompt_path.display()
            );
            default.to_string()
        }
    }
}
