use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::ollama;

/// Text embedding collaborator. `embed_texts` preserves input order and length.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Serialize)]
#[serde(untagged)]
enum OllamaEmbeddingRequest<'a> {
    Single { model: &'a str, input: &'a str },
    Batch { model: &'a str, input: &'a [String] },
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

const QUERY_CACHE_SIZE: usize = 1000;
const BATCH_TIMEOUT_SECS: u64 = 300;

/// Embedding service using the Ollama API with LRU caching of single-text queries.
pub struct EmbeddingService {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    /// Connects to Ollama and verifies that `model` is available.
    pub async fn connect(ollama_url: &str, model: &str) -> Result<Self> {
        let service = Self::new(ollama_url, model)?;
        ollama::verify_model(&service.client, &service.ollama_url, &service.model).await?;
        Ok(service)
    }

    /// Builds the service without touching the network.
    pub fn new(ollama_url: &str, model: &str) -> Result<Self> {
        let ollama_url = ollama::normalize_base_url(ollama_url);
        tracing::info!("Ollama URL: {}", ollama_url);
        tracing::info!("Ollama embedding model: {}", model);

        let cache_size =
            NonZeroUsize::new(QUERY_CACHE_SIZE).context("query cache size must be non-zero")?;

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(BATCH_TIMEOUT_SECS))
                .build()
                .context("Failed to build HTTP client")?,
            ollama_url,
            model: model.to_string(),
            query_cache: RwLock::new(LruCache::new(cache_size)),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest::Single {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await
            .context("Failed to contact Ollama embedding endpoint")?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Ollama API error: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }
        let embedding_response: OllamaEmbeddingResponse = response.json().await?;
        if let Some(embedding) = embedding_response.embedding {
            Ok(embedding)
        } else if let Some(embeddings) = embedding_response.embeddings {
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Empty embeddings array from Ollama"))
        } else {
            Err(anyhow::anyhow!("No embedding returned from Ollama"))
        }
    }

    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = OllamaEmbeddingRequest::Batch {
            model: &self.model,
            input: texts,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await
            .context("Failed to contact Ollama embedding endpoint")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Ollama API error: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }

        let embedding_response: OllamaEmbeddingResponse = response.json().await?;
        if let Some(embeddings) = embedding_response.embeddings {
            if embeddings.len() == texts.len() {
                return Ok(embeddings);
            }
            tracing::warn!(
                "Batch embedding returned {} embeddings for {} texts, falling back to sequential",
                embeddings.len(),
                texts.len()
            );
        } else if embedding_response.embedding.is_some() {
            tracing::warn!(
                "Model '{}' doesn't support batch embeddings, falling back to sequential",
                self.model
            );
        }

        let mut result = Vec::with_capacity(texts.len());
        for text in texts {
            result.push(self.request_embedding(text).await?);
        }
        Ok(result)
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.write().await.get(text) {
            return Ok(cached.clone());
        }

        let start = Instant::now();
        let embedding = self.request_embedding(text).await?;
        tracing::debug!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Embed text"
        );

        self.query_cache
            .write()
            .await
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();
        let embeddings = self.request_batch(texts).await?;
        tracing::info!(
            model = %self.model,
            num_texts = texts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Embed texts"
        );
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_request_serializes_input_array() {
        let texts = vec!["Alice".to_string(), "Bob".to_string()];
        let request = OllamaEmbeddingRequest::Batch {
            model: "nomic-embed-text",
            input: &texts,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"model": "nomic-embed-text", "input": ["Alice", "Bob"]})
        );
    }

    #[test]
    fn test_response_accepts_both_shapes() {
        let single: OllamaEmbeddingResponse =
            serde_json::from_str(r#"{"embedding": [0.1, 0.2]}"#).unwrap();
        assert_eq!(single.embedding, Some(vec![0.1, 0.2]));

        let batch: OllamaEmbeddingResponse =
            serde_json::from_str(r#"{"embeddings": [[0.1], [0.2]]}"#).unwrap();
        assert_eq!(batch.embeddings.map(|e| e.len()), Some(2));
    }

    #[tokio::test]
    async fn test_empty_batch_skips_network() {
        let service = EmbeddingService::new("http://127.0.0.1:9", "nomic-embed-text").unwrap();
        let embeddings = service.embed_texts(&[]).await.unwrap();
        assert!(embeddings.is_empty());
        assert_eq!(service.model_name(), "nomic-embed-text");
    }
}
