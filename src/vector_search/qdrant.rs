use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    BatchFilters, FilterClause, Payload, QdrantFilter, ScoredDocument, VectorSearch,
    compile_filter,
};
use crate::embeddings::Embedder;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum QueryVector {
    Plain(Vec<f32>),
    Named { name: String, vector: Vec<f32> },
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    vector: QueryVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<QdrantFilter>,
    limit: usize,
    with_payload: bool,
}

#[derive(Debug, Serialize)]
struct SearchBatchRequest {
    searches: Vec<SearchRequest>,
}

#[derive(Debug, Serialize)]
struct ScrollRequest {
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<QdrantFilter>,
    with_payload: bool,
    with_vector: bool,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    #[allow(dead_code)]
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<PointRecord>,
}

#[derive(Debug, Deserialize)]
struct PointRecord {
    #[serde(default)]
    payload: Option<Payload>,
}

impl From<ScoredPoint> for ScoredDocument {
    fn from(point: ScoredPoint) -> Self {
        ScoredDocument::new(point.payload.unwrap_or(Payload::Null), point.score)
    }
}

/// Connection settings for a Qdrant collection.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub collection: String,
    /// Name of the vector to search when the collection stores named vectors.
    pub vector_name: Option<String>,
    pub timeout: Duration,
}

/// Qdrant REST backend. Queries are embedded with the supplied [`Embedder`].
pub struct Qdrant {
    client: reqwest::Client,
    config: QdrantConfig,
    embedder: Arc<dyn Embedder>,
}

impl Qdrant {
    pub fn new(config: QdrantConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            config: QdrantConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            embedder,
        })
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    fn query_vector(&self, vector: Vec<f32>) -> QueryVector {
        match &self.config.vector_name {
            Some(name) => QueryVector::Named {
                name: name.clone(),
                vector,
            },
            None => QueryVector::Plain(vector),
        }
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!(
            "{}/collections/{}/points/{}",
            self.config.base_url, self.config.collection, path
        );
        let mut request = self.client.post(&url).json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("api-key", api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to contact Qdrant at {url}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Qdrant API error: {} - {}", status, body));
        }

        let payload: QdrantResponse<T> = response
            .json()
            .await
            .context("Failed to parse Qdrant response")?;
        Ok(payload.result)
    }
}

fn log_retrieved(query: &str, docs: &[ScoredDocument]) {
    let ids: Vec<String> = docs
        .iter()
        .map(|d| format!("{}:{:.3}", d.document["id"], d.score.unwrap_or_default()))
        .collect();
    tracing::info!(
        query = %query,
        num_documents = docs.len(),
        ids = ?ids,
        "Retrieved documents"
    );
}

#[async_trait]
impl VectorSearch for Qdrant {
    async fn retrieve_documents(
        &self,
        query: &str,
        limit: usize,
        filters: &[FilterClause],
    ) -> Result<Vec<ScoredDocument>> {
        let start = Instant::now();
        let filter = compile_filter(filters)?;
        tracing::info!(query_filter = ?filter, "Parsed search filters");

        let vector = self.embedder.embed_text(query).await?;
        let request = SearchRequest {
            vector: self.query_vector(vector),
            filter,
            limit,
            with_payload: true,
        };
        let points: Vec<ScoredPoint> = self.post("search", &request).await?;
        let docs: Vec<ScoredDocument> = points.into_iter().map(Into::into).collect();

        log_retrieved(query, &docs);
        tracing::info!(
            task = "retrieve_documents",
            limit,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Execute time"
        );
        Ok(docs)
    }

    async fn batch_retrieve_documents(
        &self,
        queries: &[String],
        limit: usize,
        filters: &BatchFilters,
    ) -> Result<Vec<Vec<ScoredDocument>>> {
        let start = Instant::now();
        let query_filters = filters.compile(queries.len())?;
        tracing::info!(
            query_filters = ?query_filters,
            collection_name = %self.config.collection,
            "Parsed batch search filters"
        );

        if queries.is_empty() {
            return Ok(vec![]);
        }

        let vectors = self.embedder.embed_texts(queries).await?;
        if vectors.len() != queries.len() {
            return Err(anyhow::anyhow!(
                "Embedder returned {} vectors for {} queries",
                vectors.len(),
                queries.len()
            ));
        }

        let searches = vectors
            .into_iter()
            .zip(query_filters)
            .map(|(vector, filter)| SearchRequest {
                vector: self.query_vector(vector),
                filter,
                limit,
                with_payload: true,
            })
            .collect();
        let batches: Vec<Vec<ScoredPoint>> = self
            .post("search/batch", &SearchBatchRequest { searches })
            .await?;
        if batches.len() != queries.len() {
            return Err(anyhow::anyhow!(
                "Qdrant returned {} result lists for {} queries",
                batches.len(),
                queries.len()
            ));
        }

        let results: Vec<Vec<ScoredDocument>> = batches
            .into_iter()
            .map(|points| points.into_iter().map(Into::into).collect())
            .collect();
        for (query, docs) in queries.iter().zip(&results) {
            log_retrieved(query, docs);
        }

        tracing::info!(
            task = "batch_retrieve_documents",
            num_queries = queries.len(),
            limit,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Execute time"
        );
        Ok(results)
    }

    async fn list_documents(&self, limit: usize, filters: &[FilterClause]) -> Result<Vec<Payload>> {
        let start = Instant::now();
        let filter = compile_filter(filters)?;
        tracing::info!(query_filter = ?filter, "Parsed listing filters");

        let request = ScrollRequest {
            limit,
            filter,
            with_payload: true,
            with_vector: false,
        };
        let result: ScrollResult = self.post("scroll", &request).await?;

        tracing::info!(
            task = "list_documents",
            limit,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Execute time"
        );
        Ok(result
            .points
            .into_iter()
            .map(|p| p.payload.unwrap_or(Payload::Null))
            .collect())
    }
}
