//! Vector search abstraction shared by entity linking and document retrieval.
//!
//! Backends return raw JSON payloads wrapped in [`ScoredDocument`]; callers
//! that know the record schema parse them with [`ScoredDocument::parse`] or
//! [`parse_documents`].

pub mod filter;
pub mod qdrant;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use filter::{FilterClause, FilterError, QdrantFilter, compile_filter};
pub use qdrant::Qdrant;

/// Raw record stored alongside a vector.
pub type Payload = serde_json::Value;

/// A retrieved record together with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument<T = Payload> {
    pub document: T,
    pub score: Option<f32>,
}

impl<T> ScoredDocument<T> {
    pub fn new(document: T, score: f32) -> Self {
        Self {
            document,
            score: Some(score),
        }
    }

    pub fn unscored(document: T) -> Self {
        Self {
            document,
            score: None,
        }
    }
}

impl ScoredDocument<Payload> {
    /// Parses the raw payload into a caller-supplied record type.
    pub fn parse<T: DeserializeOwned>(self) -> Result<ScoredDocument<T>> {
        Ok(ScoredDocument {
            document: serde_json::from_value(self.document)?,
            score: self.score,
        })
    }
}

pub fn parse_documents<T: DeserializeOwned>(
    docs: Vec<ScoredDocument<Payload>>,
) -> Result<Vec<ScoredDocument<T>>> {
    docs.into_iter().map(ScoredDocument::parse).collect()
}

/// Indexed text chunk. Chunks of the same source share `source_id`; the
/// chunk with `index == 0` is the canonical representative of its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub index: Option<i64>,
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Filters for a batched search.
#[derive(Debug, Clone, Default)]
pub enum BatchFilters {
    #[default]
    None,
    /// One filter applied to every query.
    Shared(Vec<FilterClause>),
    /// One optional filter per query; must align with the query list.
    PerQuery(Vec<Option<Vec<FilterClause>>>),
}

#[derive(Debug, thiserror::Error)]
pub enum VectorSearchError {
    #[error("batch search got {queries} queries but {filters} filter sets")]
    LengthMismatch { queries: usize, filters: usize },
    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl BatchFilters {
    /// Compiles the filters into one backend filter per query.
    pub fn compile(&self, num_queries: usize) -> Result<Vec<Option<QdrantFilter>>, VectorSearchError> {
        match self {
            BatchFilters::None => Ok(vec![None; num_queries]),
            BatchFilters::Shared(clauses) => {
                let compiled = compile_filter(clauses)?;
                Ok(vec![compiled; num_queries])
            }
            BatchFilters::PerQuery(per_query) => {
                if per_query.len() != num_queries {
                    return Err(VectorSearchError::LengthMismatch {
                        queries: num_queries,
                        filters: per_query.len(),
                    });
                }
                per_query
                    .iter()
                    .map(|clauses| match clauses {
                        Some(clauses) => Ok(compile_filter(clauses)?),
                        None => Ok(None),
                    })
                    .collect()
            }
        }
    }
}

/// Vector-search collaborator.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn retrieve_documents(
        &self,
        query: &str,
        limit: usize,
        filters: &[FilterClause],
    ) -> Result<Vec<ScoredDocument>>;

    /// One ranked list per query, aligned positionally with `queries`.
    async fn batch_retrieve_documents(
        &self,
        queries: &[String],
        limit: usize,
        filters: &BatchFilters,
    ) -> Result<Vec<Vec<ScoredDocument>>>;

    async fn list_documents(&self, limit: usize, filters: &[FilterClause]) -> Result<Vec<Payload>>;
}

/// Keeps results whose score passes `score_threshold`.
///
/// With `require_score`, unscored results are dropped; otherwise they are kept.
pub fn filter_search_results<T>(
    results: impl IntoIterator<Item = ScoredDocument<T>>,
    score_threshold: f32,
    require_score: bool,
) -> impl Iterator<Item = ScoredDocument<T>> {
    results
        .into_iter()
        .filter(move |result| match result.score {
            Some(score) => score >= score_threshold,
            None => !require_score,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scored(id: &str, score: Option<f32>) -> ScoredDocument {
        ScoredDocument {
            document: json!({"id": id}),
            score,
        }
    }

    fn ids(docs: &[ScoredDocument]) -> Vec<&str> {
        docs.iter()
            .map(|d| d.document["id"].as_str().unwrap())
            .collect()
    }

    #[test]
    fn test_filter_search_results_require_score() {
        let docs = vec![
            scored("a", Some(0.9)),
            scored("b", Some(0.5)),
            scored("c", Some(0.4)),
            scored("d", None),
        ];
        let kept: Vec<_> = filter_search_results(docs, 0.5, true).collect();
        assert_eq!(ids(&kept), vec!["a", "b"]);
    }

    #[test]
    fn test_filter_search_results_optional_score_keeps_unscored() {
        let docs = vec![scored("a", Some(0.9)), scored("c", Some(0.4)), scored("d", None)];
        let kept: Vec<_> = filter_search_results(docs, 0.5, false).collect();
        assert_eq!(ids(&kept), vec!["a", "d"]);
    }

    #[test]
    fn test_raising_threshold_never_keeps_more() {
        let docs: Vec<_> = [0.1, 0.35, 0.5, 0.51, 0.8, 0.99]
            .iter()
            .enumerate()
            .map(|(i, s)| scored(&i.to_string(), Some(*s)))
            .collect();

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.2, 0.5, 0.51, 0.9, 1.0] {
            let kept = filter_search_results(docs.clone(), threshold, true).count();
            assert!(kept <= previous, "threshold {threshold} kept more results");
            previous = kept;
        }
    }

    #[test]
    fn test_batch_filters_per_query_length_mismatch() {
        let filters = BatchFilters::PerQuery(vec![None]);
        let err = filters.compile(2).unwrap_err();
        assert!(matches!(
            err,
            VectorSearchError::LengthMismatch {
                queries: 2,
                filters: 1
            }
        ));
    }

    #[test]
    fn test_batch_filters_shared_and_none() {
        let clause: FilterClause =
            serde_json::from_value(json!({"key": "type", "match": {"value": "Person"}})).unwrap();
        let shared = BatchFilters::Shared(vec![clause]).compile(3).unwrap();
        assert_eq!(shared.len(), 3);
        assert!(shared.iter().all(|f| f.is_some()));

        let none = BatchFilters::None.compile(2).unwrap();
        assert_eq!(none, vec![None, None]);

        let empty_shared = BatchFilters::Shared(vec![]).compile(1).unwrap();
        assert_eq!(empty_shared, vec![None]);
    }

    #[test]
    fn test_document_parse_keeps_extra_fields() {
        let doc = ScoredDocument::new(
            json!({"id": "d1", "source_id": "s1", "index": 0, "content": "text", "title": "T"}),
            0.7,
        );
        let parsed = doc.parse::<Document>().unwrap();
        assert_eq!(parsed.score, Some(0.7));
        assert_eq!(parsed.document.id.as_deref(), Some("d1"));
        assert_eq!(parsed.document.index, Some(0));
        assert_eq!(parsed.document.extra["title"], "T");
    }
}
