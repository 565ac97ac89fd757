use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::conversation::Conversation;
use crate::postprocess::{PostProcessOptions, SortFn, post_process_documents};
use crate::vector_search::{Document, FilterClause, VectorSearch, parse_documents};

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveParams {
    pub top_k: usize,
    pub score_threshold: f32,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
}

/// Document retrieval for RAG: search with the last conversation message,
/// then post-process and keep the best `top_k`.
pub struct VectorSearchRetriever {
    vector_search: Arc<dyn VectorSearch>,
    filters: Vec<FilterClause>,
    max_length_per_doc: Option<usize>,
    merge_splits: bool,
    sort_by: Option<SortFn>,
}

impl VectorSearchRetriever {
    pub fn new(vector_search: Arc<dyn VectorSearch>) -> Self {
        Self {
            vector_search,
            filters: Vec::new(),
            max_length_per_doc: None,
            merge_splits: true,
            sort_by: None,
        }
    }

    /// Filters applied to every retrieval in addition to the request's own.
    pub fn with_filters(mut self, filters: Vec<FilterClause>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_max_length_per_doc(mut self, max_length: usize) -> Self {
        self.max_length_per_doc = Some(max_length);
        self
    }

    pub fn with_merge_splits(mut self, merge_splits: bool) -> Self {
        self.merge_splits = merge_splits;
        self
    }

    pub fn with_sort_by(mut self, sort_by: SortFn) -> Self {
        self.sort_by = Some(sort_by);
        self
    }

    pub async fn retrieve(
        &self,
        conversation: &Conversation,
        params: &RetrieveParams,
    ) -> Result<Vec<Document>> {
        let query = conversation
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        self.retrieve_for_query(query, params).await
    }

    pub async fn retrieve_for_query(&self, query: &str, params: &RetrieveParams) -> Result<Vec<Document>> {
        let start = Instant::now();
        let filters: Vec<FilterClause> = params
            .filters
            .iter()
            .chain(self.filters.iter())
            .cloned()
            .collect();

        let scored = self
            .vector_search
            .retrieve_documents(query, params.top_k, &filters)
            .await?;
        tracing::info!(query = %query, num_documents = scored.len(), "Retrieved documents");

        let options = PostProcessOptions {
            score_threshold: params.score_threshold,
            require_score: false,
            max_length_per_doc: self.max_length_per_doc,
            merge_splits: self.merge_splits,
            sort_by: self.sort_by.clone(),
        };
        let mut docs = post_process_documents(parse_documents(scored)?, &options);
        tracing::info!(
            num_remaining_documents = docs.len(),
            top_k = params.top_k,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Post processing of documents, will only keep top k documents"
        );

        docs.truncate(params.top_k);
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_search::{BatchFilters, Payload, ScoredDocument};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedSearch {
        docs: Vec<ScoredDocument>,
        seen_filters: Mutex<Vec<FilterClause>>,
    }

    #[async_trait]
    impl VectorSearch for FixedSearch {
        async fn retrieve_documents(
            &self,
            _query: &str,
            _limit: usize,
            filters: &[FilterClause],
        ) -> Result<Vec<ScoredDocument>> {
            *self.seen_filters.lock().unwrap() = filters.to_vec();
            Ok(self.docs.clone())
        }

        async fn batch_retrieve_documents(
            &self,
            _queries: &[String],
            _limit: usize,
            _filters: &BatchFilters,
        ) -> Result<Vec<Vec<ScoredDocument>>> {
            anyhow::bail!("batch search not used")
        }

        async fn list_documents(&self, _limit: usize, _filters: &[FilterClause]) -> Result<Vec<Payload>> {
            Ok(vec![])
        }
    }

    fn chunk(id: &str, source_id: &str, index: i64, score: Option<f32>) -> ScoredDocument {
        ScoredDocument {
            document: json!({"id": id, "source_id": source_id, "index": index, "content": id}),
            score,
        }
    }

    #[tokio::test]
    async fn test_retrieve_merges_filters_and_truncates() {
        let search = Arc::new(FixedSearch {
            docs: vec![
                chunk("a-1", "a", 1, Some(0.9)),
                chunk("b-0", "b", 0, Some(0.8)),
                chunk("c-0", "c", 0, None),
                chunk("d-0", "d", 0, Some(0.1)),
            ],
            seen_filters: Mutex::new(vec![]),
        });
        let retriever = VectorSearchRetriever::new(search.clone())
            .with_filters(vec![FilterClause::equals("lang", "en")]);

        let params = RetrieveParams {
            top_k: 2,
            score_threshold: 0.5,
            filters: vec![FilterClause::one_of("type", ["doc"])],
        };
        let docs = retriever
            .retrieve(&Conversation::from_user("what is a?"), &params)
            .await
            .unwrap();

        let ids: Vec<_> = docs.iter().map(|d| d.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a-1", "b-0"]);
        assert_eq!(
            *search.seen_filters.lock().unwrap(),
            vec![
                FilterClause::one_of("type", ["doc"]),
                FilterClause::equals("lang", "en")
            ]
        );
    }

    #[tokio::test]
    async fn test_retrieve_keeps_unscored_documents() {
        let search = Arc::new(FixedSearch {
            docs: vec![chunk("c-0", "c", 0, None)],
            seen_filters: Mutex::new(vec![]),
        });
        let retriever = VectorSearchRetriever::new(search);
        let params: RetrieveParams =
            serde_json::from_value(json!({"top_k": 3, "score_threshold": 0.9})).unwrap();

        let docs = retriever.retrieve_for_query("q", &params).await.unwrap();
        assert_eq!(docs.len(), 1);
    }
}
