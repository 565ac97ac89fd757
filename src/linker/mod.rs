//! Entity linking: candidate retrieval, confidence shortcut and model verification.
//!
//! Every input entity ends up in exactly one of the response lists.

pub mod disambiguation;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::conversation::Conversation;
use crate::extractor::Entity;
use crate::llm::LanguageModel;
use crate::vector_search::{
    BatchFilters, FilterClause, Payload, ScoredDocument, VectorSearch, filter_search_results,
};

pub use disambiguation::{
    CandidateFormatFn, Choice, DEFAULT_LINKER_PROMPT, DisambiguationResult, Disambiguator,
    EntityWithCandidates, VerificationPolicy, parse_choice,
};

/// An entity paired with the knowledge-base record it was linked to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedEntity {
    #[serde(flatten)]
    pub entity: Entity,
    pub metadata: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkerResponse {
    pub linked_entities: Vec<LinkedEntity>,
    pub unlinked_entities: Vec<Entity>,
    /// Entities whose verification answer could not be interpreted.
    #[serde(default)]
    pub unresolved_entities: Vec<Entity>,
}

impl LinkerResponse {
    pub fn len(&self) -> usize {
        self.linked_entities.len() + self.unlinked_entities.len() + self.unresolved_entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-type transform of an entity's thresholded candidates, e.g. re-ranking or pruning.
pub type CandidatePostProcessFn = Arc<dyn Fn(&Entity, Vec<Payload>) -> Vec<Payload> + Send + Sync>;

/// Outcome of candidate retrieval, before any model call.
#[derive(Debug, Default)]
struct CandidateRetrieval {
    pending: Vec<EntityWithCandidates>,
    linked: Vec<LinkedEntity>,
    unlinked: Vec<Entity>,
}

pub struct LinkerBuilder {
    vector_search: Arc<dyn VectorSearch>,
    llm: Arc<dyn LanguageModel>,
    prompt_template: String,
    cross_search_types: HashMap<String, Vec<String>>,
    candidate_postprocess_fns: HashMap<String, CandidatePostProcessFn>,
    candidate_format: Option<CandidateFormatFn>,
    skip_llm_check_confidence: Option<f32>,
    policy: VerificationPolicy,
}

impl LinkerBuilder {
    pub fn new(vector_search: Arc<dyn VectorSearch>, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            vector_search,
            llm,
            prompt_template: DEFAULT_LINKER_PROMPT.to_string(),
            cross_search_types: HashMap::new(),
            candidate_postprocess_fns: HashMap::new(),
            candidate_format: None,
            skip_llm_check_confidence: None,
            policy: VerificationPolicy::default(),
        }
    }

    pub fn prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Extra candidate types searched for entities of each type.
    pub fn cross_search_types(mut self, types: HashMap<String, Vec<String>>) -> Self {
        self.cross_search_types = types;
        self
    }

    pub fn candidate_postprocess_fn(
        mut self,
        entity_type: impl Into<String>,
        f: CandidatePostProcessFn,
    ) -> Self {
        self.candidate_postprocess_fns.insert(entity_type.into(), f);
        self
    }

    pub fn candidate_format(mut self, f: CandidateFormatFn) -> Self {
        self.candidate_format = Some(f);
        self
    }

    /// Links without a model call when exactly one candidate scores strictly above `confidence`.
    /// A non-positive confidence disables the shortcut.
    pub fn skip_llm_check_confidence(mut self, confidence: Option<f32>) -> Self {
        self.skip_llm_check_confidence = confidence.filter(|c| *c > 0.0);
        self
    }

    pub fn verification_policy(mut self, policy: VerificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Linker {
        let mut disambiguator =
            Disambiguator::new(self.llm, self.prompt_template).with_policy(self.policy);
        if let Some(format) = self.candidate_format {
            disambiguator = disambiguator.with_candidate_format(format);
        }

        Linker {
            vector_search: self.vector_search,
            disambiguator,
            cross_search_types: self.cross_search_types,
            candidate_postprocess_fns: self.candidate_postprocess_fns,
            skip_llm_check_confidence: self.skip_llm_check_confidence,
        }
    }
}

pub struct Linker {
    vector_search: Arc<dyn VectorSearch>,
    disambiguator: Disambiguator,
    cross_search_types: HashMap<String, Vec<String>>,
    candidate_postprocess_fns: HashMap<String, CandidatePostProcessFn>,
    skip_llm_check_confidence: Option<f32>,
}

impl Linker {
    pub fn builder(vector_search: Arc<dyn VectorSearch>, llm: Arc<dyn LanguageModel>) -> LinkerBuilder {
        LinkerBuilder::new(vector_search, llm)
    }

    /// The entity's own type followed by its configured cross-search types.
    pub fn search_types(&self, entity_type: &str) -> Vec<String> {
        let mut types = vec![entity_type.to_string()];
        if let Some(extra) = self.cross_search_types.get(entity_type) {
            types.extend(extra.iter().cloned());
        }
        types
    }

    fn search_filter(&self, entity_type: &str) -> Vec<FilterClause> {
        vec![FilterClause::one_of("type", self.search_types(entity_type))]
    }

    /// A single scored result strictly above the skip confidence, if there is
    /// exactly one and it is still among `candidates` after post-processing.
    fn confident_candidate(&self, scored: &[ScoredDocument], candidates: &[Payload]) -> Option<Payload> {
        let skip = self.skip_llm_check_confidence?;
        let mut confident = scored
            .iter()
            .filter(|doc| doc.score.is_some_and(|score| score > skip));
        match (confident.next(), confident.next()) {
            (Some(doc), None) if candidates.contains(&doc.document) => Some(doc.document.clone()),
            _ => None,
        }
    }

    async fn retrieve_candidates(
        &self,
        entities: Vec<Entity>,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<CandidateRetrieval> {
        let mut retrieval = CandidateRetrieval::default();
        let mut searchable = Vec::with_capacity(entities.len());

        for entity in entities {
            if entity.name_str().is_some() {
                searchable.push(entity);
            } else {
                tracing::warn!(entity = ?entity, "Entity name is not a string, skipping linking");
                retrieval.unlinked.push(entity);
            }
        }
        if searchable.is_empty() {
            return Ok(retrieval);
        }

        let queries: Vec<String> = searchable
            .iter()
            .map(|e| e.name_str().unwrap_or_default().to_string())
            .collect();
        let filters = BatchFilters::PerQuery(
            searchable
                .iter()
                .map(|e| Some(self.search_filter(&e.entity_type)))
                .collect(),
        );

        let batch = self
            .vector_search
            .batch_retrieve_documents(&queries, top_k, &filters)
            .await?;
        if batch.len() != searchable.len() {
            anyhow::bail!(
                "vector search returned {} result lists for {} queries",
                batch.len(),
                searchable.len()
            );
        }

        tracing::info!("Post processing linking candidates");
        let mut no_candidates = Vec::new();
        for (entity, results) in searchable.into_iter().zip(batch) {
            let scored: Vec<ScoredDocument> =
                filter_search_results(results, score_threshold, true).collect();
            let mut candidates: Vec<Payload> = scored.iter().map(|d| d.document.clone()).collect();

            if let Some(process) = self.candidate_postprocess_fns.get(&entity.entity_type) {
                let before = candidates.len();
                candidates = process(&entity, candidates);
                tracing::info!(
                    entity_type = %entity.entity_type,
                    num_before = before,
                    num_after = candidates.len(),
                    "Applied candidate post-processing"
                );
            }

            if candidates.is_empty() {
                no_candidates.push(entity);
                continue;
            }

            if let Some(metadata) = self.confident_candidate(&scored, &candidates) {
                tracing::info!(
                    entity_name = %entity.name,
                    normalized_entity = %metadata,
                    "Link entity and skip LLM check"
                );
                retrieval.linked.push(LinkedEntity { entity, metadata });
                continue;
            }

            retrieval.pending.push(EntityWithCandidates { entity, candidates });
        }

        if !no_candidates.is_empty() {
            tracing::warn!(entities = ?no_candidates, "No linking candidates found");
        }
        retrieval.unlinked.extend(no_candidates);

        Ok(retrieval)
    }

    /// Links `entities` mentioned in `query`.
    ///
    /// Candidates must score at least `score_threshold`; unscored results are never candidates.
    pub async fn link(
        &self,
        query: &str,
        entities: Vec<Entity>,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<LinkerResponse> {
        if entities.is_empty() {
            tracing::info!("No entities to link");
            return Ok(LinkerResponse::default());
        }

        let start = Instant::now();
        let num_entities = entities.len();
        let CandidateRetrieval {
            pending,
            mut linked,
            mut unlinked,
        } = self.retrieve_candidates(entities, top_k, score_threshold).await?;

        let mut unresolved = Vec::new();
        if !pending.is_empty() {
            let verified = self.disambiguator.disambiguate(query, pending).await?;
            linked.extend(verified.linked);
            unlinked.extend(verified.unlinked);
            unresolved.extend(verified.unresolved);
        }

        let response = LinkerResponse {
            linked_entities: linked,
            unlinked_entities: unlinked,
            unresolved_entities: unresolved,
        };
        debug_assert_eq!(response.len(), num_entities);

        tracing::info!(
            num_linked = response.linked_entities.len(),
            num_unlinked = response.unlinked_entities.len(),
            num_unresolved = response.unresolved_entities.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Linked entities"
        );
        Ok(response)
    }

    /// Links entities mentioned in the last message of `conversation`.
    pub async fn run(
        &self,
        conversation: &Conversation,
        entities: Vec<Entity>,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<LinkerResponse> {
        let query = conversation
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        self.link(query, entities, top_k, score_threshold).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns canned results by query and records the filters it was given.
    #[derive(Default)]
    struct FakeSearch {
        results: HashMap<String, Vec<ScoredDocument>>,
        seen_filters: Mutex<Option<BatchFilters>>,
    }

    #[async_trait]
    impl VectorSearch for FakeSearch {
        async fn retrieve_documents(
            &self,
            query: &str,
            _limit: usize,
            _filters: &[FilterClause],
        ) -> Result<Vec<ScoredDocument>> {
            Ok(self.results.get(query).cloned().unwrap_or_default())
        }

        async fn batch_retrieve_documents(
            &self,
            queries: &[String],
            _limit: usize,
            filters: &BatchFilters,
        ) -> Result<Vec<Vec<ScoredDocument>>> {
            *self.seen_filters.lock().unwrap() = Some(filters.clone());
            Ok(queries
                .iter()
                .map(|q| self.results.get(q).cloned().unwrap_or_default())
                .collect())
        }

        async fn list_documents(&self, _limit: usize, _filters: &[FilterClause]) -> Result<Vec<Payload>> {
            Ok(vec![])
        }
    }

    struct CountingLlm {
        answer: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingLlm {
        async fn response(&self, _conversation: &Conversation) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.to_string())
        }

        async fn streaming_response(
            &self,
            _conversation: &Conversation,
        ) -> Result<BoxStream<'static, Result<String>>> {
            anyhow::bail!("streaming not used")
        }
    }

    fn llm(answer: &'static str) -> Arc<CountingLlm> {
        Arc::new(CountingLlm {
            answer,
            calls: AtomicUsize::new(0),
        })
    }

    fn candidate(id: &str, score: f32) -> ScoredDocument {
        ScoredDocument::new(json!({"id": id, "name": id}), score)
    }

    fn search(entries: Vec<(&str, Vec<ScoredDocument>)>) -> Arc<FakeSearch> {
        Arc::new(FakeSearch {
            results: entries
                .into_iter()
                .map(|(q, docs)| (q.to_string(), docs))
                .collect(),
            ..FakeSearch::default()
        })
    }

    #[tokio::test]
    async fn test_empty_input_returns_empty_response() {
        let model = llm("1");
        let linker = Linker::builder(search(vec![]), model.clone()).build();
        let response = linker.link("q", vec![], 5, 0.5).await.unwrap();
        assert!(response.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confident_single_candidate_skips_model() {
        let model = llm("1");
        let linker = Linker::builder(
            search(vec![("Alice", vec![candidate("p1", 0.97), candidate("p2", 0.6)])]),
            model.clone(),
        )
        .skip_llm_check_confidence(Some(0.95))
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(response.linked_entities.len(), 1);
        assert_eq!(response.linked_entities[0].metadata["id"], "p1");
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_two_confident_candidates_go_to_model() {
        let model = llm("2");
        let linker = Linker::builder(
            search(vec![("Alice", vec![candidate("p1", 0.97), candidate("p2", 0.96)])]),
            model.clone(),
        )
        .skip_llm_check_confidence(Some(0.95))
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(response.linked_entities[0].metadata["id"], "p2");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_score_equal_to_skip_confidence_is_not_confident() {
        let model = llm("0");
        let linker = Linker::builder(
            search(vec![("Alice", vec![candidate("p1", 0.95)])]),
            model.clone(),
        )
        .skip_llm_check_confidence(Some(0.95))
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(response.unlinked_entities, vec![Entity::new("Person", "Alice")]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unscored_and_low_scored_results_are_not_candidates() {
        let model = llm("1");
        let linker = Linker::builder(
            search(vec![(
                "Alice",
                vec![
                    ScoredDocument::unscored(json!({"id": "p0"})),
                    candidate("p1", 0.3),
                ],
            )]),
            model.clone(),
        )
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(response.unlinked_entities.len(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_string_name_is_unlinked_without_search() {
        let fake = search(vec![]);
        let linker = Linker::builder(fake.clone(), llm("1")).build();
        let response = linker
            .link("q", vec![Entity::new("Code", 42)], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(response.unlinked_entities, vec![Entity::new("Code", 42)]);
        assert!(fake.seen_filters.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cross_search_types_widen_filter() {
        let fake = search(vec![]);
        let linker = Linker::builder(fake.clone(), llm("1"))
            .cross_search_types(HashMap::from([(
                "Person".to_string(),
                vec!["Alias".to_string()],
            )]))
            .build();

        linker
            .link(
                "q",
                vec![Entity::new("Person", "Alice"), Entity::new("Org", "Acme")],
                5,
                0.5,
            )
            .await
            .unwrap();

        let seen = fake.seen_filters.lock().unwrap().clone();
        let Some(BatchFilters::PerQuery(per_query)) = seen else {
            panic!("expected per-query filters");
        };
        assert_eq!(
            per_query,
            vec![
                Some(vec![FilterClause::one_of("type", ["Person", "Alias"])]),
                Some(vec![FilterClause::one_of("type", ["Org"])]),
            ]
        );
    }

    #[tokio::test]
    async fn test_postprocess_fn_can_empty_candidates() {
        let model = llm("1");
        let linker = Linker::builder(
            search(vec![("Alice", vec![candidate("p1", 0.9)])]),
            model.clone(),
        )
        .candidate_postprocess_fn("Person", Arc::new(|_entity: &Entity, _docs: Vec<Payload>| Vec::<Payload>::new()))
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(response.unlinked_entities.len(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confident_candidate_removed_by_postprocess_goes_to_model() {
        let model = llm("1");
        let linker = Linker::builder(
            search(vec![("Alice", vec![candidate("p1", 0.97), candidate("p2", 0.6)])]),
            model.clone(),
        )
        .skip_llm_check_confidence(Some(0.95))
        .candidate_postprocess_fn(
            "Person",
            Arc::new(|_entity: &Entity, docs: Vec<Payload>| {
                docs.into_iter().filter(|d| d["id"] != "p1").collect::<Vec<Payload>>()
            }),
        )
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.linked_entities[0].metadata["id"], "p2");
    }

    #[tokio::test]
    async fn test_zero_skip_confidence_disables_shortcut() {
        let model = llm("0");
        let linker = Linker::builder(
            search(vec![("Alice", vec![candidate("p1", 0.9)])]),
            model.clone(),
        )
        .skip_llm_check_confidence(Some(0.0))
        .build();

        let response = linker
            .link("q", vec![Entity::new("Person", "Alice")], 5, 0.5)
            .await
            .unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.unlinked_entities.len(), 1);
    }

    #[test]
    fn test_linked_entity_serializes_flat() {
        let linked = LinkedEntity {
            entity: Entity::new("Person", "Alice"),
            metadata: json!({"id": "p1"}),
        };
        assert_eq!(
            serde_json::to_value(linked).unwrap(),
            json!({"type": "Person", "name": "Alice", "metadata": {"id": "p1"}})
        );
    }
}
