//! Post-processing of retrieved documents: score threshold, deduplication,
//! length filtering and merging of chunked sources.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::vector_search::{Document, ScoredDocument, filter_search_results};

/// Caller-supplied ordering applied after all other steps.
pub type SortFn = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

#[derive(Clone)]
pub struct PostProcessOptions {
    pub score_threshold: f32,
    /// Drop unscored documents instead of keeping them.
    pub require_score: bool,
    /// Approximate token budget per document; `None` or `Some(0)` disables the check.
    pub max_length_per_doc: Option<usize>,
    pub merge_splits: bool,
    pub sort_by: Option<SortFn>,
}

impl PostProcessOptions {
    pub fn new(score_threshold: f32) -> Self {
        Self {
            score_threshold,
            require_score: false,
            max_length_per_doc: None,
            merge_splits: true,
            sort_by: None,
        }
    }
}

impl std::fmt::Debug for PostProcessOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessOptions")
            .field("score_threshold", &self.score_threshold)
            .field("require_score", &self.require_score)
            .field("max_length_per_doc", &self.max_length_per_doc)
            .field("merge_splits", &self.merge_splits)
            .field("sort_by", &self.sort_by.is_some())
            .finish()
    }
}

pub fn post_process_documents(
    scored_docs: Vec<ScoredDocument<Document>>,
    options: &PostProcessOptions,
) -> Vec<Document> {
    let docs: Vec<Document> =
        filter_search_results(scored_docs, options.score_threshold, options.require_score)
            .map(|d| d.document)
            .collect();
    tracing::info!(
        score_threshold = options.score_threshold,
        num_remaining_documents = docs.len(),
        "Filter documents by score"
    );

    let mut docs = dedup_by_id(docs);
    tracing::info!(num_unique_documents = docs.len(), "Deduplicated documents");

    if let Some(max_length) = options.max_length_per_doc.filter(|max| *max > 0) {
        docs.retain(|d| approximate_token_count(&d.content) < max_length);
        tracing::info!(
            max_length_per_doc = max_length,
            num_remaining_documents = docs.len(),
            "Filter documents by max length"
        );
    }

    if options.merge_splits {
        docs = merge_document_splits(docs);
        tracing::info!(num_remaining_documents = docs.len(), "Merged document splits");
    }

    if let Some(sort_by) = &options.sort_by {
        docs.sort_by(|a, b| sort_by(a, b));
    }

    docs
}

/// Keeps one document per id: the slot of its first occurrence holds its last occurrence.
pub fn dedup_by_id(docs: Vec<Document>) -> Vec<Document> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Document> = Vec::with_capacity(docs.len());

    for doc in docs {
        match doc.id.as_ref().and_then(|id| slots.get(id).copied()) {
            Some(slot) => unique[slot] = doc,
            None => {
                if let Some(id) = &doc.id {
                    slots.insert(id.clone(), unique.len());
                }
                unique.push(doc);
            }
        }
    }
    unique
}

/// Collapses chunks of the same source into the source's `index == 0` chunk.
///
/// Documents are stably sorted by `(id is missing, source_id)` and grouped by
/// consecutive `source_id`. A group with an `index == 0` member reduces to that
/// member; other groups keep every member in order. Documents without a
/// `source_id` are never grouped.
pub fn merge_document_splits(mut docs: Vec<Document>) -> Vec<Document> {
    docs.sort_by(|a, b| {
        (a.id.is_none(), &a.source_id).cmp(&(b.id.is_none(), &b.source_id))
    });

    let mut merged = Vec::with_capacity(docs.len());
    let mut group: Vec<Document> = Vec::new();
    let mut canonical: Option<Document> = None;

    let flush = |group: &mut Vec<Document>, canonical: &mut Option<Document>, merged: &mut Vec<Document>| {
        match canonical.take() {
            Some(doc) => {
                merged.push(doc);
                group.clear();
            }
            None => merged.append(group),
        }
    };

    for doc in docs {
        let same_source = doc.source_id.is_some()
            && group
                .first()
                .or(canonical.as_ref())
                .is_some_and(|head| head.source_id == doc.source_id);
        if !same_source {
            flush(&mut group, &mut canonical, &mut merged);
        }

        if canonical.is_some() {
            continue;
        }
        if doc.index == Some(0) {
            canonical = Some(doc);
        } else {
            group.push(doc);
        }
    }
    flush(&mut group, &mut canonical, &mut merged);

    merged
}

/// Rough token estimate: the larger of chars/4 and 0.9 tokens per word.
pub fn approximate_token_count(value: &str) -> usize {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return 0;
    }

    let char_count = trimmed.chars().count();
    let word_count = trimmed.split_whitespace().count();
    let char_estimate = char_count.div_ceil(4);
    let word_estimate = ((word_count as f32) * 0.9).ceil() as usize;
    char_estimate.max(word_estimate).max(1)
}
