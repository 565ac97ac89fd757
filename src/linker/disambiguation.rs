//! Model-based verification of ambiguous candidate lists.
//!
//! Each entity gets one prompt listing its candidates as a 1-based numbered
//! list; the model answers with the number of the matching candidate, or a
//! non-positive number when none matches. All calls of a batch run
//! concurrently and are joined before any decision is made.

use anyhow::Result;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use super::LinkedEntity;
use crate::conversation::Conversation;
use crate::extractor::Entity;
use crate::llm::LanguageModel;
use crate::prompt::fill_template;
use crate::vector_search::Payload;

/// Renders a candidate record for the verification prompt.
pub type CandidateFormatFn = Arc<dyn Fn(&Payload) -> String + Send + Sync>;

pub const DEFAULT_LINKER_PROMPT: &str = r#"You normalize entity mentions against a knowledge base.

Text:
{text}

Mention: {entity_name} (type: {entity_type})

Candidates:
{normalized_entities}

Answer with only the number of the candidate that refers to the same entity as the mention.
Answer 0 if none of the candidates match."#;

#[derive(Debug, Clone)]
pub struct EntityWithCandidates {
    pub entity: Entity,
    /// Ranked best-first; position `i` is shown to the model as number `i + 1`.
    pub candidates: Vec<Payload>,
}

/// A candidate paired with the number it is shown under.
#[derive(Debug, Clone, Copy)]
pub struct NumberedCandidate<'a> {
    pub number: usize,
    pub record: &'a Payload,
}

pub fn number_candidates(candidates: &[Payload]) -> Vec<NumberedCandidate<'_>> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, record)| NumberedCandidate {
            number: i + 1,
            record,
        })
        .collect()
}

/// The model's decision for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// 1-based number of the chosen candidate.
    Candidate(usize),
    NoMatch(i64),
    OutOfRange(i64),
    Unparsable,
}

/// Parses a verification answer against a list of `num_candidates`.
pub fn parse_choice(response: &str, num_candidates: usize) -> Choice {
    let trimmed = response.trim();
    let number = match trimmed.parse::<i64>() {
        Ok(number) => number,
        Err(_) => return overflowing_choice(trimmed),
    };

    if number <= 0 {
        Choice::NoMatch(number)
    } else if number as u64 > num_candidates as u64 {
        Choice::OutOfRange(number)
    } else {
        Choice::Candidate(number as usize)
    }
}

/// An integer too wide for `i64` is still a number: out of range or no match.
fn overflowing_choice(trimmed: &str) -> Choice {
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Choice::Unparsable;
    }

    if negative {
        Choice::NoMatch(i64::MIN)
    } else {
        Choice::OutOfRange(i64::MAX)
    }
}

/// Per-call behaviour of a verification batch. The default is all-or-fail with no timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationPolicy {
    /// A call exceeding this duration leaves its entity unlinked.
    pub call_timeout: Option<Duration>,
    /// A failed call leaves its entity unresolved instead of failing the batch.
    pub isolate_failures: bool,
}

#[derive(Debug, Default)]
pub struct DisambiguationResult {
    pub linked: Vec<LinkedEntity>,
    pub unlinked: Vec<Entity>,
    /// Entities whose verification produced no usable answer.
    pub unresolved: Vec<Entity>,
}

enum CallOutcome {
    Response(String),
    TimedOut,
    Failed(anyhow::Error),
}

pub struct Disambiguator {
    llm: Arc<dyn LanguageModel>,
    prompt_template: String,
    candidate_format: Option<CandidateFormatFn>,
    policy: VerificationPolicy,
}

impl Disambiguator {
    pub fn new(llm: Arc<dyn LanguageModel>, prompt_template: impl Into<String>) -> Self {
        Self {
            llm,
            prompt_template: prompt_template.into(),
            candidate_format: None,
            policy: VerificationPolicy::default(),
        }
    }

    pub fn with_candidate_format(mut self, format: CandidateFormatFn) -> Self {
        self.candidate_format = Some(format);
        self
    }

    pub fn with_policy(mut self, policy: VerificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn render_candidate(&self, record: &Payload) -> String {
        match &self.candidate_format {
            Some(format) => format(record),
            None => match &record["name"] {
                Payload::String(name) => name.clone(),
                Payload::Null => record.to_string(),
                other => other.to_string(),
            },
        }
    }

    pub fn format_prompt(&self, query: &str, item: &EntityWithCandidates) -> String {
        let normalized_entities = number_candidates(&item.candidates)
            .iter()
            .map(|c| format!("{}. {}", c.number, self.render_candidate(c.record)))
            .collect::<Vec<_>>()
            .join("\n");
        let entity_name = match &item.entity.name {
            Payload::String(name) => name.clone(),
            other => other.to_string(),
        };

        fill_template(
            &self.prompt_template,
            &[
                ("entity_type", item.entity.entity_type.as_str()),
                ("entity_name", entity_name.as_str()),
                ("text", query),
                ("normalized_entities", normalized_entities.as_str()),
            ],
        )
    }

    async fn verify(&self, prompt: String) -> Result<CallOutcome> {
        let conversation = Conversation::from_user(prompt);
        let call = self.llm.response(&conversation);

        let result = match self.policy.call_timeout {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Ok(CallOutcome::TimedOut),
            },
            None => call.await,
        };

        match result {
            Ok(response) => Ok(CallOutcome::Response(response)),
            Err(err) if self.policy.isolate_failures => Ok(CallOutcome::Failed(err)),
            Err(err) => Err(err),
        }
    }

    /// Verifies every entity with one concurrent model call each.
    ///
    /// Fails as a whole when any call fails, unless failures are isolated by the policy.
    pub async fn disambiguate(
        &self,
        query: &str,
        items: Vec<EntityWithCandidates>,
    ) -> Result<DisambiguationResult> {
        let start = Instant::now();
        let calls = items.iter().map(|item| {
            let prompt = self.format_prompt(query, item);
            tracing::debug!(content = %prompt, "Formatted prompt");
            self.verify(prompt)
        });
        let outcomes = try_join_all(calls).await?;
        tracing::info!(
            num_requests = items.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Verification batch complete"
        );

        let mut result = DisambiguationResult::default();
        for (request_index, (item, outcome)) in items.into_iter().zip(outcomes).enumerate() {
            let EntityWithCandidates { entity, candidates } = item;
            let response = match outcome {
                CallOutcome::Response(response) => response,
                CallOutcome::TimedOut => {
                    tracing::warn!(
                        entity_name = %entity.name,
                        request_index,
                        "Verification call timed out"
                    );
                    result.unlinked.push(entity);
                    continue;
                }
                CallOutcome::Failed(err) => {
                    tracing::warn!(
                        entity_name = %entity.name,
                        request_index,
                        error = %err,
                        "Verification call failed"
                    );
                    result.unresolved.push(entity);
                    continue;
                }
            };

            tracing::info!(
                candidates = ?candidates,
                response = %response,
                request_index,
                "LLM response for linking"
            );

            match parse_choice(&response, candidates.len()) {
                Choice::Unparsable => {
                    tracing::warn!(
                        entity_name = %entity.name,
                        response = %response,
                        request_index,
                        "LLM generated unparsable response"
                    );
                    result.unresolved.push(entity);
                }
                Choice::OutOfRange(number) => {
                    tracing::warn!(
                        index = number,
                        entity_name = %entity.name,
                        request_index,
                        "LLM generated unexpected candidate index"
                    );
                    result.unlinked.push(entity);
                }
                Choice::NoMatch(number) => {
                    tracing::info!(
                        index = number,
                        entity_name = %entity.name,
                        request_index,
                        "No suitable candidate found for linking"
                    );
                    result.unlinked.push(entity);
                }
                Choice::Candidate(number) => {
                    let chosen = number_candidates(&candidates)
                        .into_iter()
                        .find(|c| c.number == number)
                        .map(|c| c.record.clone());
                    match chosen {
                        Some(metadata) => {
                            tracing::info!(
                                normalized_entity = %metadata,
                                entity_name = %entity.name,
                                request_index,
                                "LLM generated normalized entity"
                            );
                            result.linked.push(LinkedEntity { entity, metadata });
                        }
                        None => result.unlinked.push(entity),
                    }
                }
            }
        }

        Ok(result)
    }
}
