//! Tiered resolution of one ingredient name to a reference record.
//!
//! Tiers run in order and the first hit wins: cleaning, blacklist, shortcut,
//! exact name, AND/OR search scored lexically, then model re-ranking when the
//! lexical ranking is weak or ambiguous. The engine has no side effects.

use std::sync::Arc;

use crate::cleaning::{clean_ingredient_name, is_blacklisted, lexical_similarity};
use crate::completion::{CompletionCandidate, CompletionChoice, CompletionClient, CompletionRequest};
use crate::config::MatchConfig;
use crate::error::{CompletionError, MatchError};
use crate::models::{MatchCandidate, MatchMethod, MatchResult, ReferenceRecord};
use crate::reference::ReferenceStore;

pub struct MatchEngine {
    reference: Arc<dyn ReferenceStore>,
    completion: Option<Arc<dyn CompletionClient>>,
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(reference: Arc<dyn ReferenceStore>, config: MatchConfig) -> Self {
        Self {
            reference,
            completion: None,
            config,
        }
    }

    #[must_use]
    pub fn with_completion(mut self, completion: Arc<dyn CompletionClient>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn reference(&self) -> &Arc<dyn ReferenceStore> {
        &self.reference
    }

    /// Resolve `raw_name`. A missing match is `MatchMethod::NoMatch`, not an
    /// error; `Err` means the attempt itself failed and may be retried.
    pub async fn resolve(&self, raw_name: &str) -> Result<MatchResult, MatchError> {
        let cleaned = clean_ingredient_name(raw_name);
        if cleaned.is_empty() {
            tracing::debug!(raw_name, "Nothing left after cleaning");
            return Ok(MatchResult::unmatched(cleaned, MatchMethod::NoMatch));
        }
        if is_blacklisted(&cleaned) {
            return Ok(MatchResult::unmatched(cleaned, MatchMethod::Blacklisted));
        }

        let key = cleaned.clone();
        if let Some(record) = self
            .query(move |store| store.lookup_by_shortcut(&key))
            .await?
        {
            return Ok(Self::hit(cleaned, MatchMethod::Shortcut, record, Vec::new()));
        }

        let key = cleaned.clone();
        if let Some(record) = self.query(move |store| store.find_exact(&key)).await? {
            return Ok(Self::hit(cleaned, MatchMethod::Exact, record, Vec::new()));
        }

        let key = cleaned.clone();
        let limit = self.config.candidate_limit;
        let records = self
            .query(move |store| store.search_candidates(&key, limit))
            .await?;
        if records.is_empty() {
            tracing::debug!(cleaned = %cleaned, "No candidates");
            return Ok(MatchResult::unmatched(cleaned, MatchMethod::NoMatch));
        }

        let ranked = rank_candidates(&cleaned, records);
        let candidates: Vec<MatchCandidate> = ranked
            .iter()
            .map(|(record, score)| MatchCandidate {
                reference_id: record.id,
                canonical_name: record.canonical_name.clone(),
                score: *score,
            })
            .collect();

        let needs_rerank = self.needs_rerank(&candidates);
        let Some(completion) = self.completion.as_ref().filter(|_| needs_rerank) else {
            return Ok(Self::best_lexical(cleaned, ranked, candidates));
        };

        let request = CompletionRequest::new(
            cleaned.clone(),
            candidates
                .iter()
                .map(|c| CompletionCandidate {
                    id: c.reference_id,
                    name: c.canonical_name.clone(),
                })
                .collect(),
        );
        match completion.choose(&request).await {
            Ok(CompletionChoice::Candidate(id)) => {
                if let Some(pos) = ranked.iter().position(|(r, _)| r.id == id) {
                    let mut ranked = ranked;
                    let (record, _) = ranked.swap_remove(pos);
                    Ok(Self::hit(cleaned, MatchMethod::LlmReranked, record, candidates))
                } else {
                    tracing::warn!(cleaned = %cleaned, reference_id = id, "Model picked an id outside the offered set");
                    Ok(Self::best_lexical(cleaned, ranked, candidates))
                }
            }
            Ok(CompletionChoice::None) => Ok(MatchResult {
                cleaned,
                method: MatchMethod::NoMatch,
                record: None,
                candidates,
            }),
            Err(CompletionError::Timeout) => Err(MatchError::TransientNetworkFailure(
                CompletionError::Timeout.to_string(),
            )),
            Err(e) => {
                tracing::warn!(cleaned = %cleaned, error = %e, "Re-ranking failed, keeping lexical best");
                Ok(Self::best_lexical(cleaned, ranked, candidates))
            }
        }
    }

    fn needs_rerank(&self, candidates: &[MatchCandidate]) -> bool {
        let Some(top) = candidates.first() else {
            return false;
        };
        if top.score < self.config.llm_similarity_threshold {
            return true;
        }
        candidates
            .get(1)
            .is_some_and(|second| top.score - second.score < self.config.ambiguity_margin)
    }

    async fn query<T, F>(&self, f: F) -> Result<T, MatchError>
    where
        F: FnOnce(&dyn ReferenceStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.reference);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| MatchError::Store(anyhow::Error::new(e)))?
            .map_err(MatchError::Store)
    }

    fn hit(
        cleaned: String,
        method: MatchMethod,
        record: ReferenceRecord,
        candidates: Vec<MatchCandidate>,
    ) -> MatchResult {
        MatchResult {
            cleaned,
            method,
            record: Some(record),
            candidates,
        }
    }

    fn best_lexical(
        cleaned: String,
        ranked: Vec<(ReferenceRecord, f64)>,
        candidates: Vec<MatchCandidate>,
    ) -> MatchResult {
        match ranked.into_iter().next() {
            Some((record, _)) => Self::hit(cleaned, MatchMethod::Fuzzy, record, candidates),
            None => MatchResult::unmatched(cleaned, MatchMethod::NoMatch),
        }
    }
}

/// Score every record against the cleaned query, best first. Ties keep the
/// store's shorter-name-first order.
fn rank_candidates(cleaned: &str, records: Vec<ReferenceRecord>) -> Vec<(ReferenceRecord, f64)> {
    let mut ranked: Vec<(ReferenceRecord, f64)> = records
        .into_iter()
        .map(|record| {
            let canonical = lexical_similarity(cleaned, &clean_ingredient_name(&record.canonical_name));
            let common = record
                .common_name
                .as_deref()
                .map_or(0.0, |n| lexical_similarity(cleaned, &clean_ingredient_name(n)));
            let score = canonical.max(common);
            (record, score)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}
