//! Tunables for matching, enrichment, and sync.
//!
//! Every field has a default, so a partial `settings.json` is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub matching: MatchConfig,
    pub enrichment: EnrichmentConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Maximum candidates pulled from search and offered to the model.
    pub candidate_limit: usize,
    /// Top lexical score below which the model is asked to re-rank.
    pub llm_similarity_threshold: f64,
    /// Scores closer than this between the top two candidates count as ambiguous.
    pub ambiguity_margin: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 8,
            llm_similarity_threshold: 0.82,
            ambiguity_margin: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    /// Age after which a meal with zero attempted ingredients is re-enriched.
    pub stale_grace_secs: i64,
    pub backoff: Backoff,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_attempts: 3,
            attempt_timeout_ms: 20_000,
            stale_grace_secs: 300,
            backoff: Backoff::default(),
        }
    }
}

impl EnrichmentConfig {
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    #[must_use]
    pub fn stale_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub workers: usize,
    pub max_retries: u32,
    /// Background drain interval when nothing wakes the worker.
    pub poll_interval_secs: u64,
    pub backoff: Backoff,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 8,
            poll_interval_secs: 30,
            backoff: Backoff {
                base_ms: 1_000,
                max_ms: 300_000,
                jitter: 0.2,
            },
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
