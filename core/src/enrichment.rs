//! Runs the match engine over a meal's unmatched ingredients.
//!
//! A bounded pool resolves ingredients concurrently. Each attempt has a
//! timeout and transient failures back off and retry; an ingredient that
//! exhausts its attempts is recorded as `NoMatch` so the meal always
//! finishes. Progress is published per meal on a watch channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::cleaning::clean_ingredient_name;
use crate::config::EnrichmentConfig;
use crate::error::SyncError;
use crate::matcher::MatchEngine;
use crate::models::{MatchMethod, MatchResult, Meal, parse_timestamp};
use crate::store::{SharedStore, lock};
use crate::sync::SyncCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrichmentState {
    NotStarted,
    InProgress,
    PartiallyComplete,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnrichmentProgress {
    pub state: EnrichmentState,
    pub enriched: usize,
    pub total: usize,
}

impl EnrichmentProgress {
    /// Progress as recorded in the store, for a meal that is not running.
    fn settled(meal: &Meal) -> Self {
        let enriched = meal.attempted_count();
        let total = meal.ingredients.len();
        let state = if enriched == total {
            EnrichmentState::Complete
        } else if enriched == 0 {
            EnrichmentState::NotStarted
        } else {
            EnrichmentState::PartiallyComplete
        };
        Self {
            state,
            enriched,
            total,
        }
    }
}

pub struct EnrichmentCoordinator {
    store: SharedStore,
    engine: Arc<MatchEngine>,
    config: EnrichmentConfig,
    sync: Option<Arc<SyncCoordinator>>,
    channels: Mutex<HashMap<String, watch::Sender<EnrichmentProgress>>>,
    running: Mutex<HashSet<String>>,
}

/// Ends the run however `enrich_meal` returns.
struct RunGuard<'a> {
    coordinator: &'a EnrichmentCoordinator,
    meal_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.finish_run(&self.meal_id);
    }
}

impl EnrichmentCoordinator {
    pub fn new(store: SharedStore, engine: Arc<MatchEngine>, config: EnrichmentConfig) -> Self {
        Self {
            store,
            engine,
            config,
            sync: None,
            channels: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Hand finished meals to `sync` for pushing.
    #[must_use]
    pub fn with_sync(mut self, sync: Arc<SyncCoordinator>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn subscribe(&self, meal_id: &str) -> Result<watch::Receiver<EnrichmentProgress>> {
        let current = self.progress(meal_id)?;
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let mut channels = self.channels();
        // Channels outlive a run only while someone is watching.
        channels.retain(|id, tx| tx.receiver_count() > 0 || running.contains(id));
        Ok(channels
            .entry(meal_id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe())
    }

    pub fn progress(&self, meal_id: &str) -> Result<EnrichmentProgress> {
        if self.is_running(meal_id) {
            if let Some(tx) = self.channels().get(meal_id) {
                return Ok(*tx.borrow());
            }
        }
        let meal = lock(&self.store).get_meal(meal_id)?;
        Ok(meal.map_or(
            EnrichmentProgress {
                state: EnrichmentState::NotStarted,
                enriched: 0,
                total: 0,
            },
            |meal| EnrichmentProgress::settled(&meal),
        ))
    }

    /// Match every unattempted ingredient of the meal and persist the results.
    ///
    /// A run already in progress for the meal is not duplicated; its current
    /// progress is returned instead.
    pub async fn enrich_meal(self: &Arc<Self>, meal_id: &str) -> Result<EnrichmentProgress> {
        let Some(meal) = lock(&self.store).get_meal(meal_id)? else {
            bail!("Meal {meal_id} not found");
        };
        if meal.pending_delete {
            return Ok(EnrichmentProgress::settled(&meal));
        }
        let Some(_run) = self.start_run(meal_id) else {
            return self.progress(meal_id);
        };

        let pending = lock(&self.store).unattempted_ingredients(meal_id)?;
        let mut progress = EnrichmentProgress::settled(&meal);
        if pending.is_empty() {
            self.publish(meal_id, progress);
            return Ok(progress);
        }

        progress.state = EnrichmentState::InProgress;
        self.publish(meal_id, progress);
        tracing::info!(meal_id, pending = pending.len(), "Enriching meal");

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        for ingredient in pending {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = this.resolve_with_retry(&ingredient.raw_name).await;
                (ingredient, result)
            });
        }

        let mut enriched_ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (ingredient, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(meal_id, error = %e, "Enrichment task panicked");
                    continue;
                }
            };
            let applied = lock(&self.store).apply_match(&ingredient.id, &ingredient.raw_name, &result);
            match applied {
                Ok(Some(_)) => {
                    tracing::debug!(
                        ingredient_id = %ingredient.id,
                        method = %result.method,
                        reference_id = ?result.reference_id(),
                        "Ingredient enriched"
                    );
                    enriched_ids.push(ingredient.id);
                    progress.enriched += 1;
                    self.publish(meal_id, progress);
                }
                Ok(None) => {
                    tracing::debug!(ingredient_id = %ingredient.id, "Discarded match for changed ingredient");
                }
                Err(e) => {
                    tracing::warn!(ingredient_id = %ingredient.id, error = %format!("{e:#}"), "Failed to store match");
                }
            }
        }

        let meal = lock(&self.store).get_meal(meal_id)?;
        let final_progress = match &meal {
            Some(meal) => EnrichmentProgress::settled(meal),
            None => EnrichmentProgress {
                state: EnrichmentState::Complete,
                enriched: progress.enriched,
                total: progress.enriched,
            },
        };
        let final_progress = if final_progress.state == EnrichmentState::NotStarted {
            EnrichmentProgress {
                state: EnrichmentState::PartiallyComplete,
                ..final_progress
            }
        } else {
            final_progress
        };
        self.publish(meal_id, final_progress);
        tracing::info!(
            meal_id,
            enriched = final_progress.enriched,
            total = final_progress.total,
            state = ?final_progress.state,
            "Enrichment finished"
        );

        if let (Some(sync), Some(_)) = (&self.sync, &meal) {
            if !enriched_ids.is_empty() {
                sync.record_enrichment(meal_id, &enriched_ids)?;
            }
        }
        Ok(final_progress)
    }

    /// Resolve one name, retrying timeouts and transient failures. Never fails:
    /// exhausted attempts yield `NoMatch`.
    async fn resolve_with_retry(&self, raw_name: &str) -> MatchResult {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.config.attempt_timeout(), self.engine.resolve(raw_name)).await {
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.config.attempt_timeout());
                }
            }
            tracing::debug!(raw_name, attempt, error = %last_error, "Match attempt failed");
            if attempt < max_attempts {
                tokio::time::sleep(self.config.backoff.delay(attempt)).await;
            }
        }
        let err = SyncError::MaxRetriesExceeded {
            attempts: max_attempts,
            last_error,
        };
        tracing::warn!(raw_name, error = %err, "Recording ingredient as unmatched");
        MatchResult::unmatched(clean_ingredient_name(raw_name), MatchMethod::NoMatch)
    }

    /// Created longer ago than the grace period and never attempted.
    #[must_use]
    pub fn is_stale(&self, meal: &Meal, now: DateTime<Utc>) -> bool {
        if meal.pending_delete || meal.ingredients.is_empty() || meal.attempted_count() > 0 {
            return false;
        }
        parse_timestamp(&meal.created_at)
            .is_some_and(|created| now - created > self.config.stale_grace())
    }

    /// Re-enrich meals a previous run never got to. Returns how many ran.
    pub async fn resume_stale(self: &Arc<Self>) -> Result<usize> {
        let now = Utc::now();
        let stale: Vec<Meal> = lock(&self.store)
            .meals_without_attempts()?
            .into_iter()
            .filter(|meal| self.is_stale(meal, now))
            .collect();
        for meal in &stale {
            tracing::info!(meal_id = %meal.id, "Resuming stale enrichment");
            if let Err(e) = self.enrich_meal(&meal.id).await {
                tracing::warn!(meal_id = %meal.id, error = %format!("{e:#}"), "Failed to resume enrichment");
            }
        }
        Ok(stale.len())
    }

    fn start_run(&self, meal_id: &str) -> Option<RunGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(meal_id.to_string()) {
            return None;
        }
        Some(RunGuard {
            coordinator: self,
            meal_id: meal_id.to_string(),
        })
    }

    fn finish_run(&self, meal_id: &str) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(meal_id);
        let mut channels = self.channels();
        if channels.get(meal_id).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(meal_id);
        }
    }

    fn is_running(&self, meal_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(meal_id)
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<EnrichmentProgress>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, meal_id: &str, progress: EnrichmentProgress) {
        let mut channels = self.channels();
        match channels.get(meal_id) {
            Some(tx) => {
                tx.send_replace(progress);
            }
            None => {
                channels.insert(meal_id.to_string(), watch::channel(progress).0);
            }
        }
    }
}
