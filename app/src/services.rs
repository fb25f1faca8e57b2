//! Composition root: one store, one match engine, and the two coordinators
//! built on them.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use nutrimatch_core::completion::CompletionClient;
use nutrimatch_core::config::Settings;
use nutrimatch_core::models::{
    Ingredient, IngredientEdit, Meal, MealEdit, NewIngredient, NewMeal, QueueStatus,
    ReferenceRecord, SyncQueueEntry,
};
use nutrimatch_core::reference::{ReferenceDb, ReferenceStore};
use nutrimatch_core::remote::RemoteBackend;
use nutrimatch_core::store::lock;
use nutrimatch_core::sync::DrainReport;
use nutrimatch_core::{
    DeleteOutcome, EnrichmentCoordinator, EnrichmentProgress, LocalStore, MatchEngine,
    SharedStore, SyncCoordinator, SyncSnapshot, SyncWorker,
};

use crate::completion::OpenAiCompletionClient;
use crate::config::Config;
use crate::remote::{DetachedBackend, RestBackend};

pub struct Services {
    store: SharedStore,
    engine: Arc<MatchEngine>,
    sync: Arc<SyncCoordinator>,
    enrichment: Arc<EnrichmentCoordinator>,
    worker: Mutex<Option<SyncWorker>>,
}

impl Services {
    /// Open the local databases and wire the HTTP adapters named in `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let store = LocalStore::open(&config.db_path)?;
        let reference = ReferenceDb::open(&config.reference_path)?;

        let completion: Option<Arc<dyn CompletionClient>> = match &config.completion {
            Some(endpoint) => Some(Arc::new(OpenAiCompletionClient::new(endpoint.clone())?)),
            None => {
                info!("No completion API key configured; matching without the model tier");
                None
            }
        };
        let remote: Arc<dyn RemoteBackend> = match &config.backend {
            Some(endpoint) => Arc::new(RestBackend::new(endpoint.clone())?),
            None => {
                info!("No sync backend configured; changes stay queued locally");
                Arc::new(DetachedBackend)
            }
        };

        Ok(Self::assemble(
            store,
            Arc::new(reference),
            completion,
            remote,
            &config.settings,
        ))
    }

    pub fn assemble(
        store: LocalStore,
        reference: Arc<dyn ReferenceStore>,
        completion: Option<Arc<dyn CompletionClient>>,
        remote: Arc<dyn RemoteBackend>,
        settings: &Settings,
    ) -> Self {
        let store = store.into_shared();

        let mut engine = MatchEngine::new(reference, settings.matching.clone());
        if let Some(completion) = completion {
            engine = engine.with_completion(completion);
        }
        let engine = Arc::new(engine);

        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            remote,
            settings.sync.clone(),
        ));
        let enrichment = Arc::new(
            EnrichmentCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&engine),
                settings.enrichment.clone(),
            )
            .with_sync(Arc::clone(&sync)),
        );

        Self {
            store,
            engine,
            sync,
            enrichment,
            worker: Mutex::new(None),
        }
    }

    /// Start the background sync worker and pick up meals a previous run
    /// never enriched. Returns how many were resumed.
    pub async fn start(&self) -> Result<usize> {
        {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            if worker.is_none() {
                *worker = Some(self.sync.spawn());
            }
        }
        self.enrichment.resume_stale().await
    }

    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.shutdown().await;
        }
    }

    // --- Meals ---

    /// Persist a meal and queue it for sync. Enrichment is a separate call.
    pub fn log_meal(&self, meal: &NewMeal) -> Result<Meal> {
        self.sync.create_meal(meal)
    }

    pub fn meal(&self, id: &str) -> Result<Option<Meal>> {
        lock(&self.store).get_meal(id)
    }

    pub fn meals(&self) -> Result<Vec<Meal>> {
        lock(&self.store).list_meals()
    }

    pub async fn enrich_meal(&self, meal_id: &str) -> Result<EnrichmentProgress> {
        self.enrichment.enrich_meal(meal_id).await
    }

    pub fn subscribe_enrichment(
        &self,
        meal_id: &str,
    ) -> Result<watch::Receiver<EnrichmentProgress>> {
        self.enrichment.subscribe(meal_id)
    }

    pub async fn update_meal(&self, id: &str, edit: &MealEdit) -> Result<Option<Meal>> {
        self.sync.update_meal(id, edit).await
    }

    /// Returns once the delete has been sent, queued, or found unnecessary.
    pub async fn delete_meal(&self, id: &str) -> Result<DeleteOutcome> {
        self.sync.delete_meal(id).await
    }

    // --- Ingredients ---

    /// Add an ingredient and enrich it.
    pub async fn add_ingredient(
        &self,
        meal_id: &str,
        ingredient: &NewIngredient,
    ) -> Result<Option<Ingredient>> {
        let Some(added) = self.sync.add_ingredient(meal_id, ingredient).await? else {
            return Ok(None);
        };
        self.enrichment.enrich_meal(meal_id).await?;
        lock(&self.store).get_ingredient(&added.id)
    }

    /// Apply a user edit. A portion change rescales from the matched
    /// reference row; a rename re-enriches the ingredient.
    pub async fn update_ingredient(
        &self,
        id: &str,
        edit: &IngredientEdit,
    ) -> Result<Option<Ingredient>> {
        let Some(current) = lock(&self.store).get_ingredient(id)? else {
            return Ok(None);
        };
        let record = match current.reference_id {
            Some(reference_id) => self.reference_record(reference_id).await?,
            None => None,
        };

        let Some(updated) = self
            .sync
            .update_ingredient(id, edit, record.as_ref())
            .await?
        else {
            return Ok(None);
        };
        if updated.match_attempted {
            return Ok(Some(updated));
        }
        self.enrichment.enrich_meal(&updated.meal_id).await?;
        lock(&self.store).get_ingredient(id)
    }

    pub async fn remove_ingredient(&self, id: &str) -> Result<bool> {
        self.sync.remove_ingredient(id).await
    }

    async fn reference_record(&self, reference_id: i64) -> Result<Option<ReferenceRecord>> {
        let reference = Arc::clone(self.engine.reference());
        tokio::task::spawn_blocking(move || reference.lookup_by_id(reference_id))
            .await
            .context("Reference lookup task failed")?
    }

    // --- Profile ---

    pub fn profile(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        lock(&self.store).profile()
    }

    pub async fn update_profile(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.sync.update_profile(key, value).await
    }

    // --- Sync ---

    /// Push everything queued, then pull remote changes.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.sync.sync_now().await
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncSnapshot> {
        self.sync.subscribe()
    }

    pub fn sync_snapshot(&self) -> SyncSnapshot {
        self.sync.snapshot()
    }

    /// Entries that gave up and wait for the user to retry or discard them.
    pub fn failed_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        Ok(lock(&self.store)
            .queue_entries()?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Failed)
            .collect())
    }

    pub fn retry_failed(&self, entry_id: i64) -> Result<bool> {
        self.sync.retry_failed(entry_id)
    }

    pub fn discard_failed(&self, entry_id: i64) -> Result<bool> {
        self.sync.discard_failed(entry_id)
    }
}
