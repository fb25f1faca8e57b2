//! Local-first mutations and the outbound queue drain.
//!
//! Every mutation lands in the local store together with its queue entry in
//! one transaction and wakes the drain. The drain pushes queue heads to the
//! remote under per-entity locks and settles each answer: acknowledged,
//! deferred with backoff, failed, resolved as a conflict, or deleted remotely.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::locks::EntityLocks;
use crate::models::{
    EntityType, Ingredient, IngredientEdit, Meal, MealEdit, NewIngredient, NewMeal,
    NewQueueEntry, QueueStatus, ReferenceRecord, SyncOperation, SyncQueueEntry, format_timestamp,
    is_newer, now_rfc3339, parse_timestamp,
};
use crate::remote::{IngredientPayload, MealPayload, RemoteBackend};
use crate::store::{LocalStore, MergeOutcome, SYNC_CURSOR_KEY, SharedStore, lock};

/// Upper bound on drain passes per call, so a misbehaving entry cannot spin.
const MAX_PASSES: usize = 64;

const PROFILE_ENTITY_ID: &str = "profile";
const PROFILE_SYNCED_KEY: &str = "profile.synced_at";

/// Queue health as shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub last_error: Option<String>,
    pub last_sync_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeleteOutcome {
    /// Confirmed remotely (or never known to the remote) and removed locally.
    Deleted,
    /// The remote could not be reached; the meal stays, marked for deletion.
    QueuedForRetry,
    AlreadyDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Acknowledged,
    Retrying,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub acknowledged: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Acknowledged => self.acknowledged += 1,
            EntryOutcome::Retrying => self.retrying += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Skipped => self.skipped += 1,
        }
    }

    fn handled(&self) -> usize {
        self.acknowledged + self.retrying + self.failed + self.skipped
    }
}

/// A queue entry decoded into the remote call it stands for.
enum Outbound {
    CreateMeal(MealPayload),
    UpdateMeal {
        meal: MealPayload,
        base_updated_at: Option<String>,
    },
    DeleteMeal,
    CreateIngredient(IngredientPayload),
    UpdateIngredient(IngredientPayload),
    DeleteIngredient,
    Profile(Value),
}

impl Outbound {
    fn decode(entry: &SyncQueueEntry, base_updated_at: Option<String>) -> serde_json::Result<Self> {
        let payload = entry.payload.clone();
        Ok(match (entry.entity_type, entry.operation) {
            (EntityType::Meal, SyncOperation::Create) => {
                Outbound::CreateMeal(serde_json::from_value(payload)?)
            }
            (EntityType::Meal, SyncOperation::Update) => Outbound::UpdateMeal {
                meal: serde_json::from_value(payload)?,
                base_updated_at,
            },
            (EntityType::Meal, SyncOperation::Delete) => Outbound::DeleteMeal,
            (EntityType::Ingredient, SyncOperation::Create) => {
                Outbound::CreateIngredient(serde_json::from_value(payload)?)
            }
            (EntityType::Ingredient, SyncOperation::Update) => {
                Outbound::UpdateIngredient(serde_json::from_value(payload)?)
            }
            (EntityType::Ingredient, SyncOperation::Delete) => Outbound::DeleteIngredient,
            (EntityType::Profile, _) => Outbound::Profile(payload),
        })
    }
}

enum Prepared {
    Send(SyncQueueEntry, Outbound),
    Skipped,
    Failed,
}

enum DeletePlan {
    Missing,
    Purged,
    Remote(i64),
}

pub struct SyncCoordinator {
    store: SharedStore,
    remote: Arc<dyn RemoteBackend>,
    config: SyncConfig,
    locks: EntityLocks,
    wake: Notify,
    snapshot: watch::Sender<SyncSnapshot>,
    drain_lock: AsyncMutex<()>,
}

impl SyncCoordinator {
    pub fn new(store: SharedStore, remote: Arc<dyn RemoteBackend>, config: SyncConfig) -> Self {
        let (snapshot, _) = watch::channel(SyncSnapshot::default());
        let coordinator = Self {
            store,
            remote,
            config,
            locks: EntityLocks::default(),
            wake: Notify::new(),
            snapshot,
            drain_lock: AsyncMutex::new(()),
        };
        coordinator.refresh_snapshot();
        coordinator
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Ask the background worker to drain soon.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    // --- Local-first mutations ---

    pub fn create_meal(&self, meal: &NewMeal) -> Result<Meal> {
        let created = lock(&self.store).atomically(|db| {
            let created = db.insert_meal(meal)?;
            db.enqueue(&meal_entry(&created, SyncOperation::Create)?)?;
            for ingredient in &created.ingredients {
                db.enqueue(&ingredient_entry(ingredient, SyncOperation::Create)?)?;
            }
            Ok(created)
        })?;
        tracing::info!(
            meal_id = %created.id,
            ingredients = created.ingredients.len(),
            "Logged meal"
        );
        self.changed();
        Ok(created)
    }

    /// `None` when the meal is gone or being deleted.
    pub async fn update_meal(&self, id: &str, edit: &MealEdit) -> Result<Option<Meal>> {
        let _guard = self.locks.lock(id).await;
        let updated = lock(&self.store).atomically(|db| {
            let Some(meal) = db.update_meal(id, edit)? else {
                return Ok(None);
            };
            db.enqueue(&meal_entry(&meal, SyncOperation::Update)?)?;
            db.refresh_meal_sync_status(id)?;
            db.get_meal(id)
        })?;
        if updated.is_some() {
            self.changed();
        }
        Ok(updated)
    }

    pub async fn add_ingredient(
        &self,
        meal_id: &str,
        ingredient: &NewIngredient,
    ) -> Result<Option<Ingredient>> {
        let _guard = self.locks.lock(meal_id).await;
        let added = lock(&self.store).atomically(|db| {
            let Some(added) = db.add_ingredient(meal_id, ingredient)? else {
                return Ok(None);
            };
            db.enqueue(&ingredient_entry(&added, SyncOperation::Create)?)?;
            db.refresh_meal_sync_status(meal_id)?;
            Ok(Some(added))
        })?;
        if added.is_some() {
            self.changed();
        }
        Ok(added)
    }

    /// Apply a user edit. `record` is the matched reference row, used to
    /// rescale macros when only the portion changed.
    pub async fn update_ingredient(
        &self,
        id: &str,
        edit: &IngredientEdit,
        record: Option<&ReferenceRecord>,
    ) -> Result<Option<Ingredient>> {
        let _guard = self.locks.lock(id).await;
        let updated = lock(&self.store).atomically(|db| {
            let Some(updated) = db.edit_ingredient(id, edit, record)? else {
                return Ok(None);
            };
            db.enqueue(&ingredient_entry(&updated, SyncOperation::Update)?)?;
            db.refresh_meal_sync_status(&updated.meal_id)?;
            Ok(Some(updated))
        })?;
        if updated.is_some() {
            self.changed();
        }
        Ok(updated)
    }

    /// Remove an ingredient. One the remote never saw is purged outright.
    pub async fn remove_ingredient(&self, id: &str) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let removed = lock(&self.store).atomically(|db| {
            let Some(ingredient) = db.get_ingredient(id)? else {
                return Ok(false);
            };
            if !db.meal_accepts_writes(&ingredient.meal_id)? {
                return Ok(false);
            }
            let never_sent = db.create_never_sent(EntityType::Ingredient, id)?;
            db.remove_ingredient(id)?;
            db.drop_entries_for_entity(EntityType::Ingredient, id)?;
            if !never_sent {
                db.enqueue(&tombstone(EntityType::Ingredient, id, Some(&ingredient.meal_id)))?;
            }
            db.refresh_meal_sync_status(&ingredient.meal_id)?;
            Ok(true)
        })?;
        if removed {
            self.changed();
        }
        Ok(removed)
    }

    /// Set one profile key; the whole record is pushed.
    pub async fn update_profile(
        &self,
        key: &str,
        value: Value,
    ) -> Result<serde_json::Map<String, Value>> {
        let _guard = self.locks.lock(PROFILE_ENTITY_ID).await;
        let profile = lock(&self.store).atomically(|db| {
            let profile = db.set_profile_value(key, value)?;
            db.enqueue(&NewQueueEntry {
                entity_type: EntityType::Profile,
                entity_id: PROFILE_ENTITY_ID.to_string(),
                parent_id: None,
                operation: SyncOperation::Update,
                payload: Value::Object(profile.clone()),
            })?;
            Ok(profile)
        })?;
        self.changed();
        Ok(profile)
    }

    /// Queue pushes for ingredients whose enrichment has not been acknowledged.
    pub fn record_enrichment(&self, meal_id: &str, ingredient_ids: &[String]) -> Result<usize> {
        let queued = lock(&self.store).atomically(|db| {
            if !db.meal_accepts_writes(meal_id)? {
                return Ok(0);
            }
            let mut queued = 0;
            for id in ingredient_ids {
                let Some(ingredient) = db.get_ingredient(id)? else {
                    continue;
                };
                if ingredient.enrichment_synced || ingredient.meal_id != meal_id {
                    continue;
                }
                db.enqueue(&ingredient_entry(&ingredient, SyncOperation::Update)?)?;
                queued += 1;
            }
            db.refresh_meal_sync_status(meal_id)?;
            Ok(queued)
        })?;
        if queued > 0 {
            tracing::debug!(meal_id, queued, "Queued enrichment for sync");
            self.changed();
        }
        Ok(queued)
    }

    /// Delete a meal, removing it locally only once the remote confirms.
    ///
    /// Queued edits of the meal and its ingredients are dropped first so a
    /// later push cannot resurrect it.
    pub async fn delete_meal(&self, id: &str) -> Result<DeleteOutcome> {
        let _guard = self.locks.lock(id).await;
        let plan = lock(&self.store).atomically(|db| {
            let Some(meal) = db.get_meal(id)? else {
                return Ok(DeletePlan::Missing);
            };
            if meal.server_updated_at.is_none() && db.create_never_sent(EntityType::Meal, id)? {
                db.drop_all_for_meal(id)?;
                db.delete_meal(id)?;
                return Ok(DeletePlan::Purged);
            }
            db.mark_pending_delete(id)?;
            db.drop_queued_for_meal(id)?;
            let entry_id = db.enqueue(&tombstone(EntityType::Meal, id, None))?;
            db.refresh_meal_sync_status(id)?;
            Ok(DeletePlan::Remote(entry_id))
        })?;

        let entry_id = match plan {
            DeletePlan::Missing => return Ok(DeleteOutcome::AlreadyDeleted),
            DeletePlan::Purged => {
                tracing::info!(meal_id = id, "Purged meal the remote never saw");
                self.changed();
                return Ok(DeleteOutcome::Deleted);
            }
            DeletePlan::Remote(entry_id) => entry_id,
        };

        let entry = {
            let db = lock(&self.store);
            if db.is_queue_head(entry_id)? && db.mark_in_flight(entry_id)? {
                db.get_queue_entry(entry_id)?
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            self.changed();
            return Ok(DeleteOutcome::QueuedForRetry);
        };

        self.refresh_snapshot();
        let outcome = self.send_and_settle(&entry, Outbound::DeleteMeal).await?;
        self.changed();
        if outcome == EntryOutcome::Acknowledged {
            Ok(DeleteOutcome::Deleted)
        } else {
            tracing::info!(meal_id = id, "Meal delete queued until the remote is reachable");
            Ok(DeleteOutcome::QueuedForRetry)
        }
    }

    /// Put a failed entry back in line with a fresh retry budget.
    pub fn retry_failed(&self, entry_id: i64) -> Result<bool> {
        let retried = lock(&self.store).atomically(|db| {
            let Some(entry) = db.get_queue_entry(entry_id)? else {
                return Ok(false);
            };
            if !db.retry_failed(entry_id)? {
                return Ok(false);
            }
            if let Some(meal_id) = entry.meal_id() {
                db.refresh_meal_sync_status(meal_id)?;
            }
            Ok(true)
        })?;
        if retried {
            tracing::info!(entry_id, "Retrying failed sync entry");
            self.changed();
        }
        Ok(retried)
    }

    /// Give up on a failed entry. Abandoning a meal delete keeps the meal.
    pub fn discard_failed(&self, entry_id: i64) -> Result<bool> {
        let discarded = lock(&self.store).atomically(|db| {
            let Some(entry) = db.discard_failed(entry_id)? else {
                return Ok(false);
            };
            if entry.entity_type == EntityType::Meal && entry.operation == SyncOperation::Delete {
                db.clear_pending_delete(&entry.entity_id)?;
            }
            if let Some(meal_id) = entry.meal_id() {
                db.refresh_meal_sync_status(meal_id)?;
            }
            Ok(true)
        })?;
        if discarded {
            tracing::info!(entry_id, "Discarded failed sync entry");
            self.refresh_snapshot();
        }
        Ok(discarded)
    }

    // --- Drain ---

    /// Push every entry that is ready, in priority order, `workers` at a time.
    pub async fn drain(self: &Arc<Self>) -> Result<DrainReport> {
        let _running = self.drain_lock.lock().await;
        let mut report = DrainReport::default();
        for _ in 0..MAX_PASSES {
            let mut batch =
                lock(&self.store).ready_entries(&now_rfc3339(), self.config.workers.max(1))?;
            let Some(top) = batch.first().map(|e| e.priority) else {
                break;
            };
            // Lower priorities wait for the next pass.
            batch.retain(|e| e.priority == top);
            let handled_before = report.handled();
            let mut tasks = JoinSet::new();
            for entry in batch {
                let this = Arc::clone(self);
                tasks.spawn(async move {
                    let id = entry.id;
                    (id, this.process_entry(entry).await)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(outcome))) => report.record(outcome),
                    Ok((entry_id, Err(e))) => {
                        tracing::error!(entry_id, error = %format!("{e:#}"), "Failed to process sync entry");
                        report.errors += 1;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Sync task panicked");
                        report.errors += 1;
                    }
                }
            }
            if report.handled() == handled_before {
                break;
            }
        }
        self.refresh_snapshot();
        if report != DrainReport::default() {
            tracing::debug!(?report, "Drained sync queue");
        }
        Ok(report)
    }

    async fn process_entry(&self, entry: SyncQueueEntry) -> Result<EntryOutcome> {
        let _guard = self.locks.lock(&entry.entity_id).await;
        let prepared = {
            let db = lock(&self.store);
            Self::prepare(&db, entry.id)?
        };
        let (entry, outbound) = match prepared {
            Prepared::Send(entry, outbound) => (entry, outbound),
            Prepared::Skipped => return Ok(EntryOutcome::Skipped),
            Prepared::Failed => return Ok(EntryOutcome::Failed),
        };
        self.refresh_snapshot();
        self.send_and_settle(&entry, outbound).await
    }

    /// Re-check the entry under its entity lock and mark it in flight.
    fn prepare(db: &LocalStore, entry_id: i64) -> Result<Prepared> {
        let Some(entry) = db.get_queue_entry(entry_id)? else {
            return Ok(Prepared::Skipped);
        };
        if entry.status != QueueStatus::Pending || !db.is_queue_head(entry_id)? {
            return Ok(Prepared::Skipped);
        }
        if entry.entity_type == EntityType::Ingredient {
            let parent_live = match entry.meal_id() {
                Some(meal_id) => db.meal_accepts_writes(meal_id)?,
                None => false,
            };
            if !parent_live {
                tracing::debug!(entry_id, "Dropping ingredient change of a deleted meal");
                db.complete_entry(entry_id)?;
                return Ok(Prepared::Skipped);
            }
        }

        let base_updated_at = if entry.entity_type == EntityType::Meal {
            db.get_meal(&entry.entity_id)?
                .and_then(|meal| meal.server_updated_at)
        } else {
            None
        };
        match Outbound::decode(&entry, base_updated_at) {
            Ok(outbound) => {
                db.mark_in_flight(entry_id)?;
                if let Some(meal_id) = entry.meal_id() {
                    db.refresh_meal_sync_status(meal_id)?;
                }
                Ok(Prepared::Send(entry, outbound))
            }
            Err(e) => {
                tracing::error!(entry_id, error = %e, "Undecodable sync payload");
                db.mark_failed(entry_id, &format!("undecodable payload: {e}"))?;
                if let Some(meal_id) = entry.meal_id() {
                    db.refresh_meal_sync_status(meal_id)?;
                }
                Ok(Prepared::Failed)
            }
        }
    }

    async fn send(&self, entry: &SyncQueueEntry, outbound: Outbound) -> Result<Option<String>, RemoteError> {
        match outbound {
            Outbound::CreateMeal(meal) => self.remote.create_meal(&meal).await.map(|a| Some(a.updated_at)),
            Outbound::UpdateMeal {
                meal,
                base_updated_at,
            } => self
                .remote
                .update_meal(&meal, base_updated_at.as_deref())
                .await
                .map(|a| Some(a.updated_at)),
            Outbound::DeleteMeal => self.remote.delete_meal(&entry.entity_id).await.map(|()| None),
            Outbound::CreateIngredient(ingredient) => self
                .remote
                .create_ingredient(&ingredient)
                .await
                .map(|a| Some(a.updated_at)),
            Outbound::UpdateIngredient(ingredient) => self
                .remote
                .update_ingredient(&ingredient)
                .await
                .map(|a| Some(a.updated_at)),
            Outbound::DeleteIngredient => self
                .remote
                .delete_ingredient(&entry.entity_id)
                .await
                .map(|()| None),
            Outbound::Profile(profile) => self.remote.put_profile(&profile).await.map(|a| Some(a.updated_at)),
        }
    }

    async fn send_and_settle(&self, entry: &SyncQueueEntry, outbound: Outbound) -> Result<EntryOutcome> {
        let outcome = match self.send(entry, outbound).await {
            Ok(updated_at) => self.acknowledge(entry, updated_at.as_deref())?,
            Err(RemoteError::Conflict { .. }) => self.resolve_conflict(entry).await?,
            Err(RemoteError::NotFound) => self.remote_gone(entry)?,
            Err(err) if err.is_transient() => self.retry_later(entry, &err.to_string())?,
            Err(err) => {
                tracing::warn!(entry_id = entry.id, entity_id = %entry.entity_id, error = %err, "Remote rejected sync entry");
                self.fail(entry, &err.to_string())?
            }
        };
        if let Some(meal_id) = entry.meal_id() {
            lock(&self.store).refresh_meal_sync_status(meal_id)?;
        }
        Ok(outcome)
    }

    fn acknowledge(&self, entry: &SyncQueueEntry, updated_at: Option<&str>) -> Result<EntryOutcome> {
        lock(&self.store).atomically(|db| {
            match (entry.entity_type, entry.operation) {
                (EntityType::Meal, SyncOperation::Delete) => {
                    db.drop_all_for_meal(&entry.entity_id)?;
                    db.delete_meal(&entry.entity_id)?;
                    tracing::info!(meal_id = %entry.entity_id, "Meal deleted");
                }
                (EntityType::Meal, _) => {
                    db.complete_entry(entry.id)?;
                    if let Some(ts) = updated_at {
                        db.record_meal_ack(&entry.entity_id, ts)?;
                    }
                }
                (EntityType::Ingredient, operation) => {
                    db.complete_entry(entry.id)?;
                    if operation != SyncOperation::Delete {
                        if let Some(pushed) =
                            entry.payload.get("client_updated_at").and_then(Value::as_str)
                        {
                            db.mark_ingredient_synced(&entry.entity_id, pushed)?;
                        }
                    }
                    // Ingredient writes bump the meal's server timestamp too.
                    if let (Some(meal_id), Some(ts)) = (entry.meal_id(), updated_at) {
                        let acked = db.get_meal(meal_id)?.and_then(|m| m.server_updated_at);
                        if is_newer(ts, acked.as_deref()) {
                            db.record_meal_ack(meal_id, ts)?;
                        }
                    }
                }
                (EntityType::Profile, _) => {
                    db.complete_entry(entry.id)?;
                    if let Some(ts) = updated_at {
                        db.set_setting(PROFILE_SYNCED_KEY, ts)?;
                    }
                }
            }
            Ok(())
        })?;
        self.snapshot.send_modify(|s| s.last_sync_at = Some(now_rfc3339()));
        Ok(EntryOutcome::Acknowledged)
    }

    /// Server copy wins: merge it, then re-queue enrichment it lacks.
    async fn resolve_conflict(&self, entry: &SyncQueueEntry) -> Result<EntryOutcome> {
        let Some(meal_id) = entry.meal_id() else {
            tracing::info!(entity_id = %entry.entity_id, error = %SyncError::RemoteConflict, "Keeping server profile");
            lock(&self.store).complete_entry(entry.id)?;
            return Ok(EntryOutcome::Acknowledged);
        };

        match self.remote.fetch_meal(meal_id).await {
            Ok(remote) => {
                let requeued = lock(&self.store).atomically(|db| {
                    db.complete_entry(entry.id)?;
                    db.apply_remote_meal(&remote, true)?;
                    let mut requeued = 0;
                    for ingredient in db.unsynced_enrichment(meal_id)? {
                        let queued = db.has_outstanding(EntityType::Ingredient, &ingredient.id, SyncOperation::Update)?
                            || db.has_outstanding(EntityType::Ingredient, &ingredient.id, SyncOperation::Create)?;
                        if !queued {
                            db.enqueue(&ingredient_entry(&ingredient, SyncOperation::Update)?)?;
                            requeued += 1;
                        }
                    }
                    Ok(requeued)
                })?;
                tracing::info!(meal_id, requeued, error = %SyncError::RemoteConflict, "Merged server copy");
                Ok(EntryOutcome::Acknowledged)
            }
            Err(RemoteError::NotFound) => {
                self.remove_meal_locally(meal_id)?;
                Ok(EntryOutcome::Acknowledged)
            }
            Err(err) if err.is_transient() => self.retry_later(entry, &err.to_string()),
            Err(err) => self.fail(entry, &err.to_string()),
        }
    }

    /// The remote no longer has the record.
    fn remote_gone(&self, entry: &SyncQueueEntry) -> Result<EntryOutcome> {
        match (entry.entity_type, entry.operation) {
            (EntityType::Meal, SyncOperation::Update | SyncOperation::Delete) => {
                self.remove_meal_locally(&entry.entity_id)?;
                Ok(EntryOutcome::Acknowledged)
            }
            (EntityType::Ingredient, SyncOperation::Delete) => {
                lock(&self.store).complete_entry(entry.id)?;
                Ok(EntryOutcome::Acknowledged)
            }
            (EntityType::Ingredient, SyncOperation::Update) => {
                lock(&self.store).atomically(|db| {
                    db.complete_entry(entry.id)?;
                    db.remove_ingredient(&entry.entity_id)?;
                    db.drop_entries_for_entity(EntityType::Ingredient, &entry.entity_id)?;
                    Ok(())
                })?;
                tracing::info!(ingredient_id = %entry.entity_id, "Ingredient deleted remotely");
                Ok(EntryOutcome::Acknowledged)
            }
            _ => self.fail(entry, &RemoteError::NotFound.to_string()),
        }
    }

    /// Delete wins: drop the meal and everything queued for it.
    fn remove_meal_locally(&self, meal_id: &str) -> Result<()> {
        lock(&self.store).atomically(|db| {
            db.drop_all_for_meal(meal_id)?;
            db.delete_meal(meal_id)?;
            Ok(())
        })?;
        tracing::info!(meal_id, "Meal deleted remotely, removed locally");
        Ok(())
    }

    fn retry_later(&self, entry: &SyncQueueEntry, error: &str) -> Result<EntryOutcome> {
        let attempts = entry.retry_count + 1;
        if attempts >= self.config.max_retries {
            let err = SyncError::MaxRetriesExceeded {
                attempts,
                last_error: error.to_string(),
            };
            tracing::error!(entry_id = entry.id, entity_id = %entry.entity_id, error = %err, "Giving up on sync entry");
            return self.fail(entry, &err.to_string());
        }
        let delay = self.config.backoff.delay(attempts);
        tracing::warn!(
            entry_id = entry.id,
            attempt = attempts,
            retry_in = ?delay,
            error = %SyncError::RemoteUnavailable(error.to_string()),
            "Sync push deferred"
        );
        lock(&self.store).schedule_retry(entry.id, &due_after(delay), error)?;
        self.note_error(error);
        Ok(EntryOutcome::Retrying)
    }

    fn fail(&self, entry: &SyncQueueEntry, error: &str) -> Result<EntryOutcome> {
        lock(&self.store).mark_failed(entry.id, error)?;
        self.note_error(error);
        Ok(EntryOutcome::Failed)
    }

    // --- Pull ---

    /// Merge meals changed remotely since the stored cursor.
    pub async fn pull(&self) -> Result<usize> {
        let cursor = lock(&self.store).get_setting(SYNC_CURSOR_KEY)?;
        let changes = self
            .remote
            .fetch_changes(cursor.as_deref())
            .await
            .context("Failed to fetch remote changes")?;

        let mut changed = 0;
        for remote in &changes.meals {
            let _guard = self.locks.lock(&remote.id).await;
            let outcome = lock(&self.store).apply_remote_meal(remote, false)?;
            if !matches!(outcome, MergeOutcome::Unchanged | MergeOutcome::Skipped) {
                tracing::debug!(meal_id = %remote.id, ?outcome, "Merged remote meal");
                changed += 1;
            }
        }
        lock(&self.store).set_setting(SYNC_CURSOR_KEY, &changes.server_timestamp)?;
        if changed > 0 {
            tracing::info!(changed, "Pulled remote changes");
        }
        self.snapshot.send_modify(|s| s.last_sync_at = Some(now_rfc3339()));
        self.refresh_snapshot();
        Ok(changed)
    }

    /// Drain everything now, backoff included, then pull. A failed pull is
    /// recorded in the snapshot, not returned.
    pub async fn sync_now(self: &Arc<Self>) -> Result<DrainReport> {
        lock(&self.store).expedite_pending(&now_rfc3339())?;
        let report = self.drain().await?;
        if let Err(e) = self.pull().await {
            let message = format!("{e:#}");
            tracing::warn!(error = %message, "Pull failed");
            self.note_error(&message);
        }
        Ok(report)
    }

    // --- Background worker ---

    /// Drain on wake-ups, when the next retry falls due, and every poll interval.
    pub fn spawn(self: &Arc<Self>) -> SyncWorker {
        let (shutdown, mut stop) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tracing::debug!("Sync worker started");
            loop {
                let idle = this.idle_for();
                tokio::select! {
                    _ = stop.changed() => break,
                    () = this.wake.notified() => {}
                    () = tokio::time::sleep(idle) => {}
                }
                if let Err(e) = this.drain().await {
                    tracing::warn!(error = %format!("{e:#}"), "Background drain failed");
                }
            }
            tracing::debug!("Sync worker stopped");
        });
        SyncWorker { shutdown, handle }
    }

    fn idle_for(&self) -> Duration {
        let poll = self.config.poll_interval();
        let next_due = match lock(&self.store).next_due() {
            Ok(next_due) => next_due,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read sync schedule");
                None
            }
        };
        next_due
            .as_deref()
            .and_then(parse_timestamp)
            .and_then(|due| (due - Utc::now()).to_std().ok())
            .filter(|until| !until.is_zero())
            .map_or(poll, |until| until.min(poll))
    }

    fn changed(&self) {
        self.refresh_snapshot();
        self.wake.notify_one();
    }

    fn refresh_snapshot(&self) {
        let counts = match lock(&self.store).queue_counts() {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count sync queue");
                return;
            }
        };
        self.snapshot.send_modify(|s| {
            s.pending = counts.pending;
            s.in_flight = counts.in_flight;
            s.failed = counts.failed;
        });
    }

    fn note_error(&self, error: &str) {
        self.snapshot
            .send_modify(|s| s.last_error = Some(error.to_string()));
    }
}

/// Handle to the background drain task.
pub struct SyncWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Sync worker panicked");
        }
    }
}

fn meal_entry(meal: &Meal, operation: SyncOperation) -> Result<NewQueueEntry> {
    Ok(NewQueueEntry {
        entity_type: EntityType::Meal,
        entity_id: meal.id.clone(),
        parent_id: None,
        operation,
        payload: serde_json::to_value(MealPayload::from(meal))?,
    })
}

fn ingredient_entry(ingredient: &Ingredient, operation: SyncOperation) -> Result<NewQueueEntry> {
    Ok(NewQueueEntry {
        entity_type: EntityType::Ingredient,
        entity_id: ingredient.id.clone(),
        parent_id: Some(ingredient.meal_id.clone()),
        operation,
        payload: serde_json::to_value(IngredientPayload::from(ingredient))?,
    })
}

fn tombstone(entity_type: EntityType, id: &str, parent_id: Option<&str>) -> NewQueueEntry {
    NewQueueEntry {
        entity_type,
        entity_id: id.to_string(),
        parent_id: parent_id.map(str::to_string),
        operation: SyncOperation::Delete,
        payload: serde_json::json!({ "id": id }),
    }
}

fn due_after(delay: Duration) -> String {
    let now = Utc::now();
    let due = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now);
    format_timestamp(due)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::{MatchMethod, MatchResult, MealSyncStatus};
    use crate::reference::tests::record;
    use crate::remote::tests::{Call, MemoryBackend};
    use crate::store::tests::{new_ingredient, sample_meal};

    fn coordinator(store: &SharedStore, remote: &Arc<MemoryBackend>, config: SyncConfig) -> Arc<SyncCoordinator> {
        Arc::new(SyncCoordinator::new(store.clone(), remote.clone(), config))
    }

    fn fixture() -> (Arc<SyncCoordinator>, Arc<MemoryBackend>, SharedStore) {
        let store = LocalStore::open_in_memory().unwrap().into_shared();
        let remote = Arc::new(MemoryBackend::new());
        let sync = coordinator(&store, &remote, SyncConfig::default());
        (sync, remote, store)
    }

    fn banana_match() -> MatchResult {
        MatchResult {
            cleaned: "banana".to_string(),
            method: MatchMethod::Shortcut,
            record: Some(record(173_944, "Bananas, raw", "Fruits", 89.0)),
            candidates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_meal_create_precedes_its_ingredients() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        assert_eq!(sync.snapshot().pending, 3);

        let report = sync.drain().await.unwrap();
        assert_eq!(report.acknowledged, 3);

        let calls = remote.calls();
        assert_eq!(calls[0], Call::CreateMeal(meal.id.clone()));
        let rest: HashSet<_> = calls[1..].iter().cloned().collect();
        let expected: HashSet<_> = meal
            .ingredients
            .iter()
            .map(|i| Call::CreateIngredient(i.id.clone()))
            .collect();
        assert_eq!(rest, expected);

        let local = lock(&store).get_meal(&meal.id).unwrap().unwrap();
        assert_eq!(local.sync_status, MealSyncStatus::Synced);
        assert!(local.server_updated_at.is_some());
        assert!(local.last_synced_at.is_some());
        assert_eq!(sync.snapshot().pending, 0);
        assert_eq!(remote.meal(&meal.id).unwrap().ingredients.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_changes_stay_queued_until_reachable() {
        let (sync, remote, store) = fixture();
        remote.set_online(false);
        let meal = sync.create_meal(&sample_meal()).unwrap();

        let report = sync.drain().await.unwrap();
        assert_eq!(report.retrying, 1);
        assert!(remote.calls().is_empty());
        {
            let db = lock(&store);
            assert_eq!(db.get_meal(&meal.id).unwrap().unwrap().sync_status, MealSyncStatus::Pending);
            let head = &db.queue_entries().unwrap()[0];
            assert_eq!(head.retry_count, 1);
            assert!(head.last_error.as_deref().unwrap().contains("connection refused"));
        }
        assert!(sync.snapshot().last_error.is_some());

        remote.set_online(true);
        let report = sync.sync_now().await.unwrap();
        assert_eq!(report.acknowledged, 3);
        let db = lock(&store);
        assert!(db.queue_entries().unwrap().is_empty());
        assert_eq!(db.get_meal(&meal.id).unwrap().unwrap().sync_status, MealSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_offline_delete_survives_restart_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nutrimatch.db");
        let remote = Arc::new(MemoryBackend::new());

        let meal_id = {
            let store = LocalStore::open(&path).unwrap().into_shared();
            let sync = coordinator(&store, &remote, SyncConfig::default());
            let meal = sync.create_meal(&sample_meal()).unwrap();
            sync.drain().await.unwrap();

            remote.set_online(false);
            let outcome = sync.delete_meal(&meal.id).await.unwrap();
            assert_eq!(outcome, DeleteOutcome::QueuedForRetry);

            let db = lock(&store);
            let local = db.get_meal(&meal.id).unwrap().unwrap();
            assert!(local.pending_delete);
            let queued = db.queue_entries().unwrap();
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].operation, SyncOperation::Delete);
            meal.id
        };

        let store = LocalStore::open(&path).unwrap().into_shared();
        let sync = coordinator(&store, &remote, SyncConfig::default());
        assert!(lock(&store).get_meal(&meal_id).unwrap().unwrap().pending_delete);

        remote.set_online(true);
        sync.sync_now().await.unwrap();
        assert!(lock(&store).get_meal(&meal_id).unwrap().is_none());
        assert!(lock(&store).queue_entries().unwrap().is_empty());
        assert!(remote.meal(&meal_id).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_delete_of_unsent_meal_is_purged_locally() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        let outcome = sync.delete_meal(&meal.id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(remote.calls().is_empty());
        let db = lock(&store);
        assert!(db.get_meal(&meal.id).unwrap().is_none());
        assert!(db.queue_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_online_delete_completes_inline() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();
        sync.update_meal(&meal.id, &MealEdit { name: Some("Lunch".into()), logged_at: None })
            .await
            .unwrap()
            .unwrap();

        let outcome = sync.delete_meal(&meal.id).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(remote.calls().last(), Some(&Call::DeleteMeal(meal.id.clone())));
        assert!(!remote.calls().contains(&Call::UpdateMeal(meal.id.clone())));
        assert!(lock(&store).get_meal(&meal.id).unwrap().is_none());
        assert_eq!(
            sync.delete_meal(&meal.id).await.unwrap(),
            DeleteOutcome::AlreadyDeleted
        );
    }

    #[tokio::test]
    async fn test_edits_coalesce_into_queued_create() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.update_meal(&meal.id, &MealEdit { name: Some("Brunch".into()), logged_at: None })
            .await
            .unwrap();
        assert_eq!(lock(&store).queue_entries().unwrap().len(), 3);

        sync.drain().await.unwrap();
        assert_eq!(remote.meal(&meal.id).unwrap().name, "Brunch");
        assert!(!remote.calls().contains(&Call::UpdateMeal(meal.id.clone())));
    }

    #[tokio::test]
    async fn test_conflict_takes_server_copy_and_keeps_enrichment() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();

        let banana = meal.ingredients[0].id.clone();
        lock(&store)
            .apply_match(&banana, "Banana, medium", &banana_match())
            .unwrap()
            .unwrap();
        assert_eq!(sync.record_enrichment(&meal.id, &[banana.clone()]).unwrap(), 1);
        sync.update_meal(&meal.id, &MealEdit { name: Some("Lunch".into()), logged_at: None })
            .await
            .unwrap();
        remote.edit_remotely(&meal.id, |m| m.name = "Brunch".to_string());
        remote.conflict_on_next_update();

        sync.drain().await.unwrap();

        let db = lock(&store);
        let local = db.get_meal(&meal.id).unwrap().unwrap();
        assert_eq!(local.name, "Brunch");
        let ingredient = db.get_ingredient(&banana).unwrap().unwrap();
        assert_eq!(ingredient.reference_id, Some(173_944));
        assert!(ingredient.enrichment_synced);
        assert!(db.queue_entries().unwrap().is_empty());

        let server = remote.meal(&meal.id).unwrap();
        assert_eq!(server.name, "Brunch");
        let pushed = server.ingredients.iter().find(|i| i.id == banana).unwrap();
        assert_eq!(pushed.reference_id, Some(173_944));
    }

    #[tokio::test]
    async fn test_remote_delete_wins_over_local_update() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();

        remote.delete_remotely(&meal.id);
        sync.update_meal(&meal.id, &MealEdit { name: Some("Lunch".into()), logged_at: None })
            .await
            .unwrap();
        sync.drain().await.unwrap();

        let db = lock(&store);
        assert!(db.get_meal(&meal.id).unwrap().is_none());
        assert!(db.queue_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_merges_remote_changes_and_advances_cursor() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();
        assert_eq!(sync.pull().await.unwrap(), 0);

        remote.edit_remotely(&meal.id, |m| m.name = "Dinner".to_string());
        remote
            .create_meal(&MealPayload {
                id: "other-device".to_string(),
                name: "Snack".to_string(),
                logged_at: "2026-03-01T15:00:00.000Z".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(sync.pull().await.unwrap(), 2);
        {
            let db = lock(&store);
            assert_eq!(db.get_meal(&meal.id).unwrap().unwrap().name, "Dinner");
            let inserted = db.get_meal("other-device").unwrap().unwrap();
            assert_eq!(inserted.sync_status, MealSyncStatus::Synced);
            assert!(db.get_setting(SYNC_CURSOR_KEY).unwrap().is_some());
        }
        assert_eq!(sync.pull().await.unwrap(), 0);

        remote.delete_remotely("other-device");
        assert_eq!(sync.pull().await.unwrap(), 1);
        assert!(lock(&store).get_meal("other-device").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_entry_blocks_entity_until_retried() {
        let store = LocalStore::open_in_memory().unwrap().into_shared();
        let remote = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            max_retries: 1,
            ..SyncConfig::default()
        };
        let sync = coordinator(&store, &remote, config);

        remote.set_online(false);
        let meal = sync.create_meal(&sample_meal()).unwrap();
        let report = sync.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(sync.snapshot().failed, 1);
        let failed_id = {
            let db = lock(&store);
            assert_eq!(db.get_meal(&meal.id).unwrap().unwrap().sync_status, MealSyncStatus::Error);
            let head = db.queue_entries().unwrap()[0].clone();
            assert!(head.last_error.unwrap().starts_with("gave up after 1 attempts"));
            head.id
        };

        remote.set_online(true);
        assert_eq!(sync.drain().await.unwrap(), DrainReport::default());

        assert!(sync.retry_failed(failed_id).unwrap());
        sync.sync_now().await.unwrap();
        let db = lock(&store);
        assert_eq!(db.get_meal(&meal.id).unwrap().unwrap().sync_status, MealSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_discarding_failed_delete_keeps_meal() {
        let store = LocalStore::open_in_memory().unwrap().into_shared();
        let remote = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            max_retries: 1,
            ..SyncConfig::default()
        };
        let sync = coordinator(&store, &remote, config);
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();

        remote.set_online(false);
        assert_eq!(
            sync.delete_meal(&meal.id).await.unwrap(),
            DeleteOutcome::QueuedForRetry
        );
        let entry_id = lock(&store).queue_entries().unwrap()[0].id;
        assert!(sync.discard_failed(entry_id).unwrap());

        let db = lock(&store);
        let local = db.get_meal(&meal.id).unwrap().unwrap();
        assert!(!local.pending_delete);
        assert_eq!(local.sync_status, MealSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_remove_ingredient_purges_unsent_and_pushes_sent() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();

        let sent = meal.ingredients[0].id.clone();
        let unsent = sync
            .add_ingredient(&meal.id, &new_ingredient("Kale", 50.0))
            .await
            .unwrap()
            .unwrap();
        assert!(sync.remove_ingredient(&unsent.id).await.unwrap());
        assert!(sync.remove_ingredient(&sent).await.unwrap());

        let queued = lock(&store).queue_entries().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].entity_id, sent);
        assert_eq!(queued[0].operation, SyncOperation::Delete);

        sync.drain().await.unwrap();
        assert!(!remote.calls().contains(&Call::CreateIngredient(unsent.id.clone())));
        assert!(remote.calls().contains(&Call::DeleteIngredient(sent.clone())));
        assert_eq!(remote.meal(&meal.id).unwrap().ingredients.len(), 1);
        assert!(!sync.remove_ingredient(&sent).await.unwrap());
    }

    #[tokio::test]
    async fn test_ingredient_edit_syncs_rescaled_macros() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        let banana = meal.ingredients[0].id.clone();
        lock(&store)
            .apply_match(&banana, "Banana, medium", &banana_match())
            .unwrap();
        sync.record_enrichment(&meal.id, &[banana.clone()]).unwrap();
        sync.drain().await.unwrap();

        let edit = IngredientEdit {
            quantity: Some(200.0),
            ..IngredientEdit::default()
        };
        let banana_record = banana_match().record.unwrap();
        let updated = sync
            .update_ingredient(&banana, &edit, Some(&banana_record))
            .await
            .unwrap()
            .unwrap();
        assert!((updated.calories.unwrap() - 178.0).abs() < 1e-9);

        sync.drain().await.unwrap();
        let server = remote.meal(&meal.id).unwrap();
        let pushed = server.ingredients.iter().find(|i| i.id == banana).unwrap();
        assert!((pushed.calories.unwrap() - 178.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pulled_ingredient_edit_replaces_queued_local_edit() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();

        let banana = meal.ingredients[0].id.clone();
        let edit = IngredientEdit {
            quantity: Some(200.0),
            ..IngredientEdit::default()
        };
        sync.update_ingredient(&banana, &edit, None).await.unwrap().unwrap();
        remote.edit_remotely(&meal.id, |m| {
            let slot = m.ingredients.iter_mut().find(|i| i.id == banana).unwrap();
            slot.quantity = 300.0;
            slot.grams = Some(300.0);
        });

        sync.pull().await.unwrap();
        sync.drain().await.unwrap();
        sync.pull().await.unwrap();

        let local = lock(&store).get_ingredient(&banana).unwrap().unwrap();
        assert!((local.quantity - 300.0).abs() < f64::EPSILON);
        let server = remote.meal(&meal.id).unwrap();
        let pushed = server.ingredients.iter().find(|i| i.id == banana).unwrap();
        assert!((pushed.quantity - 300.0).abs() < f64::EPSILON);
        assert!(lock(&store).queue_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pulled_portion_keeps_pending_enrichment_rescaled() {
        let (sync, remote, store) = fixture();
        let meal = sync.create_meal(&sample_meal()).unwrap();
        sync.drain().await.unwrap();

        let banana = meal.ingredients[0].id.clone();
        lock(&store)
            .apply_match(&banana, "Banana, medium", &banana_match())
            .unwrap()
            .unwrap();
        sync.record_enrichment(&meal.id, &[banana.clone()]).unwrap();
        remote.edit_remotely(&meal.id, |m| {
            let slot = m.ingredients.iter_mut().find(|i| i.id == banana).unwrap();
            slot.quantity = 300.0;
            slot.grams = Some(300.0);
        });

        sync.pull().await.unwrap();
        assert_eq!(lock(&store).queue_entries().unwrap().len(), 1);
        sync.drain().await.unwrap();

        let local = lock(&store).get_ingredient(&banana).unwrap().unwrap();
        assert!((local.calories.unwrap() - 267.0).abs() < 1e-9);
        assert!(local.enrichment_synced);
        let server = remote.meal(&meal.id).unwrap();
        let pushed = server.ingredients.iter().find(|i| i.id == banana).unwrap();
        assert!((pushed.quantity - 300.0).abs() < f64::EPSILON);
        assert_eq!(pushed.reference_id, Some(173_944));
        assert!((pushed.calories.unwrap() - 267.0).abs() < 1e-9);
        assert!(lock(&store).queue_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_profile_updates_coalesce_and_push_whole_record() {
        let (sync, remote, store) = fixture();
        sync.update_profile("units", Value::from("metric")).await.unwrap();
        let profile = sync.update_profile("theme", Value::from("dark")).await.unwrap();
        assert_eq!(profile.len(), 2);
        assert_eq!(lock(&store).queue_entries().unwrap().len(), 1);

        sync.drain().await.unwrap();
        assert_eq!(remote.calls(), vec![Call::PutProfile]);
        assert_eq!(
            remote.profile().unwrap(),
            serde_json::json!({ "units": "metric", "theme": "dark" })
        );
        assert!(lock(&store).get_setting(PROFILE_SYNCED_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_worker_drains_on_wake_and_shuts_down() {
        let (sync, _remote, store) = fixture();
        let worker = sync.spawn();
        let meal = sync.create_meal(&sample_meal()).unwrap();

        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = lock(&store).get_meal(&meal.id).unwrap().unwrap().sync_status;
                if status == MealSyncStatus::Synced {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(synced.is_ok());
        worker.shutdown().await;
    }
}
