//! The outbound sync queue, persisted next to the data it describes.
//!
//! Ordering rules live here: one entry per entity may be outstanding at the
//! head, later entries for that entity wait behind it (a failed head too),
//! and ingredient entries wait for their meal's create to be acknowledged.

use std::collections::HashSet;

use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;

use crate::models::{
    EntityType, MealSyncStatus, NewQueueEntry, QueueStatus, SyncOperation, SyncQueueEntry,
    now_rfc3339,
};
use crate::store::{LocalStore, parse_column};

const ENTRY_COLUMNS: &str = "id, entity_type, entity_id, parent_id, operation, payload, \
     retry_count, status, priority, created_at, next_attempt_at, last_error";

/// An entry that has never been handed to the remote.
const NEVER_ATTEMPTED: &str = "status = 'pending' AND retry_count = 0 AND last_error IS NULL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl LocalStore {
    fn entry_from_row(row: &Row) -> rusqlite::Result<SyncQueueEntry> {
        let payload: String = row.get(5)?;
        let payload = serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
        Ok(SyncQueueEntry {
            id: row.get(0)?,
            entity_type: parse_column(row, 1)?,
            entity_id: row.get(2)?,
            parent_id: row.get(3)?,
            operation: parse_column(row, 4)?,
            payload,
            retry_count: row.get(6)?,
            status: parse_column(row, 7)?,
            priority: row.get(8)?,
            created_at: row.get(9)?,
            next_attempt_at: row.get(10)?,
            last_error: row.get(11)?,
        })
    }

    /// Append an entry.
    ///
    /// An update whose entity's newest entry is a create or update that was
    /// never attempted replaces that entry's payload instead.
    pub fn enqueue(&self, entry: &NewQueueEntry) -> Result<i64> {
        let payload = serde_json::to_string(&entry.payload)?;
        if entry.operation == SyncOperation::Update {
            let tail: Option<(i64, String, bool)> = self
                .conn
                .query_row(
                    &format!(
                        "SELECT id, operation, ({NEVER_ATTEMPTED}) FROM sync_queue
                         WHERE entity_type = ?1 AND entity_id = ?2
                         ORDER BY id DESC LIMIT 1"
                    ),
                    params![entry.entity_type.as_str(), entry.entity_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            if let Some((id, operation, true)) = tail {
                if operation != SyncOperation::Delete.as_str() {
                    self.conn.execute(
                        "UPDATE sync_queue SET payload = ?2 WHERE id = ?1",
                        params![id, payload],
                    )?;
                    return Ok(id);
                }
            }
        }

        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, parent_id, operation, payload,
                                     retry_count, status, priority, created_at, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending', ?6, ?7, ?7)",
            params![
                entry.entity_type.as_str(),
                entry.entity_id,
                entry.parent_id,
                entry.operation.as_str(),
                payload,
                entry.entity_type.priority(),
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn queue_entries(&self) -> Result<Vec<SyncQueueEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ENTRY_COLUMNS} FROM sync_queue ORDER BY id"))?;
        let entries = stmt
            .query_map([], Self::entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn get_queue_entry(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
                params![id],
                Self::entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Entries that may be pushed now, highest priority first, then FIFO.
    pub fn ready_entries(&self, now: &str, limit: usize) -> Result<Vec<SyncQueueEntry>> {
        let all = self.queue_entries()?;
        let unacked_meal_creates: HashSet<&str> = all
            .iter()
            .filter(|e| e.entity_type == EntityType::Meal && e.operation == SyncOperation::Create)
            .map(|e| e.entity_id.as_str())
            .collect();

        let mut heads = HashSet::new();
        let mut ready: Vec<&SyncQueueEntry> = Vec::new();
        for entry in &all {
            if !heads.insert((entry.entity_type, entry.entity_id.as_str())) {
                continue;
            }
            if entry.status != QueueStatus::Pending || entry.next_attempt_at.as_str() > now {
                continue;
            }
            let waiting_for_parent = entry.entity_type == EntityType::Ingredient
                && entry
                    .parent_id
                    .as_deref()
                    .is_some_and(|p| unacked_meal_creates.contains(p));
            if !waiting_for_parent {
                ready.push(entry);
            }
        }

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(ready.into_iter().take(limit).cloned().collect())
    }

    /// True when `id` is the oldest entry of its entity.
    pub fn is_queue_head(&self, id: i64) -> Result<bool> {
        let head: Option<i64> = self.conn.query_row(
            "SELECT MIN(q.id) FROM sync_queue q
             JOIN sync_queue e ON q.entity_type = e.entity_type AND q.entity_id = e.entity_id
             WHERE e.id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(head == Some(id))
    }

    /// Earliest time a pending entry becomes due.
    pub fn next_due(&self) -> Result<Option<String>> {
        let due = self.conn.query_row(
            "SELECT MIN(next_attempt_at) FROM sync_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(due)
    }

    /// Make every backing-off entry due now, e.g. when connectivity returns.
    pub fn expedite_pending(&self, now: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET next_attempt_at = ?1
             WHERE status = 'pending' AND next_attempt_at > ?1",
            params![now],
        )?;
        Ok(rows)
    }

    pub fn mark_in_flight(&self, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET status = 'in_flight' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// The remote acknowledged the entry.
    pub fn complete_entry(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn schedule_retry(&self, id: i64, next_attempt_at: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = retry_count + 1,
                 next_attempt_at = ?2, last_error = ?3
             WHERE id = ?1",
            params![id, next_attempt_at, error],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_queue
             SET status = 'failed', retry_count = retry_count + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    /// Give a failed entry a fresh retry budget. The last error is kept, so
    /// the entry still counts as attempted.
    pub fn retry_failed(&self, id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, next_attempt_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, now_rfc3339()],
        )?;
        Ok(rows > 0)
    }

    /// Drop a failed entry; returns it when it was failed.
    pub fn discard_failed(&self, id: i64) -> Result<Option<SyncQueueEntry>> {
        let Some(entry) = self.get_queue_entry(id)? else {
            return Ok(None);
        };
        if entry.status != QueueStatus::Failed {
            return Ok(None);
        }
        self.complete_entry(id)?;
        Ok(Some(entry))
    }

    /// Entries left in flight by a crash go back to pending, counted as attempted.
    pub(crate) fn reset_in_flight(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = retry_count + 1,
                 last_error = COALESCE(last_error, 'interrupted')
             WHERE status = 'in_flight'",
            [],
        )?;
        Ok(rows)
    }

    pub fn has_outstanding(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: SyncOperation,
    ) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM sync_queue
                 WHERE entity_type = ?1 AND entity_id = ?2 AND operation = ?3 LIMIT 1",
                params![entity_type.as_str(), entity_id, operation.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The entity's create is queued and has never been sent.
    pub fn create_never_sent(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                &format!(
                    "SELECT id FROM sync_queue
                     WHERE entity_type = ?1 AND entity_id = ?2 AND operation = 'create'
                       AND {NEVER_ATTEMPTED}
                     LIMIT 1"
                ),
                params![entity_type.as_str(), entity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub(crate) fn drop_pending_updates(&self, entity_type: EntityType, entity_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_queue
             WHERE entity_type = ?1 AND entity_id = ?2 AND operation = 'update' AND status = 'pending'",
            params![entity_type.as_str(), entity_id],
        )?;
        Ok(rows)
    }

    /// Drop every entry of one entity that is not on the wire.
    pub fn drop_entries_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_queue
             WHERE entity_type = ?1 AND entity_id = ?2 AND status != 'in_flight'",
            params![entity_type.as_str(), entity_id],
        )?;
        Ok(rows)
    }

    /// Drop entries for a meal and its ingredients that are not on the wire.
    pub fn drop_queued_for_meal(&self, meal_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_queue
             WHERE status != 'in_flight'
               AND ((entity_type = 'meal' AND entity_id = ?1) OR parent_id = ?1)",
            params![meal_id],
        )?;
        Ok(rows)
    }

    /// Drop every entry for a meal and its ingredients, in flight or not.
    pub fn drop_all_for_meal(&self, meal_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_queue WHERE (entity_type = 'meal' AND entity_id = ?1) OR parent_id = ?1",
            params![meal_id],
        )?;
        Ok(rows)
    }

    pub fn queue_counts(&self) -> Result<QueueCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_column::<QueueStatus>(row, 0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = usize::try_from(n)?;
            match status {
                QueueStatus::Pending => counts.pending = n,
                QueueStatus::InFlight => counts.in_flight = n,
                QueueStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Derive the meal's sync status from its outstanding entries.
    pub fn refresh_meal_sync_status(&self, meal_id: &str) -> Result<MealSyncStatus> {
        let statuses: Vec<QueueStatus> = {
            let mut stmt = self.conn.prepare(
                "SELECT DISTINCT status FROM sync_queue
                 WHERE (entity_type = 'meal' AND entity_id = ?1) OR parent_id = ?1",
            )?;
            stmt.query_map(params![meal_id], |row| parse_column(row, 0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let status = if statuses.contains(&QueueStatus::Failed) {
            MealSyncStatus::Error
        } else if statuses.contains(&QueueStatus::InFlight) {
            MealSyncStatus::Syncing
        } else if statuses.contains(&QueueStatus::Pending) {
            MealSyncStatus::Pending
        } else {
            MealSyncStatus::Synced
        };
        self.conn.execute(
            "UPDATE meals
             SET last_synced_at = CASE WHEN ?2 = 'synced' AND sync_status != 'synced'
                                       THEN ?3 ELSE last_synced_at END,
                 sync_status = ?2
             WHERE id = ?1",
            params![meal_id, status.as_str(), now_rfc3339()],
        )?;
        Ok(status)
    }
}
