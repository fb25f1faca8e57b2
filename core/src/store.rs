//! Local persistence: meals, ingredients, the sync queue, and settings.
//!
//! One rusqlite connection behind a `std::sync::Mutex`. Callers take the
//! lock for one synchronous batch of statements and never hold it across an
//! `.await`; `atomically` groups a batch into a single transaction.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::models::{
    EntityType, Ingredient, IngredientEdit, MatchMethod, MatchResult, Meal, MealEdit, Micronutrient,
    NewIngredient, NewMeal, NewQueueEntry, ReferenceRecord, SyncOperation, convert_to_grams,
    is_newer, now_rfc3339, parse_timestamp, validate_new_ingredient,
};
use crate::remote::{IngredientPayload, RemoteIngredient, RemoteMeal};

pub type SharedStore = Arc<Mutex<LocalStore>>;

/// Lock the shared store, recovering from a poisoned mutex.
pub fn lock(store: &Mutex<LocalStore>) -> MutexGuard<'_, LocalStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

const MEAL_COLUMNS: &str = "id, name, logged_at, sync_status, last_synced_at, server_updated_at, \
     pending_delete, created_at, updated_at";

const INGREDIENT_COLUMNS: &str = "id, meal_id, position, raw_name, quantity, unit, grams, \
     calories, protein, carbs, fat, micronutrients, reference_id, match_method, match_attempted, \
     enrichment_synced, created_at, updated_at";

const PROFILE_KEY: &str = "profile";
pub(crate) const SYNC_CURSOR_KEY: &str = "sync.cursor";

/// What a remote meal did to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Deleted,
    Unchanged,
    /// Local copy is waiting for its own delete to be confirmed.
    Skipped,
}

/// Per-100g macros scaled to a portion, ready for the ingredient columns.
struct ScaledNutrients {
    calories: Option<f64>,
    protein: Option<f64>,
    carbs: Option<f64>,
    fat: Option<f64>,
    micronutrients: Vec<Micronutrient>,
}

impl ScaledNutrients {
    fn from_record(record: Option<&ReferenceRecord>, grams: Option<f64>) -> Self {
        match (record, grams) {
            (Some(record), Some(grams)) => {
                let macros = record.macros_for(grams);
                Self {
                    calories: Some(macros.calories),
                    protein: macros.protein,
                    carbs: macros.carbs,
                    fat: macros.fat,
                    micronutrients: record.micronutrients_for(grams),
                }
            }
            _ => Self {
                calories: None,
                protein: None,
                carbs: None,
                fat: None,
                micronutrients: Vec::new(),
            },
        }
    }

    fn kept(ingredient: &Ingredient) -> Self {
        Self {
            calories: ingredient.calories,
            protein: ingredient.protein,
            carbs: ingredient.carbs,
            fat: ingredient.fat,
            micronutrients: ingredient.micronutrients.clone(),
        }
    }

    /// Scale stored nutrients to a new portion. Nutrients are linear in
    /// grams, so the ratio of portions is enough without the reference row.
    fn rescaled(ingredient: &Ingredient, grams: Option<f64>) -> Self {
        match (ingredient.grams, grams) {
            (Some(old), Some(new)) if old > 0.0 => {
                let factor = new / old;
                Self {
                    calories: ingredient.calories.map(|v| v * factor),
                    protein: ingredient.protein.map(|v| v * factor),
                    carbs: ingredient.carbs.map(|v| v * factor),
                    fat: ingredient.fat.map(|v| v * factor),
                    micronutrients: ingredient
                        .micronutrients
                        .iter()
                        .map(|m| Micronutrient {
                            amount_per_100g: m.amount_per_100g * factor,
                            ..m.clone()
                        })
                        .collect(),
                }
            }
            (None, None) => Self::kept(ingredient),
            _ => Self::from_record(None, None),
        }
    }
}

pub struct LocalStore {
    pub(crate) conn: Connection,
}

impl LocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = LocalStore { conn };
        store.migrate()?;
        let requeued = store.reset_in_flight()?;
        if requeued > 0 {
            tracing::info!(count = requeued, "Requeued sync entries interrupted by the last run");
        }
        Ok(store)
    }

    #[must_use]
    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Run `f` inside a savepoint: all of its writes land, or none do.
    /// Nests safely.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("SAVEPOINT store_write")?;
        match f(self) {
            Ok(out) => {
                self.conn.execute_batch("RELEASE store_write")?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO store_write; RELEASE store_write")
                {
                    tracing::error!(error = %rollback, "Failed to roll back store write");
                }
                Err(e)
            }
        }
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meals (
                    id TEXT PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL,
                    logged_at TEXT NOT NULL,
                    sync_status TEXT NOT NULL DEFAULT 'pending',
                    last_synced_at TEXT,
                    server_updated_at TEXT,
                    pending_delete INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS ingredients (
                    id TEXT PRIMARY KEY NOT NULL,
                    meal_id TEXT NOT NULL REFERENCES meals(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    raw_name TEXT NOT NULL,
                    quantity REAL NOT NULL,
                    unit TEXT NOT NULL,
                    grams REAL,
                    calories REAL,
                    protein REAL,
                    carbs REAL,
                    fat REAL,
                    micronutrients TEXT NOT NULL DEFAULT '[]',
                    reference_id INTEGER,
                    match_method TEXT,
                    match_attempted INTEGER NOT NULL DEFAULT 0,
                    enrichment_synced INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_ingredients_meal ON ingredients(meal_id, position);

                CREATE TABLE IF NOT EXISTS sync_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    parent_id TEXT,
                    operation TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    next_attempt_at TEXT NOT NULL,
                    last_error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);
                CREATE INDEX IF NOT EXISTS idx_sync_queue_parent ON sync_queue(parent_id);

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn meal_from_row(row: &Row) -> rusqlite::Result<Meal> {
        Ok(Meal {
            id: row.get(0)?,
            name: row.get(1)?,
            logged_at: row.get(2)?,
            sync_status: parse_column(row, 3)?,
            last_synced_at: row.get(4)?,
            server_updated_at: row.get(5)?,
            pending_delete: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            ingredients: Vec::new(),
        })
    }

    fn ingredient_from_row(row: &Row) -> rusqlite::Result<Ingredient> {
        let micronutrients: String = row.get(11)?;
        let micronutrients = serde_json::from_str(&micronutrients)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;
        let match_method = row
            .get::<_, Option<String>>(13)?
            .map(|m| m.parse::<MatchMethod>())
            .transpose()
            .map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(13, Type::Text, e.into())
            })?;
        Ok(Ingredient {
            id: row.get(0)?,
            meal_id: row.get(1)?,
            position: row.get(2)?,
            raw_name: row.get(3)?,
            quantity: row.get(4)?,
            unit: row.get(5)?,
            grams: row.get(6)?,
            calories: row.get(7)?,
            protein: row.get(8)?,
            carbs: row.get(9)?,
            fat: row.get(10)?,
            micronutrients,
            reference_id: row.get(12)?,
            match_method,
            match_attempted: row.get(14)?,
            enrichment_synced: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    // --- Meals ---

    pub fn insert_meal(&self, meal: &NewMeal) -> Result<Meal> {
        for ingredient in &meal.ingredients {
            validate_new_ingredient(ingredient)?;
        }
        if let Some(ts) = &meal.logged_at {
            if parse_timestamp(ts).is_none() {
                bail!("Invalid logged_at timestamp '{ts}'");
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let logged_at = meal.logged_at.clone().unwrap_or_else(|| now.clone());
        self.atomically(|db| {
            db.conn.execute(
                "INSERT INTO meals (id, name, logged_at, sync_status, pending_delete, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
                params![id, meal.name.trim(), logged_at, now],
            )?;
            for (position, ingredient) in meal.ingredients.iter().enumerate() {
                db.insert_ingredient_row(&id, i64::try_from(position)?, ingredient, &now)?;
            }
            Ok(())
        })?;
        self.get_meal(&id)?
            .with_context(|| format!("Meal {id} missing after insert"))
    }

    pub fn get_meal(&self, id: &str) -> Result<Option<Meal>> {
        let meal = self
            .conn
            .query_row(
                &format!("SELECT {MEAL_COLUMNS} FROM meals WHERE id = ?1"),
                params![id],
                Self::meal_from_row,
            )
            .optional()?;
        let Some(mut meal) = meal else {
            return Ok(None);
        };
        meal.ingredients = self.ingredients_for_meal(id)?;
        Ok(Some(meal))
    }

    /// All meals, most recently logged first.
    pub fn list_meals(&self) -> Result<Vec<Meal>> {
        self.query_meals(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals ORDER BY logged_at DESC, created_at DESC"
        ))
    }

    /// Meals that have ingredients but none attempted yet.
    pub fn meals_without_attempts(&self) -> Result<Vec<Meal>> {
        self.query_meals(&format!(
            "SELECT {MEAL_COLUMNS} FROM meals m
             WHERE pending_delete = 0
               AND EXISTS (SELECT 1 FROM ingredients i WHERE i.meal_id = m.id)
               AND NOT EXISTS (SELECT 1 FROM ingredients i WHERE i.meal_id = m.id AND i.match_attempted = 1)
             ORDER BY created_at"
        ))
    }

    fn query_meals(&self, sql: &str) -> Result<Vec<Meal>> {
        let mut stmt = self.conn.prepare(sql)?;
        let meals = stmt
            .query_map([], Self::meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        meals
            .into_iter()
            .map(|mut meal| {
                meal.ingredients = self.ingredients_for_meal(&meal.id)?;
                Ok(meal)
            })
            .collect()
    }

    /// Apply a user edit. `None` when the meal is gone or being deleted.
    pub fn update_meal(&self, id: &str, edit: &MealEdit) -> Result<Option<Meal>> {
        if !self.meal_accepts_writes(id)? {
            return Ok(None);
        }
        if let Some(ts) = &edit.logged_at {
            if parse_timestamp(ts).is_none() {
                bail!("Invalid logged_at timestamp '{ts}'");
            }
        }
        self.conn.execute(
            "UPDATE meals
             SET name = COALESCE(?2, name), logged_at = COALESCE(?3, logged_at), updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                edit.name.as_deref().map(str::trim),
                edit.logged_at,
                now_rfc3339()
            ],
        )?;
        self.get_meal(id)
    }

    pub fn record_meal_ack(&self, id: &str, server_updated_at: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE meals SET server_updated_at = ?2 WHERE id = ?1",
            params![id, server_updated_at],
        )?;
        Ok(())
    }

    pub fn mark_pending_delete(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE meals SET pending_delete = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_rfc3339()],
        )?;
        Ok(rows > 0)
    }

    pub fn clear_pending_delete(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE meals SET pending_delete = 0 WHERE id = ?1 AND pending_delete = 1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    /// Remove the meal row; ingredients cascade.
    pub fn delete_meal(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM meals WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn meal_accepts_writes(&self, id: &str) -> Result<bool> {
        let pending_delete: Option<bool> = self
            .conn
            .query_row(
                "SELECT pending_delete FROM meals WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pending_delete == Some(false))
    }

    fn touch_meal(&self, id: &str, now: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE meals SET updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    // --- Ingredients ---

    fn insert_ingredient_row(
        &self,
        meal_id: &str,
        position: i64,
        ingredient: &NewIngredient,
        now: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let grams = convert_to_grams(ingredient.quantity, &ingredient.unit).map(|(g, _)| g);
        self.conn.execute(
            "INSERT INTO ingredients (id, meal_id, position, raw_name, quantity, unit, grams,
                                      micronutrients, match_attempted, enrichment_synced,
                                      created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]', 0, 1, ?8, ?8)",
            params![
                id,
                meal_id,
                position,
                ingredient.raw_name.trim(),
                ingredient.quantity,
                ingredient.unit.trim(),
                grams,
                now
            ],
        )?;
        Ok(id)
    }

    /// Append an ingredient to a meal. `None` when the meal is gone or being deleted.
    pub fn add_ingredient(
        &self,
        meal_id: &str,
        ingredient: &NewIngredient,
    ) -> Result<Option<Ingredient>> {
        validate_new_ingredient(ingredient)?;
        if !self.meal_accepts_writes(meal_id)? {
            return Ok(None);
        }
        let position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM ingredients WHERE meal_id = ?1",
            params![meal_id],
            |row| row.get(0),
        )?;
        let now = now_rfc3339();
        let id = self.insert_ingredient_row(meal_id, position, ingredient, &now)?;
        self.touch_meal(meal_id, &now)?;
        self.get_ingredient(&id)
    }

    pub fn get_ingredient(&self, id: &str) -> Result<Option<Ingredient>> {
        let ingredient = self
            .conn
            .query_row(
                &format!("SELECT {INGREDIENT_COLUMNS} FROM ingredients WHERE id = ?1"),
                params![id],
                Self::ingredient_from_row,
            )
            .optional()?;
        Ok(ingredient)
    }

    pub fn ingredients_for_meal(&self, meal_id: &str) -> Result<Vec<Ingredient>> {
        self.query_ingredients(
            &format!(
                "SELECT {INGREDIENT_COLUMNS} FROM ingredients WHERE meal_id = ?1
                 ORDER BY position, created_at"
            ),
            meal_id,
        )
    }

    pub fn unattempted_ingredients(&self, meal_id: &str) -> Result<Vec<Ingredient>> {
        self.query_ingredients(
            &format!(
                "SELECT {INGREDIENT_COLUMNS} FROM ingredients
                 WHERE meal_id = ?1 AND match_attempted = 0
                 ORDER BY position"
            ),
            meal_id,
        )
    }

    /// Attempted ingredients whose enrichment the remote has not acknowledged.
    pub fn unsynced_enrichment(&self, meal_id: &str) -> Result<Vec<Ingredient>> {
        self.query_ingredients(
            &format!(
                "SELECT {INGREDIENT_COLUMNS} FROM ingredients
                 WHERE meal_id = ?1 AND match_attempted = 1 AND enrichment_synced = 0
                 ORDER BY position"
            ),
            meal_id,
        )
    }

    fn query_ingredients(&self, sql: &str, meal_id: &str) -> Result<Vec<Ingredient>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![meal_id], Self::ingredient_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Apply a user edit.
    ///
    /// A name change resets the match so the ingredient is enriched again. A
    /// quantity or unit change rescales macros from `record` when it is the
    /// matched reference row; otherwise the stored macros are kept.
    pub fn edit_ingredient(
        &self,
        id: &str,
        edit: &IngredientEdit,
        record: Option<&ReferenceRecord>,
    ) -> Result<Option<Ingredient>> {
        let Some(current) = self.get_ingredient(id)? else {
            return Ok(None);
        };
        if !self.meal_accepts_writes(&current.meal_id)? {
            return Ok(None);
        }

        let updated = NewIngredient {
            raw_name: edit
                .raw_name
                .as_deref()
                .map_or(current.raw_name.as_str(), str::trim)
                .to_string(),
            quantity: edit.quantity.unwrap_or(current.quantity),
            unit: edit
                .unit
                .as_deref()
                .map_or(current.unit.as_str(), str::trim)
                .to_string(),
        };
        validate_new_ingredient(&updated)?;
        let grams = convert_to_grams(updated.quantity, &updated.unit).map(|(g, _)| g);
        let now = now_rfc3339();

        if updated.raw_name != current.raw_name {
            self.conn.execute(
                "UPDATE ingredients
                 SET raw_name = ?2, quantity = ?3, unit = ?4, grams = ?5,
                     calories = NULL, protein = NULL, carbs = NULL, fat = NULL,
                     micronutrients = '[]', reference_id = NULL, match_method = NULL,
                     match_attempted = 0, enrichment_synced = 1, updated_at = ?6
                 WHERE id = ?1",
                params![id, updated.raw_name, updated.quantity, updated.unit, grams, now],
            )?;
        } else {
            let nutrients = match record.filter(|r| Some(r.id) == current.reference_id) {
                Some(record) => ScaledNutrients::from_record(Some(record), grams),
                None => ScaledNutrients::kept(&current),
            };
            self.conn.execute(
                "UPDATE ingredients
                 SET quantity = ?2, unit = ?3, grams = ?4, calories = ?5, protein = ?6,
                     carbs = ?7, fat = ?8, micronutrients = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    id,
                    updated.quantity,
                    updated.unit,
                    grams,
                    nutrients.calories,
                    nutrients.protein,
                    nutrients.carbs,
                    nutrients.fat,
                    serde_json::to_string(&nutrients.micronutrients)?,
                    now
                ],
            )?;
        }
        self.touch_meal(&current.meal_id, &now)?;
        self.get_ingredient(id)
    }

    /// Persist a match for `id`.
    ///
    /// Discarded (`None`) when the ingredient or its meal is gone or being
    /// deleted, or when the name was edited after the match started.
    pub fn apply_match(
        &self,
        id: &str,
        matched_name: &str,
        result: &MatchResult,
    ) -> Result<Option<Ingredient>> {
        let Some(current) = self.get_ingredient(id)? else {
            return Ok(None);
        };
        if current.raw_name != matched_name || !self.meal_accepts_writes(&current.meal_id)? {
            return Ok(None);
        }
        let nutrients = ScaledNutrients::from_record(result.record.as_ref(), current.grams);
        self.conn.execute(
            "UPDATE ingredients
             SET reference_id = ?2, match_method = ?3, match_attempted = 1,
                 calories = ?4, protein = ?5, carbs = ?6, fat = ?7, micronutrients = ?8,
                 enrichment_synced = 0, updated_at = ?9
             WHERE id = ?1",
            params![
                id,
                result.reference_id(),
                result.method.as_str(),
                nutrients.calories,
                nutrients.protein,
                nutrients.carbs,
                nutrients.fat,
                serde_json::to_string(&nutrients.micronutrients)?,
                now_rfc3339()
            ],
        )?;
        self.get_ingredient(id)
    }

    pub fn remove_ingredient(&self, id: &str) -> Result<Option<Ingredient>> {
        let Some(ingredient) = self.get_ingredient(id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM ingredients WHERE id = ?1", params![id])?;
        self.touch_meal(&ingredient.meal_id, &now_rfc3339())?;
        Ok(Some(ingredient))
    }

    /// Mark enrichment acknowledged, unless the row changed after the pushed snapshot.
    pub fn mark_ingredient_synced(&self, id: &str, pushed_updated_at: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE ingredients SET enrichment_synced = 1 WHERE id = ?1 AND updated_at = ?2",
            params![id, pushed_updated_at],
        )?;
        Ok(rows > 0)
    }

    // --- Settings ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    pub fn profile(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        match self.get_setting(PROFILE_KEY)? {
            Some(text) => serde_json::from_str(&text).context("Corrupt profile record"),
            None => Ok(serde_json::Map::new()),
        }
    }

    pub fn set_profile_value(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        if key.trim().is_empty() {
            bail!("Profile key must not be empty");
        }
        let mut profile = self.profile()?;
        profile.insert(key.trim().to_string(), value);
        self.set_setting(PROFILE_KEY, &serde_json::to_string(&profile)?)?;
        Ok(profile)
    }

    // --- Remote merge ---

    /// Merge a server copy of a meal into the local store.
    ///
    /// Tombstones delete locally. Unknown meals are inserted as synced. A
    /// meal waiting for its own delete ignores remote updates. Otherwise the
    /// server copy is applied when newer than the last acknowledged version
    /// (or always, with `force`): meal fields are overwritten and queued meal
    /// updates dropped, remote ingredients overwrite local ones but keep
    /// unacknowledged local enrichment, and local ingredients missing
    /// remotely are removed unless their create is still queued.
    pub fn apply_remote_meal(&self, remote: &RemoteMeal, force: bool) -> Result<MergeOutcome> {
        self.atomically(|db| {
            let local = db.get_meal(&remote.id)?;

            if remote.deleted {
                if local.is_none() {
                    return Ok(MergeOutcome::Unchanged);
                }
                db.drop_all_for_meal(&remote.id)?;
                db.delete_meal(&remote.id)?;
                return Ok(MergeOutcome::Deleted);
            }

            let Some(local) = local else {
                db.insert_remote_meal(remote)?;
                return Ok(MergeOutcome::Inserted);
            };
            if local.pending_delete {
                return Ok(MergeOutcome::Skipped);
            }
            if !force && !is_newer(&remote.updated_at, local.server_updated_at.as_deref()) {
                return Ok(MergeOutcome::Unchanged);
            }

            db.conn.execute(
                "UPDATE meals
                 SET name = ?2, logged_at = ?3, server_updated_at = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    remote.id,
                    remote.name,
                    remote.logged_at,
                    remote.updated_at,
                    now_rfc3339()
                ],
            )?;
            db.drop_pending_updates(EntityType::Meal, &remote.id)?;

            for ingredient in &remote.ingredients {
                db.merge_remote_ingredient(&remote.id, ingredient)?;
            }
            let remote_ids: HashSet<&str> =
                remote.ingredients.iter().map(|i| i.id.as_str()).collect();
            for ingredient in &local.ingredients {
                if remote_ids.contains(ingredient.id.as_str())
                    || db.has_outstanding(EntityType::Ingredient, &ingredient.id, SyncOperation::Create)?
                {
                    continue;
                }
                db.conn.execute(
                    "DELETE FROM ingredients WHERE id = ?1",
                    params![ingredient.id],
                )?;
                db.drop_entries_for_entity(EntityType::Ingredient, &ingredient.id)?;
            }

            db.refresh_meal_sync_status(&remote.id)?;
            Ok(MergeOutcome::Updated)
        })
    }

    fn insert_remote_meal(&self, remote: &RemoteMeal) -> Result<()> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO meals (id, name, logged_at, sync_status, last_synced_at, server_updated_at,
                                pending_delete, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'synced', ?4, ?5, 0, ?4, ?4)",
            params![remote.id, remote.name, remote.logged_at, now, remote.updated_at],
        )?;
        for ingredient in &remote.ingredients {
            self.merge_remote_ingredient(&remote.id, ingredient)?;
        }
        Ok(())
    }

    fn merge_remote_ingredient(&self, meal_id: &str, remote: &RemoteIngredient) -> Result<()> {
        if self.has_outstanding(EntityType::Ingredient, &remote.id, SyncOperation::Delete)? {
            return Ok(());
        }
        // The server copy supersedes local edits that have not gone out yet.
        self.drop_pending_updates(EntityType::Ingredient, &remote.id)?;

        // Unacknowledged enrichment of the same food survives, rescaled to the
        // remote portion and queued again. A rename takes the remote copy whole.
        let local = self
            .get_ingredient(&remote.id)?
            .filter(|l| !l.enrichment_synced && l.raw_name == remote.raw_name);
        if let Some(local) = local {
            let nutrients = ScaledNutrients::rescaled(&local, remote.grams);
            self.conn.execute(
                "UPDATE ingredients
                 SET position = ?2, quantity = ?3, unit = ?4, grams = ?5, calories = ?6,
                     protein = ?7, carbs = ?8, fat = ?9, micronutrients = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    remote.id,
                    remote.position,
                    remote.quantity,
                    remote.unit,
                    remote.grams,
                    nutrients.calories,
                    nutrients.protein,
                    nutrients.carbs,
                    nutrients.fat,
                    serde_json::to_string(&nutrients.micronutrients)?,
                    now_rfc3339()
                ],
            )?;
            if let Some(merged) = self.get_ingredient(&remote.id)? {
                self.enqueue(&NewQueueEntry {
                    entity_type: EntityType::Ingredient,
                    entity_id: merged.id.clone(),
                    parent_id: Some(meal_id.to_string()),
                    operation: SyncOperation::Update,
                    payload: serde_json::to_value(IngredientPayload::from(&merged))?,
                })?;
            }
            return Ok(());
        }

        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO ingredients (id, meal_id, position, raw_name, quantity, unit, grams,
                                      calories, protein, carbs, fat, micronutrients, reference_id,
                                      match_method, match_attempted, enrichment_synced,
                                      created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 1, ?16, ?16)
             ON CONFLICT(id) DO UPDATE SET
                meal_id = excluded.meal_id, position = excluded.position,
                raw_name = excluded.raw_name, quantity = excluded.quantity, unit = excluded.unit,
                grams = excluded.grams, calories = excluded.calories, protein = excluded.protein,
                carbs = excluded.carbs, fat = excluded.fat,
                micronutrients = excluded.micronutrients, reference_id = excluded.reference_id,
                match_method = excluded.match_method, match_attempted = excluded.match_attempted,
                enrichment_synced = 1, updated_at = excluded.updated_at",
            params![
                remote.id,
                meal_id,
                remote.position,
                remote.raw_name,
                remote.quantity,
                remote.unit,
                remote.grams,
                remote.calories,
                remote.protein,
                remote.carbs,
                remote.fat,
                serde_json::to_string(&remote.micronutrients)?,
                remote.reference_id,
                remote.match_method.map(|m| m.as_str()),
                remote.match_attempted,
                now
            ],
        )?;
        Ok(())
    }
}

/// Parse a text column through `FromStr`.
pub(crate) fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}
