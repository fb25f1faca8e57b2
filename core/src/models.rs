use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// How an ingredient was resolved to a reference record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Shortcut,
    Exact,
    Fuzzy,
    LlmReranked,
    Blacklisted,
    NoMatch,
}

impl MatchMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Shortcut => "shortcut",
            MatchMethod::Exact => "exact",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::LlmReranked => "llm_reranked",
            MatchMethod::Blacklisted => "blacklisted",
            MatchMethod::NoMatch => "no_match",
        }
    }

    /// Terminal methods that carry no reference record.
    #[must_use]
    pub fn is_unmatchable(self) -> bool {
        matches!(self, MatchMethod::Blacklisted | MatchMethod::NoMatch)
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "shortcut" => MatchMethod::Shortcut,
            "exact" => MatchMethod::Exact,
            "fuzzy" => MatchMethod::Fuzzy,
            "llm_reranked" => MatchMethod::LlmReranked,
            "blacklisted" => MatchMethod::Blacklisted,
            "no_match" => MatchMethod::NoMatch,
            other => bail!("Unknown match method '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MealSyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl MealSyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MealSyncStatus::Pending => "pending",
            MealSyncStatus::Syncing => "syncing",
            MealSyncStatus::Synced => "synced",
            MealSyncStatus::Error => "error",
        }
    }
}

impl FromStr for MealSyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => MealSyncStatus::Pending,
            "syncing" => MealSyncStatus::Syncing,
            "synced" => MealSyncStatus::Synced,
            "error" => MealSyncStatus::Error,
            other => bail!("Unknown sync status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Meal,
    Ingredient,
    Profile,
}

impl EntityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Meal => "meal",
            EntityType::Ingredient => "ingredient",
            EntityType::Profile => "profile",
        }
    }

    /// Drain priority; higher drains first.
    #[must_use]
    pub fn priority(self) -> i64 {
        match self {
            EntityType::Meal => 3,
            EntityType::Ingredient => 2,
            EntityType::Profile => 1,
        }
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "meal" => EntityType::Meal,
            "ingredient" => EntityType::Ingredient,
            "profile" => EntityType::Profile,
            other => bail!("Unknown entity type '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl FromStr for SyncOperation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "create" => SyncOperation::Create,
            "update" => SyncOperation::Update,
            "delete" => SyncOperation::Delete,
            other => bail!("Unknown sync operation '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Failed,
}

impl QueueStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => QueueStatus::Pending,
            "in_flight" => QueueStatus::InFlight,
            "failed" => QueueStatus::Failed,
            other => bail!("Unknown queue status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Micronutrient {
    pub name: String,
    pub unit: String,
    pub amount_per_100g: f64,
}

/// A canonical row of the embedded nutrition dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub id: i64,
    pub canonical_name: String,
    pub common_name: Option<String>,
    pub category: Option<String>,
    pub calories_per_100g: f64,
    pub protein_per_100g: Option<f64>,
    pub carbs_per_100g: Option<f64>,
    pub fat_per_100g: Option<f64>,
    #[serde(default)]
    pub micronutrients: Vec<Micronutrient>,
}

impl ReferenceRecord {
    #[must_use]
    pub fn macros_for(&self, grams: f64) -> Macros {
        let scale = grams / 100.0;
        Macros {
            calories: self.calories_per_100g * scale,
            protein: self.protein_per_100g.map(|v| v * scale),
            carbs: self.carbs_per_100g.map(|v| v * scale),
            fat: self.fat_per_100g.map(|v| v * scale),
        }
    }

    #[must_use]
    pub fn micronutrients_for(&self, grams: f64) -> Vec<Micronutrient> {
        let scale = grams / 100.0;
        self.micronutrients
            .iter()
            .map(|m| Micronutrient {
                name: m.name.clone(),
                unit: m.unit.clone(),
                amount_per_100g: m.amount_per_100g * scale,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macros {
    pub calories: f64,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
}

/// Transient scoring of one search hit; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub reference_id: i64,
    pub canonical_name: String,
    pub score: f64,
}

/// Outcome of resolving one ingredient name.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub cleaned: String,
    pub method: MatchMethod,
    pub record: Option<ReferenceRecord>,
    pub candidates: Vec<MatchCandidate>,
}

impl MatchResult {
    #[must_use]
    pub fn unmatched(cleaned: String, method: MatchMethod) -> Self {
        Self {
            cleaned,
            method,
            record: None,
            candidates: Vec::new(),
        }
    }

    #[must_use]
    pub fn reference_id(&self) -> Option<i64> {
        self.record.as_ref().map(|r| r.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: String,
    pub meal_id: String,
    pub position: i64,
    pub raw_name: String,
    pub quantity: f64,
    pub unit: String,
    pub grams: Option<f64>,
    pub calories: Option<f64>,
    pub protein: Option<f64>,
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
    #[serde(default)]
    pub micronutrients: Vec<Micronutrient>,
    pub reference_id: Option<i64>,
    pub match_method: Option<MatchMethod>,
    pub match_attempted: bool,
    /// False while enrichment written locally has not been acknowledged remotely.
    pub enrichment_synced: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Ingredient {
    /// Matched or flagged unmatchable; never ambiguous once attempted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.match_attempted
            && (self.reference_id.is_some()
                || self.match_method.is_some_and(MatchMethod::is_unmatchable))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIngredient {
    pub raw_name: String,
    pub quantity: f64,
    pub unit: String,
}

/// User edit of an existing ingredient. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngredientEdit {
    pub raw_name: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meal {
    pub id: String,
    pub name: String,
    pub logged_at: String,
    pub sync_status: MealSyncStatus,
    pub last_synced_at: Option<String>,
    pub server_updated_at: Option<String>,
    pub pending_delete: bool,
    pub created_at: String,
    pub updated_at: String,
    pub ingredients: Vec<Ingredient>,
}

impl Meal {
    #[must_use]
    pub fn attempted_count(&self) -> usize {
        self.ingredients.iter().filter(|i| i.match_attempted).count()
    }

    #[must_use]
    pub fn total_calories(&self) -> f64 {
        self.ingredients.iter().filter_map(|i| i.calories).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMeal {
    pub name: String,
    /// RFC 3339; defaults to now.
    pub logged_at: Option<String>,
    pub ingredients: Vec<NewIngredient>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MealEdit {
    pub name: Option<String>,
    pub logged_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub status: QueueStatus,
    pub priority: i64,
    pub created_at: String,
    pub next_attempt_at: String,
    pub last_error: Option<String>,
}

impl SyncQueueEntry {
    /// The meal this entry belongs to, if any.
    #[must_use]
    pub fn meal_id(&self) -> Option<&str> {
        match self.entity_type {
            EntityType::Meal => Some(&self.entity_id),
            EntityType::Ingredient => self.parent_id.as_deref(),
            EntityType::Profile => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub operation: SyncOperation,
    pub payload: serde_json::Value,
}

/// Convert a quantity in the given unit to grams.
/// Volume-based conversions assume water density (1 ml = 1 g).
/// Returns `(grams, is_approximate)` where `is_approximate` is true for volume conversions.
#[must_use]
pub fn convert_to_grams(quantity: f64, unit: &str) -> Option<(f64, bool)> {
    let lower = unit.trim().to_lowercase();
    match lower.as_str() {
        "g" | "gram" | "grams" => Some((quantity, false)),
        "kg" | "kilogram" | "kilograms" => Some((quantity * 1000.0, false)),
        "lb" | "lbs" | "pound" | "pounds" => Some((quantity * 454.0, false)),
        "oz" | "ounce" | "ounces" => Some((quantity * 28.35, false)),
        "tbsp" | "tablespoon" | "tablespoons" => Some((quantity * 15.0, true)),
        "tsp" | "teaspoon" | "teaspoons" => Some((quantity * 5.0, true)),
        "ml" | "milliliter" | "milliliters" | "millilitre" | "millilitres" => {
            Some((quantity, true))
        }
        "l" | "liter" | "liters" | "litre" | "litres" => Some((quantity * 1000.0, true)),
        _ => None,
    }
}

pub fn validate_new_ingredient(ingredient: &NewIngredient) -> Result<()> {
    if ingredient.raw_name.trim().is_empty() {
        bail!("Ingredient name must not be empty");
    }
    if !ingredient.quantity.is_finite() || ingredient.quantity < 0.0 {
        bail!(
            "Invalid quantity {} for '{}'",
            ingredient.quantity,
            ingredient.raw_name
        );
    }
    Ok(())
}

/// Timestamps are stored as UTC RFC 3339 with millisecond precision so they
/// order lexicographically.
#[must_use]
pub fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// True when `candidate` is strictly later than `baseline`. A missing baseline
/// is always older.
#[must_use]
pub fn is_newer(candidate: &str, baseline: Option<&str>) -> bool {
    let Some(baseline) = baseline else {
        return true;
    };
    match (parse_timestamp(candidate), parse_timestamp(baseline)) {
        (Some(a), Some(b)) => a > b,
        _ => candidate > baseline,
    }
}
