//! The remote backend seam.
//!
//! The server owns `updated_at`: every successful write answers with the
//! timestamp it assigned, and last-writer-wins is decided on those.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::models::{Ingredient, MatchMethod, Meal, Micronutrient};

/// Wire form of a meal, as pushed. Ingredients travel separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPayload {
    pub id: String,
    pub name: String,
    pub logged_at: String,
}

impl From<&Meal> for MealPayload {
    fn from(meal: &Meal) -> Self {
        Self {
            id: meal.id.clone(),
            name: meal.name.clone(),
            logged_at: meal.logged_at.clone(),
        }
    }
}

/// Wire form of an ingredient, as pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientPayload {
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
    /// Local `updated_at` of the snapshot; the ack only marks enrichment
    /// synced if the row has not changed since.
    pub client_updated_at: String,
}

impl From<&Ingredient> for IngredientPayload {
    fn from(i: &Ingredient) -> Self {
        Self {
            id: i.id.clone(),
            meal_id: i.meal_id.clone(),
            position: i.position,
            raw_name: i.raw_name.clone(),
            quantity: i.quantity,
            unit: i.unit.clone(),
            grams: i.grams,
            calories: i.calories,
            protein: i.protein,
            carbs: i.carbs,
            fat: i.fat,
            micronutrients: i.micronutrients.clone(),
            reference_id: i.reference_id,
            match_method: i.match_method,
            match_attempted: i.match_attempted,
            client_updated_at: i.updated_at.clone(),
        }
    }
}

/// Server copy of an ingredient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIngredient {
    pub id: String,
    pub meal_id: String,
    #[serde(default)]
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
    #[serde(default)]
    pub match_attempted: bool,
    pub updated_at: String,
}

/// Server copy of a meal. `deleted` marks a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMeal {
    pub id: String,
    pub name: String,
    pub logged_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub ingredients: Vec<RemoteIngredient>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub meals: Vec<RemoteMeal>,
    /// Cursor for the next `fetch_changes`.
    pub server_timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    pub updated_at: String,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn create_meal(&self, meal: &MealPayload) -> Result<RemoteAck, RemoteError>;

    /// `base_updated_at` is the server timestamp the edit was made against;
    /// the server answers `Conflict` when its copy is newer.
    async fn update_meal(
        &self,
        meal: &MealPayload,
        base_updated_at: Option<&str>,
    ) -> Result<RemoteAck, RemoteError>;

    async fn delete_meal(&self, meal_id: &str) -> Result<(), RemoteError>;

    async fn create_ingredient(
        &self,
        ingredient: &IngredientPayload,
    ) -> Result<RemoteAck, RemoteError>;

    async fn update_ingredient(
        &self,
        ingredient: &IngredientPayload,
    ) -> Result<RemoteAck, RemoteError>;

    async fn delete_ingredient(&self, ingredient_id: &str) -> Result<(), RemoteError>;

    async fn put_profile(&self, profile: &serde_json::Value) -> Result<RemoteAck, RemoteError>;

    /// Meals changed since `since` (all meals when `None`), tombstones included.
    async fn fetch_changes(&self, since: Option<&str>) -> Result<ChangeSet, RemoteError>;

    async fn fetch_meal(&self, meal_id: &str) -> Result<RemoteMeal, RemoteError>;
}
