//! REST client for the sync backend.
//!
//! Meals live under `/meals`, ingredients under `/meal_ingredients`, and the
//! profile is a single document at `/profile`. Every write answers with the
//! server-assigned `updated_at`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use nutrimatch_core::error::RemoteError;
use nutrimatch_core::remote::{
    ChangeSet, IngredientPayload, MealPayload, RemoteAck, RemoteBackend, RemoteMeal,
};

use crate::config::BackendEndpoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
struct MealUpdate<'a> {
    #[serde(flatten)]
    meal: &'a MealPayload,
    base_updated_at: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct ConflictBody {
    server_updated_at: Option<String>,
}

pub struct RestBackend {
    client: reqwest::Client,
    endpoint: BackendEndpoint,
}

impl RestBackend {
    pub fn new(endpoint: BackendEndpoint) -> Result<Self> {
        Self::with_timeout(endpoint, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: BackendEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("nutrimatch/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, endpoint })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.base_url.trim_end_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(%status, "backend rejected request");
        Err(status_error(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Unavailable(format!("unreadable response: {e}")))
    }
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::CONFLICT => {
            let parsed: ConflictBody = serde_json::from_str(body).unwrap_or_default();
            RemoteError::Conflict {
                server_updated_at: parsed.server_updated_at,
            }
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Unavailable(status.to_string())
        }
        s if s.is_server_error() => RemoteError::Unavailable(status.to_string()),
        _ => RemoteError::Rejected {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        },
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn create_meal(&self, meal: &MealPayload) -> Result<RemoteAck, RemoteError> {
        self.send_json(self.client.post(self.url("/meals")).json(meal))
            .await
    }

    async fn update_meal(
        &self,
        meal: &MealPayload,
        base_updated_at: Option<&str>,
    ) -> Result<RemoteAck, RemoteError> {
        let body = MealUpdate {
            meal,
            base_updated_at,
        };
        self.send_json(
            self.client
                .put(self.url(&format!("/meals/{}", meal.id)))
                .json(&body),
        )
        .await
    }

    async fn delete_meal(&self, meal_id: &str) -> Result<(), RemoteError> {
        self.send(self.client.delete(self.url(&format!("/meals/{meal_id}"))))
            .await?;
        Ok(())
    }

    async fn create_ingredient(
        &self,
        ingredient: &IngredientPayload,
    ) -> Result<RemoteAck, RemoteError> {
        self.send_json(
            self.client
                .post(self.url("/meal_ingredients"))
                .json(ingredient),
        )
        .await
    }

    async fn update_ingredient(
        &self,
        ingredient: &IngredientPayload,
    ) -> Result<RemoteAck, RemoteError> {
        self.send_json(
            self.client
                .put(self.url(&format!("/meal_ingredients/{}", ingredient.id)))
                .json(ingredient),
        )
        .await
    }

    async fn delete_ingredient(&self, ingredient_id: &str) -> Result<(), RemoteError> {
        self.send(
            self.client
                .delete(self.url(&format!("/meal_ingredients/{ingredient_id}"))),
        )
        .await?;
        Ok(())
    }

    async fn put_profile(&self, profile: &serde_json::Value) -> Result<RemoteAck, RemoteError> {
        self.send_json(self.client.put(self.url("/profile")).json(profile))
            .await
    }

    async fn fetch_changes(&self, since: Option<&str>) -> Result<ChangeSet, RemoteError> {
        let mut request = self.client.get(self.url("/meals"));
        if let Some(since) = since {
            request = request.query(&[("updated_since", since)]);
        }
        self.send_json(request).await
    }

    async fn fetch_meal(&self, meal_id: &str) -> Result<RemoteMeal, RemoteError> {
        self.send_json(self.client.get(self.url(&format!("/meals/{meal_id}"))))
            .await
    }
}

/// Backend used when no sync endpoint is configured: every call reports the
/// remote as unavailable, so changes stay queued.
pub struct DetachedBackend;

const DETACHED: &str = "no sync backend configured";

#[async_trait]
impl RemoteBackend for DetachedBackend {
    async fn create_meal(&self, _meal: &MealPayload) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn update_meal(
        &self,
        _meal: &MealPayload,
        _base_updated_at: Option<&str>,
    ) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn delete_meal(&self, _meal_id: &str) -> Result<(), RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn create_ingredient(
        &self,
        _ingredient: &IngredientPayload,
    ) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn update_ingredient(
        &self,
        _ingredient: &IngredientPayload,
    ) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn delete_ingredient(&self, _ingredient_id: &str) -> Result<(), RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn put_profile(&self, _profile: &serde_json::Value) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn fetch_changes(&self, _since: Option<&str>) -> Result<ChangeSet, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }

    async fn fetch_meal(&self, _meal_id: &str) -> Result<RemoteMeal, RemoteError> {
        Err(RemoteError::Unavailable(DETACHED.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Server {
        requests: Arc<Mutex<Vec<String>>>,
        bodies: Arc<Mutex<Vec<Value>>>,
        auth: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl Server {
        fn note(&self, line: String, headers: &HeaderMap) {
            self.requests.lock().unwrap().push(line);
            self.auth.lock().unwrap().push(
                headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            );
        }
    }

    fn ack() -> Json<Value> {
        Json(json!({"updated_at": "2026-01-01T00:00:05.000Z"}))
    }

    async fn create_meal(
        State(s): State<Server>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        s.note("POST /meals".to_string(), &headers);
        s.bodies.lock().unwrap().push(body);
        ack()
    }

    async fn list_meals(
        State(s): State<Server>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        let since = query.get("updated_since").cloned().unwrap_or_default();
        s.note(format!("GET /meals?{since}"), &headers);
        Json(json!({
            "meals": [{
                "id": "m1",
                "name": "Lunch",
                "logged_at": "2026-01-01T12:00:00.000Z",
                "updated_at": "2026-01-01T12:00:01.000Z",
                "ingredients": [{
                    "id": "i1",
                    "meal_id": "m1",
                    "raw_name": "Banana, medium",
                    "quantity": 120.0,
                    "unit": "g",
                    "grams": 120.0,
                    "calories": 107.0,
                    "protein": null,
                    "carbs": null,
                    "fat": null,
                    "reference_id": 9040,
                    "match_method": "shortcut",
                    "match_attempted": true,
                    "updated_at": "2026-01-01T12:00:01.000Z"
                }]
            }, {
                "id": "m2",
                "name": "Gone",
                "logged_at": "2026-01-01T08:00:00.000Z",
                "updated_at": "2026-01-01T12:00:02.000Z",
                "deleted": true
            }],
            "server_timestamp": "2026-01-01T12:00:03.000Z"
        }))
    }

    async fn get_meal(
        State(s): State<Server>,
        headers: HeaderMap,
        Path(id): Path<String>,
    ) -> Result<Json<Value>, HttpStatus> {
        s.note(format!("GET /meals/{id}"), &headers);
        if id != "m1" {
            return Err(HttpStatus::NOT_FOUND);
        }
        Ok(Json(json!({
            "id": "m1",
            "name": "Lunch",
            "logged_at": "2026-01-01T12:00:00.000Z",
            "updated_at": "2026-01-01T12:00:01.000Z"
        })))
    }

    async fn update_meal(
        State(s): State<Server>,
        headers: HeaderMap,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> (HttpStatus, Json<Value>) {
        s.note(format!("PUT /meals/{id}"), &headers);
        s.bodies.lock().unwrap().push(body.clone());
        if body["base_updated_at"] == "stale" {
            return (
                HttpStatus::CONFLICT,
                Json(json!({"server_updated_at": "2026-01-01T00:00:09.000Z"})),
            );
        }
        (HttpStatus::OK, ack())
    }

    async fn delete_meal(
        State(s): State<Server>,
        headers: HeaderMap,
        Path(id): Path<String>,
    ) -> HttpStatus {
        s.note(format!("DELETE /meals/{id}"), &headers);
        match id.as_str() {
            "missing" => HttpStatus::NOT_FOUND,
            "flaky" => HttpStatus::SERVICE_UNAVAILABLE,
            _ => HttpStatus::NO_CONTENT,
        }
    }

    async fn create_ingredient(
        State(s): State<Server>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (HttpStatus, Json<Value>) {
        s.note("POST /meal_ingredients".to_string(), &headers);
        if body["quantity"].as_f64().unwrap_or(0.0) <= 0.0 {
            return (
                HttpStatus::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "quantity must be positive"})),
            );
        }
        s.bodies.lock().unwrap().push(body);
        (HttpStatus::CREATED, ack())
    }

    async fn update_ingredient(
        State(s): State<Server>,
        headers: HeaderMap,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        s.note(format!("PUT /meal_ingredients/{id}"), &headers);
        s.bodies.lock().unwrap().push(body);
        ack()
    }

    async fn delete_ingredient(
        State(s): State<Server>,
        headers: HeaderMap,
        Path(id): Path<String>,
    ) -> HttpStatus {
        s.note(format!("DELETE /meal_ingredients/{id}"), &headers);
        HttpStatus::NO_CONTENT
    }

    async fn put_profile(
        State(s): State<Server>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        s.note("PUT /profile".to_string(), &headers);
        s.bodies.lock().unwrap().push(body);
        ack()
    }

    async fn backend(token: Option<&str>) -> (RestBackend, Server) {
        let server = Server::default();
        let router = Router::new()
            .route("/meals", post(create_meal).get(list_meals))
            .route("/meals/{id}", get(get_meal).put(update_meal).delete(delete_meal))
            .route("/meal_ingredients", post(create_ingredient))
            .route(
                "/meal_ingredients/{id}",
                put(update_ingredient).delete(delete_ingredient),
            )
            .route("/profile", put(put_profile))
            .with_state(server.clone());
        let base = serve(router).await;
        let backend = RestBackend::new(BackendEndpoint {
            base_url: format!("{base}/"),
            token: token.map(str::to_string),
        })
        .unwrap();
        (backend, server)
    }

    fn meal() -> MealPayload {
        MealPayload {
            id: "m1".to_string(),
            name: "Lunch".to_string(),
            logged_at: "2026-01-01T12:00:00.000Z".to_string(),
        }
    }

    fn ingredient(quantity: f64) -> IngredientPayload {
        IngredientPayload {
            id: "i1".to_string(),
            meal_id: "m1".to_string(),
            position: 0,
            raw_name: "Banana, medium".to_string(),
            quantity,
            unit: "g".to_string(),
            grams: Some(quantity),
            calories: None,
            protein: None,
            carbs: None,
            fat: None,
            micronutrients: Vec::new(),
            reference_id: None,
            match_method: None,
            match_attempted: false,
            client_updated_at: "2026-01-01T12:00:00.500Z".to_string(),
        }
    }

    #[tokio::test]
    async fn test_meal_writes_return_server_timestamp() {
        let (backend, server) = backend(Some("tok")).await;

        let created = backend.create_meal(&meal()).await.unwrap();
        assert_eq!(created.updated_at, "2026-01-01T00:00:05.000Z");

        let updated = backend
            .update_meal(&meal(), Some("2026-01-01T00:00:05.000Z"))
            .await
            .unwrap();
        assert_eq!(updated.updated_at, "2026-01-01T00:00:05.000Z");

        let bodies = server.bodies.lock().unwrap();
        assert_eq!(bodies[0]["name"], "Lunch");
        assert_eq!(bodies[1]["id"], "m1");
        assert_eq!(bodies[1]["base_updated_at"], "2026-01-01T00:00:05.000Z");
        assert!(
            server
                .auth
                .lock()
                .unwrap()
                .iter()
                .all(|a| a.as_deref() == Some("Bearer tok"))
        );
    }

    #[tokio::test]
    async fn test_conflict_carries_server_timestamp() {
        let (backend, _) = backend(None).await;
        let err = backend.update_meal(&meal(), Some("stale")).await.unwrap_err();
        assert_eq!(
            err,
            RemoteError::Conflict {
                server_updated_at: Some("2026-01-01T00:00:09.000Z".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_delete_status_mapping() {
        let (backend, server) = backend(None).await;
        backend.delete_meal("m1").await.unwrap();
        assert_eq!(
            backend.delete_meal("missing").await.unwrap_err(),
            RemoteError::NotFound
        );
        let err = backend.delete_meal("flaky").await.unwrap_err();
        assert!(err.is_transient());
        assert!(server.auth.lock().unwrap().iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_ingredient_endpoints() {
        let (backend, server) = backend(None).await;
        backend.create_ingredient(&ingredient(120.0)).await.unwrap();
        backend.update_ingredient(&ingredient(150.0)).await.unwrap();
        backend.delete_ingredient("i1").await.unwrap();

        let requests = server.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![
                "POST /meal_ingredients",
                "PUT /meal_ingredients/i1",
                "DELETE /meal_ingredients/i1",
            ]
        );
        let bodies = server.bodies.lock().unwrap();
        assert_eq!(bodies[1]["quantity"], 150.0);
        assert_eq!(bodies[1]["client_updated_at"], "2026-01-01T12:00:00.500Z");
    }

    #[tokio::test]
    async fn test_validation_failure_is_rejected() {
        let (backend, _) = backend(None).await;
        let err = backend.create_ingredient(&ingredient(0.0)).await.unwrap_err();
        match err {
            RemoteError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert!(message.contains("quantity must be positive"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(!err_is_transient(422));
    }

    fn err_is_transient(status: u16) -> bool {
        status_error(StatusCode::from_u16(status).unwrap(), "").is_transient()
    }

    #[test]
    fn test_status_classes() {
        assert!(err_is_transient(500));
        assert!(err_is_transient(503));
        assert!(err_is_transient(429));
        assert!(!err_is_transient(400));
        assert!(!err_is_transient(401));
        assert_eq!(
            status_error(StatusCode::GONE, ""),
            RemoteError::NotFound
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, "not json"),
            RemoteError::Conflict {
                server_updated_at: None
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_changes_and_meal() {
        let (backend, server) = backend(None).await;

        let changes = backend
            .fetch_changes(Some("2026-01-01T00:00:00.000Z"))
            .await
            .unwrap();
        assert_eq!(changes.server_timestamp, "2026-01-01T12:00:03.000Z");
        assert_eq!(changes.meals.len(), 2);
        assert_eq!(changes.meals[0].ingredients[0].reference_id, Some(9040));
        assert!(changes.meals[1].deleted);
        assert!(changes.meals[1].ingredients.is_empty());

        let meal = backend.fetch_meal("m1").await.unwrap();
        assert_eq!(meal.name, "Lunch");
        assert_eq!(
            backend.fetch_meal("nope").await.unwrap_err(),
            RemoteError::NotFound
        );

        backend.fetch_changes(None).await.unwrap();
        let requests = server.requests.lock().unwrap().clone();
        assert_eq!(requests[0], "GET /meals?2026-01-01T00:00:00.000Z");
        assert_eq!(requests.last().unwrap(), "GET /meals?");
    }

    #[tokio::test]
    async fn test_profile_put() {
        let (backend, server) = backend(None).await;
        let ack = backend
            .put_profile(&json!({"calorie_target": 2200}))
            .await
            .unwrap();
        assert_eq!(ack.updated_at, "2026-01-01T00:00:05.000Z");
        assert_eq!(server.bodies.lock().unwrap()[0]["calorie_target"], 2200);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = RestBackend::new(BackendEndpoint {
            base_url: format!("http://{addr}"),
            token: None,
        })
        .unwrap();
        assert!(backend.delete_meal("m1").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_detached_backend_keeps_everything_queued() {
        let backend = DetachedBackend;
        assert!(backend.create_meal(&meal()).await.unwrap_err().is_transient());
        assert!(backend.fetch_changes(None).await.unwrap_err().is_transient());
    }
}
