//! Completion client for OpenAI-compatible chat-completions endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nutrimatch_core::completion::{
    CompletionChoice, CompletionClient, CompletionRequest, parse_choice,
};
use nutrimatch_core::error::CompletionError;

use crate::config::CompletionEndpoint;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

pub struct OpenAiCompletionClient {
    client: reqwest::Client,
    endpoint: CompletionEndpoint,
}

impl OpenAiCompletionClient {
    pub fn new(endpoint: CompletionEndpoint) -> Result<Self> {
        Self::with_timeout(endpoint, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: CompletionEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("nutrimatch/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, endpoint })
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }
}

fn transport_error(err: &reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout
    } else {
        CompletionError::Network(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> CompletionError {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CompletionError::Timeout,
        _ => {
            let snippet: String = body.chars().take(200).collect();
            CompletionError::Network(format!("{status}: {snippet}"))
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn choose(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionChoice, CompletionError> {
        let prompt = request.prompt();
        let body = ChatRequest {
            model: &self.endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.instruction,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 16,
        };

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "completion request failed");
                transport_error(&e)
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| transport_error(&e))?;
        if !status.is_success() {
            warn!(%status, "completion API returned an error");
            return Err(status_error(status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            CompletionError::InvalidModelResponse(format!("unparseable response body: {e}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::InvalidModelResponse("no choices".to_string()))?;

        debug!(cleaned = %request.cleaned_name, answer = %content.trim(), "model answered");
        parse_choice(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use nutrimatch_core::completion::CompletionCandidate;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct Scripted {
        status: StatusCode,
        reply: Value,
        delay: Duration,
        seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn chat(
        State(state): State<Scripted>,
        headers: axum::http::HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        state.seen.lock().unwrap().push((auth, body));
        tokio::time::sleep(state.delay).await;
        (state.status, Json(state.reply.clone()))
    }

    async fn scripted(status: StatusCode, reply: Value, delay: Duration) -> (String, Scripted) {
        let state = Scripted {
            status,
            reply,
            delay,
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let router = Router::new()
            .route("/v1/chat/completions", post(chat))
            .with_state(state.clone());
        (serve(router).await, state)
    }

    fn answer(content: &str) -> Value {
        json!({
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}]
        })
    }

    fn client_for(base: &str) -> OpenAiCompletionClient {
        OpenAiCompletionClient::with_timeout(
            CompletionEndpoint {
                base_url: format!("{base}/v1/"),
                api_key: "sk-test".to_string(),
                model: "gpt-4o".to_string(),
            },
            Duration::from_millis(300),
        )
        .unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            "tempeh",
            vec![
                CompletionCandidate {
                    id: 16114,
                    name: "Tempeh".to_string(),
                },
                CompletionCandidate {
                    id: 16115,
                    name: "Tempeh, cooked".to_string(),
                },
            ],
        )
    }

    #[tokio::test]
    async fn test_candidate_answer() {
        let (base, state) = scripted(StatusCode::OK, answer("16114"), Duration::ZERO).await;
        let choice = client_for(&base).choose(&request()).await.unwrap();
        assert_eq!(choice, CompletionChoice::Candidate(16114));

        let seen = state.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("Ingredient: tempeh"));
        assert!(user.contains("16115: Tempeh, cooked"));
    }

    #[tokio::test]
    async fn test_none_answer() {
        let (base, _) = scripted(StatusCode::OK, answer("none"), Duration::ZERO).await;
        let choice = client_for(&base).choose(&request()).await.unwrap();
        assert_eq!(choice, CompletionChoice::None);
    }

    #[tokio::test]
    async fn test_prose_answer_is_invalid() {
        let (base, _) = scripted(
            StatusCode::OK,
            answer("I think the best match is tempeh"),
            Duration::ZERO,
        )
        .await;
        let err = client_for(&base).choose(&request()).await.unwrap_err();
        assert!(matches!(err, CompletionError::InvalidModelResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_choices_is_invalid() {
        let (base, _) = scripted(StatusCode::OK, json!({"choices": []}), Duration::ZERO).await;
        let err = client_for(&base).choose(&request()).await.unwrap_err();
        assert!(matches!(err, CompletionError::InvalidModelResponse(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_network() {
        let (base, _) = scripted(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": {"message": "overloaded"}}),
            Duration::ZERO,
        )
        .await;
        let err = client_for(&base).choose(&request()).await.unwrap_err();
        match err {
            CompletionError::Network(message) => assert!(message.contains("500")),
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let (base, _) = scripted(StatusCode::OK, answer("16114"), Duration::from_secs(2)).await;
        let err = client_for(&base).choose(&request()).await.unwrap_err();
        assert_eq!(err, CompletionError::Timeout);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client_for(&format!("http://{addr}"))
            .choose(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Network(_)));
    }
}
