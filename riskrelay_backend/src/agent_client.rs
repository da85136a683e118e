//! HTTP access to the conversational agents.
//!
//! Both the primary agent and the risk evaluation agent speak the same protocol:
//! create a conversation to obtain a `chatId`, then post key/value parameter
//! lists to `execute`. Every request carries the API key header.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::ApiKeyResolver;
use crate::config::RelayConfig;
use crate::error::AgentApiError;
use crate::http_client::build_http_client_with_timeout;

pub const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteParam {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl ExecuteParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// `message` and `chatId` first, then any extra pairs in order.
pub fn execute_params(message: &str, chat_id: &str, extras: &[(&str, String)]) -> Vec<ExecuteParam> {
    let mut params = vec![
        ExecuteParam::new("message", message),
        ExecuteParam::new("chatId", chat_id),
    ];
    params.extend(
        extras
            .iter()
            .map(|(key, value)| ExecuteParam::new(*key, value.clone())),
    );
    params
}

#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Returns the new conversation's `chatId`.
    async fn create_conversation(&self, agent_code: &str, culture: &str)
        -> Result<String, AgentApiError>;

    /// Returns the agent's raw reply.
    async fn execute(&self, agent_code: &str, params: &[ExecuteParam]) -> Result<Value, AgentApiError>;
}

#[derive(Deserialize)]
struct ConversationCreated {
    #[serde(default, rename = "chatId")]
    chat_id: Option<Value>,
}

#[derive(Clone)]
pub struct SerenityClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SerenityClient {
    pub fn new(base_url: &str, api_key: String, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
            api_key,
        }
    }

    pub fn from_config(config: &RelayConfig, keys: &ApiKeyResolver) -> Result<Self> {
        let api_key = keys.resolve()?;
        let http = build_http_client_with_timeout(Some(config.request_timeout()))?;
        Ok(Self::new(&config.base_url, api_key, http))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AgentApiError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AgentApiError::InvalidEndpoint(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| AgentApiError::InvalidEndpoint(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
    }
}

#[async_trait]
impl AgentApi for SerenityClient {
    async fn create_conversation(
        &self,
        agent_code: &str,
        culture: &str,
    ) -> Result<String, AgentApiError> {
        let url = self.endpoint(&["v2", "agent", agent_code, "conversation"])?;
        let response = self
            .request(url)
            .query(&[("culture", culture)])
            .send()
            .await?;
        let body = read_success_body(response).await?;

        // An unreadable body is treated like one without a chatId.
        let chat_id = serde_json::from_str::<ConversationCreated>(&body)
            .ok()
            .and_then(|created| created.chat_id)
            .and_then(|id| match id {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|id| !id.is_empty());

        match chat_id {
            Some(chat_id) => {
                tracing::debug!("Created conversation {} on agent {}", chat_id, agent_code);
                Ok(chat_id)
            }
            None => {
                tracing::error!("Agent {} created a conversation without chatId", agent_code);
                Err(AgentApiError::MissingChatId)
            }
        }
    }

    async fn execute(&self, agent_code: &str, params: &[ExecuteParam]) -> Result<Value, AgentApiError> {
        let url = self.endpoint(&["v2", "agent", agent_code, "execute"])?;
        let response = self.request(url).json(params).send().await?;
        let body = read_success_body(response).await?;
        serde_json::from_str::<Value>(&body).map_err(|e| {
            AgentApiError::Decode(format!(
                "{} (payload preview: {})",
                e,
                body.chars().take(200).collect::<String>()
            ))
        })
    }
}

async fn read_success_body(response: reqwest::Response) -> Result<String, AgentApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read body".to_string());
        return Err(AgentApiError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.text().await?)
}

pub fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory `AgentApi` with scripted replies per agent code.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct ScriptedAgentApi {
        conversations: Mutex<VecDeque<Result<String, AgentApiError>>>,
        replies: Mutex<HashMap<String, VecDeque<Result<Value, AgentApiError>>>>,
        executed: Mutex<Vec<(String, Vec<ExecuteParam>)>>,
        created: AtomicU32,
    }

    impl ScriptedAgentApi {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn push_conversation(&self, result: Result<String, AgentApiError>) {
            self.conversations.lock().unwrap().push_back(result);
        }

        pub(crate) fn push_reply(&self, agent_code: &str, result: Result<Value, AgentApiError>) {
            self.replies
                .lock()
                .unwrap()
                .entry(agent_code.to_string())
                .or_default()
                .push_back(result);
        }

        pub(crate) fn created_count(&self) -> u32 {
            self.created.load(Ordering::SeqCst)
        }

        pub(crate) fn executed(&self) -> Vec<(String, Vec<ExecuteParam>)> {
            self.executed.lock().unwrap().clone()
        }

        pub(crate) fn executed_for(&self, agent_code: &str) -> Vec<Vec<ExecuteParam>> {
            self.executed()
                .into_iter()
                .filter(|(code, _)| code == agent_code)
                .map(|(_, params)| params)
                .collect()
        }
    }

    pub(crate) fn param<'a>(params: &'a [ExecuteParam], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    #[async_trait]
    impl AgentApi for ScriptedAgentApi {
        async fn create_conversation(
            &self,
            _agent_code: &str,
            _culture: &str,
        ) -> Result<String, AgentApiError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            self.conversations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("chat-{}", n)))
        }

        async fn execute(
            &self,
            agent_code: &str,
            params: &[ExecuteParam],
        ) -> Result<Value, AgentApiError> {
            self.executed
                .lock()
                .unwrap()
                .push((agent_code.to_string(), params.to_vec()));
            self.replies
                .lock()
                .unwrap()
                .get_mut(agent_code)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(serde_json::json!({ "content": "ok" })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::shutdown::ShutdownSignal;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct MockState {
        hits: Arc<AtomicU32>,
        seen_key: Arc<Mutex<Option<String>>>,
        seen_culture: Arc<Mutex<Option<String>>>,
        seen_body: Arc<Mutex<Option<Value>>>,
    }

    async fn spawn_mock(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        format!("http://{}/api/", addr)
    }

    fn client(base: &str) -> SerenityClient {
        SerenityClient::new(base, "test-key".to_string(), reqwest::Client::new())
    }

    async fn create_ok(
        State(state): State<MockState>,
        Path(code): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Json<Value> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        *state.seen_key.lock().unwrap() = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *state.seen_culture.lock().unwrap() = query.get("culture").cloned();
        Json(json!({ "chatId": format!("{}-chat", code) }))
    }

    async fn create_without_chat_id() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn execute_echo(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
        state.hits.fetch_add(1, Ordering::SeqCst);
        *state.seen_body.lock().unwrap() = Some(body);
        Json(json!({ "content": "hola" }))
    }

    async fn execute_rate_limited(State(state): State<MockState>) -> impl IntoResponse {
        state.hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::TOO_MANY_REQUESTS, "slow down")
    }

    #[tokio::test]
    async fn create_conversation_sends_key_and_culture() {
        let state = MockState::default();
        let app = Router::new()
            .route("/api/v2/agent/:code/conversation", post(create_ok))
            .with_state(state.clone());
        let base = spawn_mock(app).await;

        let chat_id = client(&base)
            .create_conversation("GAIAComunidad", "es")
            .await
            .expect("chat id");

        assert_eq!(chat_id, "GAIAComunidad-chat");
        assert_eq!(state.seen_key.lock().unwrap().as_deref(), Some("test-key"));
        assert_eq!(state.seen_culture.lock().unwrap().as_deref(), Some("es"));
    }

    #[tokio::test]
    async fn missing_chat_id_is_fatal() {
        let app = Router::new().route(
            "/api/v2/agent/:code/conversation",
            post(create_without_chat_id),
        );
        let base = spawn_mock(app).await;

        let result = client(&base).create_conversation("GAIAComunidad", "en").await;
        assert!(matches!(result, Err(AgentApiError::MissingChatId)));
    }

    #[tokio::test]
    async fn execute_posts_key_value_pairs() {
        let state = MockState::default();
        let app = Router::new()
            .route("/api/v2/agent/:code/execute", post(execute_echo))
            .with_state(state.clone());
        let base = spawn_mock(app).await;

        let params = execute_params(
            "me siento mal",
            "chat-1",
            &[("correlationId", "abc".to_string())],
        );
        let reply = client(&base)
            .execute("EvaluadorRiesgo", &params)
            .await
            .expect("reply");

        assert_eq!(reply, json!({ "content": "hola" }));
        assert_eq!(
            state.seen_body.lock().unwrap().clone(),
            Some(json!([
                { "Key": "message", "Value": "me siento mal" },
                { "Key": "chatId", "Value": "chat-1" },
                { "Key": "correlationId", "Value": "abc" }
            ]))
        );
    }

    #[tokio::test]
    async fn repeated_rate_limits_exhaust_retries() {
        let state = MockState::default();
        let app = Router::new()
            .route("/api/v2/agent/:code/execute", post(execute_rate_limited))
            .with_state(state.clone());
        let base = spawn_mock(app).await;
        let client = client(&base);
        let params = execute_params("hola", "chat-1", &[]);

        let result = RetryPolicy::new(3, Duration::from_millis(1))
            .run("execute", &ShutdownSignal::never(), || {
                client.execute("GAIAComunidad", &params)
            })
            .await;

        assert!(matches!(result, Err(AgentApiError::Http { status: 429, .. })));
        assert_eq!(state.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_retryable_transport_error() {
        let result = client("http://127.0.0.1:9/api")
            .create_conversation("GAIAComunidad", "en")
            .await;
        match result {
            Err(error) => assert!(error.is_retryable(), "unexpected: {}", error),
            Ok(id) => panic!("unexpected chat id {}", id),
        }
    }

    #[test]
    fn endpoint_appends_escaped_segments() {
        let client = client("https://api.example.com/api/");
        let url = client
            .endpoint(&["v2", "agent", "Agente Uno", "execute"])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/api/v2/agent/Agente%20Uno/execute"
        );
    }
}
