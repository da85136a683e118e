//! Server-sent-event transport for agent runs.
//!
//! `task_stop` frames report individual skill results and feed a flag
//! accumulator; the `stop` frame carries the final answer.

use std::time::Duration;

use anyhow::Result;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::agent_client::{normalize_base_url, API_KEY_HEADER};
use crate::auth::ApiKeyResolver;
use crate::config::RelayConfig;
use crate::error::AgentApiError;
use crate::flags::RiskFlags;
use crate::http_client::build_http_client;
use crate::normalizer::scan_named_entries;
use crate::shutdown::ShutdownSignal;
use crate::transcript::{preview, ConversationTurn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamMessage {
    pub role: String,
    pub content: String,
}

impl StreamMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for StreamMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role().as_str().to_string(),
            content: turn.content().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    TaskStop { task_key: String, output: Value },
    Stop { content: Option<String> },
    Other(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    task_key: Option<String>,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    result: Value,
}

/// `None` for data that is not a JSON frame.
pub fn parse_frame(data: &str) -> Option<StreamFrame> {
    let raw: RawFrame = serde_json::from_str(data.trim()).ok()?;
    let frame = match raw.kind.as_str() {
        "task_stop" => match raw.task_key {
            Some(task_key) => StreamFrame::TaskStop {
                task_key,
                output: raw.output,
            },
            None => StreamFrame::Other(raw.kind),
        },
        "stop" => StreamFrame::Stop {
            content: raw
                .result
                .get("content")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        },
        _ => StreamFrame::Other(raw.kind),
    };
    Some(frame)
}

/// Flags OR-ed across every skill result of one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagAccumulator {
    flags: RiskFlags,
}

impl FlagAccumulator {
    /// Returns true when the observation raised a new flag.
    pub fn observe(&mut self, task_key: &str, output: &Value) -> bool {
        let mut entry = Map::new();
        entry.insert(task_key.to_string(), output.clone());
        let merged = self.flags.union(scan_named_entries(&entry));
        let changed = merged != self.flags;
        self.flags = merged;
        changed
    }

    pub fn flags(&self) -> RiskFlags {
        self.flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Flags(RiskFlags),
    Final { text: String, flags: RiskFlags },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub final_text: Option<String>,
    pub flags: RiskFlags,
    pub frames: usize,
}

pub struct StreamClient {
    http: reqwest::Client,
    api_root: String,
    api_key: String,
    idle_timeout: Duration,
}

impl StreamClient {
    pub fn new(base_url: &str, api_key: String, http: reqwest::Client, idle_timeout: Duration) -> Self {
        Self {
            http,
            api_root: api_root(base_url),
            api_key,
            idle_timeout,
        }
    }

    /// Streams are long-lived, so the client carries no overall request timeout.
    pub fn from_config(config: &RelayConfig, keys: &ApiKeyResolver) -> Result<Self> {
        let api_key = keys.resolve()?;
        Ok(Self::new(
            &config.base_url,
            api_key,
            build_http_client()?,
            config.stream_idle_timeout(),
        ))
    }

    pub fn run_url(&self, agent_code: &str) -> String {
        format!("{}/v1/agents/{}/run", self.api_root, agent_code)
    }

    pub async fn run(
        &self,
        agent_code: &str,
        messages: &[StreamMessage],
        updates: Option<&flume::Sender<StreamUpdate>>,
        shutdown: &ShutdownSignal,
    ) -> Result<StreamOutcome, AgentApiError> {
        let url = self.run_url(agent_code);
        tracing::info!("Opening event stream {}", url);

        let request = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({ "input": { "messages": messages } }));

        let response = tokio::select! {
            response = request.send() => response?,
            _ = shutdown.cancelled() => return Err(AgentApiError::Cancelled),
        };

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

        consume_event_stream(response.bytes_stream(), self.idle_timeout, updates, shutdown).await
    }
}

/// Drive an SSE byte stream to completion. Each frame must arrive within
/// `idle_timeout`; teardown aborts the read.
pub async fn consume_event_stream<S, B, E>(
    bytes: S,
    idle_timeout: Duration,
    updates: Option<&flume::Sender<StreamUpdate>>,
    shutdown: &ShutdownSignal,
) -> Result<StreamOutcome, AgentApiError>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut events = Box::pin(bytes.eventsource());
    let mut accumulator = FlagAccumulator::default();
    let mut outcome = StreamOutcome::default();

    loop {
        let next = tokio::select! {
            next = timeout(idle_timeout, events.next()) => next,
            _ = shutdown.cancelled() => {
                tracing::info!("Event stream aborted by teardown");
                return Err(AgentApiError::Cancelled);
            }
        };

        let event = match next {
            Ok(Some(Ok(event))) => event,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::error!("Event stream error: {}", e);
                return Err(AgentApiError::Stream(e.to_string()));
            }
            Err(_) => {
                tracing::error!("Event stream idle for {:?}", idle_timeout);
                return Err(AgentApiError::IdleTimeout(idle_timeout));
            }
        };

        let Some(frame) = parse_frame(&event.data) else {
            tracing::debug!("Skipping non-JSON frame: {}", preview(&event.data));
            continue;
        };
        outcome.frames += 1;

        match frame {
            StreamFrame::TaskStop { task_key, output } => {
                if accumulator.observe(&task_key, &output) {
                    tracing::info!(
                        "Skill {} raised flags: {}",
                        task_key,
                        accumulator.flags().describe()
                    );
                    publish(updates, StreamUpdate::Flags(accumulator.flags()));
                }
            }
            StreamFrame::Stop { content } => {
                if let Some(text) = content {
                    publish(
                        updates,
                        StreamUpdate::Final {
                            text: text.clone(),
                            flags: accumulator.flags(),
                        },
                    );
                    outcome.final_text = Some(text);
                }
            }
            StreamFrame::Other(kind) => {
                tracing::trace!("Ignoring frame type {:?}", kind);
            }
        }
    }

    outcome.flags = accumulator.flags();
    if outcome.final_text.is_none() {
        tracing::warn!("Event stream closed without a final answer");
    }
    Ok(outcome)
}

fn publish(updates: Option<&flume::Sender<StreamUpdate>>, update: StreamUpdate) {
    if let Some(tx) = updates {
        let _ = tx.send(update);
    }
}

/// The run endpoint lives beside the REST API, not under `/api`.
pub fn api_root(base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    base.strip_suffix("/api").map(str::to_string).unwrap_or(base)
}
