//! A relayed chat session with the primary agent.
//!
//! `RiskSession` owns everything that lives for one conversation: the chat id,
//! the transcript, the escalation orchestrator and the per-turn records.
//! Progress is published as `SessionEvent`s on a flume channel.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent_client::{execute_params, AgentApi};
use crate::config::RelayConfig;
use crate::escalation::{
    wrap_with_context, EscalationOrchestrator, EscalationOutcome, EscalationReport,
};
use crate::flags::RiskFlags;
use crate::interpreter::{interpret, RiskAssessment};
use crate::normalizer::ResponseNormalizer;
use crate::retry::RetryPolicy;
use crate::shutdown::{shutdown_pair, ShutdownHandle, ShutdownSignal};
use crate::transcript::{preview, CaptureChannel, ConversationRecorder};

pub const START_FAILED_MESSAGE: &str =
    "No fue posible iniciar la conversación. Verifique API Key/Agent.";
pub const NEW_CHAT_FAILED_MESSAGE: &str = "No fue posible iniciar un nuevo chat.";
pub const SEND_FAILED_MESSAGE: &str = "No fue posible enviar o procesar el mensaje.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Normal,
    Flagged,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub id: Uuid,
    pub user_text: String,
    pub user_at: DateTime<Utc>,
    pub status: TurnStatus,
    /// The primary agent's answer, kept even when it was replaced.
    pub primary_text: String,
    pub flags: Option<RiskFlags>,
    pub assessment: Option<RiskAssessment>,
    pub intervention_text: String,
    pub correlation_id: Option<String>,
}

impl TurnRecord {
    fn pending(user_text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_text: user_text.to_string(),
            user_at: Utc::now(),
            status: TurnStatus::Pending,
            primary_text: String::new(),
            flags: None,
            assessment: None,
            intervention_text: String::new(),
            correlation_id: None,
        }
    }

    /// What the user actually sees as the assistant's answer.
    pub fn visible_reply(&self) -> &str {
        if self.intervention_text.trim().is_empty() {
            &self.primary_text
        } else {
            &self.intervention_text
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConversationStarted {
        chat_id: String,
    },
    TurnStarted {
        turn_id: Uuid,
        user_text: String,
    },
    FlagsDetected {
        turn_id: Option<Uuid>,
        flags: RiskFlags,
    },
    BannerCleared,
    EscalationResolved {
        turn_id: Option<Uuid>,
        report: EscalationReport,
    },
    EscalationFailed {
        turn_id: Option<Uuid>,
        message: String,
    },
    EscalationSuppressed {
        flags: RiskFlags,
    },
    TurnCompleted(TurnRecord),
    Error(String),
}

pub struct RiskSession {
    api: Arc<dyn AgentApi>,
    agent_code: String,
    culture: String,
    retry: RetryPolicy,
    normalizer: ResponseNormalizer,
    recorder: ConversationRecorder,
    orchestrator: EscalationOrchestrator,
    chat_id: Option<String>,
    turns: Vec<TurnRecord>,
    events: flume::Sender<SessionEvent>,
    shutdown: ShutdownHandle,
    signal: ShutdownSignal,
}

impl RiskSession {
    pub fn new(api: Arc<dyn AgentApi>, config: &RelayConfig) -> (Self, flume::Receiver<SessionEvent>) {
        let (events, rx) = flume::unbounded();
        let (shutdown, signal) = shutdown_pair();
        let orchestrator = EscalationOrchestrator::new(api.clone(), config, signal.clone());
        let session = Self {
            api,
            agent_code: config.primary_agent_code.clone(),
            culture: config.culture.clone(),
            retry: config.retry_policy(),
            normalizer: ResponseNormalizer::new(),
            recorder: ConversationRecorder::new(config.transcript_capacity),
            orchestrator,
            chat_id: None,
            turns: Vec::new(),
            events,
            shutdown,
            signal,
        };
        (session, rx)
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn turns(&self) -> &[TurnRecord] {
        &self.turns
    }

    pub fn recorder(&self) -> &ConversationRecorder {
        &self.recorder
    }

    pub fn orchestrator(&self) -> &EscalationOrchestrator {
        &self.orchestrator
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn create_conversation(&self) -> Result<String> {
        let api = &self.api;
        let code = self.agent_code.as_str();
        let culture = self.culture.as_str();
        let chat_id = self
            .retry
            .run("create conversation", &self.signal, || {
                api.create_conversation(code, culture)
            })
            .await?;
        Ok(chat_id)
    }

    /// Create the primary conversation. A reply without `chatId` is fatal.
    pub async fn start(&mut self) -> Result<&str> {
        let created = self.create_conversation().await;
        match created {
            Ok(chat_id) => {
                tracing::info!("Session started with chat {}", chat_id);
                self.emit(SessionEvent::ConversationStarted {
                    chat_id: chat_id.clone(),
                });
                Ok(self.chat_id.insert(chat_id).as_str())
            }
            Err(e) => {
                self.emit(SessionEvent::Error(START_FAILED_MESSAGE.to_string()));
                Err(e.context(START_FAILED_MESSAGE))
            }
        }
    }

    /// Fresh conversation; turns, transcript and escalation memory are dropped.
    pub async fn new_chat(&mut self) -> Result<&str> {
        let chat_id = match self.create_conversation().await {
            Ok(chat_id) => chat_id,
            Err(e) => {
                self.emit(SessionEvent::Error(NEW_CHAT_FAILED_MESSAGE.to_string()));
                return Err(e.context(NEW_CHAT_FAILED_MESSAGE));
            }
        };
        self.turns.clear();
        self.recorder.clear();
        self.orchestrator.reset();
        tracing::info!("Started new chat {}", chat_id);
        self.emit(SessionEvent::ConversationStarted {
            chat_id: chat_id.clone(),
        });
        Ok(self.chat_id.insert(chat_id).as_str())
    }

    /// Relay one user message and, when the reply carries risk flags, escalate it.
    pub async fn send(&mut self, text: &str) -> Result<TurnRecord> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Cannot send an empty message");
        }
        if self.signal.is_cancelled() {
            bail!("Session has been torn down");
        }
        let chat_id = self
            .chat_id
            .clone()
            .context("No active conversation; start the session first")?;

        let context = self.orchestrator.take_pending_context();
        let outbound = match context.as_deref() {
            Some(context) => wrap_with_context(context, text),
            None => text.to_string(),
        };

        let mut turn = TurnRecord::pending(text);
        self.turns.push(turn.clone());
        self.emit(SessionEvent::TurnStarted {
            turn_id: turn.id,
            user_text: text.to_string(),
        });
        self.recorder.record_user(text, CaptureChannel::Session);
        tracing::debug!("Sending to {}: {}", self.agent_code, preview(text));

        let params = execute_params(&outbound, &chat_id, &[]);
        let api = &self.api;
        let code = self.agent_code.as_str();
        let reply = self
            .retry
            .run("send message", &self.signal, || api.execute(code, &params))
            .await;

        let raw = match reply {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Primary agent call failed: {}", e);
                if let Some(context) = context {
                    self.orchestrator.restore_pending_context(context);
                }
                turn.status = TurnStatus::Error;
                self.store(&turn);
                self.emit(SessionEvent::Error(SEND_FAILED_MESSAGE.to_string()));
                self.emit(SessionEvent::TurnCompleted(turn));
                return Err(anyhow!(e).context(SEND_FAILED_MESSAGE));
            }
        };

        turn.primary_text = interpret(&raw).text.trim().to_string();
        let normalized = self.normalizer.normalize(&raw);
        let flags = normalized.flags;

        if !flags.any() {
            turn.status = TurnStatus::Normal;
            self.recorder
                .record_assistant(&turn.primary_text, CaptureChannel::Session);
            self.orchestrator.on_agent_turn(flags, &[]).await;
            self.emit(SessionEvent::BannerCleared);
            self.store(&turn);
            self.emit(SessionEvent::TurnCompleted(turn.clone()));
            return Ok(turn);
        }

        tracing::info!(
            "Turn {} flagged: {} (via {:?})",
            turn.id,
            flags.describe(),
            normalized.strategy
        );
        turn.flags = Some(flags);
        self.emit(SessionEvent::FlagsDetected {
            turn_id: Some(turn.id),
            flags,
        });

        // The replaced primary answer is not part of the escalated history.
        let transcript = self.recorder.snapshot();
        let outcome = self.orchestrator.on_agent_turn(flags, &transcript).await;
        turn.status = TurnStatus::Flagged;

        match outcome {
            EscalationOutcome::Resolved(report) => {
                turn.assessment = Some(report.assessment.clone());
                turn.intervention_text = report.intervention_text.clone();
                turn.correlation_id = Some(report.correlation_id.clone());
                self.emit(SessionEvent::EscalationResolved {
                    turn_id: Some(turn.id),
                    report,
                });
            }
            EscalationOutcome::Failed {
                correlation_id,
                message,
                ..
            } => {
                turn.intervention_text = message.clone();
                turn.correlation_id = Some(correlation_id);
                self.emit(SessionEvent::EscalationFailed {
                    turn_id: Some(turn.id),
                    message,
                });
            }
            EscalationOutcome::Suppressed => {
                self.emit(SessionEvent::EscalationSuppressed { flags });
            }
            EscalationOutcome::NotFlagged => {}
        }

        let assistant_text = match &turn.assessment {
            Some(_) if !turn.intervention_text.is_empty() => turn.intervention_text.clone(),
            _ => turn.primary_text.clone(),
        };
        self.recorder
            .record_assistant(&assistant_text, CaptureChannel::Session);

        self.store(&turn);
        self.emit(SessionEvent::TurnCompleted(turn.clone()));
        Ok(turn)
    }

    fn store(&mut self, turn: &TurnRecord) {
        if let Some(slot) = self.turns.iter_mut().find(|t| t.id == turn.id) {
            *slot = turn.clone();
        }
    }

    /// Abort in-flight retries and streams tied to this session.
    pub fn teardown(&self) {
        if !self.shutdown.is_triggered() {
            tracing::info!("Tearing down session");
        }
        self.shutdown.trigger();
    }
}

impl Drop for RiskSession {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::fake::{param, ScriptedAgentApi};
    use crate::error::AgentApiError;
    use crate::escalation::FALLBACK_APOLOGY;
    use crate::flags::RiskFlag;
    use crate::transcript::Role;
    use serde_json::json;

    const PRIMARY: &str = "GAIAComunidad";
    const RISK: &str = "EvaluadorRiesgo";

    fn config() -> RelayConfig {
        RelayConfig {
            retry_delay_ms: 1,
            ..RelayConfig::default()
        }
    }

    fn flagged_reply(text: &str) -> serde_json::Value {
        json!({
            "content": text,
            "action_results": {
                "TendenciaSuicida": { "output": { "content": "true" } }
            }
        })
    }

    async fn started(api: Arc<ScriptedAgentApi>) -> (RiskSession, flume::Receiver<SessionEvent>) {
        let (mut session, rx) = RiskSession::new(api, &config());
        session.start().await.expect("start");
        (session, rx)
    }

    #[tokio::test]
    async fn missing_chat_id_fails_start() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_conversation(Err(AgentApiError::MissingChatId));
        let (mut session, rx) = RiskSession::new(api.clone(), &config());

        let error = session.start().await.expect_err("start must fail");
        assert!(error.to_string().contains("No fue posible iniciar"));
        assert!(session.chat_id().is_none());
        assert!(session.send("hola").await.is_err());
        assert!(api.executed().is_empty());
        assert!(rx
            .drain()
            .any(|event| matches!(event, SessionEvent::Error(_))));
    }

    #[tokio::test]
    async fn normal_turn_records_primary_reply() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(PRIMARY, Ok(json!({ "content": "¡Hola! ¿Cómo estás?" })));
        let (mut session, rx) = started(api.clone()).await;

        let turn = session.send("  hola  ").await.expect("send");

        assert_eq!(turn.status, TurnStatus::Normal);
        assert_eq!(turn.user_text, "hola");
        assert_eq!(turn.visible_reply(), "¡Hola! ¿Cómo estás?");
        assert_eq!(session.recorder().len(), 2);
        assert!(api.executed_for(RISK).is_empty());
        let sent = api.executed_for(PRIMARY);
        assert_eq!(param(&sent[0], "message"), Some("hola"));
        assert_eq!(param(&sent[0], "chatId"), Some("chat-1"));
        assert!(rx
            .drain()
            .any(|event| matches!(event, SessionEvent::BannerCleared)));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let api = Arc::new(ScriptedAgentApi::new());
        let (mut session, _rx) = started(api.clone()).await;
        assert!(session.send("   ").await.is_err());
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn flagged_turn_is_replaced_by_intervention() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(PRIMARY, Ok(json!({ "content": "Cuéntame más." })));
        api.push_reply(PRIMARY, Ok(flagged_reply("Respuesta primaria")));
        api.push_reply(
            RISK,
            Ok(json!({
                "content": "```json\n{\"nivel_riesgo\":\"alto\",\"recomendacion\":\"derivar a guardia\",\"respuesta_sugerida\":\"Estoy contigo. Llama al 911.\"}\n```"
            })),
        );
        let (mut session, rx) = started(api.clone()).await;

        session.send("estoy cansado").await.expect("first turn");
        let turn = session.send("no quiero vivir").await.expect("second turn");

        assert_eq!(turn.status, TurnStatus::Flagged);
        assert_eq!(turn.flags, Some(RiskFlags::none().with(RiskFlag::SuicidalTendency)));
        assert_eq!(turn.primary_text, "Respuesta primaria");
        assert_eq!(turn.visible_reply(), "Estoy contigo. Llama al 911.");
        let assessment = turn.assessment.clone().expect("assessment");
        assert_eq!(assessment.risk_level, "alto");
        assert_eq!(assessment.recommendation, "derivar a guardia");

        // The escalated history ends with the flagged user message.
        let risk_calls = api.executed_for(RISK);
        assert_eq!(risk_calls.len(), 1);
        let prompt = param(&risk_calls[0], "message").expect("prompt");
        assert!(prompt.ends_with("Usuario: no quiero vivir"));
        assert!(!prompt.contains("Respuesta primaria"));

        let last = session.recorder().last().expect("assistant turn");
        assert_eq!(last.role(), Role::Assistant);
        assert_eq!(last.content(), "Estoy contigo. Llama al 911.");

        let events: Vec<SessionEvent> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::FlagsDetected { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::EscalationResolved { .. })));
    }

    #[tokio::test]
    async fn repeated_message_on_flagged_turn_ends_the_escalated_history() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(PRIMARY, Ok(json!({ "content": "Cuéntame." })));
        api.push_reply(PRIMARY, Ok(flagged_reply("Respuesta primaria")));
        api.push_reply(RISK, Ok(json!({ "content": "Estoy aquí contigo." })));
        let (mut session, _rx) = started(api.clone()).await;

        session.send("ayuda").await.expect("first turn");
        let turn = session.send("ayuda").await.expect("second turn");

        assert_eq!(turn.status, TurnStatus::Flagged);
        let risk_calls = api.executed_for(RISK);
        assert_eq!(risk_calls.len(), 1);
        let prompt = param(&risk_calls[0], "message").expect("prompt");
        assert!(prompt.ends_with("Usuario: ayuda\nAsistente: Cuéntame.\nUsuario: ayuda"));
        assert_eq!(session.recorder().len(), 4);
    }

    #[tokio::test]
    async fn intervention_context_prefixes_next_message_once() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(PRIMARY, Ok(flagged_reply("x")));
        api.push_reply(RISK, Ok(json!({ "content": "Busca ayuda ahora." })));
        let (mut session, _rx) = started(api.clone()).await;

        session.send("me quiero morir").await.expect("flagged turn");
        session.send("gracias").await.expect("follow-up");
        session.send("adiós").await.expect("third");

        let sent = api.executed_for(PRIMARY);
        let second = param(&sent[1], "message").expect("message");
        assert!(second.starts_with("[Contexto del sistema:"));
        assert!(second.contains("\"Busca ayuda ahora.\""));
        assert!(second.ends_with("\n]\ngracias"));
        assert_eq!(param(&sent[2], "message"), Some("adiós"));
    }

    #[tokio::test]
    async fn failed_escalation_keeps_primary_text_in_transcript() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(PRIMARY, Ok(flagged_reply("Respuesta primaria")));
        for _ in 0..3 {
            api.push_reply(
                RISK,
                Err(AgentApiError::Http {
                    status: 429,
                    body: String::new(),
                }),
            );
        }
        let (mut session, rx) = started(api.clone()).await;

        let turn = session.send("no puedo más").await.expect("send");

        assert_eq!(turn.status, TurnStatus::Flagged);
        assert!(turn.assessment.is_none());
        assert_eq!(turn.visible_reply(), FALLBACK_APOLOGY);
        assert_eq!(
            session.recorder().last().map(|t| t.content().to_string()),
            Some("Respuesta primaria".to_string())
        );
        assert!(rx
            .drain()
            .any(|e| matches!(e, SessionEvent::EscalationFailed { .. })));
    }

    #[tokio::test]
    async fn primary_failure_marks_turn_as_error() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(
            PRIMARY,
            Err(AgentApiError::Http {
                status: 500,
                body: "boom".to_string(),
            }),
        );
        let (mut session, _rx) = started(api.clone()).await;

        let error = session.send("hola").await.expect_err("send fails");
        assert!(error.to_string().contains("No fue posible enviar"));
        assert_eq!(session.turns()[0].status, TurnStatus::Error);
    }

    #[tokio::test]
    async fn new_chat_clears_state() {
        let api = Arc::new(ScriptedAgentApi::new());
        api.push_reply(PRIMARY, Ok(flagged_reply("x")));
        let (mut session, _rx) = started(api.clone()).await;
        session.send("me quiero morir").await.expect("flagged turn");
        assert!(session.orchestrator().pending_context().is_some());

        let chat_id = session.new_chat().await.expect("new chat").to_string();

        assert_eq!(chat_id, "chat-3");
        assert!(session.turns().is_empty());
        assert!(session.recorder().is_empty());
        assert!(session.orchestrator().pending_context().is_none());
        assert!(session.orchestrator().last_key().is_none());
    }

    #[tokio::test]
    async fn teardown_stops_further_sends() {
        let api = Arc::new(ScriptedAgentApi::new());
        let (mut session, _rx) = started(api.clone()).await;
        let signal = session.shutdown_signal();

        session.teardown();

        assert!(signal.is_cancelled());
        assert!(session.send("hola").await.is_err());
        assert!(api.executed().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_session_cancels_its_signal() {
        let api = Arc::new(ScriptedAgentApi::new());
        let (session, _rx) = RiskSession::new(api, &config());
        let signal = session.shutdown_signal();
        drop(session);
        assert!(signal.is_cancelled());
    }
}
