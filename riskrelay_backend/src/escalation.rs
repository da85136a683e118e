//! Escalation of flagged turns to the risk evaluation agent.
//!
//! Each agent turn runs through a small state machine:
//!
//! ```text
//! Idle -> Pending -> Escalating -> Resolved | Failed
//!            \-> Idle (duplicate key, suppressed)
//! ```
//!
//! The orchestrator owns the last escalation key and the one-shot pending
//! context for the next outbound user message.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent_client::{execute_params, AgentApi, ExecuteParam};
use crate::config::RelayConfig;
use crate::error::AgentApiError;
use crate::flags::RiskFlags;
use crate::interpreter::{interpret, Interpretation, RiskAssessment};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::transcript::{ConversationTurn, Role};

pub const DEFAULT_HISTORY_WINDOW: usize = 12;

/// Characters of the opening turn folded into the escalation key.
const KEY_OPENING_CHARS: usize = 32;

pub const FALLBACK_APOLOGY: &str = "No fue posible completar la evaluación de riesgo en este momento. \
Si estás en peligro inmediato, comunícate con los servicios de emergencia de tu zona.";

pub const MISSING_SESSION_MESSAGE: &str =
    "No fue posible iniciar la evaluación de riesgo: el agente no devolvió un identificador de conversación.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Idle,
    Pending,
    Escalating,
    Resolved,
    Failed,
}

impl EscalationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    pub fn can_transition_to(self, next: EscalationState) -> bool {
        use EscalationState::*;
        matches!(
            (self, next),
            (Idle, Pending)
                | (Pending, Escalating)
                | (Pending, Idle)
                | (Escalating, Resolved)
                | (Escalating, Failed)
                // A new turn starts from any terminal state.
                | (Resolved, Idle)
                | (Failed, Idle)
        )
    }
}

impl fmt::Display for EscalationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Pending => write!(f, "Pending"),
            Self::Escalating => write!(f, "Escalating"),
            Self::Resolved => write!(f, "Resolved"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Identity of a conversation state that has already been escalated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EscalationKey {
    pub flags: RiskFlags,
    pub transcript_len: usize,
    pub opening: String,
}

impl EscalationKey {
    pub fn compute(flags: RiskFlags, transcript: &[ConversationTurn]) -> Self {
        Self {
            flags,
            transcript_len: transcript.len(),
            opening: transcript
                .first()
                .map(|turn| turn.content().chars().take(KEY_OPENING_CHARS).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationRequest {
    pub correlation_id: String,
    pub flags: RiskFlags,
    pub prompt: String,
    pub turns_included: usize,
}

impl EscalationRequest {
    /// Prompt over the last `history_window` turns with a fresh correlation id.
    pub fn build(flags: RiskFlags, transcript: &[ConversationTurn], history_window: usize) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        let start = transcript.len().saturating_sub(history_window.max(1));
        let window = &transcript[start..];

        let mut prompt = String::new();
        prompt.push_str("Evaluación de riesgo solicitada.\n");
        prompt.push_str(&format!("Indicadores activos: {}\n", flags.describe()));
        prompt.push_str(&format!("Id de correlación: {}\n\n", correlation_id));
        prompt.push_str("Conversación:\n");
        prompt.push_str(&render_dialogue(window));

        Self {
            correlation_id,
            flags,
            prompt,
            turns_included: window.len(),
        }
    }

    pub fn params(&self, chat_id: &str, culture: &str) -> Vec<ExecuteParam> {
        execute_params(
            &self.prompt,
            chat_id,
            &[
                ("flags", self.flags.describe()),
                ("correlationId", self.correlation_id.clone()),
                ("culture", culture.to_string()),
            ],
        )
    }
}

pub fn render_dialogue(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role() {
                Role::User => "Usuario",
                Role::Assistant => "Asistente",
            };
            format!("{}: {}", speaker, turn.content())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct EscalationReport {
    pub correlation_id: String,
    pub flags: RiskFlags,
    pub assessment: RiskAssessment,
    pub interpretation: Interpretation,
    /// Text shown to the user in place of the primary answer.
    pub intervention_text: String,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub enum EscalationOutcome {
    NotFlagged,
    Suppressed,
    Resolved(EscalationReport),
    Failed {
        correlation_id: String,
        flags: RiskFlags,
        /// User-facing fallback text.
        message: String,
        error: String,
    },
}

impl EscalationOutcome {
    pub fn state(&self) -> EscalationState {
        match self {
            Self::NotFlagged | Self::Suppressed => EscalationState::Idle,
            Self::Resolved(_) => EscalationState::Resolved,
            Self::Failed { .. } => EscalationState::Failed,
        }
    }

    pub fn user_message(&self) -> Option<&str> {
        match self {
            Self::Resolved(report) => Some(report.intervention_text.as_str()),
            Self::Failed { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }
}

/// Prefix telling the primary agent its previous answer was replaced.
pub fn wrap_with_context(context: &str, user_text: &str) -> String {
    format!(
        "[Contexto del sistema: En el turno anterior se reemplazó la respuesta por intervención de riesgo. \
Respuesta de intervención: \"{}\"\n]\n{}",
        context, user_text
    )
}

pub struct EscalationOrchestrator {
    api: Arc<dyn AgentApi>,
    agent_code: String,
    culture: String,
    history_window: usize,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
    state: EscalationState,
    last_key: Option<EscalationKey>,
    pending_context: Option<String>,
    fired: u64,
}

impl EscalationOrchestrator {
    pub fn new(api: Arc<dyn AgentApi>, config: &RelayConfig, shutdown: ShutdownSignal) -> Self {
        Self::with_settings(
            api,
            &config.risk_agent_code,
            &config.culture,
            config.history_window,
            config.retry_policy(),
            shutdown,
        )
    }

    pub fn with_settings(
        api: Arc<dyn AgentApi>,
        agent_code: &str,
        culture: &str,
        history_window: usize,
        retry: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            api,
            agent_code: agent_code.to_string(),
            culture: culture.to_string(),
            history_window: history_window.max(1),
            retry,
            shutdown,
            state: EscalationState::Idle,
            last_key: None,
            pending_context: None,
            fired: 0,
        }
    }

    pub fn state(&self) -> EscalationState {
        self.state
    }

    pub fn last_key(&self) -> Option<&EscalationKey> {
        self.last_key.as_ref()
    }

    /// Escalations that reached the network, including failed ones.
    pub fn escalations_fired(&self) -> u64 {
        self.fired
    }

    fn advance(&mut self, next: EscalationState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!("Unexpected escalation transition {} -> {}", self.state, next);
        }
        tracing::debug!("Escalation {} -> {}", self.state, next);
        self.state = next;
    }

    fn begin_turn(&mut self) {
        if self.state != EscalationState::Idle {
            self.advance(EscalationState::Idle);
        }
    }

    /// React to the flags of one agent turn. `transcript` is the conversation
    /// as of the moment the flags were computed.
    pub async fn on_agent_turn(
        &mut self,
        flags: RiskFlags,
        transcript: &[ConversationTurn],
    ) -> EscalationOutcome {
        self.begin_turn();
        if !flags.any() {
            return EscalationOutcome::NotFlagged;
        }
        self.advance(EscalationState::Pending);

        let key = EscalationKey::compute(flags, transcript);
        if self.last_key.as_ref() == Some(&key) {
            tracing::info!(
                "Escalation for {} already fired for this state; suppressing",
                flags.describe()
            );
            self.advance(EscalationState::Idle);
            return EscalationOutcome::Suppressed;
        }
        // Recorded before the call so a failure does not re-fire for the same state.
        self.last_key = Some(key);

        let request = EscalationRequest::build(flags, transcript, self.history_window);
        self.advance(EscalationState::Escalating);
        self.fired += 1;
        tracing::info!(
            "Escalating {} to {} ({} turns, correlation {})",
            flags.describe(),
            self.agent_code,
            request.turns_included,
            request.correlation_id
        );

        let result = self.call_risk_agent(&request).await;
        match result {
            Ok(raw) => {
                let interpretation = interpret(&raw);
                let assessment = interpretation.assessment_or_fallback();
                let intervention_text = interpretation.suggested_reply().unwrap_or_default();
                if !intervention_text.is_empty() {
                    self.pending_context = Some(intervention_text.clone());
                }
                tracing::info!(
                    "Escalation {} resolved (level {:?}, source {:?})",
                    request.correlation_id,
                    assessment.risk_level,
                    interpretation.source
                );
                self.advance(EscalationState::Resolved);
                EscalationOutcome::Resolved(EscalationReport {
                    correlation_id: request.correlation_id,
                    flags,
                    assessment,
                    interpretation,
                    intervention_text,
                    raw,
                })
            }
            Err(error) => {
                tracing::error!("Escalation {} failed: {}", request.correlation_id, error);
                let message = match error {
                    AgentApiError::MissingChatId => MISSING_SESSION_MESSAGE,
                    _ => FALLBACK_APOLOGY,
                };
                self.advance(EscalationState::Failed);
                EscalationOutcome::Failed {
                    correlation_id: request.correlation_id,
                    flags,
                    message: message.to_string(),
                    error: error.to_string(),
                }
            }
        }
    }

    async fn call_risk_agent(&self, request: &EscalationRequest) -> Result<Value, AgentApiError> {
        let api = &self.api;
        let code = self.agent_code.as_str();
        let culture = self.culture.as_str();

        let chat_id = self
            .retry
            .run("create risk conversation", &self.shutdown, || {
                api.create_conversation(code, culture)
            })
            .await?;

        let params = request.params(&chat_id, culture);
        self.retry
            .run("execute risk evaluation", &self.shutdown, || {
                api.execute(code, &params)
            })
            .await
    }

    pub fn pending_context(&self) -> Option<&str> {
        self.pending_context.as_deref()
    }

    pub fn take_pending_context(&mut self) -> Option<String> {
        self.pending_context.take()
    }

    /// Put back a context whose message never reached the primary agent.
    pub fn restore_pending_context(&mut self, context: String) {
        if self.pending_context.is_none() {
            self.pending_context = Some(context);
        }
    }

    /// The text to send for `user_text`, consuming any pending context.
    pub fn compose_outbound(&mut self, user_text: &str) -> String {
        match self.take_pending_context() {
            Some(context) => wrap_with_context(&context, user_text),
            None => user_text.to_string(),
        }
    }

    /// Forget everything tied to the current conversation.
    pub fn reset(&mut self) {
        self.state = EscalationState::Idle;
        self.last_key = None;
        self.pending_context = None;
    }
}
