//! Subscription boundary for an embedded chat widget.
//!
//! The widget reports what it sends and renders as `WidgetEvent`s; the bridge
//! turns them into transcript entries, flag checks and escalations. Several
//! widget callbacks may report the same message or response, so user turns
//! are deduplicated by the recorder and escalations by their key.

use serde_json::Value;

use crate::escalation::{EscalationOrchestrator, EscalationOutcome};
use crate::normalizer::ResponseNormalizer;
use crate::session::SessionEvent;
use crate::shutdown::ShutdownSignal;
use crate::transcript::{CaptureChannel, ConversationRecorder, RecordOutcome};

#[derive(Debug, Clone)]
pub enum WidgetEvent {
    /// Text leaving the widget towards the primary agent.
    Outbound { channel: CaptureChannel, text: String },
    /// Assistant text the widget has rendered.
    AssistantRendered(String),
    /// Raw reply payload observed by the widget.
    AgentResponse(Value),
}

pub struct WidgetBridge {
    recorder: ConversationRecorder,
    normalizer: ResponseNormalizer,
    orchestrator: EscalationOrchestrator,
    events: flume::Sender<SessionEvent>,
}

impl WidgetBridge {
    pub fn new(
        orchestrator: EscalationOrchestrator,
        transcript_capacity: usize,
    ) -> (Self, flume::Receiver<SessionEvent>) {
        let (events, rx) = flume::unbounded();
        let bridge = Self {
            recorder: ConversationRecorder::new(transcript_capacity),
            normalizer: ResponseNormalizer::new(),
            orchestrator,
            events,
        };
        (bridge, rx)
    }

    pub fn recorder(&self) -> &ConversationRecorder {
        &self.recorder
    }

    pub fn orchestrator(&self) -> &EscalationOrchestrator {
        &self.orchestrator
    }

    /// Text the widget should send instead of `text`, carrying any pending
    /// intervention context.
    pub fn outbound_text(&mut self, text: &str) -> String {
        self.orchestrator.compose_outbound(text)
    }

    pub async fn handle(&mut self, event: WidgetEvent) -> Option<EscalationOutcome> {
        match event {
            WidgetEvent::Outbound { channel, text } => {
                if self.recorder.record_user(&text, channel) == RecordOutcome::Appended {
                    tracing::debug!("Captured user turn via {:?}", channel);
                }
                None
            }
            WidgetEvent::AssistantRendered(text) => {
                self.recorder.record_assistant(&text, CaptureChannel::Widget);
                None
            }
            WidgetEvent::AgentResponse(raw) => Some(self.on_agent_response(&raw).await),
        }
    }

    async fn on_agent_response(&mut self, raw: &Value) -> EscalationOutcome {
        let flags = self.normalizer.extract_flags(raw);
        if !flags.any() {
            self.orchestrator.on_agent_turn(flags, &[]).await;
            let _ = self.events.send(SessionEvent::BannerCleared);
            return EscalationOutcome::NotFlagged;
        }

        let _ = self.events.send(SessionEvent::FlagsDetected {
            turn_id: None,
            flags,
        });
        let transcript = self.recorder.snapshot();
        let outcome = self.orchestrator.on_agent_turn(flags, &transcript).await;
        let event = match &outcome {
            EscalationOutcome::Resolved(report) => Some(SessionEvent::EscalationResolved {
                turn_id: None,
                report: report.clone(),
            }),
            EscalationOutcome::Failed { message, .. } => Some(SessionEvent::EscalationFailed {
                turn_id: None,
                message: message.clone(),
            }),
            EscalationOutcome::Suppressed => Some(SessionEvent::EscalationSuppressed { flags }),
            EscalationOutcome::NotFlagged => None,
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        outcome
    }

    /// Consume widget events until the channel closes or the session ends.
    pub async fn run(mut self, widget: flume::Receiver<WidgetEvent>, shutdown: ShutdownSignal) {
        loop {
            let event = tokio::select! {
                event = widget.recv_async() => event,
                _ = shutdown.cancelled() => {
                    tracing::info!("Widget bridge stopped by teardown");
                    return;
                }
            };
            match event {
                Ok(event) => {
                    self.handle(event).await;
                }
                Err(_) => {
                    tracing::info!("Widget event channel closed");
                    return;
                }
            }
        }
    }
}
