//! Terminal rendering of session and stream events.

use chrono::Local;
use riskrelay_backend::flags::RiskFlags;
use riskrelay_backend::interpreter::RiskAssessment;
use riskrelay_backend::session::{SessionEvent, TurnRecord, TurnStatus};
use riskrelay_backend::stream::{StreamOutcome, StreamUpdate};

pub fn print_help() {
    println!("Type a message and press Enter. /new starts a new chat, /quit exits.");
}

pub async fn print_events(events: flume::Receiver<SessionEvent>) {
    while let Ok(event) = events.recv_async().await {
        if let Some(text) = render_event(&event) {
            println!("{}", text);
        }
    }
}

pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::ConversationStarted { chat_id } => {
            Some(format!("-- conversation {} --", chat_id))
        }
        SessionEvent::FlagsDetected { flags, .. } => Some(render_banner(*flags)),
        SessionEvent::EscalationResolved { report, .. } => {
            Some(render_assessment(&report.assessment))
        }
        SessionEvent::EscalationFailed { message, .. } => Some(format!("[risk] {}", message)),
        SessionEvent::EscalationSuppressed { .. } => None,
        SessionEvent::TurnCompleted(turn) => render_turn(turn),
        SessionEvent::Error(message) => Some(format!("[error] {}", message)),
        SessionEvent::TurnStarted { .. } | SessionEvent::BannerCleared => None,
    }
}

pub fn render_banner(flags: RiskFlags) -> String {
    format!("[!] Risk signals detected: {}", flags.describe())
}

fn render_turn(turn: &TurnRecord) -> Option<String> {
    let at = turn.user_at.with_timezone(&Local).format("%H:%M");
    match turn.status {
        TurnStatus::Pending | TurnStatus::Error => None,
        TurnStatus::Normal => Some(format!("{} assistant> {}", at, turn.visible_reply())),
        TurnStatus::Flagged => {
            let mut out = format!("{} intervention> {}", at, turn.visible_reply());
            if !turn.primary_text.is_empty() && turn.primary_text != turn.visible_reply() {
                out.push_str(&format!("\n      (replaced) {}", turn.primary_text));
            }
            Some(out)
        }
    }
}

pub fn render_assessment(assessment: &RiskAssessment) -> String {
    let field = |value: &str| {
        if value.trim().is_empty() {
            "-".to_string()
        } else {
            value.trim().to_string()
        }
    };
    let percentage = assessment
        .risk_percentage
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "-".to_string());

    [
        "[risk] assessment".to_string(),
        format!("  type:           {}", field(&assessment.risk_type)),
        format!("  level:          {}", field(&assessment.risk_level)),
        format!("  percentage:     {}", percentage),
        format!("  justification:  {}", field(&assessment.justification)),
        format!("  recommendation: {}", field(&assessment.recommendation)),
    ]
    .join("\n")
}

pub async fn print_stream_updates(updates: flume::Receiver<StreamUpdate>) {
    while let Ok(update) = updates.recv_async().await {
        if let StreamUpdate::Flags(flags) = update {
            println!("{}", render_banner(flags));
        }
    }
}

pub fn render_stream_outcome(outcome: &StreamOutcome) -> String {
    format!(
        "{}\nflags: {} ({} frames)",
        outcome.final_text.as_deref().unwrap_or("(no final answer)"),
        outcome.flags.describe(),
        outcome.frames
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskrelay_backend::flags::RiskFlag;
    use riskrelay_backend::interpreter::interpret;
    use serde_json::json;

    #[test]
    fn assessment_lists_every_field() {
        let interpretation = interpret(&json!({
            "content": "```json\n{\"nivel_riesgo\":\"alto\",\"porcentaje\":\"80%\",\"recomendacion\":\"derivar a guardia\"}\n```"
        }));
        let rendered = render_assessment(&interpretation.assessment_or_fallback());
        assert!(rendered.contains("level:          alto"));
        assert!(rendered.contains("percentage:     80%"));
        assert!(rendered.contains("recommendation: derivar a guardia"));
        assert!(rendered.contains("type:           -"));
    }

    #[test]
    fn banner_names_active_flags() {
        let flags = RiskFlags::none().with(RiskFlag::ClinicalAlarm);
        assert_eq!(
            render_event(&SessionEvent::FlagsDetected {
                turn_id: None,
                flags
            }),
            Some("[!] Risk signals detected: PautasDeAlarmaClinicas".to_string())
        );
        assert_eq!(render_event(&SessionEvent::BannerCleared), None);
    }

    #[test]
    fn stream_outcome_without_answer() {
        let outcome = StreamOutcome::default();
        assert_eq!(
            render_stream_outcome(&outcome),
            "(no final answer)\nflags: - (0 frames)"
        );
    }
}
