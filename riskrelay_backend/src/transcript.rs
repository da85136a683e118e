//! Conversation recorder.
//!
//! Merges turns observed from several capture channels into one append-only,
//! bounded transcript. User turns from capture channels are deduplicated
//! against the most recent turn of the same role, because the same message is
//! usually seen by more than one channel. Turns produced by the session itself
//! have a single source and are always appended, so a message the user repeats
//! on a later turn stays in the history. Already-appended turns are never
//! reordered or rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub const DEFAULT_TRANSCRIPT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a turn was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureChannel {
    /// Text posted to the primary agent over HTTP.
    HttpRequest,
    /// Text sent over the widget's streaming connection.
    SocketFrame,
    /// Text typed into the widget's input box.
    TypedInput,
    /// Assistant text reported by the widget.
    Widget,
    /// Turns produced by the session itself.
    Session,
}

impl CaptureChannel {
    /// Several channels can observe the same user message.
    pub fn needs_dedup(self) -> bool {
        !matches!(self, CaptureChannel::Session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: Role,
    content: String,
    channel: CaptureChannel,
    recorded_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>, channel: CaptureChannel) -> Self {
        Self {
            role,
            content: content.into().trim().to_string(),
            channel,
            recorded_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, CaptureChannel::Session)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, CaptureChannel::Session)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn channel(&self) -> CaptureChannel {
        self.channel
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended,
    /// Same trimmed text as the previous turn of the same role.
    Duplicate,
    /// Nothing but whitespace.
    Empty,
}

const PREVIEW_CHARS: usize = 80;

/// Log-safe excerpt of a message.
pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[derive(Debug, Clone)]
pub struct ConversationRecorder {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
    total_recorded: u64,
}

impl Default for ConversationRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_CAPACITY)
    }
}

impl ConversationRecorder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
            total_recorded: 0,
        }
    }

    pub fn record(&mut self, turn: ConversationTurn) -> RecordOutcome {
        if turn.content.is_empty() {
            return RecordOutcome::Empty;
        }

        if turn.role == Role::User
            && turn.channel.needs_dedup()
            && self.repeats_last_of_role(&turn)
        {
            tracing::debug!(
                "Dropping duplicate user turn from {:?} ({} chars)",
                turn.channel,
                turn.content.chars().count()
            );
            return RecordOutcome::Duplicate;
        }

        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
        self.total_recorded += 1;
        RecordOutcome::Appended
    }

    pub fn record_user(&mut self, content: &str, channel: CaptureChannel) -> RecordOutcome {
        self.record(ConversationTurn::new(Role::User, content, channel))
    }

    pub fn record_assistant(&mut self, content: &str, channel: CaptureChannel) -> RecordOutcome {
        self.record(ConversationTurn::new(Role::Assistant, content, channel))
    }

    /// Retained turns in chronological order.
    pub fn transcript(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    /// Owned copy of the retained turns, for work that must not see later appends.
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    /// The last `limit` retained turns, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(limit);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Turns ever appended, including those evicted by the retention bound.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.total_recorded = 0;
    }

    fn repeats_last_of_role(&self, turn: &ConversationTurn) -> bool {
        self.turns
            .iter()
            .rev()
            .find(|existing| existing.role == turn.role)
            .map(|existing| existing.content == turn.content)
            .unwrap_or(false)
    }
}
