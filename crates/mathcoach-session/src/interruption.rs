//! Detection of learner interruptions during a demonstration.
//!
//! Classification is keyword based. Continuation phrases win over question
//! indicators, so "can you show me the demo?" resumes rather than pauses.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::InterruptionConfig;
use crate::demo::DemoStatus;

const CONTINUATION_KEYWORDS: &[&str] = &[
    "continue",
    "resume",
    "next step",
    "keep going",
    "proceed",
    "go on",
    "demo",
    "demonstration",
    "show me",
    "let me see",
];

const QUESTION_INDICATORS: &[&str] = &[
    "what",
    "how",
    "why",
    "when",
    "where",
    "who",
    "can you",
    "could you",
    "would you",
    "will you",
    "explain",
    "tell me",
    "help me",
];

const QUESTION_STARTERS: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "can", "could", "would", "will", "is", "are",
    "do", "does",
];

// ============================================================================
// Chat messages
// ============================================================================

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The learner.
    User,
    /// The tutor agent.
    Assistant,
}

/// One entry of the chat transcript. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Transcript-unique id.
    pub id: String,
    /// Who wrote it.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// When it was sent.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Creates a learner message stamped now.
    #[must_use]
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Classification
// ============================================================================

/// What a learner message means for a running demonstration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Asks the demonstration to carry on.
    Continuation,
    /// A question that should pause the demonstration.
    Query,
    /// Anything else.
    Noise,
}

/// Classifies one message.
///
/// Messages shorter than `min_chars` after trimming are always noise.
#[must_use]
pub fn classify(content: &str, min_chars: usize) -> Classification {
    let trimmed = content.trim();
    if trimmed.chars().count() < min_chars {
        return Classification::Noise;
    }
    let lower = trimmed.to_lowercase();

    if CONTINUATION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Classification::Continuation;
    }
    if lower.contains('?')
        || QUESTION_INDICATORS.iter().any(|k| lower.contains(k))
        || QUESTION_STARTERS.iter().any(|w| lower.starts_with(w))
    {
        return Classification::Query;
    }
    Classification::Noise
}

// ============================================================================
// InterruptionDetector
// ============================================================================

/// Action the detector asks the demo player to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionAction {
    /// Freeze playback.
    Pause,
    /// Continue playback.
    Resume,
}

/// A detected interruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interruption {
    /// What to do.
    pub action: InterruptionAction,
    /// The message that triggered it.
    pub message_id: String,
    /// The question text, for pauses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Watches the transcript and turns learner messages into pause/resume
/// requests.
///
/// Each message id is classified at most once per demonstration. Only
/// messages sent at or after the current demonstration started are
/// considered, and nothing is tracked while disarmed.
#[derive(Debug, Clone, Default)]
pub struct InterruptionDetector {
    min_message_chars: usize,
    seen: HashSet<String>,
    started_at: Option<DateTime<Utc>>,
}

impl InterruptionDetector {
    /// Creates a detector with no demonstration armed.
    #[must_use]
    pub fn new(config: &InterruptionConfig) -> Self {
        Self {
            min_message_chars: config.min_message_chars,
            seen: HashSet::new(),
            started_at: None,
        }
    }

    /// Starts watching for a demonstration that began at `started_at`.
    ///
    /// Message ids seen during an earlier demonstration are forgotten.
    pub fn arm(&mut self, started_at: DateTime<Utc>) {
        self.seen.clear();
        self.started_at = Some(started_at);
    }

    /// Stops watching.
    pub fn disarm(&mut self) {
        self.seen.clear();
        self.started_at = None;
    }

    /// Returns `true` while a demonstration is being watched.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.started_at.is_some()
    }

    /// Looks at one message given the player's current status.
    ///
    /// A query while `Running` yields a pause; a continuation while `Paused`
    /// yields a resume. Every other combination yields nothing.
    pub fn observe(&mut self, message: &ChatMessage, status: DemoStatus) -> Option<Interruption> {
        let started_at = self.started_at?;
        if message.role != MessageRole::User || message.timestamp < started_at {
            return None;
        }
        if !self.seen.insert(message.id.clone()) {
            return None;
        }

        let classification = classify(&message.content, self.min_message_chars);
        debug!(message_id = %message.id, ?classification, ?status, "Classified message");

        match (classification, status) {
            (Classification::Query, DemoStatus::Running) => Some(Interruption {
                action: InterruptionAction::Pause,
                message_id: message.id.clone(),
                reason: Some(message.content.trim().to_string()),
            }),
            (Classification::Continuation, DemoStatus::Paused) => Some(Interruption {
                action: InterruptionAction::Resume,
                message_id: message.id.clone(),
                reason: None,
            }),
            _ => None,
        }
    }
}
