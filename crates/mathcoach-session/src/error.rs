//! Error types for the MathCoach session controller.
//!
//! This module defines the error hierarchy for every controller operation:
//! problem parsing, grading, submission admission, session lifecycle and
//! configuration loading.

use std::path::PathBuf;

/// A specialized `Result` type for MathCoach session operations.
pub type Result<T> = std::result::Result<T, MathCoachError>;

/// Errors that can occur while driving an interactive tool session.
///
/// Learner-facing variants degrade to encouragement at the call site; only
/// malformed problems and backend failures are surfaced to operators.
#[derive(Debug, thiserror::Error)]
pub enum MathCoachError {
    // ========================================================================
    // Grading Errors
    // ========================================================================
    /// The arithmetic problem text could not be parsed.
    ///
    /// Graders refuse to grade; the controller falls back to a permissive
    /// "treat as correct" result so the learner is never blocked.
    #[error("Malformed problem '{problem}': {reason}\n\nSuggestion: Use the form '<number> <operator> <number>', e.g. '5 + 3'")]
    MalformedProblem {
        /// The problem text as received.
        problem: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The learner's answer was empty, non-numeric or out of bounds.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput {
        /// The raw input.
        input: String,
        /// Why the input was rejected.
        reason: String,
    },

    /// Too many answer submissions inside the sliding window.
    #[error("Rate limit exceeded: try again in {retry_after_ms}ms\n\nSuggestion: Take a moment to check your work before submitting again")]
    RateLimited {
        /// Milliseconds until the next submission will be admitted.
        retry_after_ms: u64,
    },

    /// The grading call itself failed or timed out.
    #[error("Validation backend failure: {message}")]
    ValidationBackendFailure {
        /// Description of the failure.
        message: String,
    },

    /// A grading response arrived after its tool instance was replaced.
    #[error("Stale grading result for session {session} (generation {generation})")]
    StaleResult {
        /// Session the result was issued for.
        session: u64,
        /// Grading generation the result was issued for.
        generation: u64,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// An operation required an active tool session but none is installed.
    #[error("No active tool session\n\nSuggestion: Activate a tool before sending events")]
    NoActiveSession,

    /// An event was sent to a session whose tool cannot handle it.
    #[error("Event '{event}' is not supported by tool '{tool}'")]
    WrongTool {
        /// The tool type of the active session.
        tool: String,
        /// The event that was rejected.
        event: String,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your mathcoach.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },
}

impl MathCoachError {
    /// Creates a new `MalformedProblem` error.
    #[must_use]
    pub fn malformed_problem(problem: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedProblem {
            problem: problem.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `RateLimited` error.
    #[must_use]
    pub const fn rate_limited(retry_after_ms: u64) -> Self {
        Self::RateLimited { retry_after_ms }
    }

    /// Creates a new `ValidationBackendFailure` error.
    #[must_use]
    pub fn backend_failure(message: impl Into<String>) -> Self {
        Self::ValidationBackendFailure {
            message: message.into(),
        }
    }

    /// Creates a new `StaleResult` error.
    #[must_use]
    pub const fn stale_result(session: u64, generation: u64) -> Self {
        Self::StaleResult {
            session,
            generation,
        }
    }

    /// Creates a new `WrongTool` error.
    #[must_use]
    pub fn wrong_tool(tool: impl std::fmt::Display, event: impl Into<String>) -> Self {
        Self::WrongTool {
            tool: tool.to_string(),
            event: event.into(),
        }
    }

    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Returns `true` if this error should be logged for operators.
    ///
    /// Only malformed problems and backend failures qualify; everything else
    /// is either a learner mistake or an expected race.
    #[must_use]
    pub const fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            Self::MalformedProblem { .. } | Self::ValidationBackendFailure { .. }
        )
    }

    /// Returns `true` if this error is reported back to the learner.
    #[must_use]
    pub const fn is_learner_facing(&self) -> bool {
        matches!(self, Self::InvalidInput { .. } | Self::RateLimited { .. })
    }

    /// Returns `true` if this error must be dropped without any user-visible effect.
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::StaleResult { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = MathCoachError::malformed_problem("five plus three", "no arithmetic found");
        let msg = err.to_string();
        assert!(msg.contains("Malformed problem"));
        assert!(msg.contains("five plus three"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_rate_limited_display() {
        let err = MathCoachError::rate_limited(1500);
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn test_is_operator_visible() {
        assert!(MathCoachError::malformed_problem("x", "y").is_operator_visible());
        assert!(MathCoachError::backend_failure("timeout").is_operator_visible());
        assert!(!MathCoachError::invalid_input("abc", "not a number").is_operator_visible());
        assert!(!MathCoachError::rate_limited(10).is_operator_visible());
        assert!(!MathCoachError::stale_result(1, 2).is_operator_visible());
    }

    #[test]
    fn test_is_learner_facing() {
        assert!(MathCoachError::invalid_input("", "empty").is_learner_facing());
        assert!(MathCoachError::rate_limited(10).is_learner_facing());
        assert!(!MathCoachError::backend_failure("boom").is_learner_facing());
        assert!(!MathCoachError::NoActiveSession.is_learner_facing());
    }

    #[test]
    fn test_stale_result_is_silent() {
        assert!(MathCoachError::stale_result(3, 7).is_silent());
        assert!(!MathCoachError::NoActiveSession.is_silent());
    }

    #[test]
    fn test_wrong_tool_display() {
        let err = MathCoachError::wrong_tool("calculator", "number_clicked");
        let msg = err.to_string();
        assert!(msg.contains("number_clicked"));
        assert!(msg.contains("calculator"));
    }
}
