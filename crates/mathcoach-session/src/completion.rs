//! The structured completion string handed back to the tutor agent.
//!
//! Format: `TOOL_COMPLETION: [METHOD: <method>] [ANSWER: <value>] [PROBLEM: <expr>]`

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MathCoachError, Result};
use crate::problem::{format_number, parse_answer, sanitize_expression};

/// Prefix every completion string starts with.
pub const COMPLETION_PREFIX: &str = "TOOL_COMPLETION:";

static FIELD_PATTERNS: Lazy<Option<[Regex; 3]>> = Lazy::new(|| {
    Some([
        Regex::new(r"\[METHOD:\s*([^\]]+)\]").ok()?,
        Regex::new(r"\[ANSWER:\s*([^\]]+)\]").ok()?,
        Regex::new(r"\[PROBLEM:\s*([^\]]+)\]").ok()?,
    ])
});

/// How the learner reached the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMethod {
    /// Walked (or watched) the number line.
    NumberLine,
    /// Typed the answer into a practice form.
    Practice,
    /// Used the calculator.
    Calculator,
    /// Any method this crate does not know.
    Unknown,
}

impl CompletionMethod {
    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NumberLine => "number_line",
            Self::Practice => "practice",
            Self::Calculator => "calculator",
            Self::Unknown => "unknown",
        }
    }

    fn from_wire(name: &str) -> Self {
        match name {
            "number_line" => Self::NumberLine,
            "practice" => Self::Practice,
            "calculator" => Self::Calculator,
            _ => Self::Unknown,
        }
    }
}

/// Parsed form of a completion string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCompletion {
    /// How the problem was solved.
    pub method: CompletionMethod,
    /// The final answer.
    pub answer: f64,
    /// The solved expression, sanitized.
    pub problem: String,
}

impl ToolCompletion {
    /// Creates a completion record.
    #[must_use]
    pub fn new(method: CompletionMethod, answer: f64, problem: impl Into<String>) -> Self {
        Self {
            method,
            answer,
            problem: problem.into(),
        }
    }

    /// Parses a completion string.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::InvalidInput` when the prefix or a field is
    /// missing, or when the problem or answer fail sanitization.
    pub fn parse(text: &str) -> Result<Self> {
        let content = text.trim();
        if !content.starts_with(COMPLETION_PREFIX) {
            return Err(MathCoachError::invalid_input(
                text,
                format!("expected '{COMPLETION_PREFIX}' prefix"),
            ));
        }
        let Some([method, answer, problem]) = FIELD_PATTERNS.as_ref() else {
            return Err(MathCoachError::invalid_input(text, "field patterns unavailable"));
        };
        let field = |pattern: &Regex| {
            pattern
                .captures(content)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
        };
        let (Some(method), Some(answer), Some(problem)) =
            (field(method), field(answer), field(problem))
        else {
            return Err(MathCoachError::invalid_input(
                text,
                "missing required fields: METHOD, ANSWER or PROBLEM",
            ));
        };

        Ok(Self {
            method: CompletionMethod::from_wire(&method.to_lowercase()),
            answer: parse_answer(&answer)?,
            problem: sanitize_expression(&problem)?,
        })
    }
}

impl fmt::Display for ToolCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{COMPLETION_PREFIX} [METHOD: {}] [ANSWER: {}] [PROBLEM: {}]",
            self.method.as_str(),
            format_number(self.answer),
            self.problem
        )
    }
}
