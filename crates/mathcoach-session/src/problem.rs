//! Arithmetic problem parsing and learner input sanitization.
//!
//! Problems are plain ASCII of the shape `"<int> <operator> <int>"`, with an
//! optional `= ?` or `= <int>` suffix. The visual glyphs `×` and `÷` are
//! normalized to `*` and `/` before matching. Parsing is pattern based: the
//! first `<digits> <op> <digits>` run found anywhere in the text wins.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MathCoachError, Result};

/// Longest expression accepted by [`sanitize_expression`].
pub const MAX_EXPRESSION_LEN: usize = 100;

/// Largest answer magnitude accepted by [`parse_answer`].
pub const MAX_ANSWER_MAGNITUDE: f64 = 1_000_000.0;

static PROBLEM_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d+)\s*([+\-*/])\s*(\d+)").ok());

static EXPRESSION_CHARSET: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[\d\s+\-*/().=?]+$").ok());

/// Single arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `+`
    #[serde(rename = "+")]
    Add,
    /// `-`
    #[serde(rename = "-")]
    Subtract,
    /// `*` (also written `×`)
    #[serde(rename = "*")]
    Multiply,
    /// `/` (also written `÷`)
    #[serde(rename = "/")]
    Divide,
}

impl Operator {
    /// Parses a single operator symbol, accepting the visual glyphs.
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "+" => Some(Self::Add),
            "-" => Some(Self::Subtract),
            "*" | "×" => Some(Self::Multiply),
            "/" | "÷" => Some(Self::Divide),
            _ => None,
        }
    }

    /// The ASCII symbol of this operator.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }

    /// Direction of travel on the number line: `+1` for addition, `-1` for
    /// subtraction. Multiplication and division have no direction.
    #[must_use]
    pub const fn direction(self) -> Option<i64> {
        match self {
            Self::Add => Some(1),
            Self::Subtract => Some(-1),
            Self::Multiply | Self::Divide => None,
        }
    }

    /// The word used in narration and feedback ("forward" / "backward").
    #[must_use]
    pub const fn direction_word(self) -> &'static str {
        match self {
            Self::Subtract => "backward",
            _ => "forward",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A parsed two-operand arithmetic problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Left operand.
    pub first: i64,
    /// The operator.
    pub operator: Operator,
    /// Right operand.
    pub second: i64,
}

impl Problem {
    /// Parses problem text such as `"5 + 3"`, `"12 ÷ 4 = ?"` or `"7 - 2 = 5"`.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::MalformedProblem` when no
    /// `<int> <operator> <int>` run can be found.
    ///
    /// # Examples
    ///
    /// ```
    /// use mathcoach_session::{Operator, Problem};
    ///
    /// let problem = Problem::parse("12 ÷ 4 = ?").unwrap();
    /// assert_eq!(problem.first, 12);
    /// assert_eq!(problem.operator, Operator::Divide);
    /// assert_eq!(problem.second, 4);
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let normalized = normalize_glyphs(text);
        let Some(pattern) = PROBLEM_PATTERN.as_ref() else {
            return Err(MathCoachError::malformed_problem(
                text,
                "problem pattern unavailable",
            ));
        };
        let captures = pattern.captures(&normalized).ok_or_else(|| {
            MathCoachError::malformed_problem(text, "expected '<number> <operator> <number>'")
        })?;

        let operand = |index: usize| -> Result<i64> {
            captures
                .get(index)
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .ok_or_else(|| MathCoachError::malformed_problem(text, "operand out of range"))
        };
        let operator = captures
            .get(2)
            .and_then(|m| Operator::from_symbol(m.as_str()))
            .ok_or_else(|| MathCoachError::malformed_problem(text, "unknown operator"))?;

        Ok(Self {
            first: operand(1)?,
            operator,
            second: operand(3)?,
        })
    }

    /// Parses a problem that can be walked on a number line (`+` or `-`).
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::MalformedProblem` for unparseable text and for
    /// multiplication or division.
    pub fn parse_sequential(text: &str) -> Result<Self> {
        let problem = Self::parse(text)?;
        if problem.operator.direction().is_none() {
            return Err(MathCoachError::malformed_problem(
                text,
                format!(
                    "operator '{}' cannot be stepped on a number line",
                    problem.operator
                ),
            ));
        }
        Ok(problem)
    }

    /// Evaluates the problem.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::MalformedProblem` on division by zero or
    /// integer overflow.
    #[allow(clippy::cast_precision_loss)]
    pub fn answer(&self) -> Result<f64> {
        let overflow = || MathCoachError::malformed_problem(self.to_string(), "result overflows");
        match self.operator {
            Operator::Add => self
                .first
                .checked_add(self.second)
                .map(|v| v as f64)
                .ok_or_else(overflow),
            Operator::Subtract => self
                .first
                .checked_sub(self.second)
                .map(|v| v as f64)
                .ok_or_else(overflow),
            Operator::Multiply => self
                .first
                .checked_mul(self.second)
                .map(|v| v as f64)
                .ok_or_else(overflow),
            Operator::Divide => {
                if self.second == 0 {
                    return Err(MathCoachError::malformed_problem(
                        self.to_string(),
                        "division by zero",
                    ));
                }
                Ok(self.first as f64 / self.second as f64)
            }
        }
    }

    /// The integer end point of a number line walk (`first ± second`).
    ///
    /// Returns `None` for multiplication and division.
    #[must_use]
    pub fn walk_end(&self) -> Option<i64> {
        let direction = self.operator.direction()?;
        self.first.checked_add(direction.checked_mul(self.second)?)
    }

    /// The number at `step` along the number line walk.
    #[must_use]
    pub fn position_at(&self, step: i64) -> Option<i64> {
        let direction = self.operator.direction()?;
        self.first.checked_add(direction.checked_mul(step)?)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.first, self.operator, self.second)
    }
}

/// Replaces the multiply/divide glyphs with their ASCII forms.
#[must_use]
pub fn normalize_glyphs(text: &str) -> String {
    text.replace('×', "*").replace('÷', "/")
}

/// Normalizes and checks an arithmetic expression typed on the calculator or
/// carried in a completion payload.
///
/// # Errors
///
/// Returns `MathCoachError::InvalidInput` when the expression is empty, longer
/// than [`MAX_EXPRESSION_LEN`], or contains anything but digits, whitespace,
/// `+ - * / ( ) . = ?`.
pub fn sanitize_expression(expression: &str) -> Result<String> {
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(MathCoachError::invalid_input(
            expression,
            format!("expression longer than {MAX_EXPRESSION_LEN} characters"),
        ));
    }
    let normalized = normalize_glyphs(expression.trim());
    if normalized.is_empty() {
        return Err(MathCoachError::invalid_input(expression, "empty expression"));
    }
    let allowed = EXPRESSION_CHARSET
        .as_ref()
        .is_some_and(|re| re.is_match(&normalized));
    if !allowed {
        return Err(MathCoachError::invalid_input(
            expression,
            "only numbers and + - * / ( ) . = ? are allowed",
        ));
    }
    Ok(normalized)
}

/// Parses a learner's numeric answer.
///
/// # Errors
///
/// Returns `MathCoachError::InvalidInput` when the input is empty, not a
/// finite number, or larger in magnitude than [`MAX_ANSWER_MAGNITUDE`].
pub fn parse_answer(input: &str) -> Result<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(MathCoachError::invalid_input(input, "empty answer"));
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| MathCoachError::invalid_input(input, "not a number"))?;
    if !value.is_finite() {
        return Err(MathCoachError::invalid_input(input, "not a finite number"));
    }
    if value.abs() > MAX_ANSWER_MAGNITUDE {
        return Err(MathCoachError::invalid_input(
            input,
            "answer out of reasonable bounds",
        ));
    }
    Ok(value)
}

/// Formats a numeric answer without a trailing `.0` for whole numbers.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
