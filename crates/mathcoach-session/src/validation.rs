//! Step-wise grading of learner actions.
//!
//! Three independent graders, one per tool:
//!
//! - [`grade_number_line_step`] walks a `+`/`-` problem one number at a time
//! - [`grade_final_answer`] checks a typed answer to a practice problem
//! - [`grade_expression`] acknowledges calculator evaluations
//!
//! Every grader is a pure function. Serialization of grading calls and
//! stale-result suppression belong to the session controller.

use serde::{Deserialize, Serialize};

use crate::error::{MathCoachError, Result};
use crate::problem::{format_number, parse_answer, Operator, Problem};

// ============================================================================
// Result Types
// ============================================================================

/// Coarse verdict of a grading call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The step or answer is right.
    Correct,
    /// The step or answer is wrong.
    Incorrect,
    /// Nothing gradable was submitted yet.
    NeedsGuidance,
}

/// Tone of the feedback shown to the learner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceLevel {
    /// Soft nudge.
    Gentle,
    /// Names the exact fix.
    Specific,
    /// Keep-going encouragement.
    Encouraging,
    /// The problem is solved.
    Celebration,
}

/// Classified learner mistake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MistakeType {
    /// First click was not the first operand.
    WrongStartingNumber,
    /// Jumped past the next number while adding.
    SkippingNumbers,
    /// Moved backward while adding.
    WrongDirection,
    /// Any other wrong number line step.
    IncorrectSequence,
    /// A step was proposed after the walk already ended.
    ProblemAlreadyCompleted,
    /// The answer was not a number.
    InvalidInput,
    /// The answer repeated one of the addends.
    NotAdding,
    /// A wrong final answer.
    IncorrectCalculation,
    /// Grading itself could not run.
    ValidationError,
}

impl MistakeType {
    /// The snake_case name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WrongStartingNumber => "wrong_starting_number",
            Self::SkippingNumbers => "skipping_numbers",
            Self::WrongDirection => "wrong_direction",
            Self::IncorrectSequence => "incorrect_sequence",
            Self::ProblemAlreadyCompleted => "problem_already_completed",
            Self::InvalidInput => "invalid_input",
            Self::NotAdding => "not_adding",
            Self::IncorrectCalculation => "incorrect_calculation",
            Self::ValidationError => "validation_error",
        }
    }
}

impl std::fmt::Display for MistakeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict returned for one learner action.
///
/// Immutable once built; displayed and then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Coarse verdict.
    #[serde(rename = "result")]
    pub outcome: Outcome,

    /// `true` only for [`Outcome::Correct`].
    pub is_correct: bool,

    /// Sentence shown to the learner.
    pub feedback: String,

    /// Optional next-step hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Classified mistake, for incorrect results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mistake_type: Option<MistakeType>,

    /// Tone of the feedback.
    pub guidance_level: GuidanceLevel,

    /// Number line steps still to take.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_steps: Option<i64>,

    /// The expected answer, when it is revealed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<f64>,

    /// The end point of a finished number line walk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<i64>,

    /// Set when this action finished the problem.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub problem_completed: bool,
}

impl ValidationResult {
    fn correct(feedback: impl Into<String>, guidance_level: GuidanceLevel) -> Self {
        Self {
            outcome: Outcome::Correct,
            is_correct: true,
            feedback: feedback.into(),
            hint: None,
            mistake_type: None,
            guidance_level,
            remaining_steps: None,
            correct_answer: None,
            final_answer: None,
            problem_completed: false,
        }
    }

    fn incorrect(
        feedback: impl Into<String>,
        mistake_type: MistakeType,
        guidance_level: GuidanceLevel,
    ) -> Self {
        Self {
            outcome: Outcome::Incorrect,
            is_correct: false,
            feedback: feedback.into(),
            hint: None,
            mistake_type: Some(mistake_type),
            guidance_level,
            remaining_steps: None,
            correct_answer: None,
            final_answer: None,
            problem_completed: false,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Substitute result used when grading itself fails, so the learner is
    /// never stuck.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            outcome: Outcome::NeedsGuidance,
            is_correct: false,
            feedback: "I'm having trouble checking that step. Let's keep going!".to_string(),
            hint: Some("Continue with the next step in your learning.".to_string()),
            mistake_type: Some(MistakeType::ValidationError),
            guidance_level: GuidanceLevel::Gentle,
            remaining_steps: None,
            correct_answer: None,
            final_answer: None,
            problem_completed: false,
        }
    }

    /// Permissive result used when the problem text cannot be parsed: the
    /// step is accepted rather than blocking the learner.
    #[must_use]
    pub fn permissive() -> Self {
        Self::correct("Nice work! Keep going.", GuidanceLevel::Encouraging)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A grading call, one variant per tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum GradingRequest {
    /// A number line click.
    NumberLine {
        /// Problem text.
        problem: String,
        /// Steps accepted so far, in order.
        prior_steps: Vec<i64>,
        /// The number just clicked.
        proposed_step: i64,
    },
    /// A practice problem answer.
    PracticeProblem {
        /// Problem text.
        problem: String,
        /// Raw answer text.
        user_input: String,
        /// 1-based attempt counter supplied by the caller.
        attempt: u32,
    },
    /// A calculator evaluation.
    Calculator {
        /// The evaluated expression.
        expression: String,
        /// The calculator's own result.
        result: Option<f64>,
    },
}

/// Stateless dispatcher over the three graders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationEngine {
    tolerance: f64,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self { tolerance: 0.01 }
    }
}

impl ValidationEngine {
    /// Creates an engine accepting numeric answers within `tolerance`.
    #[must_use]
    pub const fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Grades one request with the grader matching its tool.
    pub fn grade(&self, request: &GradingRequest) -> Result<ValidationResult> {
        match request {
            GradingRequest::NumberLine {
                problem,
                prior_steps,
                proposed_step,
            } => grade_number_line_step(problem, prior_steps, *proposed_step),
            GradingRequest::PracticeProblem {
                problem,
                user_input,
                attempt,
            } => grade_final_answer_within(problem, user_input, *attempt, self.tolerance),
            GradingRequest::Calculator { expression, result } => {
                Ok(grade_expression(expression, *result))
            }
        }
    }
}

// ============================================================================
// Sequential-step grader (number line)
// ============================================================================

/// Grades one click on the number line.
///
/// The accepted progression is `first, first ± 1, …, first ± second`
/// (`second + 1` numbers). Mistake classification is deliberately
/// asymmetric: only addition distinguishes overshooting
/// (`skipping_numbers`) and moving backward (`wrong_direction`); every
/// subtraction mistake is reported as `incorrect_sequence`.
///
/// # Errors
///
/// Returns `MathCoachError::MalformedProblem` when the problem is not a
/// `+`/`-` problem.
pub fn grade_number_line_step(
    problem: &str,
    prior_steps: &[i64],
    proposed_step: i64,
) -> Result<ValidationResult> {
    let parsed = Problem::parse_sequential(problem)?;
    let Some(direction) = parsed.operator.direction() else {
        return Err(MathCoachError::malformed_problem(problem, "no direction"));
    };
    let unreachable_end =
        || MathCoachError::malformed_problem(problem, "number line walk overflows");

    let Some(&last) = prior_steps.last() else {
        return grade_first_step(&parsed, direction, proposed_step).ok_or_else(unreachable_end);
    };

    let end = parsed.walk_end().ok_or_else(unreachable_end)?;
    let steps_taken = i64::try_from(prior_steps.len() - 1).map_err(|_| unreachable_end())?;

    if steps_taken >= parsed.second {
        return Ok(ValidationResult::incorrect(
            format!("You already finished! {parsed} = {end}."),
            MistakeType::ProblemAlreadyCompleted,
            GuidanceLevel::Gentle,
        )
        .with_hint(format!("The answer is {end}. No more clicks needed.")));
    }

    let expected_next = last + direction;
    if proposed_step == expected_next {
        let remaining = parsed.second - steps_taken - 1;
        if remaining <= 0 {
            let mut result = ValidationResult::correct(
                format!("Fantastic! You solved {parsed} = {end}!"),
                GuidanceLevel::Celebration,
            )
            .with_hint("Excellent work! You completed the problem step by step.");
            result.problem_completed = true;
            result.final_answer = Some(end);
            return Ok(result);
        }

        let plural = if remaining > 1 { "s" } else { "" };
        let mut result = ValidationResult::correct(
            format!("Great! Keep going - {remaining} more step{plural}."),
            GuidanceLevel::Encouraging,
        )
        .with_hint(format!(
            "Perfect! Now click on {}.",
            expected_next + direction
        ));
        result.remaining_steps = Some(remaining);
        return Ok(result);
    }

    Ok(classify_number_line_mistake(
        parsed.operator,
        last,
        expected_next,
        proposed_step,
    ))
}

fn grade_first_step(parsed: &Problem, direction: i64, proposed_step: i64) -> Option<ValidationResult> {
    if proposed_step != parsed.first {
        return Some(
            ValidationResult::incorrect(
                format!("Let's start at the first number: {}", parsed.first),
                MistakeType::WrongStartingNumber,
                GuidanceLevel::Specific,
            )
            .with_hint(format!("Click on {} to begin the problem.", parsed.first)),
        );
    }

    if parsed.second == 0 {
        let mut result = ValidationResult::correct(
            format!(
                "Perfect! {parsed} = {} because we don't move at all.",
                parsed.first
            ),
            GuidanceLevel::Celebration,
        );
        result.problem_completed = true;
        result.final_answer = Some(parsed.first);
        return Some(result);
    }

    let next = parsed.first.checked_add(direction)?;
    let mut result = ValidationResult::correct(
        format!(
            "Perfect! You started at {}. Now let's count {}!",
            parsed.first,
            parsed.operator.direction_word()
        ),
        GuidanceLevel::Encouraging,
    )
    .with_hint(format!("Great start! Next, click on {next}."));
    result.remaining_steps = Some(parsed.second);
    Some(result)
}

fn classify_number_line_mistake(
    operator: Operator,
    last: i64,
    expected_next: i64,
    proposed_step: i64,
) -> ValidationResult {
    match operator {
        Operator::Add if proposed_step > expected_next => ValidationResult::incorrect(
            "Slow down! Let's count one step at a time.",
            MistakeType::SkippingNumbers,
            GuidanceLevel::Gentle,
        )
        .with_hint(format!(
            "Try clicking on {expected_next} instead of {proposed_step}."
        )),
        Operator::Add if proposed_step < last => ValidationResult::incorrect(
            "For addition, we count forward (to the right)!",
            MistakeType::WrongDirection,
            GuidanceLevel::Specific,
        )
        .with_hint(format!(
            "Click on {expected_next} to continue counting forward."
        )),
        _ => ValidationResult::incorrect(
            format!(
                "Not quite! Let's count {} one number at a time.",
                operator.direction_word()
            ),
            MistakeType::IncorrectSequence,
            GuidanceLevel::Gentle,
        )
        .with_hint(format!("Click on {expected_next} to continue.")),
    }
}

// ============================================================================
// Final-answer grader (practice problems)
// ============================================================================

/// Grades a typed answer with the default 0.01 tolerance.
///
/// `attempt` is the caller's 1-based submission counter; it escalates the
/// generic feedback from `gentle` to `specific`.
pub fn grade_final_answer(problem: &str, user_input: &str, attempt: u32) -> Result<ValidationResult> {
    grade_final_answer_within(problem, user_input, attempt, ValidationEngine::default().tolerance)
}

/// Grades a typed answer with an explicit tolerance.
///
/// # Errors
///
/// Returns `MathCoachError::MalformedProblem` if the problem cannot be parsed
/// or evaluated (division by zero). Bad learner input is not an error: it
/// yields a `needs_guidance` or `invalid_input` result.
#[allow(clippy::float_cmp, clippy::cast_precision_loss)]
pub fn grade_final_answer_within(
    problem: &str,
    user_input: &str,
    attempt: u32,
    tolerance: f64,
) -> Result<ValidationResult> {
    let parsed = Problem::parse(problem)?;
    let correct_answer = parsed.answer()?;
    let shown = format_number(correct_answer);

    if user_input.trim().is_empty() {
        return Ok(ValidationResult {
            outcome: Outcome::NeedsGuidance,
            is_correct: false,
            feedback: "Please enter your answer to continue.".to_string(),
            hint: Some("Take your time and think about the problem step by step.".to_string()),
            mistake_type: None,
            guidance_level: GuidanceLevel::Gentle,
            remaining_steps: None,
            correct_answer: None,
            final_answer: None,
            problem_completed: false,
        });
    }

    let Ok(answer) = parse_answer(user_input) else {
        return Ok(ValidationResult::incorrect(
            "Please enter a valid number.",
            MistakeType::InvalidInput,
            GuidanceLevel::Specific,
        )
        .with_hint("Make sure you're entering just the number, like '8' or '12'."));
    };

    if (answer - correct_answer).abs() < tolerance {
        let mut result =
            ValidationResult::correct(format!("Excellent! {parsed} = {shown}"), GuidanceLevel::Celebration)
                .with_hint("Great job! You solved it correctly!");
        result.correct_answer = Some(correct_answer);
        result.problem_completed = true;
        return Ok(result);
    }

    if parsed.operator == Operator::Add
        && (answer == parsed.first as f64 || answer == parsed.second as f64)
    {
        return Ok(ValidationResult::incorrect(
            "You entered one of the numbers from the problem. For addition, we need to add them together!",
            MistakeType::NotAdding,
            GuidanceLevel::Specific,
        )
        .with_hint(format!(
            "Try adding {} + {}. What do you get?",
            parsed.first, parsed.second
        )));
    }

    let guidance_level = if attempt <= 1 {
        GuidanceLevel::Gentle
    } else {
        GuidanceLevel::Specific
    };
    let mut result = ValidationResult::incorrect(
        format!("Not quite right. The correct answer is {shown}."),
        MistakeType::IncorrectCalculation,
        guidance_level,
    )
    .with_hint(format!("Try working through {parsed} step by step."));
    result.correct_answer = Some(correct_answer);
    Ok(result)
}

// ============================================================================
// Expression-tracking grader (calculator)
// ============================================================================

/// Acknowledges a calculator evaluation.
///
/// Always correct: the calculator's own evaluation is authoritative, this
/// grader only keeps the UI feedback consistent across tools.
pub fn grade_expression(expression: &str, result: Option<f64>) -> ValidationResult {
    let feedback = match (expression.trim().is_empty(), result) {
        (true, _) => "Ready to calculate!".to_string(),
        (false, Some(value)) => format!(
            "Looking good! {} = {}",
            expression.trim(),
            format_number(value)
        ),
        (false, None) => "Looking good! Your calculation is on track.".to_string(),
    };
    ValidationResult::correct(feedback, GuidanceLevel::Encouraging)
        .with_hint("Continue with your calculation.")
}

// ============================================================================
// Tests
// ============================================================================
