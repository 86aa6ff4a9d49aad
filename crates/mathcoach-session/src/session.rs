//! Tool session lifecycle and the controller that owns it.
//!
//! [`SessionController`] is the single owner of everything a tool instance
//! needs: the active [`ToolSession`], its callbacks, the [`DemoPlayer`], the
//! [`InterruptionDetector`] and the answer [`RateLimiter`]. Exactly one
//! session is active at a time; activating a new one discards the previous
//! without firing its completion callback.
//!
//! Grading is split in two halves so the server can run it outside the lock:
//! [`SessionController::begin_grading`] issues a [`GradingTicket`] and marks
//! the session in flight, [`SessionController::finish_grading`] applies the
//! verdict. A ticket whose session was replaced or closed in between is
//! rejected as stale.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::completion::{CompletionMethod, ToolCompletion};
use crate::config::Config;
use crate::demo::{DemoEvent, DemoHandle, DemoPlayer, DemoState, DemoStatus, Narration};
use crate::error::{MathCoachError, Result};
use crate::insights::{count_mistakes, insights, success_message, LearningInsights};
use crate::interruption::{ChatMessage, Interruption, InterruptionAction, InterruptionDetector};
use crate::problem::{parse_answer, sanitize_expression, Problem};
use crate::rate_limit::RateLimiter;
use crate::validation::{GradingRequest, ValidationEngine, ValidationResult};

fn default_line_end() -> i64 {
    20
}

// ============================================================================
// Tool types and props
// ============================================================================

/// Kind of interactive tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Learner walks a `+`/`-` problem on the number line.
    NumberLine,
    /// Automated number line demonstration.
    DemonstrateNumberLine,
    /// Learner types the answer to a problem.
    PracticeProblem,
    /// Free-form calculator.
    Calculator,
}

impl ToolType {
    /// Wire name of the tool type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NumberLine => "number_line",
            Self::DemonstrateNumberLine => "demonstrate_number_line",
            Self::PracticeProblem => "practice_problem",
            Self::Calculator => "calculator",
        }
    }

    /// Returns `true` for the automated demonstration.
    #[must_use]
    pub const fn is_demonstration(self) -> bool {
        matches!(self, Self::DemonstrateNumberLine)
    }

    const fn completion_method(self) -> CompletionMethod {
        match self {
            Self::NumberLine | Self::DemonstrateNumberLine => CompletionMethod::NumberLine,
            Self::PracticeProblem => CompletionMethod::Practice,
            Self::Calculator => CompletionMethod::Calculator,
        }
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation parameters, one variant per tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolProps {
    /// Interactive number line.
    NumberLine {
        /// Problem text, e.g. `"5 + 3"`.
        problem: String,
        /// First visible number.
        #[serde(default)]
        start: i64,
        /// Last visible number.
        #[serde(default = "default_line_end")]
        end: i64,
    },
    /// Automated number line walk-through.
    DemonstrateNumberLine {
        /// Problem text, e.g. `"4 + 2"`.
        problem: String,
        /// First visible number.
        #[serde(default)]
        start: i64,
        /// Last visible number.
        #[serde(default = "default_line_end")]
        end: i64,
    },
    /// Practice form.
    PracticeProblem {
        /// Problem text, e.g. `"7 + 4 = ?"`.
        problem: String,
    },
    /// Calculator.
    Calculator,
}

impl ToolProps {
    /// The tool type implied by these props.
    #[must_use]
    pub const fn tool_type(&self) -> ToolType {
        match self {
            Self::NumberLine { .. } => ToolType::NumberLine,
            Self::DemonstrateNumberLine { .. } => ToolType::DemonstrateNumberLine,
            Self::PracticeProblem { .. } => ToolType::PracticeProblem,
            Self::Calculator => ToolType::Calculator,
        }
    }

    /// The problem text, for tools that have one.
    #[must_use]
    pub fn problem(&self) -> Option<&str> {
        match self {
            Self::NumberLine { problem, .. }
            | Self::DemonstrateNumberLine { problem, .. }
            | Self::PracticeProblem { problem } => Some(problem),
            Self::Calculator => None,
        }
    }
}

/// A learner action reported by the tool renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    /// A number on the number line was clicked.
    NumberClicked {
        /// The clicked number.
        number: i64,
    },
    /// The practice form's "check" button was pressed.
    AnswerChecked {
        /// Raw answer text.
        answer: String,
    },
    /// The calculator evaluated an expression.
    ExpressionEvaluated {
        /// The evaluated expression.
        expression: String,
        /// The calculator's own result.
        #[serde(default)]
        result: Option<f64>,
    },
}

impl ToolEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NumberClicked { .. } => "number_clicked",
            Self::AnswerChecked { .. } => "answer_checked",
            Self::ExpressionEvaluated { .. } => "expression_evaluated",
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Identifies one activation. Assigned in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One activated tool instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSession {
    /// Activation id.
    pub id: SessionId,
    /// Activation parameters.
    pub props: ToolProps,
    /// Advisory flag: the chat input is blocked while the tool is open.
    pub chat_blocked: bool,
    /// The demonstration run, for demonstration sessions.
    pub demo: Option<DemoHandle>,
    /// Set once the completion callback fired.
    pub completed: bool,
}

impl ToolSession {
    /// The tool type, derived from the props.
    #[must_use]
    pub const fn tool_type(&self) -> ToolType {
        self.props.tool_type()
    }
}

/// What the completion callback receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    /// The completed session.
    pub session: SessionId,
    /// Its tool type.
    pub tool_type: ToolType,
    /// Structured summary for the agent.
    pub summary: String,
    /// The solved problem (normalized), when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    /// The final answer, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<f64>,
    /// Ordered narration history, for demonstrations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub narrations: Vec<Narration>,
    /// Closing message, for graded sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    /// Summary of the grading history, for graded sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<LearningInsights>,
}

/// Read-only view of the active session for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Activation id.
    pub id: SessionId,
    /// Tool type.
    pub tool_type: ToolType,
    /// Activation parameters.
    pub props: ToolProps,
    /// Advisory chat-blocked flag.
    pub chat_blocked: bool,
    /// Whether the completion callback already fired.
    pub completed: bool,
    /// Demonstration progress while the run is live. Absent once the run
    /// finishes or is cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo: Option<DemoState>,
    /// Whether a grading call is outstanding.
    pub grading_in_flight: bool,
    /// Number line steps accepted so far.
    pub accepted_steps: Vec<i64>,
    /// Numeric practice answers graded so far.
    pub attempts: u32,
}

/// Invoked once when a session completes.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// Invoked for every narration line of a demonstration.
pub type NarrationCallback = Box<dyn FnMut(&Narration) + Send>;

struct Callbacks {
    on_complete: Option<CompletionCallback>,
    on_intermediate: Option<NarrationCallback>,
}

/// An outstanding grading call.
#[derive(Debug, Clone, PartialEq)]
pub struct GradingTicket {
    /// Session the call was issued for.
    pub session: SessionId,
    /// Grading generation within that session.
    pub generation: u64,
    /// What to grade.
    pub request: GradingRequest,
}

#[derive(Debug, Default)]
struct GradingSlot {
    in_flight: bool,
    generation: u64,
}

#[derive(Debug)]
struct ActiveSession {
    session: ToolSession,
    grading: GradingSlot,
    accepted_steps: Vec<i64>,
    attempts: u32,
    history: Vec<ValidationResult>,
}

// ============================================================================
// SessionController
// ============================================================================

/// Owns the active tool session and everything attached to it.
pub struct SessionController {
    engine: ValidationEngine,
    player: DemoPlayer,
    detector: InterruptionDetector,
    rate_limiter: RateLimiter,
    active: Option<ActiveSession>,
    callbacks: HashMap<SessionId, Callbacks>,
    sessions_created: u64,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("engine", &self.engine)
            .field("player", &self.player)
            .field("active", &self.active)
            .field("sessions_created", &self.sessions_created)
            .finish_non_exhaustive()
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl SessionController {
    /// Creates a controller with no active session.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            engine: ValidationEngine::new(config.grading.tolerance),
            player: DemoPlayer::new(config.demo),
            detector: InterruptionDetector::new(&config.interruption),
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            active: None,
            callbacks: HashMap::new(),
            sessions_created: 0,
        }
    }

    /// The grading engine, for callers that grade outside the controller.
    #[must_use]
    pub const fn engine(&self) -> ValidationEngine {
        self.engine
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Installs a new session, discarding the current one.
    ///
    /// The discarded session's completion callback is dropped without being
    /// invoked. For a demonstration the player starts right away.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::MalformedProblem` if a demonstration's problem
    /// cannot be played. The current session is then left untouched.
    pub fn activate(
        &mut self,
        props: ToolProps,
        on_complete: CompletionCallback,
        on_intermediate: Option<NarrationCallback>,
        now: Instant,
    ) -> Result<SessionId> {
        if let ToolProps::DemonstrateNumberLine { problem, .. } = &props {
            DemoPlayer::validate(problem)?;
        }

        self.teardown();

        self.sessions_created += 1;
        let id = SessionId(self.sessions_created);
        let demo = match &props {
            ToolProps::DemonstrateNumberLine { problem, .. } => {
                let handle = self.player.start(problem, now)?;
                self.detector.arm(Utc::now());
                Some(handle)
            }
            _ => None,
        };

        info!(session = %id, tool = %props.tool_type(), "Tool session activated");

        self.callbacks.insert(
            id,
            Callbacks {
                on_complete: Some(on_complete),
                on_intermediate,
            },
        );
        self.active = Some(ActiveSession {
            session: ToolSession {
                id,
                props,
                chat_blocked: false,
                demo,
                completed: false,
            },
            grading: GradingSlot::default(),
            accepted_steps: Vec::new(),
            attempts: 0,
            history: Vec::new(),
        });
        Ok(id)
    }

    /// Completes the active session with a free-form summary.
    ///
    /// Fires the completion callback at most once per session; returns
    /// `false` when there is no session or it already completed.
    pub fn complete(&mut self, message: impl Into<String>) -> bool {
        self.finish_session(message.into(), None, Vec::new())
    }

    /// Clears the active session and any demonstration attached to it.
    ///
    /// Returns `false` when there was nothing to close.
    pub fn close(&mut self) -> bool {
        let closed = self.active.is_some();
        if let Some(active) = &self.active {
            info!(session = %active.session.id, "Tool session closed");
        }
        self.teardown();
        closed
    }

    /// Sets the advisory chat-blocked flag.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::NoActiveSession` without an active session.
    pub fn set_chat_blocked(&mut self, blocked: bool) -> Result<()> {
        let active = self.active.as_mut().ok_or(MathCoachError::NoActiveSession)?;
        active.session.chat_blocked = blocked;
        debug!(session = %active.session.id, blocked, "Chat blocked flag set");
        Ok(())
    }

    /// The active session.
    #[must_use]
    pub fn session(&self) -> Option<&ToolSession> {
        self.active.as_ref().map(|active| &active.session)
    }

    /// Read-only view of the active session.
    #[must_use]
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let active = self.active.as_ref()?;
        let demo = active
            .session
            .demo
            .filter(|handle| self.player.handle() == Some(*handle))
            .and_then(|_| self.player.state().cloned());
        Some(SessionSnapshot {
            id: active.session.id,
            tool_type: active.session.tool_type(),
            props: active.session.props.clone(),
            chat_blocked: active.session.chat_blocked,
            completed: active.session.completed,
            demo,
            grading_in_flight: active.grading.in_flight,
            accepted_steps: active.accepted_steps.clone(),
            attempts: active.attempts,
        })
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            self.callbacks.remove(&active.session.id);
            // The answer window is per session
            self.rate_limiter.reset();
            if active.session.demo.is_some() {
                self.player.cancel();
                self.detector.disarm();
            }
        }
    }

    fn finish_session(
        &mut self,
        summary: String,
        answer: Option<f64>,
        narrations: Vec<Narration>,
    ) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.session.completed {
            debug!(session = %active.session.id, "Session already completed");
            return false;
        }
        active.session.completed = true;

        let id = active.session.id;
        let tool_type = active.session.tool_type();
        let problem = active.session.props.problem().map(normalized_problem);
        let graded = !tool_type.is_demonstration() && !active.history.is_empty();
        let (success, learning) = match (&problem, graded) {
            (Some(problem), true) => (
                Some(success_message(problem, count_mistakes(&active.history))),
                Some(insights(&active.history)),
            ),
            _ => (None, None),
        };

        let completion = Completion {
            session: id,
            tool_type,
            summary,
            problem,
            answer,
            narrations,
            success_message: success,
            insights: learning,
        };

        info!(session = %id, tool = %tool_type, "Tool session completed");
        let callback = self
            .callbacks
            .get_mut(&id)
            .and_then(|callbacks| callbacks.on_complete.take());
        if let Some(callback) = callback {
            callback(completion);
        }
        true
    }

    fn completion_summary(&self, answer: f64, problem: &str) -> String {
        let method = self
            .active
            .as_ref()
            .map_or(CompletionMethod::Unknown, |active| {
                active.session.tool_type().completion_method()
            });
        ToolCompletion::new(method, answer, problem).to_string()
    }

    fn narrate(&mut self, id: SessionId, narration: &Narration) {
        if let Some(callback) = self
            .callbacks
            .get_mut(&id)
            .and_then(|callbacks| callbacks.on_intermediate.as_mut())
        {
            callback(narration);
        }
    }

    // ------------------------------------------------------------------------
    // Demonstration
    // ------------------------------------------------------------------------

    /// When the demonstration next needs [`SessionController::poll`].
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.player.next_deadline()
    }

    /// Drives the demonstration up to `now`.
    ///
    /// Narrations are forwarded to the intermediate callback; a finished run
    /// completes the session with the full narration history.
    pub fn poll(&mut self, now: Instant) -> Vec<DemoEvent> {
        let owner = self.demo_session();
        let events = self.player.poll(now);
        let Some(id) = owner else {
            return events;
        };
        for event in &events {
            match event {
                DemoEvent::Narrated(narration) => self.narrate(id, narration),
                DemoEvent::Finished(outcome) => {
                    self.detector.disarm();
                    #[allow(clippy::cast_precision_loss)]
                    let answer = outcome.answer as f64;
                    let problem = outcome.problem.to_string();
                    let summary = self.completion_summary(answer, &problem);
                    self.finish_session(summary, Some(answer), outcome.narrations.clone());
                }
            }
        }
        events
    }

    /// Pauses the demonstration of the active session.
    ///
    /// Returns the pause narration, or `None` if the demonstration was not
    /// running.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` without a session and `WrongTool` when the
    /// session is not a demonstration.
    pub fn pause_demo(&mut self, reason: impl Into<String>) -> Result<Option<Narration>> {
        let id = self.require_demo("pause")?;
        let narration = self.player.pause(reason);
        if let Some(narration) = &narration {
            self.narrate(id, narration);
        }
        Ok(narration)
    }

    /// Resumes the demonstration of the active session.
    ///
    /// Returns the resume narration, or `None` if it was not paused.
    ///
    /// # Errors
    ///
    /// Same as [`SessionController::pause_demo`].
    pub fn resume_demo(&mut self, now: Instant) -> Result<Option<Narration>> {
        let id = self.require_demo("resume")?;
        let narration = self.player.resume(now);
        if let Some(narration) = &narration {
            self.narrate(id, narration);
        }
        Ok(narration)
    }

    /// Feeds transcript messages to the interruption detector and acts on
    /// what it finds.
    ///
    /// Returns the interruptions that paused or resumed the demonstration.
    pub fn ingest(&mut self, messages: &[ChatMessage], now: Instant) -> Vec<Interruption> {
        if !self.detector.is_armed() {
            debug!(messages = messages.len(), "No demonstration watching the transcript");
            return Vec::new();
        }
        let mut acted = Vec::new();
        for message in messages {
            let status = if self.demo_session().is_some() {
                self.player.status()
            } else {
                DemoStatus::Stopped
            };
            let Some(interruption) = self.detector.observe(message, status) else {
                continue;
            };
            let applied = match interruption.action {
                InterruptionAction::Pause => self
                    .pause_demo(interruption.reason.clone().unwrap_or_default())
                    .map(|narration| narration.is_some()),
                InterruptionAction::Resume => {
                    self.resume_demo(now).map(|narration| narration.is_some())
                }
            };
            if matches!(applied, Ok(true)) {
                info!(message_id = %interruption.message_id, action = ?interruption.action, "Interruption applied");
                acted.push(interruption);
            }
        }
        acted
    }

    /// The active session id if it owns the player's current run.
    fn demo_session(&self) -> Option<SessionId> {
        let active = self.active.as_ref()?;
        let handle = active.session.demo?;
        (self.player.handle() == Some(handle)).then_some(active.session.id)
    }

    fn require_demo(&self, operation: &str) -> Result<SessionId> {
        let active = self.active.as_ref().ok_or(MathCoachError::NoActiveSession)?;
        if active.session.demo.is_none() {
            return Err(MathCoachError::wrong_tool(active.session.tool_type(), operation));
        }
        Ok(active.session.id)
    }

    // ------------------------------------------------------------------------
    // Grading
    // ------------------------------------------------------------------------

    /// Turns a learner action into a grading call.
    ///
    /// Returns `Ok(None)` when the event is ignored: a call for this session
    /// is already in flight, or the session already completed.
    ///
    /// # Errors
    ///
    /// - `NoActiveSession` without a session
    /// - `WrongTool` when the active tool cannot take this event
    /// - `RateLimited` when practice answers come in too fast
    /// - `InvalidInput` for an unsafe calculator expression
    pub fn begin_grading(&mut self, event: ToolEvent, now: Instant) -> Result<Option<GradingTicket>> {
        let active = self.active.as_mut().ok_or(MathCoachError::NoActiveSession)?;
        let session = &active.session;

        if session.completed {
            debug!(session = %session.id, event = event.name(), "Ignoring event after completion");
            return Ok(None);
        }
        if active.grading.in_flight {
            debug!(session = %session.id, event = event.name(), "Ignoring event while grading in flight");
            return Ok(None);
        }

        let request = match (&session.props, event) {
            (ToolProps::NumberLine { problem, .. }, ToolEvent::NumberClicked { number }) => {
                GradingRequest::NumberLine {
                    problem: problem.clone(),
                    prior_steps: active.accepted_steps.clone(),
                    proposed_step: number,
                }
            }
            (ToolProps::PracticeProblem { problem }, ToolEvent::AnswerChecked { answer }) => {
                // Empty or non-numeric input is graded for feedback but is not an attempt
                if parse_answer(&answer).is_err() {
                    debug!(session = %session.id, "Practice input is not a number, attempt not counted");
                    GradingRequest::PracticeProblem {
                        problem: problem.clone(),
                        user_input: answer,
                        attempt: active.attempts + 1,
                    }
                } else {
                    if !self.rate_limiter.is_allowed_at(now) {
                        let retry_after = self.rate_limiter.retry_after_at(now);
                        let retry_after_ms =
                            u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                        warn!(session = %session.id, retry_after_ms, "Practice answer rate limited");
                        return Err(MathCoachError::rate_limited(retry_after_ms));
                    }
                    active.attempts += 1;
                    GradingRequest::PracticeProblem {
                        problem: problem.clone(),
                        user_input: answer,
                        attempt: active.attempts,
                    }
                }
            }
            (ToolProps::Calculator, ToolEvent::ExpressionEvaluated { expression, result }) => {
                GradingRequest::Calculator {
                    expression: sanitize_expression(&expression)?,
                    result,
                }
            }
            (props, event) => {
                warn!(tool = %props.tool_type(), event = event.name(), "Event rejected by tool");
                return Err(MathCoachError::wrong_tool(props.tool_type(), event.name()));
            }
        };

        active.grading.in_flight = true;
        active.grading.generation += 1;
        debug!(session = %session.id, generation = active.grading.generation, "Grading started");

        Ok(Some(GradingTicket {
            session: session.id,
            generation: active.grading.generation,
            request,
        }))
    }

    /// Applies the outcome of a grading call.
    ///
    /// Grader failures never reach the learner: a malformed problem yields
    /// the permissive result, any other failure the gentle fallback. A
    /// completing verdict fires the session's completion callback.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::StaleResult` when the ticket's session was
    /// replaced or closed, or its generation is outdated. Callers drop it.
    pub fn finish_grading(
        &mut self,
        ticket: GradingTicket,
        outcome: Result<ValidationResult>,
    ) -> Result<ValidationResult> {
        let stale = || MathCoachError::stale_result(ticket.session.get(), ticket.generation);
        let Some(active) = self.active.as_mut() else {
            debug!(session = %ticket.session, "Dropping grading result: no active session");
            return Err(stale());
        };
        if active.session.id != ticket.session || active.grading.generation != ticket.generation {
            debug!(
                session = %ticket.session,
                generation = ticket.generation,
                "Dropping stale grading result"
            );
            return Err(stale());
        }
        active.grading.in_flight = false;

        let result = match outcome {
            Ok(result) => result,
            Err(err @ MathCoachError::MalformedProblem { .. }) => {
                warn!(session = %ticket.session, error = %err, "Grading malformed problem permissively");
                ValidationResult::permissive()
            }
            Err(err) => {
                error!(session = %ticket.session, error = %err, "Grading failed, using fallback");
                ValidationResult::fallback()
            }
        };
        active.history.push(result.clone());

        let completion = match &ticket.request {
            GradingRequest::NumberLine {
                problem,
                proposed_step,
                ..
            } => {
                if result.is_correct {
                    active.accepted_steps.push(*proposed_step);
                }
                result
                    .final_answer
                    .filter(|_| result.problem_completed)
                    .map(|end| {
                        #[allow(clippy::cast_precision_loss)]
                        let answer = end as f64;
                        (answer, normalized_problem(problem))
                    })
            }
            GradingRequest::PracticeProblem {
                problem,
                user_input,
                ..
            } => result.is_correct.then(|| {
                let answer = result
                    .correct_answer
                    .or_else(|| parse_answer(user_input).ok())
                    .unwrap_or_default();
                (answer, normalized_problem(problem))
            }),
            GradingRequest::Calculator { expression, result: value } => {
                value.map(|value| (value, expression.clone()))
            }
        };

        if let Some((answer, problem)) = completion {
            let summary = self.completion_summary(answer, &problem);
            self.finish_session(summary, Some(answer), Vec::new());
        }
        Ok(result)
    }

    /// Grades a learner action synchronously.
    ///
    /// Returns `Ok(None)` when the event is ignored.
    ///
    /// # Errors
    ///
    /// Same as [`SessionController::begin_grading`].
    pub fn handle_event(&mut self, event: ToolEvent, now: Instant) -> Result<Option<ValidationResult>> {
        let Some(ticket) = self.begin_grading(event, now)? else {
            return Ok(None);
        };
        let outcome = self.engine.grade(&ticket.request);
        self.finish_grading(ticket, outcome).map(Some)
    }
}

fn normalized_problem(text: &str) -> String {
    Problem::parse(text).map_or_else(|_| text.to_string(), |parsed| parsed.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::config::DemoTiming;
    use crate::demo::NarrationKind;
    use crate::validation::{GuidanceLevel, MistakeType, Outcome};

    const STEP: Duration = Duration::from_millis(100);

    #[derive(Clone, Default)]
    struct Recorder {
        completions: Arc<Mutex<Vec<Completion>>>,
        narrations: Arc<Mutex<Vec<Narration>>>,
    }

    impl Recorder {
        fn on_complete(&self) -> CompletionCallback {
            let completions = Arc::clone(&self.completions);
            Box::new(move |completion: Completion| {
                completions.lock().unwrap().push(completion);
            })
        }

        fn on_intermediate(&self) -> Option<NarrationCallback> {
            let narrations = Arc::clone(&self.narrations);
            Some(Box::new(move |narration: &Narration| {
                narrations.lock().unwrap().push(narration.clone());
            }))
        }

        fn completions(&self) -> Vec<Completion> {
            self.completions.lock().unwrap().clone()
        }

        fn narration_kinds(&self) -> Vec<NarrationKind> {
            self.narrations.lock().unwrap().iter().map(|n| n.kind).collect()
        }
    }

    fn controller() -> SessionController {
        let config = Config {
            demo: DemoTiming::uniform(100),
            ..Config::default()
        };
        SessionController::new(&config)
    }

    fn number_line(problem: &str) -> ToolProps {
        ToolProps::NumberLine {
            problem: problem.to_string(),
            start: 0,
            end: 20,
        }
    }

    fn demo(problem: &str) -> ToolProps {
        ToolProps::DemonstrateNumberLine {
            problem: problem.to_string(),
            start: 0,
            end: 20,
        }
    }

    fn practice(problem: &str) -> ToolProps {
        ToolProps::PracticeProblem {
            problem: problem.to_string(),
        }
    }

    fn click(number: i64) -> ToolEvent {
        ToolEvent::NumberClicked { number }
    }

    fn answer(text: &str) -> ToolEvent {
        ToolEvent::AnswerChecked {
            answer: text.to_string(),
        }
    }

    fn run_demo(controller: &mut SessionController) {
        while let Some(due) = controller.next_deadline() {
            controller.poll(due);
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[test]
    fn test_activate_assigns_increasing_ids() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let now = Instant::now();
        let first = controller
            .activate(number_line("5 + 3"), recorder.on_complete(), None, now)
            .unwrap();
        let second = controller
            .activate(ToolProps::Calculator, recorder.on_complete(), None, now)
            .unwrap();
        assert!(second > first);
        assert_eq!(controller.session().unwrap().tool_type(), ToolType::Calculator);
    }

    #[test]
    fn test_replacing_session_does_not_complete_previous() {
        let mut controller = controller();
        let first = Recorder::default();
        let now = Instant::now();
        controller
            .activate(number_line("1 + 1"), first.on_complete(), None, now)
            .unwrap();
        controller.handle_event(click(1), now).unwrap();

        let second = Recorder::default();
        controller
            .activate(number_line("2 + 1"), second.on_complete(), None, now)
            .unwrap();
        assert!(controller.snapshot().unwrap().accepted_steps.is_empty());
        controller.handle_event(click(2), now).unwrap();
        controller.handle_event(click(3), now).unwrap();

        assert!(first.completions().is_empty());
        assert_eq!(second.completions().len(), 1);
    }

    #[test]
    fn test_complete_fires_once() {
        let mut controller = controller();
        let recorder = Recorder::default();
        controller
            .activate(ToolProps::Calculator, recorder.on_complete(), None, Instant::now())
            .unwrap();
        assert!(controller.complete("done"));
        assert!(!controller.complete("again"));
        let completions = recorder.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].summary, "done");
    }

    #[test]
    fn test_complete_without_session_is_noop() {
        let mut controller = controller();
        assert!(!controller.complete("nothing"));
    }

    #[test]
    fn test_close_clears_session_and_demo() {
        let mut controller = controller();
        let recorder = Recorder::default();
        controller
            .activate(demo("4 + 2"), recorder.on_complete(), None, Instant::now())
            .unwrap();
        assert!(controller.next_deadline().is_some());
        assert!(controller.close());
        assert!(controller.snapshot().is_none());
        assert!(controller.next_deadline().is_none());
        assert!(!controller.close());
        assert!(recorder.completions().is_empty());
    }

    #[test]
    fn test_chat_blocked_flag() {
        let mut controller = controller();
        assert!(matches!(
            controller.set_chat_blocked(true),
            Err(MathCoachError::NoActiveSession)
        ));
        controller
            .activate(ToolProps::Calculator, Recorder::default().on_complete(), None, Instant::now())
            .unwrap();
        controller.set_chat_blocked(true).unwrap();
        assert!(controller.snapshot().unwrap().chat_blocked);
    }

    #[test]
    fn test_malformed_demo_keeps_prior_session() {
        let mut controller = controller();
        let now = Instant::now();
        let prior = controller
            .activate(practice("7 + 4"), Recorder::default().on_complete(), None, now)
            .unwrap();
        let err = controller
            .activate(demo("6 * 2"), Recorder::default().on_complete(), None, now)
            .unwrap_err();
        assert!(matches!(err, MathCoachError::MalformedProblem { .. }));
        assert_eq!(controller.session().unwrap().id, prior);
    }

    #[test]
    fn test_non_demo_sessions_have_no_demo_state() {
        let mut controller = controller();
        controller
            .activate(number_line("5 + 3"), Recorder::default().on_complete(), None, Instant::now())
            .unwrap();
        assert!(controller.snapshot().unwrap().demo.is_none());
        assert!(controller.next_deadline().is_none());
    }

    // ------------------------------------------------------------------------
    // Demonstration
    // ------------------------------------------------------------------------

    #[test]
    fn test_demo_runs_to_completion() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let id = controller
            .activate(demo("4 + 2"), recorder.on_complete(), recorder.on_intermediate(), Instant::now())
            .unwrap();
        run_demo(&mut controller);

        assert_eq!(
            recorder.narration_kinds(),
            vec![
                NarrationKind::Start,
                NarrationKind::Step,
                NarrationKind::Step,
                NarrationKind::Complete
            ]
        );
        let completions = recorder.completions();
        assert_eq!(completions.len(), 1);
        let completion = &completions[0];
        assert_eq!(completion.session, id);
        assert_eq!(completion.answer, Some(6.0));
        assert_eq!(completion.narrations.len(), 4);
        assert_eq!(
            completion.summary,
            "TOOL_COMPLETION: [METHOD: number_line] [ANSWER: 6] [PROBLEM: 4 + 2]"
        );
        assert!(completion.success_message.is_none());
    }

    #[test]
    fn test_demo_state_discarded_after_finish() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let start = Instant::now();
        controller
            .activate(demo("1 + 1"), recorder.on_complete(), recorder.on_intermediate(), start)
            .unwrap();
        controller.poll(start + STEP * 2);
        assert_eq!(
            controller.snapshot().unwrap().demo.unwrap().status,
            DemoStatus::Completed
        );
        assert!(recorder.completions().is_empty());

        run_demo(&mut controller);
        let snapshot = controller.snapshot().unwrap();
        assert!(snapshot.completed);
        assert!(snapshot.demo.is_none());
        assert!(controller.next_deadline().is_none());

        // Demo controls stay valid on the finished session but do nothing
        assert!(controller.pause_demo("wait").unwrap().is_none());
        assert!(controller.resume_demo(start).unwrap().is_none());
        assert_eq!(recorder.completions().len(), 1);
    }

    #[test]
    fn test_demo_pause_resume_through_controller() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let start = Instant::now();
        controller
            .activate(demo("4 + 2"), recorder.on_complete(), recorder.on_intermediate(), start)
            .unwrap();
        controller.poll(start + STEP);

        assert!(controller.pause_demo("why?").unwrap().is_some());
        assert!(controller.pause_demo("why again?").unwrap().is_none());
        assert_eq!(
            controller.snapshot().unwrap().demo.unwrap().status,
            DemoStatus::Paused
        );
        assert!(controller.resume_demo(start + STEP * 5).unwrap().is_some());
        assert!(controller.resume_demo(start + STEP * 5).unwrap().is_none());

        run_demo(&mut controller);
        let completions = recorder.completions();
        assert_eq!(completions[0].narrations.len(), 6);
    }

    #[test]
    fn test_pause_demo_requires_demo_session() {
        let mut controller = controller();
        assert!(matches!(
            controller.pause_demo("x"),
            Err(MathCoachError::NoActiveSession)
        ));
        controller
            .activate(ToolProps::Calculator, Recorder::default().on_complete(), None, Instant::now())
            .unwrap();
        assert!(matches!(
            controller.resume_demo(Instant::now()),
            Err(MathCoachError::WrongTool { .. })
        ));
    }

    #[test]
    fn test_ingest_pauses_and_resumes() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let start = Instant::now();
        controller
            .activate(demo("4 + 2"), recorder.on_complete(), recorder.on_intermediate(), start)
            .unwrap();
        controller.poll(start + STEP);

        let question = ChatMessage::user("m1", "What does the arrow mean?");
        let noise = ChatMessage::user("m2", "hm");
        let acted = controller.ingest(&[question.clone(), noise], start + STEP);
        assert_eq!(acted.len(), 1);
        assert_eq!(acted[0].action, InterruptionAction::Pause);
        assert_eq!(controller.snapshot().unwrap().demo.unwrap().pause_reason.as_deref(), Some("What does the arrow mean?"));

        // Replaying the same transcript is a no-op
        assert!(controller.ingest(&[question], start + STEP).is_empty());

        let acted = controller.ingest(&[ChatMessage::user("m3", "ok continue")], start + STEP * 2);
        assert_eq!(acted[0].action, InterruptionAction::Resume);
        run_demo(&mut controller);
        assert_eq!(recorder.completions().len(), 1);
    }

    #[test]
    fn test_ingest_without_demo_does_nothing() {
        let mut controller = controller();
        controller
            .activate(practice("7 + 4"), Recorder::default().on_complete(), None, Instant::now())
            .unwrap();
        let acted = controller.ingest(&[ChatMessage::user("m1", "what?")], Instant::now());
        assert!(acted.is_empty());
    }

    // ------------------------------------------------------------------------
    // Grading
    // ------------------------------------------------------------------------

    #[test]
    fn test_number_line_walk_completes() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let now = Instant::now();
        controller
            .activate(number_line("5 + 3"), recorder.on_complete(), None, now)
            .unwrap();

        let result = controller.handle_event(click(5), now).unwrap().unwrap();
        assert_eq!(result.outcome, Outcome::Correct);
        let result = controller.handle_event(click(7), now).unwrap().unwrap();
        assert_eq!(result.mistake_type, Some(MistakeType::SkippingNumbers));
        for number in [6, 7] {
            assert!(controller.handle_event(click(number), now).unwrap().unwrap().is_correct);
        }
        assert!(recorder.completions().is_empty());
        let result = controller.handle_event(click(8), now).unwrap().unwrap();
        assert!(result.problem_completed);

        let completions = recorder.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].answer, Some(8.0));
        assert!(completions[0]
            .success_message
            .as_deref()
            .unwrap()
            .contains("one small mistake"));
        assert_eq!(completions[0].insights.as_ref().unwrap().total_validations, 5);

        // Events after completion are ignored
        assert!(controller.handle_event(click(9), now).unwrap().is_none());
    }

    #[test]
    fn test_practice_completes_on_correct_answer() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let now = Instant::now();
        controller
            .activate(practice("12 / 4"), recorder.on_complete(), None, now)
            .unwrap();
        let result = controller.handle_event(answer("8"), now).unwrap().unwrap();
        assert_eq!(result.correct_answer, Some(3.0));
        assert!(recorder.completions().is_empty());

        controller.handle_event(answer("3"), now).unwrap();
        let completions = recorder.completions();
        assert_eq!(
            completions[0].summary,
            "TOOL_COMPLETION: [METHOD: practice] [ANSWER: 3] [PROBLEM: 12 / 4]"
        );
        assert_eq!(controller.snapshot().unwrap().attempts, 2);
    }

    #[test]
    fn test_practice_rate_limited() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(practice("7 + 4"), Recorder::default().on_complete(), None, now)
            .unwrap();
        for _ in 0..5 {
            controller.handle_event(answer("1"), now).unwrap();
        }
        let err = controller.handle_event(answer("11"), now).unwrap_err();
        assert!(matches!(err, MathCoachError::RateLimited { retry_after_ms: 30_000 }));
        assert_eq!(controller.snapshot().unwrap().attempts, 5);

        let later = now + Duration::from_secs(30);
        assert!(controller.handle_event(answer("11"), later).unwrap().unwrap().is_correct);
    }

    #[test]
    fn test_practice_non_numeric_input_is_not_an_attempt() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(practice("12 / 4"), Recorder::default().on_complete(), None, now)
            .unwrap();

        let empty = controller.handle_event(answer(""), now).unwrap().unwrap();
        assert_eq!(empty.outcome, Outcome::NeedsGuidance);
        let word = controller.handle_event(answer("abc"), now).unwrap().unwrap();
        assert_eq!(word.mistake_type, Some(MistakeType::InvalidInput));
        assert_eq!(controller.snapshot().unwrap().attempts, 0);

        let wrong = controller.handle_event(answer("8"), now).unwrap().unwrap();
        assert_eq!(wrong.guidance_level, GuidanceLevel::Gentle);
        assert_eq!(controller.snapshot().unwrap().attempts, 1);

        // The two bad inputs left the whole quota for numeric answers
        for guess in ["1", "2", "4", "5"] {
            controller.handle_event(answer(guess), now).unwrap();
        }
        assert_eq!(controller.snapshot().unwrap().attempts, 5);
        assert!(matches!(
            controller.handle_event(answer("3"), now),
            Err(MathCoachError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_rate_limit_window_is_per_session() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(practice("7 + 4"), Recorder::default().on_complete(), None, now)
            .unwrap();
        for _ in 0..5 {
            controller.handle_event(answer("1"), now).unwrap();
        }
        assert!(controller.handle_event(answer("11"), now).is_err());

        controller
            .activate(practice("2 + 2"), Recorder::default().on_complete(), None, now)
            .unwrap();
        assert!(controller.handle_event(answer("4"), now).unwrap().unwrap().is_correct);
    }

    #[test]
    fn test_calculator_completes_on_evaluation() {
        let mut controller = controller();
        let recorder = Recorder::default();
        let now = Instant::now();
        controller
            .activate(ToolProps::Calculator, recorder.on_complete(), None, now)
            .unwrap();
        let err = controller
            .handle_event(
                ToolEvent::ExpressionEvaluated {
                    expression: "2 + x".to_string(),
                    result: None,
                },
                now,
            )
            .unwrap_err();
        assert!(err.is_learner_facing());

        let result = controller
            .handle_event(
                ToolEvent::ExpressionEvaluated {
                    expression: "6 × 7".to_string(),
                    result: Some(42.0),
                },
                now,
            )
            .unwrap()
            .unwrap();
        assert!(result.is_correct);
        let completions = recorder.completions();
        assert_eq!(
            completions[0].summary,
            "TOOL_COMPLETION: [METHOD: calculator] [ANSWER: 42] [PROBLEM: 6 * 7]"
        );
        assert!(completions[0].problem.is_none());
    }

    #[test]
    fn test_wrong_tool_event_rejected() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(number_line("5 + 3"), Recorder::default().on_complete(), None, now)
            .unwrap();
        let err = controller.handle_event(answer("8"), now).unwrap_err();
        assert!(matches!(err, MathCoachError::WrongTool { .. }));

        controller
            .activate(demo("4 + 2"), Recorder::default().on_complete(), None, now)
            .unwrap();
        assert!(controller.handle_event(click(4), now).is_err());
    }

    #[test]
    fn test_events_ignored_while_grading_in_flight() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(number_line("5 + 3"), Recorder::default().on_complete(), None, now)
            .unwrap();
        let ticket = controller.begin_grading(click(5), now).unwrap().unwrap();
        assert!(controller.snapshot().unwrap().grading_in_flight);
        assert!(controller.begin_grading(click(6), now).unwrap().is_none());

        let outcome = controller.engine().grade(&ticket.request);
        controller.finish_grading(ticket, outcome).unwrap();
        assert!(!controller.snapshot().unwrap().grading_in_flight);
        assert_eq!(controller.snapshot().unwrap().accepted_steps, vec![5]);
    }

    #[test]
    fn test_stale_result_after_replacement() {
        let mut controller = controller();
        let now = Instant::now();
        let recorder = Recorder::default();
        controller
            .activate(number_line("0 + 0"), recorder.on_complete(), None, now)
            .unwrap();
        let ticket = controller.begin_grading(click(0), now).unwrap().unwrap();
        controller
            .activate(number_line("5 + 3"), Recorder::default().on_complete(), None, now)
            .unwrap();

        let outcome = controller.engine().grade(&ticket.request);
        let err = controller.finish_grading(ticket, outcome).unwrap_err();
        assert!(err.is_silent());
        assert!(recorder.completions().is_empty());
        assert!(controller.snapshot().unwrap().accepted_steps.is_empty());
    }

    #[test]
    fn test_stale_result_after_close() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(practice("2 + 2"), Recorder::default().on_complete(), None, now)
            .unwrap();
        let ticket = controller.begin_grading(answer("4"), now).unwrap().unwrap();
        controller.close();
        let outcome = controller.engine().grade(&ticket.request);
        assert!(matches!(
            controller.finish_grading(ticket, outcome),
            Err(MathCoachError::StaleResult { .. })
        ));
    }

    #[test]
    fn test_backend_failure_uses_fallback() {
        let mut controller = controller();
        let now = Instant::now();
        controller
            .activate(practice("2 + 2"), Recorder::default().on_complete(), None, now)
            .unwrap();
        let ticket = controller.begin_grading(answer("4"), now).unwrap().unwrap();
        let result = controller
            .finish_grading(ticket, Err(MathCoachError::backend_failure("timed out")))
            .unwrap();
        assert_eq!(result, ValidationResult::fallback());
        assert!(!controller.snapshot().unwrap().completed);
    }

    #[test]
    fn test_malformed_problem_graded_permissively() {
        let mut controller = controller();
        let now = Instant::now();
        let recorder = Recorder::default();
        controller
            .activate(number_line("count some apples"), recorder.on_complete(), None, now)
            .unwrap();
        let result = controller.handle_event(click(3), now).unwrap().unwrap();
        assert!(result.is_correct);
        assert!(recorder.completions().is_empty());

        controller
            .activate(practice("how many apples"), recorder.on_complete(), None, now)
            .unwrap();
        let result = controller.handle_event(answer("3"), now).unwrap().unwrap();
        assert!(result.is_correct);
        assert_eq!(recorder.completions()[0].answer, Some(3.0));
    }

    #[test]
    fn test_props_serialization() {
        let props: ToolProps =
            serde_json::from_str(r#"{"tool":"demonstrate_number_line","problem":"4 + 2"}"#).unwrap();
        assert_eq!(props.tool_type(), ToolType::DemonstrateNumberLine);
        assert_eq!(props, demo("4 + 2"));

        let props: ToolProps = serde_json::from_str(r#"{"tool":"calculator"}"#).unwrap();
        assert_eq!(props, ToolProps::Calculator);

        let event: ToolEvent = serde_json::from_str(r#"{"type":"number_clicked","number":6}"#).unwrap();
        assert_eq!(event, click(6));
    }
}
