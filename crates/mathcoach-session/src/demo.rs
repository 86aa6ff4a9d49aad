//! Timed number line demonstration.
//!
//! [`DemoPlayer`] is a pure state machine: it never sleeps and never spawns.
//! Callers feed it the current [`Instant`] through [`DemoPlayer::poll`] and
//! sleep until [`DemoPlayer::next_deadline`] in between. A run moves through
//!
//! - `Stopped` -> `Running` on [`DemoPlayer::start`]
//! - `Running` <-> `Paused` on [`DemoPlayer::pause`] / [`DemoPlayer::resume`]
//! - `Running` -> `Completed` after the tick that lands on the answer
//!
//! and [`DemoPlayer::cancel`] returns to `Stopped` from anywhere. A completed
//! run is dropped once its finish timer fires. A run holds at most one
//! pending timer; every schedule replaces the previous one.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DemoTiming;
use crate::error::{MathCoachError, Result};
use crate::problem::Problem;

// ============================================================================
// DemoStatus and DemoState
// ============================================================================

/// Playback status of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoStatus {
    /// No run, or the run was cancelled.
    #[default]
    Stopped,
    /// Ticking toward the answer.
    Running,
    /// Frozen by an interruption.
    Paused,
    /// Landed on the answer.
    Completed,
}

impl DemoStatus {
    /// Returns `true` for `Stopped` and `Completed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

/// Read-only view of a run's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoState {
    /// Index of the next tick.
    pub current_step: u64,

    /// Delay between ticks.
    pub step_delay_ms: u64,

    /// Playback status.
    pub status: DemoStatus,

    /// Why playback is paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,

    /// When playback was paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,

    /// When playback last resumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Narration
// ============================================================================

/// What a narration line announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationKind {
    /// First tick, standing on the first operand.
    Start,
    /// One move along the number line.
    Step,
    /// Playback froze.
    Pause,
    /// Playback continues.
    Resume,
    /// Landed on the answer.
    Complete,
}

/// One line of demonstration narration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narration {
    /// Tick index the line belongs to.
    pub step: u64,
    /// Number line position being shown.
    pub position: i64,
    /// Kind of line.
    pub kind: NarrationKind,
    /// Text shown to the learner.
    pub text: String,
}

/// Identifies one run of the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DemoHandle(u64);

impl DemoHandle {
    /// The run number, unique per player.
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.0
    }
}

/// Final result of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoOutcome {
    /// The run that finished.
    pub handle: DemoHandle,
    /// The demonstrated problem.
    pub problem: Problem,
    /// Where the walk ended.
    pub answer: i64,
    /// Every narration of the run, in order.
    pub narrations: Vec<Narration>,
}

/// Emitted by [`DemoPlayer::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoEvent {
    /// A narration line, delivered as it happens.
    Narrated(Narration),
    /// The settle delay after completion elapsed.
    Finished(DemoOutcome),
}

// ============================================================================
// DemoPlayer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Tick,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingTimer {
    due: Instant,
    kind: TimerKind,
}

#[derive(Debug, Clone)]
struct DemoRun {
    handle: DemoHandle,
    problem: Problem,
    last_step: u64,
    state: DemoState,
    pending: Option<PendingTimer>,
    narrations: Vec<Narration>,
}

impl DemoRun {
    /// Steps are clamped to the walk, which `plan` checked cannot overflow.
    fn position(&self, step: u64) -> i64 {
        i64::try_from(step.min(self.last_step))
            .ok()
            .and_then(|step| self.problem.position_at(step))
            .unwrap_or(self.problem.first)
    }

    fn record(&mut self, step: u64, position: i64, kind: NarrationKind, text: String) -> Narration {
        let narration = Narration {
            step,
            position,
            kind,
            text,
        };
        self.narrations.push(narration.clone());
        narration
    }

    fn fire(&mut self, timer: PendingTimer, timing: &DemoTiming, events: &mut Vec<DemoEvent>) {
        match timer.kind {
            TimerKind::Tick => {
                let step = self.state.current_step;
                let position = self.position(step);
                let narration = if step == 0 {
                    let text = format!(
                        "Let's solve {} on the number line. We start at {position}.",
                        self.problem
                    );
                    self.record(step, position, NarrationKind::Start, text)
                } else {
                    let text = format!(
                        "Step {step}: count {} to {position}.",
                        self.problem.operator.direction_word()
                    );
                    self.record(step, position, NarrationKind::Step, text)
                };
                debug!(run = self.handle.run_id(), step, position, "Demo tick");
                events.push(DemoEvent::Narrated(narration));
                self.state.current_step = step.saturating_add(1);

                if step >= self.last_step {
                    self.state.status = DemoStatus::Completed;
                    let text = format!("We landed on {position}, so {} = {position}!", self.problem);
                    let narration = self.record(step, position, NarrationKind::Complete, text);
                    events.push(DemoEvent::Narrated(narration));
                    self.pending = Some(PendingTimer {
                        due: timer.due + timing.completion_delay(),
                        kind: TimerKind::Finish,
                    });
                } else {
                    self.pending = Some(PendingTimer {
                        due: timer.due + timing.step_delay(),
                        kind: TimerKind::Tick,
                    });
                }
            }
            TimerKind::Finish => {
                info!(run = self.handle.run_id(), problem = %self.problem, "Demo finished");
                events.push(DemoEvent::Finished(DemoOutcome {
                    handle: self.handle,
                    problem: self.problem,
                    answer: self.position(self.last_step),
                    narrations: self.narrations.clone(),
                }));
            }
        }
    }
}

/// Plays a `+`/`-` problem on the number line one tick at a time.
#[derive(Debug, Clone)]
pub struct DemoPlayer {
    timing: DemoTiming,
    runs_started: u64,
    run: Option<DemoRun>,
}

impl Default for DemoPlayer {
    fn default() -> Self {
        Self::new(DemoTiming::default())
    }
}

fn plan(problem: &str) -> Result<(Problem, u64)> {
    let parsed = Problem::parse_sequential(problem)?;
    if parsed.operator.direction().is_none() {
        return Err(MathCoachError::malformed_problem(problem, "no direction"));
    }
    if parsed.walk_end().is_none() {
        return Err(MathCoachError::malformed_problem(problem, "number line walk overflows"));
    }
    let last_step = u64::try_from(parsed.second)
        .map_err(|_| MathCoachError::malformed_problem(problem, "negative step count"))?;
    Ok((parsed, last_step))
}

impl DemoPlayer {
    /// Checks that `problem` can be demonstrated without starting anything.
    ///
    /// # Errors
    ///
    /// Same as [`DemoPlayer::start`].
    pub fn validate(problem: &str) -> Result<Problem> {
        plan(problem).map(|(parsed, _)| parsed)
    }

    /// Creates a stopped player with the given pacing.
    #[must_use]
    pub const fn new(timing: DemoTiming) -> Self {
        Self {
            timing,
            runs_started: 0,
            run: None,
        }
    }

    /// Starts a new run, replacing any current one.
    ///
    /// The first tick is due after the initial delay.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::MalformedProblem` if the problem is not a
    /// `+`/`-` problem. The player is left untouched.
    pub fn start(&mut self, problem: &str, now: Instant) -> Result<DemoHandle> {
        let (parsed, last_step) = plan(problem)?;

        self.runs_started += 1;
        let handle = DemoHandle(self.runs_started);
        info!(run = handle.run_id(), problem = %parsed, "Demo started");

        self.run = Some(DemoRun {
            handle,
            problem: parsed,
            last_step,
            state: DemoState {
                current_step: 0,
                step_delay_ms: self.timing.step_delay_ms,
                status: DemoStatus::Running,
                pause_reason: None,
                paused_at: None,
                resumed_at: None,
            },
            pending: Some(PendingTimer {
                due: now + self.timing.initial_delay(),
                kind: TimerKind::Tick,
            }),
            narrations: Vec::new(),
        });
        Ok(handle)
    }

    /// Fires every timer due at or before `now`.
    ///
    /// Overdue ticks are caught up in order, each measured from the previous
    /// deadline rather than from `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<DemoEvent> {
        let mut events = Vec::new();
        let timing = self.timing;
        let Some(run) = self.run.as_mut() else {
            return events;
        };
        while let Some(timer) = run.pending.filter(|timer| timer.due <= now) {
            run.pending = None;
            run.fire(timer, &timing, &mut events);
        }
        // A finished run has nothing left to schedule and is dropped
        if run.state.status.is_terminal() && run.pending.is_none() {
            debug!(run = run.handle.run_id(), "Demo run discarded");
            self.run = None;
        }
        events
    }

    /// Freezes playback, recording `reason`.
    ///
    /// Only acts while `Running`; returns `None` otherwise, so a second pause
    /// leaves the saved state untouched.
    pub fn pause(&mut self, reason: impl Into<String>) -> Option<Narration> {
        let run = self.run.as_mut()?;
        if run.state.status != DemoStatus::Running {
            return None;
        }
        let reason = reason.into();
        run.pending = None;
        run.state.status = DemoStatus::Paused;
        run.state.paused_at = Some(Utc::now());
        run.state.pause_reason = Some(reason.clone());

        let step = run.state.current_step;
        let position = run.position(step.saturating_sub(1));
        info!(run = run.handle.run_id(), step, %reason, "Demo paused");
        let text = format!("Pausing at {position} to answer your question: \"{reason}\"");
        Some(run.record(step, position, NarrationKind::Pause, text))
    }

    /// Continues a paused run at its saved step after the resume delay.
    ///
    /// Returns `None` and does nothing unless `Paused`.
    pub fn resume(&mut self, now: Instant) -> Option<Narration> {
        let run = self.run.as_mut()?;
        if run.state.status != DemoStatus::Paused {
            return None;
        }
        run.state.status = DemoStatus::Running;
        run.state.pause_reason = None;
        run.state.paused_at = None;
        run.state.resumed_at = Some(Utc::now());
        run.pending = Some(PendingTimer {
            due: now + self.timing.resume_delay(),
            kind: TimerKind::Tick,
        });

        let step = run.state.current_step;
        let position = run.position(step.saturating_sub(1));
        info!(run = run.handle.run_id(), step, "Demo resumed");
        let text = format!("Let's continue from {position}!");
        Some(run.record(step, position, NarrationKind::Resume, text))
    }

    /// Drops the current run and its pending timer.
    pub fn cancel(&mut self) {
        if let Some(run) = self.run.take() {
            debug!(run = run.handle.run_id(), "Demo cancelled");
        }
    }

    /// Status of the current run, `Stopped` when there is none.
    #[must_use]
    pub fn status(&self) -> DemoStatus {
        self.run
            .as_ref()
            .map_or(DemoStatus::Stopped, |run| run.state.status)
    }

    /// Progress of the current run.
    #[must_use]
    pub fn state(&self) -> Option<&DemoState> {
        self.run.as_ref().map(|run| &run.state)
    }

    /// Handle of the current run.
    #[must_use]
    pub fn handle(&self) -> Option<DemoHandle> {
        self.run.as_ref().map(|run| run.handle)
    }

    /// When the pending timer is due, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.run.as_ref()?.pending.map(|timer| timer.due)
    }
}

// ============================================================================
// Tests
// ============================================================================
