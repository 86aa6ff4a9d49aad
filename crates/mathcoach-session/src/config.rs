//! Configuration types for the MathCoach session controller.
//!
//! This module provides the configuration structures that tune demo pacing,
//! submission rate limiting, grading tolerance and interruption detection.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MathCoachError, Result};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "mathcoach.json";

/// Default delay before the first demo tick, giving the learner time to read
/// the starting position.
const fn default_initial_delay_ms() -> u64 {
    2000
}

/// Default delay between demo ticks.
const fn default_step_delay_ms() -> u64 {
    1200
}

/// Default settle delay between a resume and the next tick.
const fn default_resume_delay_ms() -> u64 {
    500
}

/// Default settle delay between the final tick and the completion callback.
const fn default_completion_delay_ms() -> u64 {
    1500
}

/// Default number of admitted submissions per window.
const fn default_max_calls() -> usize {
    5
}

/// Default sliding window length.
const fn default_window_ms() -> u64 {
    30_000
}

/// Default absolute tolerance for numeric answers.
const fn default_tolerance() -> f64 {
    0.01
}

/// Default timeout for a single grading call.
const fn default_grading_timeout_ms() -> u64 {
    5000
}

/// Default minimum length of a message worth classifying.
const fn default_min_message_chars() -> usize {
    3
}

/// Default broadcast buffer per event subscriber.
const fn default_event_buffer() -> usize {
    100
}

/// Main configuration for the MathCoach session controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Demo playback pacing.
    #[serde(default)]
    pub demo: DemoTiming,

    /// Answer submission admission control.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Grading tolerance and timeouts.
    #[serde(default)]
    pub grading: GradingConfig,

    /// Interruption detector tuning.
    #[serde(default)]
    pub interruption: InterruptionConfig,

    /// Buffer size of each WebSocket event subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            demo: DemoTiming::default(),
            rate_limit: RateLimitConfig::default(),
            grading: GradingConfig::default(),
            interruption: InterruptionConfig::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `mathcoach.json` in the current directory. If not found,
    /// returns default configuration.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            MathCoachError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `mathcoach.json` in a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `MathCoachError::ConfigParseError` if the file exists but
    /// contains invalid JSON, and `MathCoachError::ConfigValidationError` if
    /// the values are out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(MathCoachError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| MathCoachError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// Every delay, the rate limit window and quota, the grading timeout and
    /// the event buffer must be greater than 0. The tolerance must be a
    /// finite, non-negative number.
    pub fn validate(&self) -> Result<()> {
        let delays = [
            ("demo.initialDelayMs", self.demo.initial_delay_ms),
            ("demo.stepDelayMs", self.demo.step_delay_ms),
            ("demo.resumeDelayMs", self.demo.resume_delay_ms),
            ("demo.completionDelayMs", self.demo.completion_delay_ms),
            ("rateLimit.windowMs", self.rate_limit.window_ms),
            ("grading.timeoutMs", self.grading.timeout_ms),
        ];
        for (name, value) in delays {
            if value == 0 {
                return Err(MathCoachError::config_validation(
                    format!("{name} must be greater than 0"),
                    format!("Set {name} to at least 1 in your mathcoach.json"),
                ));
            }
        }

        if self.rate_limit.max_calls == 0 {
            return Err(MathCoachError::config_validation(
                "rateLimit.maxCalls must be greater than 0",
                "Set rateLimit.maxCalls to at least 1 in your mathcoach.json",
            ));
        }

        if !self.grading.tolerance.is_finite() || self.grading.tolerance < 0.0 {
            return Err(MathCoachError::config_validation(
                format!(
                    "grading.tolerance must be a non-negative number (got {})",
                    self.grading.tolerance
                ),
                "Use a small positive tolerance such as 0.01",
            ));
        }

        if self.event_buffer == 0 {
            return Err(MathCoachError::config_validation(
                "eventBuffer must be greater than 0",
                "Set eventBuffer to at least 1 in your mathcoach.json (100 is typical)",
            ));
        }

        Ok(())
    }
}

/// Demo playback pacing, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoTiming {
    /// Delay before the first ("orientation") tick.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay between subsequent ticks.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// Settle delay after a resume before playback moves again.
    #[serde(default = "default_resume_delay_ms")]
    pub resume_delay_ms: u64,

    /// Settle delay after the last tick before the completion callback fires.
    #[serde(default = "default_completion_delay_ms")]
    pub completion_delay_ms: u64,
}

impl DemoTiming {
    /// Uniform timing, mostly useful for tests and terminal playback.
    #[must_use]
    pub const fn uniform(delay_ms: u64) -> Self {
        Self {
            initial_delay_ms: delay_ms,
            step_delay_ms: delay_ms,
            resume_delay_ms: delay_ms,
            completion_delay_ms: delay_ms,
        }
    }

    pub(crate) const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub(crate) const fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub(crate) const fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }

    pub(crate) const fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }
}

impl Default for DemoTiming {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            step_delay_ms: default_step_delay_ms(),
            resume_delay_ms: default_resume_delay_ms(),
            completion_delay_ms: default_completion_delay_ms(),
        }
    }
}

/// Sliding-window admission control for answer submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Maximum admitted submissions inside one window.
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,

    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_ms: default_window_ms(),
        }
    }
}

/// Grading tolerance and timeout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingConfig {
    /// Absolute tolerance accepted for numeric answers.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Time budget for a single grading call before the fallback applies.
    #[serde(default = "default_grading_timeout_ms")]
    pub timeout_ms: u64,
}

impl GradingConfig {
    /// The grading timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            timeout_ms: default_grading_timeout_ms(),
        }
    }
}

/// Interruption detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionConfig {
    /// Messages shorter than this (after trimming) are noise.
    #[serde(default = "default_min_message_chars")]
    pub min_message_chars: usize,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            min_message_chars: default_min_message_chars(),
        }
    }
}
