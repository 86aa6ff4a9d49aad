//! MathCoach Session Controller
//!
//! Runs the interactive arithmetic tools a tutor agent opens during a
//! lesson: step-by-step number line grading, automated demonstrations that
//! pause for learner questions, practice problems and a calculator.

pub mod api;
pub mod completion;
pub mod config;
pub mod demo;
pub mod driver;
pub mod error;
pub mod events;
pub mod insights;
pub mod interruption;
pub mod problem;
pub mod rate_limit;
pub mod session;
pub mod validation;

pub use api::{
    create_router, ActivateRequest, ActivateResponse, AppState, ChatBlockedRequest,
    CloseResponse, DemoControlResponse, ErrorResponse, EventResponse, HealthResponse,
    PauseRequest, TranscriptRequest, TranscriptResponse,
};
pub use completion::{CompletionMethod, ToolCompletion, COMPLETION_PREFIX};
pub use config::{Config, DemoTiming, GradingConfig, InterruptionConfig, RateLimitConfig};
pub use demo::{
    DemoEvent, DemoHandle, DemoOutcome, DemoPlayer, DemoState, DemoStatus, Narration,
    NarrationKind,
};
pub use driver::spawn_demo_driver;
pub use error::{MathCoachError, Result};
pub use events::{EventBroadcaster, SessionEvent};
pub use insights::LearningInsights;
pub use interruption::{
    ChatMessage, Classification, Interruption, InterruptionAction, InterruptionDetector,
    MessageRole,
};
pub use problem::{Operator, Problem};
pub use rate_limit::RateLimiter;
pub use session::{
    Completion, CompletionCallback, GradingTicket, NarrationCallback, SessionController,
    SessionId, SessionSnapshot, ToolEvent, ToolProps, ToolSession, ToolType,
};
pub use validation::{
    GradingRequest, GuidanceLevel, MistakeType, Outcome, ValidationEngine, ValidationResult,
};
