//! MathCoach CLI
//!
//! Runs the session server for tutor agents and tool renderers, and offers
//! terminal versions of the demonstration, the practice grader and the
//! completion line parser.

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use mathcoach_session::{
    create_router, spawn_demo_driver, AppState, CompletionMethod, Config, DemoEvent, DemoPlayer,
    DemoTiming, GradingRequest, Problem, ToolCompletion, ValidationEngine, ValidationResult,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::time::sleep_until;
use tracing_subscriber::EnvFilter;

/// Default port for the HTTP API server.
const DEFAULT_PORT: u16 = 3000;

/// MathCoach - Interactive arithmetic tools for a tutoring agent
///
/// Serves the tool session API, or plays and grades problems in the terminal.
#[derive(Parser, Debug)]
#[command(name = "mathcoach")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: mathcoach.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Port for the HTTP API server
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Play a number line demonstration in the terminal
    Demo {
        /// Problem to demonstrate, e.g. "4 + 2"
        #[arg(value_name = "PROBLEM")]
        problem: String,

        /// Use the same delay for every step instead of the configured pacing
        #[arg(long, value_name = "MS")]
        delay_ms: Option<u64>,
    },
    /// Grade an answer to a practice problem
    Grade {
        /// Problem text, e.g. "12 / 4"
        #[arg(value_name = "PROBLEM")]
        problem: String,

        /// The learner's answer
        #[arg(value_name = "ANSWER")]
        answer: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse a TOOL_COMPLETION line and print its fields
    Check {
        /// The completion line, e.g. "TOOL_COMPLETION: [METHOD: practice] [ANSWER: 3] [PROBLEM: 12 / 4]"
        #[arg(value_name = "COMPLETION")]
        completion: String,

        /// Print the fields as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(config = ?args.config, "Config file");

    let result = match load_config(args.config.as_deref()) {
        Ok(config) => match args.command {
            Command::Serve { port } => serve(config, port).await,
            Command::Demo { problem, delay_ms } => demo(&config, &problem, delay_ms).await,
            Command::Grade {
                problem,
                answer,
                json,
            } => grade(&config, problem, answer, json),
            Command::Check { completion, json } => check(&completion, json),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Runs the session server until Ctrl+C.
async fn serve(config: Config, port: u16) -> anyhow::Result<()> {
    print_config(&config);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    println!();
    println!("Starting HTTP API server on {addr}...");

    let state = AppState::new(config);
    let driver = spawn_demo_driver(state.controller.clone(), state.wake.clone());
    let router = create_router(state);

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!("HTTP API server running on http://{addr}");
    println!("Event stream on ws://{addr}/ws");
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {e}"))?;

    driver.abort();
    Ok(())
}

/// Plays a demonstration, printing each narration as it happens.
async fn demo(config: &Config, problem: &str, delay_ms: Option<u64>) -> anyhow::Result<()> {
    let timing = delay_ms.map_or(config.demo, DemoTiming::uniform);
    let mut player = DemoPlayer::new(timing);
    player
        .start(problem, Instant::now())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    while let Some(deadline) = player.next_deadline() {
        sleep_until(tokio::time::Instant::from_std(deadline)).await;
        for event in player.poll(Instant::now()) {
            match event {
                DemoEvent::Narrated(narration) => println!("{}", narration.text),
                DemoEvent::Finished(outcome) => {
                    #[allow(clippy::cast_precision_loss)]
                    let answer = outcome.answer as f64;
                    println!();
                    println!(
                        "{}",
                        ToolCompletion::new(
                            CompletionMethod::NumberLine,
                            answer,
                            outcome.problem.to_string()
                        )
                    );
                }
            }
        }
    }
    Ok(())
}

/// JSON shape printed by `grade --json`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GradeReport<'a> {
    problem: &'a str,
    answer: &'a str,
    result: &'a ValidationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    completion: Option<String>,
}

/// Grades one practice answer.
fn grade(config: &Config, problem: String, answer: String, json: bool) -> anyhow::Result<()> {
    let engine = ValidationEngine::new(config.grading.tolerance);
    let request = GradingRequest::PracticeProblem {
        problem: problem.clone(),
        user_input: answer.clone(),
        attempt: 1,
    };
    let result = engine.grade(&request).map_err(|e| anyhow::anyhow!("{e}"))?;

    let solved = Problem::parse(&problem).map_or_else(|_| problem.clone(), |p| p.to_string());
    let completion = result
        .correct_answer
        .filter(|_| result.is_correct)
        .map(|value| ToolCompletion::new(CompletionMethod::Practice, value, solved).to_string());

    if json {
        let report = GradeReport {
            problem: &problem,
            answer: &answer,
            result: &result,
            completion,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", result.feedback);
    if let Some(hint) = &result.hint {
        println!("Hint: {hint}");
    }
    if let Some(completion) = completion {
        println!();
        println!("{completion}");
    }
    Ok(())
}

/// Parses a completion line the way the tutor agent reads it.
fn check(completion: &str, json: bool) -> anyhow::Result<()> {
    let parsed = ToolCompletion::parse(completion).map_err(|e| anyhow::anyhow!("{e}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&parsed)?);
        return Ok(());
    }
    println!("Method:  {}", parsed.method.as_str());
    println!("Answer:  {}", parsed.answer);
    println!("Problem: {}", parsed.problem);
    Ok(())
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Config::load_from_file(path).map_err(|e| anyhow::anyhow!("{e}"))
        }
        None => Config::load().map_err(|e| anyhow::anyhow!("{e}")),
    }
}

/// Prints the loaded configuration.
fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!(
        "  Demo pacing: start {}ms, step {}ms, resume {}ms, finish {}ms",
        config.demo.initial_delay_ms,
        config.demo.step_delay_ms,
        config.demo.resume_delay_ms,
        config.demo.completion_delay_ms
    );
    println!(
        "  Rate limit: {} answers per {}ms",
        config.rate_limit.max_calls, config.rate_limit.window_ms
    );
    println!(
        "  Grading: tolerance {}, timeout {}ms",
        config.grading.tolerance, config.grading.timeout_ms
    );
    println!("  Event buffer: {}", config.event_buffer);
}
