//! Ordered invocation pipeline for clap-based CLIs.
//!
//! `standout-invoke` runs everything that happens between "the command line
//! was parsed" and "the process exits": help and version short-circuits,
//! directives, locale configuration, typo suggestions, failure containment
//! and graceful cancellation on Ctrl+C or SIGTERM. The matched command's
//! handler runs last, and only if nothing before it decided the output.
//!
//! # Features
//!
//! - **Deterministic ordering**: steps run by [`Priority`] slot, independent of
//!   the order they were registered in
//! - **Middleware chain**: async steps that may run before, after or instead of
//!   the rest of the chain
//! - **Deferred results**: the step that decides the output sets an
//!   [`InvocationResult`]; it is applied once, after the chain unwound
//! - **Directives**: `[parse]`, `[suggest]`, `[debug]`, `[env:…]` and the
//!   culture directives, as leading command-line tokens
//! - **Termination handling**: OS signals become cancellation of a
//!   [`CancellationToken`](tokio_util::sync::CancellationToken), without
//!   losing the final exit code
//!
//! # Usage
//!
//! ```rust,no_run
//! use clap::Command;
//! use standout_invoke::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::builder(Command::new("app").version("1.0.0"))
//!         .use_defaults()
//!         .command_fn("", |ctx| {
//!             Box::pin(async move {
//!                 let token = ctx.cancellation_token();
//!                 tokio::select! {
//!                     _ = token.cancelled() => Ok(130),
//!                     _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => Ok(0),
//!                 }
//!             })
//!         })?
//!         .build();
//!
//!     let code = pipeline.invoke(std::env::args()).await?;
//!     std::process::exit(code);
//! }
//! ```
//!
//! # Execution order
//!
//! ```text
//! Startup → exception handler → ConfigureConsole → [env] → [parse] → [debug]
//!   → culture → [suggest] → suggest-tool registration → typo corrections
//!   → parse errors → --help → --version → user middleware → handler
//! ```

// Core modules
mod ambient;
mod builtins;
mod console;
mod context;
mod directives;
mod env;
mod error;
mod parse;
mod pipeline;
mod priority;
mod process;
mod registration;
mod resources;
mod result;
mod termination;
mod typo;

pub mod locale;

// Re-export core types
pub use ambient::{AmbientGuard, AmbientSnapshot, RestoringResult};

pub use builtins::{
    ConfigureConsole, ConsoleFactory, ExceptionCallback, ExceptionHandler, ExceptionOptions,
    HelpOption, ParseErrorReporting, VersionOption,
};

pub use console::{write_error_line, BufferConsole, Console, SharedBuffer, TermConsole};

pub use context::{Extensions, InvocationContext};

pub use directives::{
    parse_env_assignment, CultureDirective, CultureRequest, DebugAttach, DebuggerProbe,
    EnvironmentVariables, ParseDiagram, ProcDebuggerProbe, SuggestDirective,
};

pub use env::{EnvReader, MockEnv, RealEnv};

pub use error::InvocationError;

pub use parse::{
    extract_command_path, get_deepest_matches, path_to_string, Directives, ParseError,
    ParseResult, Parser, HELP_ID, VERSION_ID,
};

pub use pipeline::{FnHandler, FnMiddleware, Handler, Middleware, Next, Pipeline, PipelineBuilder};

pub use priority::Priority;

pub use process::{run_captured, CapturedOutput, ShellError};

pub use registration::{
    describe_outcome, FeatureRegistration, ProcessRunner, RegisterSuggestTool, RegistrationError,
    RegistrationOptions, RegistrationOutcome, ToolRunner, SUGGEST_TOOL,
};

pub use result::{
    HelpResult, InvocationResult, ParseDiagramResult, ParseErrorResult, SuggestResult,
    VersionResult,
};

pub use termination::{
    CancelOnTermination, DefaultDisposition, ExitFn, ManualSignals, OsSignals, SignalSource,
    TerminationCoordinator, TerminationOptions, INTERRUPT_EXIT_CODE, TERMINATE_EXIT_CODE,
};

pub use typo::{suggest, DistanceScorer, Levenshtein, TypoCorrection, TypoOptions};
