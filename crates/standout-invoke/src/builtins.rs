//! Standard options and failure handling.
//!
//! | Step | Slot | Behavior |
//! |------|------|----------|
//! | [`ConfigureConsole`] | [`Priority::ConfigureConsole`] | swaps the console before anything writes |
//! | [`ParseErrorReporting`] | [`Priority::ParseErrorReporting`] | parse errors short-circuit with [`ParseErrorResult`] |
//! | [`HelpOption`] | [`Priority::HelpOption`] | `-h/--help` short-circuits with [`HelpResult`] |
//! | [`VersionOption`] | [`Priority::VersionOption`] | `--version` short-circuits with [`VersionResult`] |
//! | [`ExceptionHandler`] | [`Priority::ExceptionHandler`] | contains failures and panics of everything inside it |
//!
//! [`PipelineBuilder::use_defaults`] enables the standard set in one call.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use once_cell::sync::OnceCell;

use crate::console::{write_error_line, Console};
use crate::context::InvocationContext;
use crate::error::InvocationError;
use crate::pipeline::{Middleware, Next, PipelineBuilder};
use crate::priority::Priority;
use crate::resources;
use crate::result::{HelpResult, ParseErrorResult, VersionResult};

// ============================================================================
// Console
// ============================================================================

/// Builds the console an invocation writes to.
pub type ConsoleFactory = Arc<dyn Fn(&InvocationContext) -> Box<dyn Console> + Send + Sync>;

/// Replaces the invocation's console.
#[derive(Clone)]
pub struct ConfigureConsole {
    factory: ConsoleFactory,
}

impl ConfigureConsole {
    /// Uses `factory` for every invocation.
    pub fn new(
        factory: impl Fn(&InvocationContext) -> Box<dyn Console> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

#[async_trait]
impl Middleware for ConfigureConsole {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        let console = (self.factory)(ctx);
        ctx.replace_console(console);
        next.run(ctx).await
    }
}

// ============================================================================
// Parse errors
// ============================================================================

/// Stops with a [`ParseErrorResult`] when the parse has errors.
#[derive(Debug, Clone, Copy)]
pub struct ParseErrorReporting {
    exit_code: i32,
}

impl ParseErrorReporting {
    /// Reports with `exit_code`.
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

impl Default for ParseErrorReporting {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Middleware for ParseErrorReporting {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        if ctx.parse_result().has_errors() {
            tracing::debug!(
                errors = ctx.parse_result().errors().len(),
                "parse errors, short-circuiting"
            );
            ctx.set_result(ParseErrorResult::new(self.exit_code))?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

// ============================================================================
// Help and version
// ============================================================================

/// Stops with a [`HelpResult`] when `-h/--help` was given.
#[derive(Debug, Default, Clone, Copy)]
pub struct HelpOption;

#[async_trait]
impl Middleware for HelpOption {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        if ctx.parse_result().help_requested() {
            tracing::debug!("help requested, short-circuiting");
            ctx.set_result(HelpResult)?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

/// Stops with a [`VersionResult`] when `--version` was given.
///
/// The version is resolved on first use and then reused: the informational
/// version passed to the builder if any, otherwise the clap command's version.
#[derive(Debug, Default)]
pub struct VersionOption {
    informational: Option<String>,
    resolved: OnceCell<String>,
}

impl VersionOption {
    /// Reports the clap command's version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `version` instead of the clap command's version.
    pub fn informational(version: impl Into<String>) -> Self {
        Self {
            informational: Some(version.into()),
            resolved: OnceCell::new(),
        }
    }

    fn version(&self, ctx: &InvocationContext) -> &str {
        self.resolved.get_or_init(|| {
            self.informational
                .clone()
                .or_else(|| {
                    let root = ctx.parse_result().root_command();
                    root.get_version()
                        .or_else(|| root.get_long_version())
                        .map(str::to_string)
                })
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl Middleware for VersionOption {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        if ctx.parse_result().version_requested() {
            tracing::debug!("version requested, short-circuiting");
            let version = self.version(ctx).to_string();
            ctx.set_result(VersionResult::new(version))?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Called with every failure the exception handler contains.
pub type ExceptionCallback = Arc<dyn Fn(&anyhow::Error, &mut InvocationContext) + Send + Sync>;

/// Configuration for [`ExceptionHandler`].
#[derive(Clone)]
pub struct ExceptionOptions {
    /// Result code after a contained failure.
    pub exit_code: i32,
    /// Replaces the default report.
    pub callback: Option<ExceptionCallback>,
}

impl ExceptionOptions {
    /// Uses `callback` instead of the default report.
    pub fn with_callback(
        mut self,
        callback: impl Fn(&anyhow::Error, &mut InvocationContext) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Sets the result code after a contained failure.
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }
}

impl Default for ExceptionOptions {
    fn default() -> Self {
        Self {
            exit_code: 1,
            callback: None,
        }
    }
}

impl fmt::Debug for ExceptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionOptions")
            .field("exit_code", &self.exit_code)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Contains failures and panics from the rest of the chain.
///
/// A cancellation failure while cancellation was requested is expected and
/// only sets the result code.
#[derive(Debug, Clone, Default)]
pub struct ExceptionHandler {
    options: ExceptionOptions,
}

impl ExceptionHandler {
    /// Uses `options`.
    pub fn new(options: ExceptionOptions) -> Self {
        Self { options }
    }

    fn report(&self, err: &anyhow::Error, ctx: &mut InvocationContext) {
        if let Some(callback) = &self.options.callback {
            callback(err, ctx);
            return;
        }
        let message = format!("{}{:#}", resources::exception_header(), err);
        if let Err(write_err) = write_error_line(ctx.console(), &message) {
            tracing::warn!(error = %write_err, "failed to report unhandled failure");
        }
        ctx.set_result_code(self.options.exit_code);
    }
}

#[async_trait]
impl Middleware for ExceptionHandler {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        let outcome = AssertUnwindSafe(next.run(ctx)).catch_unwind().await;
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err,
            Err(payload) => InvocationError::Panic(panic_message(payload)).into(),
        };

        if InvocationError::is_cancellation(&err) && ctx.is_cancellation_requested() {
            tracing::debug!("invocation cancelled");
            ctx.set_result_code(self.options.exit_code);
            return Ok(());
        }

        tracing::debug!(error = %err, "containing unhandled failure");
        self.report(&err, ctx);
        Ok(())
    }
}

// ============================================================================
// Builder methods
// ============================================================================

impl PipelineBuilder {
    /// Replaces the console of every invocation.
    pub fn configure_console(
        mut self,
        factory: impl Fn(&InvocationContext) -> Box<dyn Console> + Send + Sync + 'static,
    ) -> Self {
        if !self.enable("configure-console") {
            return self;
        }
        self.add_middleware(Priority::ConfigureConsole, ConfigureConsole::new(factory))
    }

    /// Reports parse errors with result code 1.
    pub fn use_parse_error_reporting(self) -> Self {
        self.use_parse_error_reporting_with(1)
    }

    /// Reports parse errors with `exit_code`.
    pub fn use_parse_error_reporting_with(mut self, exit_code: i32) -> Self {
        if !self.enable("parse-error-reporting") {
            return self;
        }
        self.add_middleware(Priority::ParseErrorReporting, ParseErrorReporting::new(exit_code))
    }

    /// Adds `-h/--help` to every command. Registered at most once.
    pub fn use_help(mut self) -> Self {
        if !self.enable("help") {
            return self;
        }
        self.help_option = true;
        self.add_middleware(Priority::HelpOption, HelpOption)
    }

    /// Adds `--version` to the root command, reporting the command's version.
    pub fn use_version(self) -> Self {
        self.use_version_step(VersionOption::new())
    }

    /// Adds `--version`, reporting `version`.
    pub fn use_informational_version(self, version: impl Into<String>) -> Self {
        self.use_version_step(VersionOption::informational(version))
    }

    fn use_version_step(mut self, step: VersionOption) -> Self {
        if !self.enable("version") {
            return self;
        }
        self.version_option = true;
        self.add_middleware(Priority::VersionOption, step)
    }

    /// Contains failures with the default report and result code 1.
    pub fn use_exception_handler(self) -> Self {
        self.use_exception_handler_with(ExceptionOptions::default())
    }

    /// Contains failures with custom options.
    pub fn use_exception_handler_with(mut self, options: ExceptionOptions) -> Self {
        if !self.enable("exception-handler") {
            return self;
        }
        self.add_middleware(Priority::ExceptionHandler, ExceptionHandler::new(options))
    }

    /// Enables the standard set: help, version, every directive, suggestion
    /// tool registration, typo corrections, parse-error reporting, exception
    /// handling and termination handling.
    pub fn use_defaults(self) -> Self {
        self.use_help()
            .use_version()
            .use_environment_variable_directive()
            .use_parse_directive(1)
            .use_debug_directive()
            .use_culture_directive()
            .use_suggest_directive()
            .register_with_suggest_tool()
            .use_typo_corrections()
            .use_parse_error_reporting()
            .use_exception_handler()
            .cancel_on_termination()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::locale;
    use crate::pipeline::Pipeline;
    use clap::{Arg, Command};
    use serial_test::serial;
    use std::io::Write;

    fn explode() -> anyhow::Result<i32> {
        panic!("bad state")
    }

    fn app() -> Command {
        Command::new("app")
            .version("2.3.1")
            .about("Sample app")
            .arg(Arg::new("name").long("name"))
    }

    async fn invoke(
        builder: PipelineBuilder,
        args: &[&str],
    ) -> (anyhow::Result<i32>, BufferConsole) {
        let console = BufferConsole::new();
        let pipeline = builder.build();
        let code = pipeline
            .invoke_with(args.iter().copied(), Box::new(console.clone()))
            .await;
        (code, console)
    }

    fn with_handler(builder: PipelineBuilder) -> PipelineBuilder {
        builder
            .command_fn("", |ctx| {
                Box::pin(async move {
                    writeln!(ctx.console().out(), "handled")?;
                    Ok(0)
                })
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_version_option() {
        let builder = with_handler(Pipeline::builder(app()).use_version());
        let (code, console) = invoke(builder, &["app", "--version"]).await;
        assert_eq!(code.unwrap(), 0);
        assert_eq!(console.out_text(), "2.3.1\n");
    }

    #[tokio::test]
    async fn test_informational_version_wins() {
        let builder =
            with_handler(Pipeline::builder(app()).use_informational_version("2.3.1+abc123"));
        let (_, console) = invoke(builder, &["app", "--version"]).await;
        assert_eq!(console.out_text(), "2.3.1+abc123\n");
    }

    #[test]
    fn test_version_is_cached() {
        let step = VersionOption::new();
        let first = InvocationContext::new(
            Pipeline::builder(app()).use_version().build().parse(["app"]),
            Box::new(BufferConsole::new()),
        );
        assert_eq!(step.version(&first), "2.3.1");

        let second = InvocationContext::new(
            Pipeline::builder(Command::new("other").version("9.0"))
                .build()
                .parse(["other"]),
            Box::new(BufferConsole::new()),
        );
        assert_eq!(step.version(&second), "2.3.1");
    }

    #[tokio::test]
    #[serial]
    async fn test_version_combined_is_parse_error() {
        locale::use_invariant_for_tests();
        let builder = with_handler(
            Pipeline::builder(app())
                .use_version()
                .use_parse_error_reporting(),
        );
        let (code, console) = invoke(builder, &["app", "--version", "--name", "x"]).await;
        assert_eq!(code.unwrap(), 1);
        assert!(console
            .err_text()
            .contains("--version option cannot be combined with other arguments."));
        assert!(!console.out_text().contains("handled"));
    }

    #[tokio::test]
    async fn test_help_option() {
        let builder = with_handler(Pipeline::builder(app()).use_help().use_help());
        let (code, console) = invoke(builder, &["app", "--help"]).await;
        assert_eq!(code.unwrap(), 0);
        assert!(console.out_text().contains("Sample app"));
        assert!(!console.out_text().contains("handled"));
    }

    #[tokio::test]
    #[serial]
    async fn test_parse_error_reporting() {
        locale::use_invariant_for_tests();
        let builder = with_handler(Pipeline::builder(app()).use_parse_error_reporting_with(2));
        let (code, console) = invoke(builder, &["app", "--bogus"]).await;
        assert_eq!(code.unwrap(), 2);
        assert!(console
            .err_text()
            .contains("Unrecognized command or argument '--bogus'."));
        assert!(console.out_text().starts_with('\n'));
    }

    #[tokio::test]
    #[serial]
    async fn test_exception_handler_contains_error() {
        locale::use_invariant_for_tests();
        let builder = Pipeline::builder(app())
            .use_exception_handler()
            .command_fn("", |_ctx| {
                Box::pin(async { Err(anyhow::anyhow!("disk full")) })
            })
            .unwrap();
        let (code, console) = invoke(builder, &["app"]).await;
        assert_eq!(code.unwrap(), 1);
        assert_eq!(console.err_text(), "Unhandled exception: disk full\n");
    }

    #[tokio::test]
    #[serial]
    async fn test_exception_handler_contains_panic() {
        locale::use_invariant_for_tests();
        let builder = Pipeline::builder(app())
            .use_exception_handler_with(ExceptionOptions::default().with_exit_code(70))
            .command_fn("", |_ctx| Box::pin(async { explode() }))
            .unwrap();
        let (code, console) = invoke(builder, &["app"]).await;
        assert_eq!(code.unwrap(), 70);
        assert_eq!(console.err_text(), "Unhandled exception: panic: bad state\n");
    }

    #[tokio::test]
    async fn test_exception_handler_silent_on_cancellation() {
        let builder = Pipeline::builder(app())
            .use_exception_handler()
            .command_fn("", |ctx| {
                Box::pin(async move {
                    ctx.cancellation_token().cancel();
                    Err(InvocationError::Cancelled.into())
                })
            })
            .unwrap();
        let (code, console) = invoke(builder, &["app"]).await;
        assert_eq!(code.unwrap(), 1);
        assert!(console.err_text().is_empty());
    }

    #[tokio::test]
    async fn test_exception_handler_custom_callback() {
        let options = ExceptionOptions::default().with_callback(|err, ctx| {
            let _ = writeln!(ctx.console().out(), "custom: {}", err);
            ctx.set_result_code(9);
        });
        let builder = Pipeline::builder(app())
            .use_exception_handler_with(options)
            .command_fn("", |_ctx| Box::pin(async { Err(anyhow::anyhow!("oops")) }))
            .unwrap();
        let (code, console) = invoke(builder, &["app"]).await;
        assert_eq!(code.unwrap(), 9);
        assert_eq!(console.out_text(), "custom: oops\n");
        assert!(console.err_text().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_exception_handler_contains_console_factory_panic() {
        locale::use_invariant_for_tests();
        let builder = with_handler(
            Pipeline::builder(app())
                .use_defaults()
                .configure_console(|_ctx| panic!("no terminal")),
        );
        let (code, console) = invoke(builder, &["app"]).await;
        assert_eq!(code.unwrap(), 1);
        assert_eq!(console.err_text(), "Unhandled exception: panic: no terminal\n");
        assert!(!console.out_text().contains("handled"));
    }

    #[tokio::test]
    #[serial]
    async fn test_exception_handler_contains_directive_slot_failure() {
        locale::use_invariant_for_tests();
        let builder = with_handler(Pipeline::builder(app()).use_defaults().add_fn(
            Priority::CultureDirective,
            |_ctx, _next| Box::pin(async { Err(anyhow::anyhow!("bad locale table")) }),
        ));
        let (code, console) = invoke(builder, &["app"]).await;
        assert_eq!(code.unwrap(), 1);
        assert_eq!(console.err_text(), "Unhandled exception: bad locale table\n");
    }

    #[tokio::test]
    async fn test_configure_console() {
        let replacement = BufferConsole::new();
        let captured = replacement.clone();
        let builder = with_handler(
            Pipeline::builder(app())
                .configure_console(move |_ctx| Box::new(replacement.clone())),
        );
        let (_, original) = invoke(builder, &["app"]).await;
        assert!(original.out_text().is_empty());
        assert_eq!(captured.out_text(), "handled\n");
    }

    #[test]
    fn test_defaults_fill_every_framework_slot() {
        let pipeline = Pipeline::builder(app()).use_defaults().use_defaults().build();
        let expected: Vec<Priority> = Priority::ALL
            .iter()
            .copied()
            .filter(|p| !matches!(p, Priority::ConfigureConsole | Priority::Default))
            .collect();
        assert_eq!(pipeline.slots(), expected.as_slice());
    }
}
