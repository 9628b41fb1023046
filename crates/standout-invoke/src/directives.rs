//! Directive steps.
//!
//! Directives are bracketed tokens at the start of the command line that
//! change how the invocation runs rather than what it does:
//!
//! | Directive | Slot | Effect |
//! |-----------|------|--------|
//! | `[env:NAME=value]` | [`Priority::EnvironmentVariableDirective`] | sets an environment variable |
//! | `[parse]` | [`Priority::ParseDirective`] | prints the parse diagram, stops |
//! | `[debug]` | [`Priority::DebugDirective`] | waits for a debugger |
//! | `[culture:…]`, `[uiculture:…]`, `[invariantculture]`, `[invariantuiculture]` | [`Priority::CultureDirective`] | configures the locale |
//! | `[suggest]`, `[suggest:N]` | [`Priority::SuggestDirective`] | prints completions, stops |
//!
//! Each directive is enabled by its `use_*` builder method. Enabling one twice
//! registers it once.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::InvocationContext;
use crate::env::{self, EnvReader, RealEnv};
use crate::locale::{self, Locale};
use crate::pipeline::{Middleware, Next, PipelineBuilder};
use crate::priority::Priority;
use crate::resources;
use crate::result::{ParseDiagramResult, SuggestResult};

// ============================================================================
// [env]
// ============================================================================

/// Applies `[env:NAME=value]` directives to the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvironmentVariables;

/// Splits an `[env]` payload into a trimmed name and value.
///
/// Returns `None` when there is no `=`, the name is empty, or either part
/// contains a NUL byte (the process environment cannot hold one).
pub fn parse_env_assignment(payload: &str) -> Option<(&str, &str)> {
    let (name, value) = payload.split_once('=')?;
    let (name, value) = (name.trim(), value.trim());
    if name.is_empty() || name.contains('\0') || value.contains('\0') {
        return None;
    }
    Some((name, value))
}

#[async_trait]
impl Middleware for EnvironmentVariables {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        for payload in ctx.parse_result().directives().values("env") {
            match parse_env_assignment(payload) {
                Some((name, value)) => {
                    tracing::debug!(name, "setting environment variable from directive");
                    env::set_process_var(name, value);
                }
                None => tracing::debug!(payload = %payload, "ignoring malformed env directive"),
            }
        }
        next.run(ctx).await
    }
}

// ============================================================================
// [parse]
// ============================================================================

/// Short-circuits with the parse diagram when `[parse]` is given.
#[derive(Debug, Clone, Copy)]
pub struct ParseDiagram {
    error_exit_code: i32,
}

impl ParseDiagram {
    /// Uses `error_exit_code` when the diagrammed parse had errors.
    pub fn new(error_exit_code: i32) -> Self {
        Self { error_exit_code }
    }
}

impl Default for ParseDiagram {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Middleware for ParseDiagram {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        if ctx.parse_result().directives().contains("parse") {
            tracing::debug!("parse directive, short-circuiting");
            ctx.set_result(ParseDiagramResult::new(self.error_exit_code))?;
            return Ok(());
        }
        next.run(ctx).await
    }
}

// ============================================================================
// [debug]
// ============================================================================

/// Reports whether a debugger is attached to this process.
pub trait DebuggerProbe: Send + Sync {
    /// Returns true if a debugger is attached.
    fn is_attached(&self) -> bool;
}

/// Reads `TracerPid` from `/proc/self/status`.
///
/// On platforms without procfs nothing is ever reported as attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcDebuggerProbe;

impl DebuggerProbe for ProcDebuggerProbe {
    fn is_attached(&self) -> bool {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| tracer_pid(&status))
            .is_some_and(|pid| pid != 0)
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Waits for a debugger when `[debug]` is given.
///
/// The wait has no timeout and does not observe cancellation.
#[derive(Clone)]
pub struct DebugAttach {
    probe: Arc<dyn DebuggerProbe>,
    poll_interval: Duration,
}

impl DebugAttach {
    /// Polling interval of the default configuration.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Uses `probe`, checking every `poll_interval`.
    pub fn new(probe: impl DebuggerProbe + 'static, poll_interval: Duration) -> Self {
        Self {
            probe: Arc::new(probe),
            poll_interval,
        }
    }
}

impl Default for DebugAttach {
    fn default() -> Self {
        Self::new(ProcDebuggerProbe, Self::DEFAULT_POLL_INTERVAL)
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

#[async_trait]
impl Middleware for DebugAttach {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        if ctx.parse_result().directives().contains("debug") {
            let pid = std::process::id();
            let message = resources::debug_attach(pid, &process_name());
            writeln!(ctx.console().out(), "{}", message)?;
            ctx.console().out().flush()?;

            tracing::debug!(pid, "waiting for debugger");
            while !self.probe.is_attached() {
                tokio::time::sleep(self.poll_interval).await;
            }
            tracing::debug!(pid, "debugger attached");
        }
        next.run(ctx).await
    }
}

// ============================================================================
// [culture]
// ============================================================================

/// Locale changes requested by environment and directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CultureRequest {
    /// New formatting locale, if any.
    pub culture: Option<Locale>,
    /// New message locale, if any.
    pub ui_culture: Option<Locale>,
}

impl CultureRequest {
    /// Resolves the request from `env` and the parsed directives.
    ///
    /// Environment variables are read first, directives override them.
    /// Invalid locale names and unparsable booleans are ignored.
    pub fn resolve(env: &dyn EnvReader, directives: &crate::parse::Directives) -> Self {
        let mut request = Self::default();

        let flag = |name: &str| env.var(name).and_then(|v| locale::parse_bool(&v)) == Some(true);
        if flag(locale::INVARIANT_CULTURE_VAR) {
            request.culture = Some(Locale::invariant());
        }
        if flag(locale::INVARIANT_UI_CULTURE_VAR) {
            request.ui_culture = Some(Locale::invariant());
        }
        if let Some(culture) = env.var(locale::CULTURE_VAR).and_then(|v| Locale::parse(&v)) {
            request.culture = Some(culture);
        }
        if let Some(culture) = env.var(locale::UI_CULTURE_VAR).and_then(|v| Locale::parse(&v)) {
            request.ui_culture = Some(culture);
        }

        if directives.contains("invariantculture") {
            request.culture = Some(Locale::invariant());
        }
        if directives.contains("invariantuiculture") {
            request.ui_culture = Some(Locale::invariant());
        }
        if let Some(culture) = last_valid(directives.values("culture")) {
            request.culture = Some(culture);
        }
        if let Some(culture) = last_valid(directives.values("uiculture")) {
            request.ui_culture = Some(culture);
        }

        request
    }

    /// Writes the requested locales into the process-wide settings.
    pub fn apply(&self) {
        if let Some(culture) = &self.culture {
            locale::set_culture(culture.clone());
        }
        if let Some(ui_culture) = &self.ui_culture {
            locale::set_ui_culture(ui_culture.clone());
        }
    }
}

fn last_valid(values: &[String]) -> Option<Locale> {
    values.iter().rev().find_map(|value| Locale::parse(value))
}

/// Configures the process locale, then captures it for deferred results.
#[derive(Clone)]
pub struct CultureDirective {
    env: Arc<dyn EnvReader>,
}

impl CultureDirective {
    /// Reads locale variables from `env`.
    pub fn with_env(env: impl EnvReader + 'static) -> Self {
        Self { env: Arc::new(env) }
    }
}

impl Default for CultureDirective {
    fn default() -> Self {
        Self::with_env(RealEnv)
    }
}

#[async_trait]
impl Middleware for CultureDirective {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        let request = CultureRequest::resolve(&*self.env, ctx.parse_result().directives());
        if request != CultureRequest::default() {
            tracing::debug!(
                culture = ?request.culture.as_ref().map(Locale::to_string),
                ui_culture = ?request.ui_culture.as_ref().map(Locale::to_string),
                "configuring locale"
            );
            request.apply();
        }
        ctx.capture_ambient();
        next.run(ctx).await
    }
}

// ============================================================================
// [suggest]
// ============================================================================

/// Short-circuits with completions when `[suggest]` is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuggestDirective;

/// The cursor position: the numeric payload, else the end of the command line.
fn suggest_position(ctx: &InvocationContext) -> Option<usize> {
    let parse = ctx.parse_result();
    let directives = parse.directives();
    if !directives.contains("suggest") {
        return None;
    }
    let position = directives
        .values("suggest")
        .last()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or_else(|| parse.command_line_text().len());
    Some(position)
}

#[async_trait]
impl Middleware for SuggestDirective {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        let Some(position) = suggest_position(ctx) else {
            return next.run(ctx).await;
        };

        tracing::debug!(position, "suggest directive, short-circuiting");
        ctx.set_result(SuggestResult::new(position))?;
        Ok(())
    }
}

// ============================================================================
// Builder methods
// ============================================================================

impl PipelineBuilder {
    /// Enables `[env:NAME=value]`.
    pub fn use_environment_variable_directive(mut self) -> Self {
        if !self.enable("env-directive") {
            return self;
        }
        self.add_middleware(Priority::EnvironmentVariableDirective, EnvironmentVariables)
    }

    /// Enables `[parse]`. `error_exit_code` is used when the parse had errors.
    pub fn use_parse_directive(mut self, error_exit_code: i32) -> Self {
        if !self.enable("parse-directive") {
            return self;
        }
        self.add_middleware(Priority::ParseDirective, ParseDiagram::new(error_exit_code))
    }

    /// Enables `[debug]` with the default probe.
    pub fn use_debug_directive(self) -> Self {
        self.use_debug_directive_with(DebugAttach::default())
    }

    /// Enables `[debug]` with a custom configuration.
    pub fn use_debug_directive_with(mut self, step: DebugAttach) -> Self {
        if !self.enable("debug-directive") {
            return self;
        }
        self.add_middleware(Priority::DebugDirective, step)
    }

    /// Enables locale configuration from environment and directives.
    pub fn use_culture_directive(self) -> Self {
        self.use_culture_directive_with(CultureDirective::default())
    }

    /// Enables locale configuration reading variables from a custom source.
    pub fn use_culture_directive_with(mut self, step: CultureDirective) -> Self {
        if !self.enable("culture-directive") {
            return self;
        }
        self.add_middleware(Priority::CultureDirective, step)
    }

    /// Enables `[suggest]` and `[suggest:N]`.
    pub fn use_suggest_directive(mut self) -> Self {
        if !self.enable("suggest-directive") {
            return self;
        }
        self.add_middleware(Priority::SuggestDirective, SuggestDirective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::env::MockEnv;
    use crate::parse::Directives;
    use crate::pipeline::Pipeline;
    use clap::{Arg, Command};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn app() -> Command {
        Command::new("app")
            .arg(Arg::new("name").long("name"))
            .subcommand(Command::new("serve"))
            .subcommand(Command::new("status"))
    }

    async fn run(builder: PipelineBuilder, args: &[&str]) -> (i32, BufferConsole) {
        let console = BufferConsole::new();
        let pipeline = builder
            .command_fn("", |ctx| {
                Box::pin(async move {
                    writeln!(ctx.console().out(), "handler")?;
                    Ok(0)
                })
            })
            .unwrap()
            .build();
        let code = pipeline
            .invoke_with(args.iter().copied(), Box::new(console.clone()))
            .await
            .unwrap();
        (code, console)
    }

    #[test]
    fn test_parse_env_assignment() {
        assert_eq!(parse_env_assignment(" NAME = value "), Some(("NAME", "value")));
        assert_eq!(parse_env_assignment("A=b=c"), Some(("A", "b=c")));
        assert_eq!(parse_env_assignment("A="), Some(("A", "")));
        assert_eq!(parse_env_assignment("novalue"), None);
        assert_eq!(parse_env_assignment(" =x"), None);
        assert_eq!(parse_env_assignment("BAD\0NAME=x"), None);
        assert_eq!(parse_env_assignment("NAME=bad\0value"), None);
    }

    #[tokio::test]
    #[serial]
    async fn test_env_directive_skips_nul_bytes() {
        std::env::remove_var("STANDOUT_INVOKE_NUL_CHECK");
        let builder = Pipeline::builder(app()).use_environment_variable_directive();
        let (code, console) = run(
            builder,
            &[
                "app",
                "[env:BAD\0NAME=x]",
                "[env:STANDOUT_INVOKE_NUL_CHECK=a\0b]",
            ],
        )
        .await;

        assert_eq!(code, 0);
        assert_eq!(console.out_text(), "handler\n");
        assert!(std::env::var_os("STANDOUT_INVOKE_NUL_CHECK").is_none());
    }

    #[test]
    fn test_tracer_pid() {
        let status = "Name:\tapp\nState:\tR\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(tracer_pid(status), Some(4242));
        assert_eq!(tracer_pid("Name:\tapp\n"), None);
    }

    #[tokio::test]
    async fn test_parse_directive_short_circuits() {
        let builder = Pipeline::builder(app()).use_parse_directive(1);
        let (code, console) = run(builder, &["app", "[parse]", "--name", "Ada"]).await;
        assert_eq!(code, 0);
        assert_eq!(console.out_text(), "[ app [ --name <Ada> ] ]\n");
    }

    #[tokio::test]
    async fn test_parse_directive_with_errors_uses_error_code() {
        let builder = Pipeline::builder(app()).use_parse_directive(4);
        let (code, console) = run(builder, &["app", "[parse]", "--bogus"]).await;
        assert_eq!(code, 4);
        assert!(console.out_text().starts_with('!'));
    }

    #[tokio::test]
    async fn test_suggest_directive_uses_text_length() {
        let builder = Pipeline::builder(app()).use_suggest_directive();
        let (code, console) = run(builder, &["app", "[suggest]", "s"]).await;
        assert_eq!(code, 0);
        assert_eq!(console.out_text(), "serve\nstatus\n");
    }

    #[tokio::test]
    async fn test_suggest_directive_with_position() {
        let builder = Pipeline::builder(app()).use_suggest_directive();
        let (_, console) = run(builder, &["app", "[suggest:2]", "--name"]).await;
        assert_eq!(console.out_text(), "--name\n");
    }

    #[tokio::test]
    async fn test_without_directive_handler_runs() {
        let builder = Pipeline::builder(app())
            .use_parse_directive(1)
            .use_suggest_directive();
        let (_, console) = run(builder, &["app"]).await;
        assert_eq!(console.out_text(), "handler\n");
    }

    struct CountingProbe {
        polls: Arc<AtomicUsize>,
        attach_after: usize,
    }

    impl DebuggerProbe for CountingProbe {
        fn is_attached(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= self.attach_after
        }
    }

    #[tokio::test]
    async fn test_debug_directive_waits_for_probe() {
        let polls = Arc::new(AtomicUsize::new(0));
        let probe = CountingProbe {
            polls: polls.clone(),
            attach_after: 3,
        };
        let builder = Pipeline::builder(app())
            .use_debug_directive_with(DebugAttach::new(probe, Duration::from_millis(1)));
        let (_, console) = run(builder, &["app", "[debug]"]).await;

        assert_eq!(polls.load(Ordering::SeqCst), 4);
        let out = console.out_text();
        assert!(out.contains(&std::process::id().to_string()));
        assert!(out.ends_with("handler\n"));
    }

    #[tokio::test]
    async fn test_debug_directive_absent_does_not_probe() {
        let polls = Arc::new(AtomicUsize::new(0));
        let probe = CountingProbe {
            polls: polls.clone(),
            attach_after: 0,
        };
        let builder = Pipeline::builder(app())
            .use_debug_directive_with(DebugAttach::new(probe, Duration::from_millis(1)));
        run(builder, &["app"]).await;
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_culture_request_directives_override_env() {
        let env = MockEnv::new()
            .with_var(locale::CULTURE_VAR, "fr-FR")
            .with_var(locale::UI_CULTURE_VAR, "fr-FR");
        let (directives, _) = Directives::extract(["[uiculture:de-DE]"]);

        let request = CultureRequest::resolve(&env, &directives);
        assert_eq!(request.culture, Locale::parse("fr-FR"));
        assert_eq!(request.ui_culture, Locale::parse("de-DE"));
    }

    #[test]
    fn test_culture_request_invariant_flags() {
        let env = MockEnv::new()
            .with_var(locale::INVARIANT_CULTURE_VAR, "1")
            .with_var(locale::INVARIANT_UI_CULTURE_VAR, "FALSE");
        let request = CultureRequest::resolve(&env, &Directives::new());
        assert_eq!(request.culture, Some(Locale::invariant()));
        assert_eq!(request.ui_culture, None);

        let (directives, _) = Directives::extract(["[invariantuiculture]"]);
        let request = CultureRequest::resolve(&MockEnv::new(), &directives);
        assert_eq!(request.ui_culture, Some(Locale::invariant()));
    }

    #[test]
    fn test_culture_request_ignores_invalid_names() {
        let env = MockEnv::new().with_var(locale::CULTURE_VAR, "not a culture");
        let (directives, _) = Directives::extract(["[culture:??]"]);
        let request = CultureRequest::resolve(&env, &directives);
        assert_eq!(request, CultureRequest::default());
    }

    #[test]
    fn test_enabling_twice_registers_once() {
        let pipeline = Pipeline::builder(app())
            .use_suggest_directive()
            .use_suggest_directive()
            .use_environment_variable_directive()
            .build();
        assert_eq!(
            pipeline.slots(),
            [Priority::EnvironmentVariableDirective, Priority::SuggestDirective]
        );
    }
}
