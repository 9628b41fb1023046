//! The middleware chain.
//!
//! A [`Pipeline`] is built once from a [`PipelineBuilder`] and then invoked
//! once per command line. Building sorts the registered steps by
//! [`Priority`](crate::Priority) (stable, so ties keep registration order) and
//! folds them right-to-left into a single chain:
//!
//! ```text
//! step₁(ctx, next₁) → step₂(ctx, next₂) → … → handler for the matched command
//! ```
//!
//! Each step decides whether to call `next`. A step that returns without
//! calling it short-circuits everything after it, usually after setting a
//! deferred result on the context.
//!
//! # Invocation lifecycle
//!
//! 1. Parse the arguments into a [`ParseResult`].
//! 2. Run the chain against a fresh [`InvocationContext`].
//! 3. Apply the deferred result, if any, exactly once.
//! 4. Release termination handling, if a step installed it.
//! 5. Return the result code.

mod builder;

pub use builder::PipelineBuilder;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::console::{Console, TermConsole};
use crate::context::InvocationContext;
use crate::parse::{path_to_string, ParseResult, Parser};
use crate::priority::Priority;
use crate::result::HelpResult;

/// One step of the chain.
///
/// Implementations may work before calling `next.run(ctx)`, after it, both,
/// or not call it at all.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Processes the invocation and optionally continues the chain.
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()>;
}

/// A command handler: the innermost link of the chain.
///
/// The returned value becomes the result code.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Runs the command.
    async fn handle(&self, ctx: &mut InvocationContext) -> anyhow::Result<i32>;
}

/// Adapts a closure returning a boxed future into a [`Middleware`].
///
/// ```rust
/// use standout_invoke::{FnMiddleware, Middleware};
///
/// let step = FnMiddleware::new(|ctx, next| {
///     Box::pin(async move {
///         ctx.set_result_code(3);
///         next.run(ctx).await
///     })
/// });
/// # fn assert_middleware<M: Middleware>(_: &M) {}
/// # assert_middleware(&step);
/// ```
pub struct FnMiddleware<F> {
    f: F,
}

impl<F> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        (self.f)(ctx, next).await
    }
}

/// Adapts a closure returning a boxed future into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, anyhow::Result<i32>> + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, anyhow::Result<i32>> + Send + Sync,
{
    async fn handle(&self, ctx: &mut InvocationContext) -> anyhow::Result<i32> {
        (self.f)(ctx).await
    }
}

#[async_trait]
trait Link: Send + Sync {
    async fn call(&self, ctx: &mut InvocationContext) -> anyhow::Result<()>;
}

/// The remainder of the chain, handed to each step.
#[derive(Clone)]
pub struct Next {
    link: Arc<dyn Link>,
}

impl Next {
    /// Runs the rest of the chain.
    pub async fn run(self, ctx: &mut InvocationContext) -> anyhow::Result<()> {
        self.link.call(ctx).await
    }
}

struct StepLink {
    priority: Priority,
    step: Arc<dyn Middleware>,
    next: Next,
}

#[async_trait]
impl Link for StepLink {
    async fn call(&self, ctx: &mut InvocationContext) -> anyhow::Result<()> {
        tracing::trace!(slot = %self.priority, "entering middleware");
        self.step.handle(ctx, self.next.clone()).await
    }
}

struct HandlerLink {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

#[async_trait]
impl Link for HandlerLink {
    async fn call(&self, ctx: &mut InvocationContext) -> anyhow::Result<()> {
        if ctx.has_result() {
            tracing::debug!("invocation result already set, handler skipped");
            return Ok(());
        }

        let path = path_to_string(ctx.parse_result().command_path());
        match self.handlers.get(&path) {
            Some(handler) => {
                tracing::debug!(command = %path, "invoking handler");
                let code = handler.handle(ctx).await?;
                ctx.set_result_code(code);
            }
            None => {
                tracing::debug!(command = %path, "no handler registered, showing help");
                ctx.set_result(HelpResult)?;
            }
        }
        Ok(())
    }
}

/// A built, reusable invocation pipeline.
pub struct Pipeline {
    parser: Parser,
    chain: Next,
    slots: Vec<Priority>,
}

impl Pipeline {
    /// Starts building a pipeline for `command`.
    pub fn builder(command: clap::Command) -> PipelineBuilder {
        PipelineBuilder::new(command)
    }

    fn assemble(
        parser: Parser,
        mut steps: Vec<(Priority, Arc<dyn Middleware>)>,
        handlers: HashMap<String, Arc<dyn Handler>>,
    ) -> Self {
        steps.sort_by_key(|(priority, _)| *priority);
        let slots: Vec<Priority> = steps.iter().map(|(priority, _)| *priority).collect();
        tracing::debug!(slots = ?slots, "pipeline built");

        let mut next = Next {
            link: Arc::new(HandlerLink { handlers }),
        };
        for (priority, step) in steps.into_iter().rev() {
            next = Next {
                link: Arc::new(StepLink {
                    priority,
                    step,
                    next,
                }),
            };
        }

        Self {
            parser,
            chain: next,
            slots,
        }
    }

    /// The parser this pipeline uses.
    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    /// The slots of the registered steps, in execution order.
    pub fn slots(&self) -> &[Priority] {
        &self.slots
    }

    /// Parses `args` (program name first) without running anything.
    pub fn parse<I, T>(&self, args: I) -> ParseResult
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.parser.parse(args)
    }

    /// Parses `args` and runs the pipeline against the process's streams.
    pub async fn invoke<I, T>(&self, args: I) -> anyhow::Result<i32>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.invoke_with(args, Box::new(TermConsole::new())).await
    }

    /// Parses `args` and runs the pipeline against `console`.
    pub async fn invoke_with<I, T>(&self, args: I, console: Box<dyn Console>) -> anyhow::Result<i32>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let parse_result = self.parser.parse(args);
        self.run(parse_result, console).await
    }

    /// Runs the pipeline on an existing parse result.
    ///
    /// Returns the result code. Failures only escape when no exception
    /// handler is registered; the deferred result is applied and termination
    /// handling released either way.
    pub async fn run(
        &self,
        parse_result: ParseResult,
        console: Box<dyn Console>,
    ) -> anyhow::Result<i32> {
        let mut ctx = InvocationContext::new(parse_result, console);
        let outcome = self.chain.clone().run(&mut ctx).await;

        if let Some(result) = ctx.take_result() {
            if let Err(err) = result.apply(&mut ctx) {
                tracing::warn!(error = %err, "failed to write invocation result");
            }
        }

        let code = ctx.result_code();
        if let Some(termination) = ctx.take_termination() {
            termination.release(code).await;
        }

        outcome.map(|()| code)
    }

    /// Runs [`invoke`](Self::invoke) on a new multi-threaded runtime.
    ///
    /// For programs whose `main` is not async.
    pub fn invoke_blocking<I, T>(&self, args: I) -> anyhow::Result<i32>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.invoke(args))
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("command", &self.parser.command().get_name())
            .field("slots", &self.slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::error::InvocationError;
    use crate::result::VersionResult;
    use clap::Command;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, label: &'static str) -> impl Middleware + 'static {
        let log = log.clone();
        FnMiddleware::new(move |ctx, next| {
            log.lock().push(label.to_string());
            Box::pin(async move { next.run(ctx).await })
        })
    }

    fn handler(log: &Log, code: i32) -> impl Handler + 'static {
        let log = log.clone();
        FnHandler::new(move |_ctx| {
            log.lock().push("handler".to_string());
            Box::pin(async move { Ok(code) })
        })
    }

    #[tokio::test]
    async fn test_steps_run_in_priority_order() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder(Command::new("app"))
            .add_middleware(Priority::Default, recorder(&log, "default"))
            .add_middleware(Priority::Startup, recorder(&log, "startup"))
            .add_middleware(Priority::HelpOption, recorder(&log, "help"))
            .command("", handler(&log, 0))
            .unwrap()
            .build();

        let code = pipeline
            .invoke_with(["app"], Box::new(BufferConsole::new()))
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(*log.lock(), ["startup", "help", "default", "handler"]);
        assert_eq!(
            pipeline.slots(),
            [Priority::Startup, Priority::HelpOption, Priority::Default]
        );
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder(Command::new("app"))
            .add_middleware(Priority::Default, recorder(&log, "first"))
            .add_middleware(Priority::Default, recorder(&log, "second"))
            .add_middleware(Priority::Startup, recorder(&log, "outer"))
            .build();

        pipeline
            .invoke_with(["app"], Box::new(BufferConsole::new()))
            .await
            .unwrap();

        assert_eq!(*log.lock(), ["outer", "first", "second"]);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_later_steps() {
        let log: Log = Arc::default();
        let console = BufferConsole::new();
        let pipeline = Pipeline::builder(Command::new("app"))
            .add_fn(Priority::VersionOption, |ctx, _next| {
                Box::pin(async move {
                    ctx.set_result(VersionResult::new("9.9.9"))?;
                    Ok(())
                })
            })
            .add_middleware(Priority::Default, recorder(&log, "late"))
            .command("", handler(&log, 5))
            .unwrap()
            .build();

        let code = pipeline
            .invoke_with(["app"], Box::new(console.clone()))
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(log.lock().is_empty());
        assert_eq!(console.out_text(), "9.9.9\n");
    }

    #[tokio::test]
    async fn test_handler_skipped_when_result_set() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder(Command::new("app"))
            .add_fn(Priority::Default, |ctx, next| {
                Box::pin(async move {
                    ctx.set_result(VersionResult::new("1.0"))?;
                    next.run(ctx).await
                })
            })
            .command("", handler(&log, 5))
            .unwrap()
            .build();

        let code = pipeline
            .invoke_with(["app"], Box::new(BufferConsole::new()))
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_code_becomes_result() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder(Command::new("app").subcommand(Command::new("run")))
            .command("run", handler(&log, 7))
            .unwrap()
            .build();

        let code = pipeline
            .invoke_with(["app", "run"], Box::new(BufferConsole::new()))
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_missing_handler_shows_help() {
        let console = BufferConsole::new();
        let pipeline = Pipeline::builder(Command::new("app").about("Group command"))
            .build();

        let code = pipeline
            .invoke_with(["app"], Box::new(console.clone()))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(console.out_text().contains("Group command"));
    }

    #[tokio::test]
    async fn test_failure_escapes_without_exception_handler() {
        let pipeline = Pipeline::builder(Command::new("app"))
            .command(
                "",
                FnHandler::new(|_ctx| Box::pin(async move { Err(anyhow::anyhow!("boom")) })),
            )
            .unwrap()
            .build();

        let err = pipeline
            .invoke_with(["app"], Box::new(BufferConsole::new()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_duplicate_command_is_rejected() {
        let log: Log = Arc::default();
        let result = Pipeline::builder(Command::new("app"))
            .command("run", handler(&log, 0))
            .unwrap()
            .command("run", handler(&log, 1));
        assert!(matches!(
            result,
            Err(InvocationError::DuplicateRegistration(_))
        ));
    }

    #[test]
    fn test_pipeline_is_reusable() {
        let log: Log = Arc::default();
        let pipeline = Pipeline::builder(Command::new("app"))
            .add_middleware(Priority::Default, recorder(&log, "step"))
            .command("", handler(&log, 0))
            .unwrap()
            .build();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        for _ in 0..2 {
            runtime
                .block_on(pipeline.invoke_with(["app"], Box::new(BufferConsole::new())))
                .unwrap();
        }
        assert_eq!(*log.lock(), ["step", "handler", "step", "handler"]);
    }
}
