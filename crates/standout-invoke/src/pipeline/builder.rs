//! Registration of steps and handlers.
//!
//! The standard behaviors (`use_help`, `use_version`, directives, typo
//! correction, exception handling, termination handling) are added by
//! `impl PipelineBuilder` blocks in their own modules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clap::Command;
use futures::future::BoxFuture;

use super::{FnHandler, FnMiddleware, Handler, Middleware, Next, Pipeline};
use crate::context::InvocationContext;
use crate::error::InvocationError;
use crate::parse::Parser;
use crate::priority::Priority;

/// Builder for a [`Pipeline`].
///
/// ```rust
/// use clap::Command;
/// use standout_invoke::{FnHandler, Pipeline};
///
/// let pipeline = Pipeline::builder(Command::new("app").version("1.0.0"))
///     .use_defaults()
///     .command("", FnHandler::new(|_ctx| Box::pin(async { Ok(0) })))
///     .expect("unique command paths")
///     .build();
/// # let _ = pipeline;
/// ```
pub struct PipelineBuilder {
    command: Command,
    steps: Vec<(Priority, Arc<dyn Middleware>)>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    tolerant_paths: Vec<String>,
    features: HashSet<&'static str>,
    pub(crate) help_option: bool,
    pub(crate) version_option: bool,
}

impl PipelineBuilder {
    /// Starts a builder for `command`.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            steps: Vec::new(),
            handlers: HashMap::new(),
            tolerant_paths: Vec::new(),
            features: HashSet::new(),
            help_option: false,
            version_option: false,
        }
    }

    /// The command being configured.
    pub fn root_command(&self) -> &Command {
        &self.command
    }

    /// Adds a step at `priority`.
    ///
    /// Steps with equal priority run in the order they were added.
    pub fn add_middleware(mut self, priority: Priority, step: impl Middleware + 'static) -> Self {
        self.steps.push((priority, Arc::new(step)));
        self
    }

    /// Adds a closure step at `priority`.
    ///
    /// ```rust
    /// use clap::Command;
    /// use standout_invoke::{Pipeline, Priority};
    ///
    /// let builder = Pipeline::builder(Command::new("app"))
    ///     .add_fn(Priority::Default, |ctx, next| {
    ///         Box::pin(async move {
    ///             tracing::info!("before");
    ///             next.run(ctx).await
    ///         })
    ///     });
    /// # let _ = builder;
    /// ```
    pub fn add_fn<F>(self, priority: Priority, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.add_middleware(priority, FnMiddleware::new(f))
    }

    /// Registers the handler for a command path.
    ///
    /// Paths are dot-separated subcommand names (`"db.migrate"`); `""` is the
    /// root command. Fails if the path already has a handler.
    pub fn command(
        mut self,
        path: &str,
        handler: impl Handler + 'static,
    ) -> Result<Self, InvocationError> {
        if self.handlers.contains_key(path) {
            return Err(InvocationError::DuplicateRegistration(path.to_string()));
        }
        self.handlers.insert(path.to_string(), Arc::new(handler));
        Ok(self)
    }

    /// Registers a closure handler for a command path.
    pub fn command_fn<F>(self, path: &str, f: F) -> Result<Self, InvocationError>
    where
        F: for<'a> Fn(&'a mut InvocationContext) -> BoxFuture<'a, anyhow::Result<i32>>
            + Send
            + Sync
            + 'static,
    {
        self.command(path, FnHandler::new(f))
    }

    /// Lets the command at `path` accept tokens the parser did not match.
    ///
    /// Such tokens are neither parse errors nor typo-corrected; they stay
    /// available through [`ParseResult::unmatched_tokens`](crate::ParseResult::unmatched_tokens)
    /// and the handler runs.
    pub fn allow_unmatched_tokens(mut self, path: &str) -> Self {
        self.tolerant_paths.push(path.to_string());
        self
    }

    /// Records `name` as enabled. Returns false if it already was.
    pub(crate) fn enable(&mut self, name: &'static str) -> bool {
        self.features.insert(name)
    }

    /// Builds the pipeline.
    pub fn build(self) -> Pipeline {
        let mut parser = Parser::with_options(self.command, self.help_option, self.version_option);
        for path in self.tolerant_paths {
            parser = parser.allow_unmatched_tokens(path);
        }
        Pipeline::assemble(parser, self.steps, self.handlers)
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut commands: Vec<&String> = self.handlers.keys().collect();
        commands.sort();
        f.debug_struct("PipelineBuilder")
            .field("command", &self.command.get_name())
            .field("steps", &self.steps.len())
            .field("commands", &commands)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_is_idempotent() {
        let mut builder = PipelineBuilder::new(Command::new("app"));
        assert!(builder.enable("help"));
        assert!(!builder.enable("help"));
    }

    #[test]
    fn test_allow_unmatched_tokens_reaches_parser() {
        let pipeline = PipelineBuilder::new(Command::new("app").subcommand(Command::new("exec")))
            .allow_unmatched_tokens("exec")
            .build();

        let strict = pipeline.parse(["app", "stray"]);
        assert!(strict.has_errors());

        let tolerant = pipeline.parse(["app", "exec", "--extra"]);
        assert_eq!(tolerant.unmatched_tokens(), ["--extra"]);
        assert!(!tolerant.has_errors());
    }

    #[test]
    fn test_command_fn_registers_handler() {
        let builder = PipelineBuilder::new(Command::new("app"))
            .command_fn("", |_ctx| Box::pin(async { Ok(0) }))
            .unwrap();
        assert!(format!("{:?}", builder).contains("commands: [\"\"]"));
    }
}
