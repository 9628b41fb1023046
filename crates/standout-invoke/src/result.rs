//! Deferred results.
//!
//! A step that decides the final output of an invocation does not write it
//! immediately. It sets an [`InvocationResult`] on the context and stops the
//! chain; the pipeline applies that result exactly once, after the chain has
//! fully unwound.
//!
//! Built-in results:
//!
//! | Result | Set by | Output | Result code |
//! |--------|--------|--------|-------------|
//! | [`HelpResult`] | `--help`, handler-less commands | help of the matched command | unchanged |
//! | [`VersionResult`] | `--version` | the version string | unchanged |
//! | [`ParseErrorResult`] | parse-error reporting | errors (red, stderr) + help | configured (1) |
//! | [`ParseDiagramResult`] | `[parse]` | the parse diagram | 0, or configured on errors |
//! | [`SuggestResult`] | `[suggest]` | completions, one per line | unchanged |

use std::io::{self, Write};

use crate::console::write_error_line;
use crate::context::InvocationContext;

/// Output decided by a step, applied once at the end of the invocation.
pub trait InvocationResult: Send {
    /// Writes the output and/or sets the result code.
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()>;
}

/// Prints the help of the matched command.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelpResult;

impl InvocationResult for HelpResult {
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
        let help = ctx.parse_result().render_help();
        write!(ctx.console().out(), "{}", help)
    }
}

/// Prints a version string.
#[derive(Debug, Clone)]
pub struct VersionResult {
    version: String,
}

impl VersionResult {
    /// A result printing `version`.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl InvocationResult for VersionResult {
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
        writeln!(ctx.console().out(), "{}", self.version)
    }
}

/// Reports parse errors, followed by the help of the matched command.
#[derive(Debug, Clone, Copy)]
pub struct ParseErrorResult {
    exit_code: i32,
}

impl ParseErrorResult {
    /// A result that sets `exit_code`.
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

impl Default for ParseErrorResult {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InvocationResult for ParseErrorResult {
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
        ctx.set_result_code(self.exit_code);

        let messages: Vec<String> = ctx
            .parse_result()
            .errors()
            .iter()
            .map(|error| error.message())
            .collect();
        for message in &messages {
            write_error_line(ctx.console(), message)?;
        }

        let help = ctx.parse_result().render_help();
        let out = ctx.console().out();
        writeln!(out)?;
        write!(out, "{}", help)
    }
}

/// Prints the parse diagram requested with `[parse]`.
#[derive(Debug, Clone, Copy)]
pub struct ParseDiagramResult {
    error_exit_code: i32,
}

impl ParseDiagramResult {
    /// A result that sets `error_exit_code` when the parse had errors.
    pub fn new(error_exit_code: i32) -> Self {
        Self { error_exit_code }
    }
}

impl Default for ParseDiagramResult {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InvocationResult for ParseDiagramResult {
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
        let code = if ctx.parse_result().has_errors() {
            self.error_exit_code
        } else {
            0
        };
        ctx.set_result_code(code);

        let diagram = ctx.parse_result().diagram();
        writeln!(ctx.console().out(), "{}", diagram)
    }
}

/// Prints completions for the word at a cursor position.
#[derive(Debug, Clone, Copy)]
pub struct SuggestResult {
    position: usize,
}

impl SuggestResult {
    /// A result completing the word that ends at `position`.
    pub fn new(position: usize) -> Self {
        Self { position }
    }

    /// The cursor position.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl InvocationResult for SuggestResult {
    fn apply(&self, ctx: &mut InvocationContext) -> io::Result<()> {
        let completions = ctx.parse_result().completions(self.position);
        let out = ctx.console().out();
        for completion in completions {
            writeln!(out, "{}", completion)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::parse::Parser;
    use clap::{Arg, Command};

    fn context_for(args: &[&str]) -> (InvocationContext, BufferConsole) {
        let command = Command::new("app")
            .about("Sample app")
            .arg(Arg::new("name").long("name"))
            .subcommand(Command::new("serve"));
        let parse_result = Parser::with_options(command, true, true).parse(args.iter().copied());
        let console = BufferConsole::new();
        (
            InvocationContext::new(parse_result, Box::new(console.clone())),
            console,
        )
    }

    #[test]
    fn test_version_result() {
        let (mut ctx, console) = context_for(&["app", "--version"]);
        VersionResult::new("2.3.1").apply(&mut ctx).unwrap();
        assert_eq!(console.out_text(), "2.3.1\n");
        assert_eq!(ctx.result_code(), 0);
    }

    #[test]
    fn test_help_result_renders_clap_help() {
        let (mut ctx, console) = context_for(&["app", "--help"]);
        HelpResult.apply(&mut ctx).unwrap();
        let out = console.out_text();
        assert!(out.contains("Sample app"));
        assert!(out.contains("--name"));
        assert!(console.err_text().is_empty());
    }

    #[test]
    fn test_parse_error_result() {
        let (mut ctx, console) = context_for(&["app", "--name"]);
        ParseErrorResult::new(2).apply(&mut ctx).unwrap();
        assert_eq!(ctx.result_code(), 2);
        assert!(console.err_text().contains("--name"));
        assert!(console.out_text().contains("Usage"));
    }

    #[test]
    fn test_parse_diagram_result_codes() {
        let (mut ctx, console) = context_for(&["app", "--name", "Ada"]);
        ParseDiagramResult::default().apply(&mut ctx).unwrap();
        assert_eq!(ctx.result_code(), 0);
        assert_eq!(console.out_text(), "[ app [ --name <Ada> ] ]\n");

        let (mut ctx, _) = context_for(&["app", "--name"]);
        ParseDiagramResult::new(3).apply(&mut ctx).unwrap();
        assert_eq!(ctx.result_code(), 3);
    }

    #[test]
    fn test_suggest_result() {
        let (mut ctx, console) = context_for(&["app", "se"]);
        SuggestResult::new(2).apply(&mut ctx).unwrap();
        assert_eq!(console.out_text(), "serve\n");
    }
}
