//! Fixed ordering of pipeline slots.
//!
//! Every middleware is registered against a [`Priority`]. The pipeline sorts
//! by priority when it is built, so the order in which behaviors are
//! registered never affects the order in which they run.
//!
//! The order encodes which behaviors must observe or modify the context before
//! others:
//!
//! ```text
//! Startup                       termination handling wraps everything
//!   → ExceptionHandler          failure boundary around every later step
//!   → ConfigureConsole          console chosen before anything writes
//!   → EnvironmentVariableDirective
//!   → ParseDirective
//!   → DebugDirective
//!   → CultureDirective          locale set before anything renders text
//!   → SuggestDirective
//!   → RegisterSuggestTool
//!   → TypoCorrection            hints printed before the parse error
//!   → ParseErrorReporting       malformed input wins over --help/--version
//!   → HelpOption
//!   → VersionOption
//!   → Default                   user middleware
//! ```

use std::fmt;

/// A named position in the pipeline.
///
/// Variants are declared in execution order; the derived `Ord` is the
/// pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Outermost slot. Termination handling lives here.
    Startup,
    /// Failure boundary around the rest of the chain.
    ExceptionHandler,
    /// Console replacement.
    ConfigureConsole,
    /// `[env:NAME=value]` injection.
    EnvironmentVariableDirective,
    /// `[parse]` diagram.
    ParseDirective,
    /// `[debug]` attach wait.
    DebugDirective,
    /// `[culture:..]` and friends.
    CultureDirective,
    /// `[suggest]` completions.
    SuggestDirective,
    /// Companion suggestion tool registration.
    RegisterSuggestTool,
    /// "Did you mean" hints for unmatched tokens.
    TypoCorrection,
    /// Parse error short-circuit.
    ParseErrorReporting,
    /// `--help` short-circuit.
    HelpOption,
    /// `--version` short-circuit.
    VersionOption,
    /// Slot for application middleware; runs inside every framework behavior.
    Default,
}

impl Priority {
    /// All slots in pipeline order.
    pub const ALL: [Priority; 14] = [
        Priority::Startup,
        Priority::ExceptionHandler,
        Priority::ConfigureConsole,
        Priority::EnvironmentVariableDirective,
        Priority::ParseDirective,
        Priority::DebugDirective,
        Priority::CultureDirective,
        Priority::SuggestDirective,
        Priority::RegisterSuggestTool,
        Priority::TypoCorrection,
        Priority::ParseErrorReporting,
        Priority::HelpOption,
        Priority::VersionOption,
        Priority::Default,
    ];

    /// Short kebab-case name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Priority::Startup => "startup",
            Priority::ExceptionHandler => "exception-handler",
            Priority::ConfigureConsole => "configure-console",
            Priority::EnvironmentVariableDirective => "env-directive",
            Priority::ParseDirective => "parse-directive",
            Priority::DebugDirective => "debug-directive",
            Priority::CultureDirective => "culture-directive",
            Priority::SuggestDirective => "suggest-directive",
            Priority::RegisterSuggestTool => "register-suggest-tool",
            Priority::TypoCorrection => "typo-correction",
            Priority::ParseErrorReporting => "parse-error-reporting",
            Priority::HelpOption => "help-option",
            Priority::VersionOption => "version-option",
            Priority::Default => "default",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_sorted() {
        let mut sorted = Priority::ALL;
        sorted.sort();
        assert_eq!(sorted, Priority::ALL);
    }

    #[test]
    fn test_policy_constraints() {
        assert!(Priority::CultureDirective < Priority::HelpOption);
        assert!(Priority::ParseErrorReporting < Priority::HelpOption);
        assert!(Priority::ParseErrorReporting < Priority::VersionOption);
        assert!(Priority::TypoCorrection < Priority::ParseErrorReporting);
        assert!(Priority::Startup < Priority::ExceptionHandler);
        assert!(Priority::ExceptionHandler < Priority::ConfigureConsole);
        assert!(Priority::ExceptionHandler < Priority::EnvironmentVariableDirective);
        assert!(Priority::ExceptionHandler < Priority::RegisterSuggestTool);
        assert!(Priority::VersionOption < Priority::Default);
    }

    #[test]
    fn test_display() {
        assert_eq!(Priority::TypoCorrection.to_string(), "typo-correction");
        assert_eq!(Priority::Startup.to_string(), "startup");
    }
}
