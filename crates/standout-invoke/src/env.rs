//! Environment abstractions for testability.
//!
//! The culture directive reads locale variables through [`EnvReader`], so
//! tests can supply values without touching the process environment.

use std::collections::HashMap;

/// Abstraction over reading environment variables.
pub trait EnvReader: Send + Sync {
    /// Get an environment variable value.
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealEnv;

impl EnvReader for RealEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Mock environment for testing.
#[derive(Debug, Clone, Default)]
pub struct MockEnv {
    vars: HashMap<String, String>,
}

impl MockEnv {
    /// Create an empty mock environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable.
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvReader for MockEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Sets a process environment variable.
///
/// Environment writes are process-wide; the pipeline only performs them while
/// the directive phase runs, before any handler code.
pub(crate) fn set_process_var(name: &str, value: &str) {
    // Steps run sequentially and handlers have not started yet.
    std::env::set_var(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_env() {
        let env = MockEnv::new().with_var("STANDOUT_CULTURE", "de-DE");
        assert_eq!(env.var("STANDOUT_CULTURE").as_deref(), Some("de-DE"));
        assert_eq!(env.var("MISSING"), None);
    }
}
