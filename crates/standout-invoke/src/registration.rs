//! One-time registration with the external suggestion tool.
//!
//! Shells complete arguments by asking a separate tool, which has to know
//! about this program first. The [`RegisterSuggestTool`] step registers the
//! running executable once per process (and, with a sentinel directory, once
//! per machine), then continues. Registration problems never fail the
//! invocation; they only end up in the recorded outcome.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::context::InvocationContext;
use crate::pipeline::{Middleware, Next, PipelineBuilder};
use crate::priority::Priority;
use crate::process::{self, CapturedOutput, ShellError};

/// Name of the suggestion tool executable.
pub const SUGGEST_TOOL: &str = "standout-suggest";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid sentinel record: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("Registration task failed: {0}")]
    Join(String),
}

static FEATURES: Lazy<Mutex<HashMap<String, Arc<OnceCell<String>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Serialize, Deserialize)]
struct SentinelRecord {
    feature: String,
    outcome: String,
    recorded_at: u64,
}

/// A one-time initialization, keyed by feature name.
///
/// Within a process, every caller for the same feature shares one
/// initialization: concurrent callers wait for the one in flight, later
/// callers get its outcome. With a sentinel directory the outcome is also
/// written to disk, and later processes reuse it without initializing.
#[derive(Debug, Clone)]
pub struct FeatureRegistration {
    feature: String,
    sentinel_dir: Option<PathBuf>,
}

impl FeatureRegistration {
    /// A registration remembered for the lifetime of the process.
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            sentinel_dir: None,
        }
    }

    /// Also remembers the outcome in `dir`.
    pub fn with_sentinel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sentinel_dir = Some(dir.into());
        self
    }

    /// The feature name.
    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// The sentinel file for this feature, if a directory is configured.
    pub fn sentinel_path(&self) -> Option<PathBuf> {
        let file: String = self
            .feature
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.sentinel_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", file)))
    }

    /// Runs `init` unless this feature was already registered, and returns
    /// the recorded outcome.
    pub async fn ensure_registered<F, Fut>(&self, init: F) -> String
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = String>,
    {
        let cell = {
            let mut features = FEATURES.lock();
            Arc::clone(features.entry(self.feature.clone()).or_default())
        };

        cell.get_or_init(|| async move {
            let sentinel = self.sentinel_path();
            if let Some(path) = &sentinel {
                match read_sentinel(path) {
                    Ok(Some(record)) => {
                        tracing::debug!(feature = %self.feature, "registration found on disk");
                        return record.outcome;
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "ignoring unreadable sentinel"),
                }
            }

            let outcome = init().await;

            if let Some(path) = &sentinel {
                if let Err(err) = write_sentinel(path, &self.feature, &outcome) {
                    tracing::warn!(error = %err, "failed to record registration");
                }
            }
            outcome
        })
        .await
        .clone()
    }
}

fn read_sentinel(path: &Path) -> Result<Option<SentinelRecord>, RegistrationError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_sentinel(path: &Path, feature: &str, outcome: &str) -> Result<(), RegistrationError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let record = SentinelRecord {
        feature: feature.to_string(),
        outcome: outcome.to_string(),
        recorded_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

/// Runs the suggestion tool.
pub trait ToolRunner: Send + Sync {
    /// Runs `program` with `args` to completion.
    fn run(&self, program: &str, args: &[&str]) -> Result<CapturedOutput, ShellError>;
}

/// Runs the tool as a subprocess with a timeout.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    pub timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CapturedOutput, ShellError> {
        process::run_captured(program, args, Some(self.timeout))
    }
}

/// The recorded outcome of the last registration, stored in the context's
/// extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome(pub String);

/// Configuration for [`RegisterSuggestTool`].
#[derive(Clone)]
pub struct RegistrationOptions {
    /// The tool executable.
    pub tool: String,
    /// Memo key. Defaults to one key per executable path.
    pub feature: Option<String>,
    /// Where outcomes are persisted across runs.
    pub sentinel_dir: Option<PathBuf>,
    /// How the tool is run.
    pub runner: Arc<dyn ToolRunner>,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            tool: SUGGEST_TOOL.to_string(),
            feature: None,
            sentinel_dir: Some(std::env::temp_dir().join("standout-invoke").join("registrations")),
            runner: Arc::new(ProcessRunner::default()),
        }
    }
}

impl std::fmt::Debug for RegistrationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationOptions")
            .field("tool", &self.tool)
            .field("feature", &self.feature)
            .field("sentinel_dir", &self.sentinel_dir)
            .finish_non_exhaustive()
    }
}

/// Formats what the tool did.
pub fn describe_outcome(tool: &str, result: Result<CapturedOutput, RegistrationError>) -> String {
    match result {
        Ok(output) => format!(
            "{} exited with code {}\nOUT:\n{}\nERR:\n{}",
            tool,
            output.code.unwrap_or(-1),
            output.stdout,
            output.stderr
        ),
        Err(err) => format!("Exception during registration:\n{}", err),
    }
}

/// Registers the running program with the suggestion tool, then continues.
#[derive(Debug, Clone, Default)]
pub struct RegisterSuggestTool {
    options: RegistrationOptions,
}

impl RegisterSuggestTool {
    /// Uses `options`.
    pub fn new(options: RegistrationOptions) -> Self {
        Self { options }
    }

    async fn register(&self, command_path: String, command_name: String) -> String {
        let tool = self.options.tool.clone();
        let runner = Arc::clone(&self.options.runner);
        let task = tokio::task::spawn_blocking(move || {
            runner.run(
                &tool,
                &[
                    "register",
                    "--command-path",
                    &command_path,
                    "--suggestion-command",
                    &command_name,
                ],
            )
        });

        let result = match task.await {
            Ok(result) => result.map_err(RegistrationError::from),
            Err(err) => Err(RegistrationError::Join(err.to_string())),
        };
        describe_outcome(&self.options.tool, result)
    }
}

#[async_trait]
impl Middleware for RegisterSuggestTool {
    async fn handle(&self, ctx: &mut InvocationContext, next: Next) -> anyhow::Result<()> {
        let command_path = std::env::current_exe()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let command_name = ctx.parse_result().root_command().get_name().to_string();

        let feature = self
            .options
            .feature
            .clone()
            .unwrap_or_else(|| format!("suggest-registration:{}", command_path));
        let mut registration = FeatureRegistration::new(feature);
        if let Some(dir) = &self.options.sentinel_dir {
            registration = registration.with_sentinel_dir(dir);
        }

        let outcome = registration
            .ensure_registered(|| self.register(command_path, command_name))
            .await;
        tracing::debug!(outcome = %outcome, "suggestion tool registration");
        ctx.extensions.insert(RegistrationOutcome(outcome));

        next.run(ctx).await
    }
}

impl PipelineBuilder {
    /// Registers the program with `standout-suggest` on first use.
    pub fn register_with_suggest_tool(self) -> Self {
        self.register_with_suggest_tool_with(RegistrationOptions::default())
    }

    /// Registers with a custom tool configuration.
    pub fn register_with_suggest_tool_with(mut self, options: RegistrationOptions) -> Self {
        if !self.enable("register-suggest-tool") {
            return self;
        }
        self.add_middleware(Priority::RegisterSuggestTool, RegisterSuggestTool::new(options))
    }
}
