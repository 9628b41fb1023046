//! The request-scoped state threaded through the pipeline.
//!
//! # Design Rationale
//!
//! Every middleware and the command handler receive the same
//! `&mut InvocationContext`. It carries:
//!
//! | Field | Written by | Purpose |
//! |-------|------------|---------|
//! | parse result | upstream parser | read-only input |
//! | console | console configuration | where all output goes |
//! | result code | anyone | the process exit code |
//! | deferred result | the step that short-circuits | what is printed at the end |
//! | extensions | any step | request-scoped state for later steps |
//!
//! # Short-circuit invariant
//!
//! At most one deferred result is ever set. The second attempt fails with
//! [`InvocationError::ResultAlreadySet`], and once a result is set the
//! terminal link of the chain refuses to run the handler.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::ambient::{AmbientSnapshot, RestoringResult};
use crate::console::Console;
use crate::error::InvocationError;
use crate::parse::ParseResult;
use crate::result::InvocationResult;
use crate::termination::TerminationCoordinator;

/// Type-safe container for request-scoped state.
///
/// Steps early in the chain insert values that later steps and the handler
/// retrieve by type.
///
/// # Example
///
/// ```rust
/// use standout_invoke::Extensions;
///
/// struct RequestId(u64);
///
/// let mut extensions = Extensions::new();
/// extensions.insert(RequestId(7));
/// assert_eq!(extensions.get::<RequestId>().map(|r| r.0), Some(7));
/// ```
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Extensions {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T: Send + 'static>(&mut self, val: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(val))
            .and_then(|boxed| boxed.downcast().ok().map(|b| *b))
    }

    /// Gets a reference to a value of the given type.
    pub fn get<T: Send + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Gets a mutable reference to a value of the given type.
    pub fn get_mut<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    /// Gets a value of the given type or fails with a descriptive error.
    pub fn get_required<T: Send + 'static>(&self) -> Result<&T, anyhow::Error> {
        self.get::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "Extension missing: type {} not found in context",
                std::any::type_name::<T>()
            )
        })
    }

    /// Removes a value of the given type.
    pub fn remove<T: Send + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok().map(|b| *b))
    }

    /// Returns true if a value of the given type is present.
    pub fn contains<T: Send + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}

/// State for one invocation of the pipeline.
pub struct InvocationContext {
    parse_result: ParseResult,
    console: Box<dyn Console>,
    result_code: i32,
    result: Option<Box<dyn InvocationResult>>,
    snapshot: Option<AmbientSnapshot>,
    termination: Option<TerminationCoordinator>,
    cancellation: Option<CancellationToken>,

    /// Request-scoped state shared between steps and the handler.
    pub extensions: Extensions,
}

impl InvocationContext {
    /// Creates a context with result code 0 and no deferred result.
    pub fn new(parse_result: ParseResult, console: Box<dyn Console>) -> Self {
        Self {
            parse_result,
            console,
            result_code: 0,
            result: None,
            snapshot: None,
            termination: None,
            cancellation: None,
            extensions: Extensions::new(),
        }
    }

    /// The parse result this invocation runs on.
    pub fn parse_result(&self) -> &ParseResult {
        &self.parse_result
    }

    /// The output sinks.
    pub fn console(&mut self) -> &mut dyn Console {
        &mut *self.console
    }

    /// Replaces the console, returning the previous one.
    pub fn replace_console(&mut self, console: Box<dyn Console>) -> Box<dyn Console> {
        std::mem::replace(&mut self.console, console)
    }

    /// The current result code.
    pub fn result_code(&self) -> i32 {
        self.result_code
    }

    /// Sets the result code.
    pub fn set_result_code(&mut self, code: i32) {
        self.result_code = code;
    }

    /// Sets the deferred result.
    ///
    /// If an ambient snapshot was captured, the result is wrapped so it is
    /// applied under that snapshot. Fails if a result is already set.
    pub fn set_result<R>(&mut self, result: R) -> Result<(), InvocationError>
    where
        R: InvocationResult + 'static,
    {
        if self.result.is_some() {
            return Err(InvocationError::ResultAlreadySet);
        }
        let boxed: Box<dyn InvocationResult> = match &self.snapshot {
            Some(snapshot) => Box::new(RestoringResult::new(
                Box::new(result),
                Some(snapshot.clone()),
            )),
            None => Box::new(result),
        };
        self.result = Some(boxed);
        Ok(())
    }

    /// Returns true if a deferred result was set.
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn take_result(&mut self) -> Option<Box<dyn InvocationResult>> {
        self.result.take()
    }

    /// Captures the ambient configuration; results set afterwards are applied
    /// under it.
    pub fn capture_ambient(&mut self) {
        self.snapshot = Some(AmbientSnapshot::capture());
    }

    /// The captured ambient snapshot, if any.
    pub fn ambient_snapshot(&self) -> Option<&AmbientSnapshot> {
        self.snapshot.as_ref()
    }

    /// Hands termination handling to this context. The pipeline releases it
    /// after the deferred result has been applied.
    pub fn install_termination(&mut self, coordinator: TerminationCoordinator) {
        self.termination = Some(coordinator);
    }

    /// Returns true if termination handling was installed.
    pub fn has_termination(&self) -> bool {
        self.termination.is_some()
    }

    pub(crate) fn take_termination(&mut self) -> Option<TerminationCoordinator> {
        self.termination.take()
    }

    /// The invocation's cancellation token.
    ///
    /// With termination handling installed, the first call arms it: OS
    /// interrupt and terminate notifications start cancelling this token.
    /// Without it, the token is created on first use and only cancelled by
    /// whoever holds a clone.
    pub fn cancellation_token(&mut self) -> CancellationToken {
        if let Some(coordinator) = &mut self.termination {
            return coordinator.arm();
        }
        self.cancellation
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Returns true if cancellation was requested. Never arms anything.
    pub fn is_cancellation_requested(&self) -> bool {
        match &self.termination {
            Some(coordinator) => coordinator.is_cancelled(),
            None => self
                .cancellation
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled),
        }
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("command_path", &self.parse_result.command_path())
            .field("result_code", &self.result_code)
            .field("has_result", &self.result.is_some())
            .field("has_termination", &self.termination.is_some())
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}
