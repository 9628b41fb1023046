//! Error types for the invocation pipeline.

use thiserror::Error;

/// Errors raised by the pipeline itself.
///
/// Handlers and middleware return `anyhow::Result`, so any of these can travel
/// through the chain and be recognized again with `downcast_ref`.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// A step tried to set a deferred result after another step already did.
    #[error("an invocation result was already set by an earlier step")]
    ResultAlreadySet,

    /// The invocation observed a cancellation request and stopped.
    #[error("the invocation was cancelled")]
    Cancelled,

    /// A handler was registered twice for the same command path.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A step panicked.
    #[error("panic: {0}")]
    Panic(String),
}

impl InvocationError {
    /// Returns true if `err` is (or wraps) a cancellation.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<InvocationError>(),
                Some(InvocationError::Cancelled)
            )
        })
    }
}
