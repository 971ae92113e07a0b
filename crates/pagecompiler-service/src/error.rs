use std::fmt;

use thiserror::Error;

use crate::compiler::ControllerState;

/// An error produced by a page computation.
///
/// Errors are reported through [`CompilerEvent::Failed`](crate::compiler::CompilerEvent::Failed)
/// and are always local to the page they were produced for. They are never cached,
/// a subsequent request for the same page simply attempts the computation again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The compile function failed.
    ///
    /// The attached string contains the description reported by the compile function.
    #[error("compilation failed: {0}")]
    Failed(String),
    /// The input of the page could be read, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The compile function panicked.
    #[error("compilation panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for CompileError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CompileError {
    /// Converts any error into a [`CompileError::Failed`], logging its full chain.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e;
        tracing::debug!(error = dynerr, "page compile function returned an error");
        Self::Failed(e.to_string())
    }

    /// Creates an error from the payload of a caught panic.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::Panicked(message)
    }

    /// A short tag suitable for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Malformed(_) => "malformed",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// The result of a page computation.
pub type CompileResult<T> = Result<T, CompileError>;

/// A lifecycle entry point was called from a state that does not permit it.
///
/// This always indicates a bug in the caller, it is never produced by the compiler on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// `operation` is not valid while the controller is in `state`.
    #[error("cannot {operation} page compiler while it is {state}")]
    InvalidState {
        operation: Operation,
        state: ControllerState,
    },
}

/// A lifecycle entry point of the page compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Reset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
        })
    }
}
