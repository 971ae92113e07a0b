use std::fmt;

use crate::error::{LifecycleError, Operation};

/// The lifecycle state of a [`PageCompiler`](super::PageCompiler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    /// No work is accepted. This is the initial state.
    #[default]
    Inactive,
    /// Requests may dispatch new computations.
    Active,
    /// Outstanding computations are being cancelled, no new work is accepted.
    Stopping,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Stopping => "stopping",
        })
    }
}

/// Gates work admission of the compiler.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    state: ControllerState,
}

impl Lifecycle {
    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn accepts_work(&self) -> bool {
        self.state == ControllerState::Active
    }

    /// `Inactive -> Active`
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        self.transition(Operation::Start, ControllerState::Inactive, ControllerState::Active)
    }

    /// `Active -> Stopping`
    pub fn begin_stop(&mut self, operation: Operation) -> Result<(), LifecycleError> {
        self.transition(operation, ControllerState::Active, ControllerState::Stopping)
    }

    /// `Stopping -> Inactive`, once all outstanding work has been drained.
    pub fn finish_stop(&mut self) {
        debug_assert_eq!(self.state, ControllerState::Stopping);
        self.state = ControllerState::Inactive;
    }

    fn transition(
        &mut self,
        operation: Operation,
        from: ControllerState,
        to: ControllerState,
    ) -> Result<(), LifecycleError> {
        if self.state != from {
            let error = LifecycleError::InvalidState {
                operation,
                state: self.state,
            };
            tracing::error!(error = &error as &dyn std::error::Error, "invalid lifecycle call");
            return Err(error);
        }
        tracing::debug!(%operation, "page compiler {from} -> {to}");
        self.state = to;
        Ok(())
    }
}
