//! Domain-specific error types following panic-free policy.

use crate::{FlowId, FlowState};
use thiserror::Error;

/// Errors that can occur when mutating a flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The flow has completed and no longer accepts mutation
    #[error("Flow {id} is completed")]
    Completed { id: FlowId },

    /// The requested state change is not part of the flow lifecycle
    #[error("Flow {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: FlowId,
        from: FlowState,
        to: FlowState,
    },
}

/// Result type for flow operations.
pub type FlowResult<T> = Result<T, FlowError>;
