//! Manager results and errors.
//!
//! - `MeterOutcome`: what happened to a meter report
//! - `ManagerError`: failures constructing a manager

use thiserror::Error;

use kegflow_core::{Flow, Tap};

use crate::config::ConfigError;

/// Result of feeding a meter report to the manager.
///
/// Sensor input never fails the caller; a report is either applied to a
/// flow or dropped for one of the reasons below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterOutcome {
    /// The reading was committed and applied to this flow (snapshot after the update).
    Accepted(Flow),

    /// The delta was positive but below the debounce threshold. The stored
    /// reading was not updated.
    Debounced {
        tap: Tap,
        /// Rejected tick delta
        delta: u64,
        /// Threshold in force
        min: u64,
    },

    /// No tap is configured for the meter name.
    UnknownTap { meter_name: String },
}

impl MeterOutcome {
    /// Returns the flow the report was applied to, if any.
    pub fn flow(&self) -> Option<&Flow> {
        match self {
            Self::Accepted(flow) => Some(flow),
            Self::Debounced { .. } | Self::UnknownTap { .. } => None,
        }
    }

    pub fn into_flow(self) -> Option<Flow> {
        match self {
            Self::Accepted(flow) => Some(flow),
            Self::Debounced { .. } | Self::UnknownTap { .. } => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Errors that can occur constructing a flow manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The idle reaper needs a tokio runtime and none is running on this thread.
    #[error("no tokio runtime available for the idle reaper")]
    NoRuntime,

    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
