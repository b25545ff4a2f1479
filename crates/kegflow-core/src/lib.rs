//! kegflow Core - Shared types for pour tracking
//!
//! This crate provides the domain types shared between the flow
//! session manager (kegflowd) and its collaborators (UI, persistence).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod flow;
pub mod tap;

// Re-exports for convenience
pub use error::{FlowError, FlowResult};
pub use flow::{filter_flows, is_active, is_completed, is_idle, Flow, FlowId, FlowState};
pub use tap::{StaticTapRegistry, Tap, TapRegistry};
