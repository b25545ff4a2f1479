//! Flow session manager.
//!
//! Turns raw per-tap meter readings into flow sessions and keeps them
//! alive until they are ended explicitly or go idle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Meter reports  │────▶│   FlowManager   │────▶│  FlowListeners  │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!                                  ▲                 UI, persistence,
//!                                  │                 BroadcastListener
//!                         ┌────────┴────────┐
//!                         │   IdleReaper    │
//!                         │ (tokio task,    │
//!                         │  fixed delay)   │
//!                         └─────────────────┘
//! ```
//!
//! Sensor input never panics or errors the caller: unknown taps and
//! debounced readings come back as [`MeterOutcome`] variants.

mod dispatch;
mod flow_manager;
mod listener;
mod outcome;
mod reaper;

pub use flow_manager::FlowManager;
pub use listener::{BroadcastListener, FlowEvent, FlowListener};
pub use outcome::{ManagerError, MeterOutcome};

/// Default channel capacity for [`BroadcastListener`].
pub const EVENT_BUFFER: usize = 100;
