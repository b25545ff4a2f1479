//! kegflowd - Flow session manager for multi-tap pour tracking
//!
//! This crate provides:
//! - `manager` - Flow session manager: debounce, session start/end, idle reaping,
//!   listener fan-out
//! - `config` - Layered configuration (defaults, TOML file, environment)
//! - `cli` - Line-oriented driver used by the `kegflowd` binary
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Lock poisoning is recovered rather than propagated

pub mod cli;
pub mod config;
pub mod manager;
