//! kegflowd - Flow session manager driver
//!
//! Reads meter and session commands from stdin and prints flow
//! notifications to stdout as JSON lines.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default taps (kegboard.flow0, kegboard.flow1)
//! kegflowd
//!
//! # Custom taps and a short idle timeout
//! kegflowd --tap kegboard.flow0 --idle-timeout-ms 5000
//!
//! # Load settings from a config file
//! kegflowd --config ./kegflow.toml
//!
//! # Enable debug logging
//! RUST_LOG=kegflowd=debug kegflowd
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: end all open flows and exit

use anyhow::Result;
use clap::Parser;

use kegflowd::cli::{self, Args};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cli::init_logging()?;
    cli::run(args).await
}
