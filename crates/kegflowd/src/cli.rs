//! Line-oriented driver for the flow manager.
//!
//! Reads meter and session commands from stdin, one per line, and writes
//! flow notifications and command replies to stdout as JSON lines. Logs go
//! to stderr.
//!
//! ```text
//! meter kegboard.flow0 120       cumulative meter reading
//! tick kegboard.flow0 15         incremental ticks
//! user kegboard.flow0 alice      authenticate a user at the tap
//! shout kegboard.flow0 cheers!   set the flow's shout text
//! poke [kegboard.flow0]          mark one flow (or all) as still pouring
//! end kegboard.flow0             end the tap's flow
//! end-all                        end every flow
//! list                           print active flows
//! idle-timeout 5000              idle timeout for flows started from now on
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use kegflow_core::{Flow, StaticTapRegistry, Tap};

use crate::config::{ConfigError, FlowConfig};
use crate::manager::{BroadcastListener, FlowEvent, FlowManager, MeterOutcome, EVENT_BUFFER};

/// Meters registered when neither flags nor the config file name any taps.
pub const DEFAULT_METERS: [&str; 2] = ["kegboard.flow0", "kegboard.flow1"];

// ============================================================================
// CLI Arguments
// ============================================================================

/// kegflowd - pour session tracking for kegerator taps
#[derive(Parser, Debug, Default)]
#[command(name = "kegflowd", version, about)]
pub struct Args {
    /// Path to a TOML config file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Idle timeout for new flows, in milliseconds
    #[arg(long, value_name = "MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Minimum tick delta that starts or extends a flow
    #[arg(long, value_name = "TICKS")]
    pub min_start_ticks: Option<u64>,

    /// Delay between idle scans, in milliseconds
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Register a tap for this meter name (repeatable, replaces configured taps)
    #[arg(long = "tap", value_name = "METER")]
    pub taps: Vec<String>,
}

impl Args {
    /// Loads the config file and environment, then applies flag overrides.
    pub fn resolve_config(&self) -> Result<FlowConfig, ConfigError> {
        let mut config = FlowConfig::load(self.config.as_deref())?;
        if let Some(ms) = self.idle_timeout_ms {
            config.default_idle_timeout_ms = ms;
        }
        if let Some(ticks) = self.min_start_ticks {
            config.min_flow_start_ticks = ticks;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.idle_poll_interval_ms = ms;
        }
        config.validate()?;
        Ok(config)
    }

    /// Builds the tap registry: `--tap` flags, else configured taps, else
    /// [`DEFAULT_METERS`].
    pub fn tap_registry(&self, config: &FlowConfig) -> StaticTapRegistry {
        if !self.taps.is_empty() {
            return StaticTapRegistry::new(self.taps.iter().map(Tap::from_meter_name));
        }
        if !config.taps.is_empty() {
            return config.tap_registry();
        }
        StaticTapRegistry::new(DEFAULT_METERS.into_iter().map(Tap::from_meter_name))
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Meter { meter: String, ticks: u64 },
    Tick { meter: String, ticks: u64 },
    User { meter: String, username: String },
    Shout { meter: String, text: String },
    Poke { meter: Option<String> },
    End { meter: String },
    EndAll,
    List,
    IdleTimeout { timeout_ms: u64 },
}

/// Errors from parsing an input line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command}: missing {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("{command}: {argument} must be a non-negative integer, got {value:?}")]
    InvalidNumber {
        command: &'static str,
        argument: &'static str,
        value: String,
    },

    #[error("{command}: unexpected argument {extra:?}")]
    Unexpected { command: &'static str, extra: String },
}

/// Parses one input line. Blank lines and comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (keyword, rest) = split_word(line);
    let command = match keyword {
        "meter" => {
            let (meter, ticks) = meter_and_number("meter", rest)?;
            Command::Meter { meter, ticks }
        }
        "tick" => {
            let (meter, ticks) = meter_and_number("tick", rest)?;
            Command::Tick { meter, ticks }
        }
        "user" => {
            let (meter, rest) = required_word("user", "meter", rest)?;
            let (username, rest) = required_word("user", "username", rest)?;
            no_more("user", rest)?;
            Command::User {
                meter: meter.to_string(),
                username: username.to_string(),
            }
        }
        "shout" => {
            // The text is the remainder of the line and may contain spaces
            let (meter, text) = required_word("shout", "meter", rest)?;
            Command::Shout {
                meter: meter.to_string(),
                text: text.to_string(),
            }
        }
        "poke" => {
            let (meter, rest) = split_word(rest);
            no_more("poke", rest)?;
            Command::Poke {
                meter: (!meter.is_empty()).then(|| meter.to_string()),
            }
        }
        "end" => {
            let (meter, rest) = required_word("end", "meter", rest)?;
            no_more("end", rest)?;
            Command::End {
                meter: meter.to_string(),
            }
        }
        "end-all" => {
            no_more("end-all", rest)?;
            Command::EndAll
        }
        "list" => {
            no_more("list", rest)?;
            Command::List
        }
        "idle-timeout" => {
            let (raw, rest) = required_word("idle-timeout", "milliseconds", rest)?;
            no_more("idle-timeout", rest)?;
            Command::IdleTimeout {
                timeout_ms: parse_number("idle-timeout", "milliseconds", raw)?,
            }
        }
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (input, ""),
    }
}

fn required_word<'a>(
    command: &'static str,
    argument: &'static str,
    input: &'a str,
) -> Result<(&'a str, &'a str), CommandError> {
    let (word, rest) = split_word(input);
    if word.is_empty() {
        return Err(CommandError::MissingArgument { command, argument });
    }
    Ok((word, rest))
}

fn no_more(command: &'static str, rest: &str) -> Result<(), CommandError> {
    let rest = rest.trim();
    if rest.is_empty() {
        Ok(())
    } else {
        Err(CommandError::Unexpected {
            command,
            extra: rest.to_string(),
        })
    }
}

fn parse_number(
    command: &'static str,
    argument: &'static str,
    raw: &str,
) -> Result<u64, CommandError> {
    raw.parse().map_err(|_| CommandError::InvalidNumber {
        command,
        argument,
        value: raw.to_string(),
    })
}

fn meter_and_number(command: &'static str, rest: &str) -> Result<(String, u64), CommandError> {
    let (meter, rest) = required_word(command, "meter", rest)?;
    let (raw, rest) = required_word(command, "ticks", rest)?;
    no_more(command, rest)?;
    Ok((meter.to_string(), parse_number(command, "ticks", raw)?))
}

// ============================================================================
// Execution
// ============================================================================

/// Output for commands whose effect is not visible as a flow event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Flows { flows: Vec<Flow> },
    Debounced { meter: String, delta: u64, min: u64 },
    UnknownTap { meter: String },
    NoFlow { meter: String },
    Poked { count: usize },
    IdleTimeout { timeout_ms: u64 },
    Rejected { reason: String },
}

/// Applies a command to the manager.
///
/// Returns a reply when the command produced no flow notification of its
/// own (queries, rejected readings, missing flows).
pub fn execute(manager: &FlowManager, command: &Command) -> Option<Reply> {
    debug!(?command, "Executing command");
    match command {
        Command::Meter { meter, ticks } => {
            meter_reply(meter, manager.handle_meter_activity(meter, *ticks))
        }
        Command::Tick { meter, ticks } => {
            meter_reply(meter, manager.handle_new_ticks(meter, *ticks))
        }
        Command::User { meter, username } => {
            let Some(tap) = manager.tap_for_meter_name(meter) else {
                return Some(Reply::UnknownTap {
                    meter: meter.clone(),
                });
            };
            manager.activate_user_at_tap(&tap, username);
            None
        }
        Command::Shout { meter, text } => with_tap(manager, meter, |tap| {
            manager.set_shout(tap, text).map(|_| None)
        }),
        Command::Poke { meter: Some(meter) } => with_tap(manager, meter, |tap| {
            manager.poke_flow(tap).map(|_| Some(Reply::Poked { count: 1 }))
        }),
        Command::Poke { meter: None } => Some(Reply::Poked {
            count: manager.poke_all_active(),
        }),
        Command::End { meter } => {
            let ended = manager
                .flow_for_meter_name(meter)
                .and_then(|flow| manager.end_flow(&flow));
            match ended {
                Some(_) => None,
                None => Some(Reply::NoFlow {
                    meter: meter.clone(),
                }),
            }
        }
        Command::EndAll => {
            let ended = manager.end_all_flows();
            info!(ended = ended.len(), "Ended all flows");
            None
        }
        Command::List => Some(Reply::Flows {
            flows: manager.active_flows(),
        }),
        Command::IdleTimeout { timeout_ms } => {
            if let Err(e) = manager.set_default_idle_timeout(*timeout_ms) {
                warn!(error = %e, "Idle timeout change rejected");
                return Some(Reply::Rejected {
                    reason: e.to_string(),
                });
            }
            Some(Reply::IdleTimeout {
                timeout_ms: manager.default_idle_timeout(),
            })
        }
    }
}

fn meter_reply(meter: &str, outcome: MeterOutcome) -> Option<Reply> {
    match outcome {
        MeterOutcome::Accepted(_) => None,
        MeterOutcome::Debounced { delta, min, .. } => Some(Reply::Debounced {
            meter: meter.to_string(),
            delta,
            min,
        }),
        MeterOutcome::UnknownTap { meter_name } => Some(Reply::UnknownTap { meter: meter_name }),
    }
}

/// Runs `op` against the tap for `meter`. `op` returns `None` when the tap
/// has no flow.
fn with_tap<F>(manager: &FlowManager, meter: &str, op: F) -> Option<Reply>
where
    F: FnOnce(&Tap) -> Option<Option<Reply>>,
{
    let Some(tap) = manager.tap_for_meter_name(meter) else {
        return Some(Reply::UnknownTap {
            meter: meter.to_string(),
        });
    };
    op(&tap).unwrap_or_else(|| {
        Some(Reply::NoFlow {
            meter: meter.to_string(),
        })
    })
}

// ============================================================================
// Driver
// ============================================================================

/// Initializes stderr logging, honoring `RUST_LOG`.
pub fn init_logging() -> Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(log_filter(rust_log.as_deref()))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;
    Ok(())
}

/// Filter used when `RUST_LOG` is unset, empty or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "kegflowd=info,kegflow_core=info";

/// Builds the log filter from a `RUST_LOG` value, falling back to
/// [`DEFAULT_LOG_FILTER`].
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Runs the driver until stdin closes or a shutdown signal arrives, then
/// stops the manager so every open flow ends with its notifications.
pub async fn run(args: Args) -> Result<()> {
    let config = args
        .resolve_config()
        .context("Failed to load configuration")?;
    let registry = args.tap_registry(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        taps = registry.len(),
        idle_timeout_ms = config.default_idle_timeout_ms,
        min_flow_start_ticks = config.min_flow_start_ticks,
        idle_poll_interval_ms = config.idle_poll_interval_ms,
        "kegflowd starting"
    );

    let manager = FlowManager::new(Arc::new(registry), &config)?;

    let events = Arc::new(BroadcastListener::new(EVENT_BUFFER));
    let printer = tokio::spawn(print_events(events.subscribe()));
    manager.add_listener(events.clone());

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let result = read_commands(&manager, tokio::io::stdin(), cancel_token).await;

    manager.stop();

    // Closing the channel lets the printer drain and exit
    manager.remove_listener(&events);
    drop(events);
    if let Err(e) = printer.await {
        error!(error = %e, "Event printer failed");
    }

    match result {
        Ok(handled) => {
            info!(commands = handled, "kegflowd stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Input error");
            Err(e)
        }
    }
}

/// Feeds commands from `input` to the manager until EOF or cancellation.
/// Returns the number of commands executed.
pub async fn read_commands<R>(
    manager: &FlowManager,
    input: R,
    cancel_token: CancellationToken,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut handled = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read command input")? else {
                    info!("Command input closed");
                    break;
                };
                match parse_line(&line) {
                    Ok(Some(command)) => {
                        if let Some(reply) = execute(manager, &command) {
                            emit_json(&reply);
                        }
                        handled += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, line = %line, "Ignoring malformed command"),
                }
            }
        }
    }

    Ok(handled)
}

async fn print_events(mut rx: broadcast::Receiver<FlowEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => emit_json(&event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer lagged, notifications dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn emit_json<T: Serialize>(value: &T) {
    let line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to serialize output");
            return;
        }
    };
    let mut stdout = io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        debug!(error = %e, "Failed to write output");
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kegflow_core::TapRegistry;
    use std::io::Write as _;

    fn test_manager() -> FlowManager {
        let taps = StaticTapRegistry::new(DEFAULT_METERS.into_iter().map(Tap::from_meter_name));
        FlowManager::new(Arc::new(taps), &FlowConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_meter_commands() {
        assert_eq!(
            parse_line("meter kegboard.flow0 120").unwrap(),
            Some(Command::Meter {
                meter: "kegboard.flow0".to_string(),
                ticks: 120,
            })
        );
        assert_eq!(
            parse_line("  tick   kegboard.flow1\t15 ").unwrap(),
            Some(Command::Tick {
                meter: "kegboard.flow1".to_string(),
                ticks: 15,
            })
        );
    }

    #[test]
    fn test_parse_blank_and_comment() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   ").unwrap(), None);
        assert_eq!(parse_line("# meter kegboard.flow0 1").unwrap(), None);
    }

    #[test]
    fn test_parse_shout_keeps_spaces() {
        assert_eq!(
            parse_line("shout kegboard.flow0 first pour of the night").unwrap(),
            Some(Command::Shout {
                meter: "kegboard.flow0".to_string(),
                text: "first pour of the night".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_poke_optional_meter() {
        assert_eq!(parse_line("poke").unwrap(), Some(Command::Poke { meter: None }));
        assert_eq!(
            parse_line("poke kegboard.flow0").unwrap(),
            Some(Command::Poke {
                meter: Some("kegboard.flow0".to_string())
            })
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_line("end-all").unwrap(), Some(Command::EndAll));
        assert_eq!(parse_line("list").unwrap(), Some(Command::List));
        assert_eq!(
            parse_line("idle-timeout 5000").unwrap(),
            Some(Command::IdleTimeout { timeout_ms: 5000 })
        );
        assert_eq!(
            parse_line("user kegboard.flow0 alice").unwrap(),
            Some(Command::User {
                meter: "kegboard.flow0".to_string(),
                username: "alice".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_line("pour kegboard.flow0"),
            Err(CommandError::Unknown("pour".to_string()))
        );
        assert_eq!(
            parse_line("meter"),
            Err(CommandError::MissingArgument {
                command: "meter",
                argument: "meter",
            })
        );
        assert_eq!(
            parse_line("meter kegboard.flow0"),
            Err(CommandError::MissingArgument {
                command: "meter",
                argument: "ticks",
            })
        );
        assert!(matches!(
            parse_line("meter kegboard.flow0 -5"),
            Err(CommandError::InvalidNumber { .. })
        ));
        assert!(matches!(
            parse_line("list everything"),
            Err(CommandError::Unexpected { .. })
        ));
        assert!(matches!(
            parse_line("user kegboard.flow0 alice bob"),
            Err(CommandError::Unexpected { .. })
        ));
    }

    #[test]
    fn test_command_error_display() {
        let err = parse_line("tick kegboard.flow0 lots").unwrap_err();
        assert_eq!(
            err.to_string(),
            "tick: ticks must be a non-negative integer, got \"lots\""
        );
        let err = parse_line("end kegboard.flow0 now").unwrap_err();
        assert_eq!(err.to_string(), "end: unexpected argument \"now\"");
    }

    #[test]
    fn test_tap_registry_precedence() {
        let mut config = FlowConfig::default();

        let args = Args::default();
        let registry = args.tap_registry(&config);
        assert_eq!(registry.len(), 2);
        assert!(registry.tap_for_meter_name("kegboard.flow1").is_some());

        config.taps.push(crate::config::TapConfig {
            name: "Main Tap".to_string(),
            meter_name: "kegboard.flow0".to_string(),
        });
        let registry = args.tap_registry(&config);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.tap_for_meter_name("kegboard.flow0").unwrap().name(),
            "Main Tap"
        );

        let args = Args {
            taps: vec!["test.meter".to_string()],
            ..Args::default()
        };
        let registry = args.tap_registry(&config);
        assert_eq!(registry.len(), 1);
        assert!(registry.tap_for_meter_name("test.meter").is_some());
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_idle_timeout_ms = 5000\nmin_flow_start_ticks = 3").unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            idle_timeout_ms: Some(250),
            poll_interval_ms: Some(50),
            ..Args::default()
        };
        let config = args.resolve_config().unwrap();
        assert_eq!(config.default_idle_timeout_ms, 250);
        assert_eq!(config.min_flow_start_ticks, 3);
        assert_eq!(config.idle_poll_interval_ms, 50);
    }

    #[test]
    fn test_zero_poll_interval_flag_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let args = Args {
            config: Some(file.path().to_path_buf()),
            poll_interval_ms: Some(0),
            ..Args::default()
        };
        assert!(matches!(
            args.resolve_config(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_meter_replies() {
        let manager = test_manager();

        assert!(execute(
            &manager,
            &Command::Meter {
                meter: "kegboard.flow0".to_string(),
                ticks: 0,
            }
        )
        .is_none());

        let reply = execute(
            &manager,
            &Command::Meter {
                meter: "kegboard.flow0".to_string(),
                ticks: 4,
            },
        );
        assert!(matches!(
            reply,
            Some(Reply::Debounced {
                delta: 4,
                min: 10,
                ..
            })
        ));

        let reply = execute(
            &manager,
            &Command::Tick {
                meter: "nope".to_string(),
                ticks: 50,
            },
        );
        assert!(matches!(reply, Some(Reply::UnknownTap { .. })));

        manager.stop();
    }

    #[tokio::test]
    async fn test_execute_session_commands() {
        let manager = test_manager();
        let meter = "kegboard.flow0".to_string();

        let reply = execute(&manager, &Command::End { meter: meter.clone() });
        assert!(matches!(reply, Some(Reply::NoFlow { .. })));

        let reply = execute(
            &manager,
            &Command::Shout {
                meter: meter.clone(),
                text: "hi".to_string(),
            },
        );
        assert!(matches!(reply, Some(Reply::NoFlow { .. })));

        execute(
            &manager,
            &Command::User {
                meter: meter.clone(),
                username: "alice".to_string(),
            },
        );
        let flow = manager.flow_for_meter_name(&meter).unwrap();
        assert_eq!(flow.username(), Some("alice"));

        execute(
            &manager,
            &Command::Shout {
                meter: meter.clone(),
                text: "cheers".to_string(),
            },
        );
        assert_eq!(
            manager.flow_for_meter_name(&meter).unwrap().shout(),
            Some("cheers")
        );

        let reply = execute(&manager, &Command::Poke { meter: None });
        assert!(matches!(reply, Some(Reply::Poked { count: 1 })));

        let reply = execute(&manager, &Command::List);
        match reply {
            Some(Reply::Flows { flows }) => assert_eq!(flows.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }

        assert!(execute(&manager, &Command::End { meter: meter.clone() }).is_none());
        assert!(manager.active_flows().is_empty());

        let reply = execute(&manager, &Command::IdleTimeout { timeout_ms: 1234 });
        assert!(matches!(
            reply,
            Some(Reply::IdleTimeout { timeout_ms: 1234 })
        ));

        let reply = execute(&manager, &Command::IdleTimeout { timeout_ms: 0 });
        assert!(matches!(reply, Some(Reply::Rejected { .. })));
        assert_eq!(manager.default_idle_timeout(), 1234);
    }

    #[test]
    fn test_log_filter_honors_rust_log() {
        let filter = log_filter(Some("kegflowd=debug")).to_string();
        assert!(filter.contains("kegflowd=debug"), "got {filter}");
        assert!(!filter.contains("kegflowd=info"), "got {filter}");
    }

    #[test]
    fn test_log_filter_defaults() {
        for rust_log in [None, Some(""), Some("  ")] {
            let filter = log_filter(rust_log).to_string();
            assert!(filter.contains("kegflowd=info"), "got {filter}");
            assert!(filter.contains("kegflow_core=info"), "got {filter}");
        }
    }

    #[tokio::test]
    async fn test_read_commands_until_eof() {
        let manager = test_manager();
        let input: &[u8] = b"meter kegboard.flow0 0\n\
            meter kegboard.flow0 0\n\
            bogus\n\
            \n\
            meter kegboard.flow0 50\n";

        let handled = read_commands(&manager, input, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handled, 3);

        let flows = manager.active_flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].total_ticks(), 50);

        manager.stop();
    }

    #[tokio::test]
    async fn test_read_commands_stops_on_cancel() {
        let manager = test_manager();
        let cancel_token = CancellationToken::new();
        cancel_token.cancel();

        let (_writer, reader) = tokio::io::duplex(64);
        let handled = read_commands(&manager, reader, cancel_token).await.unwrap();
        assert_eq!(handled, 0);
    }
}
