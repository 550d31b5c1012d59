//! Parses the command line arguments and runs the demo.
//!
//! Basic usage with logging on:
//!
//! ```cargo run -p toe -- --log```

use crate::{
    demo::{self, DemoError},
    logging::{initialize_logging, LoggingError},
};
use clap::Parser;
use thiserror::Error as ThisError;
use toe_core::{ConfigError, ToeConfig};

/// Stores the different command line arguments.
#[derive(Parser, Debug)]
#[command(about = "Runs one loopback connection through a TCP offload engine")]
struct Args {
    /// Logging flag. Used to turn logging on or off.
    #[arg(short, long)]
    log: bool,
    /// Number of session slots
    #[arg(short, long, default_value_t = 1024)]
    sessions: u16,
    /// Bytes of buffer per session and direction, a power of two
    #[arg(short, long, default_value_t = 0x1_0000)]
    buffer_size: u32,
    /// Port the engine listens on
    #[arg(short, long, default_value_t = 80)]
    port: u16,
    /// What the remote peer sends
    #[arg(short, long, default_value = "Hello from the other side")]
    message: String,
}

#[derive(Debug, ThisError)]
pub enum CliError {
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Demo failed: {0}")]
    Demo(#[from] DemoError),
    #[error("Interrupted")]
    Interrupted,
}

impl Args {
    fn config(&self) -> Result<ToeConfig, ConfigError> {
        let config = ToeConfig::default()
            .max_sessions(self.sessions)
            .buffer_size(self.buffer_size);
        config.validate()?;
        Ok(config)
    }
}

/// Parses command line arguments and runs the demo until it finishes or the
/// process is interrupted.
pub async fn run_from_arguments() -> Result<(), CliError> {
    let args = Args::parse();
    if args.log {
        initialize_logging()?;
    }
    let config = args.config()?;
    tokio::select! {
        report = demo::run(config, args.port, args.message.into_bytes()) => {
            let report = report?;
            println!(
                "Session {} received {} bytes, sent {} bytes, closed: {}",
                report.session, report.received, report.sent, report.closed
            );
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => Err(CliError::Interrupted),
    }
}
