use std::{
    fs::{create_dir_all, OpenOptions},
    sync::Arc,
};
use thiserror::Error as ThisError;
use tracing_subscriber::FmtSubscriber;

const LOG_DIRECTORY: &str = "./logs";

#[derive(Debug, ThisError)]
pub enum LoggingError {
    #[error("Could not open the log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("A global subscriber is already installed: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Sends every event to a JSON log file under `./logs`, named for the time
/// the engine started. Only call this once per process.
pub fn initialize_logging() -> Result<(), LoggingError> {
    create_dir_all(LOG_DIRECTORY)?;
    let file_path = format!(
        "{}/toe-{}.log",
        LOG_DIRECTORY,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(tracing::Level::DEBUG)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
