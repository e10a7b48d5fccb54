use std::io;

use thiserror::Error;
use tracing::subscriber::set_global_default;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, registry};

use crate::config::{LogMode, LoggerConfig};

/// Create and set the global logger.
pub fn init_logger(config: &LoggerConfig) -> Result<(), LoggerError> {
    let filter = Targets::new()
        .with_default(config.level)
        // The AWS SDK is very chatty below warn.
        .with_target("aws_config", tracing::Level::WARN)
        .with_target("aws_smithy_runtime", tracing::Level::WARN)
        .with_target("hyper", tracing::Level::WARN);

    match config.mode {
        LogMode::Text => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(io::stdout)
                .with_ansi(true)
                .with_target(false);
            set_global_default(registry().with(layer).with(filter))?;
        }
        LogMode::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_target(false);
            set_global_default(registry().with(layer).with(filter))?;
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Failed to set the global logger:\n{0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}
