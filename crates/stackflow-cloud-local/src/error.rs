//! Local provider error types

use stackflow_core::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocalError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Command output is not a JSON object: {0}")]
    InvalidOutput(String),

    #[error("Environment variable not set: {0}")]
    MissingVariable(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LocalError>;

impl From<LocalError> for DriverError {
    fn from(err: LocalError) -> Self {
        match err {
            LocalError::EmptyCommand | LocalError::InvalidOutput(_) | LocalError::JsonError(_) => {
                DriverError::InvalidConfig(err.to_string())
            }
            LocalError::MissingVariable(_) => DriverError::AuthenticationFailed(err.to_string()),
            LocalError::CommandNotFound(_)
            | LocalError::CommandFailed { .. }
            | LocalError::IoError(_) => DriverError::CommandFailed(err.to_string()),
        }
    }
}
