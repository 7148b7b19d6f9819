use std::path::PathBuf;
use thiserror::Error;

/// Secrets errors
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("No key material matches a recipient of secret '{name}' (recipients: {})", .recipients.join(", "))]
    KeyNotConfigured {
        name: String,
        recipients: Vec<String>,
    },

    #[error("Secret not found: {name}{}", .suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    NotFound {
        name: String,
        suggestion: Option<String>,
    },

    #[error("No recipients to encrypt for")]
    NoRecipients,

    #[error("Invalid recipient public key: {0}")]
    InvalidRecipient(String),

    #[error("Invalid identity file: {path}\nReason: {message}")]
    InvalidIdentity { path: PathBuf, message: String },

    #[error("Identity file not found: {0}")]
    IdentityNotFound(PathBuf),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption of secret '{name}' failed: {message}")]
    DecryptionFailed { name: String, message: String },

    #[error("Unsupported secrets document version: {0}")]
    UnsupportedVersion(u32),

    #[error("Secrets document parse error: {path}\nReason: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("IO error: {path}\nReason: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SecretError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SecretError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SecretError>;
