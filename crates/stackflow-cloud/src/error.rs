//! Provisioning error types

use crate::report::ProvisionReport;
use crate::state::Operation;
use chrono::{DateTime, Utc};
use stackflow_core::{ConfigError, DriverError, PlaceholderError};
use std::path::PathBuf;
use thiserror::Error;

/// Persisted state errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file is not valid JSON: {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State file version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Timed out waiting for state mutex: {0}")]
    Busy(PathBuf),

    #[error("Lock on {0} was taken over by another operation")]
    LockLost(String),

    #[error("State of {0} kept changing during update")]
    Contention(String),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classification of a [`ProvisionError`] for frontends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    CyclicInheritance,
    UnresolvedPlaceholder,
    Secret,
    Auth,
    Conflict,
    DependentStacks,
    Apply,
    Cancelled,
    State,
}

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unresolved placeholders in stack '{stack}':\n{}", list(.errors))]
    UnresolvedPlaceholder {
        stack: String,
        errors: Vec<PlaceholderError>,
    },

    #[error("Secret error in stack '{stack}': {message}")]
    Secret { stack: String, message: String },

    #[error("Auth provider '{provider}' failed for stack '{stack}': {source}")]
    Auth {
        stack: String,
        provider: String,
        #[source]
        source: DriverError,
    },

    #[error(
        "{stack}/{environment} is locked by {owner} ({operation}) since {acquired_at}"
    )]
    Conflict {
        stack: String,
        environment: String,
        owner: String,
        operation: Operation,
        acquired_at: DateTime<Utc>,
    },

    #[error(
        "Cannot destroy '{stack}' in {environment}: still used by {}",
        .dependents.join(", ")
    )]
    DependentStacks {
        stack: String,
        environment: String,
        dependents: Vec<String>,
    },

    #[error("Apply failed for '{resource}' in {stack}/{environment}: {message}")]
    Apply {
        stack: String,
        environment: String,
        resource: String,
        message: String,
        report: Box<ProvisionReport>,
    },

    #[error("Operation on {stack}/{environment} was cancelled")]
    Cancelled {
        stack: String,
        environment: String,
        report: Box<ProvisionReport>,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

fn list(errors: &[PlaceholderError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Config(ConfigError::CyclicInheritance(_)) => {
                ErrorKind::CyclicInheritance
            }
            ProvisionError::Config(_) => ErrorKind::Config,
            ProvisionError::UnresolvedPlaceholder { .. } => ErrorKind::UnresolvedPlaceholder,
            ProvisionError::Secret { .. } => ErrorKind::Secret,
            ProvisionError::Auth { .. } => ErrorKind::Auth,
            ProvisionError::Conflict { .. } => ErrorKind::Conflict,
            ProvisionError::DependentStacks { .. } => ErrorKind::DependentStacks,
            ProvisionError::Apply { .. } => ErrorKind::Apply,
            ProvisionError::Cancelled { .. } => ErrorKind::Cancelled,
            ProvisionError::State(_) => ErrorKind::State,
        }
    }

    /// True when nothing was mutated before the error
    pub fn is_preflight(&self) -> bool {
        match self {
            ProvisionError::Apply { .. } | ProvisionError::State(_) => false,
            ProvisionError::Cancelled { report, .. } => report.is_untouched(),
            _ => true,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            ProvisionError::Config(e) => e.stack(),
            ProvisionError::UnresolvedPlaceholder { stack, .. }
            | ProvisionError::Secret { stack, .. }
            | ProvisionError::Auth { stack, .. }
            | ProvisionError::Conflict { stack, .. }
            | ProvisionError::DependentStacks { stack, .. }
            | ProvisionError::Apply { stack, .. }
            | ProvisionError::Cancelled { stack, .. } => Some(stack),
            ProvisionError::State(_) => None,
        }
    }

    /// Resource that failed, for mid-flight errors
    pub fn resource(&self) -> Option<&str> {
        match self {
            ProvisionError::Apply { resource, .. } => Some(resource),
            ProvisionError::Config(ConfigError::UnknownResource { resource, .. })
            | ProvisionError::Config(ConfigError::UnknownResourceType { resource, .. }) => {
                Some(resource)
            }
            _ => None,
        }
    }

    /// Per-resource report of a partially completed run
    pub fn report(&self) -> Option<&ProvisionReport> {
        match self {
            ProvisionError::Apply { report, .. } | ProvisionError::Cancelled { report, .. } => {
                Some(report)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
