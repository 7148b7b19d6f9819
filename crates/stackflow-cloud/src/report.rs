//! Per-unit outcome of a run

use crate::state::{Operation, StateKey};
use stackflow_core::{ChangeSummary, Changeset, Document, UnitKind};
use std::fmt;

/// Outcome of one unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitStatus {
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
    /// Preview only
    Planned,
}

impl UnitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitStatus::Succeeded | UnitStatus::Planned)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Succeeded => write!(f, "succeeded"),
            UnitStatus::Failed { message } => write!(f, "failed: {message}"),
            UnitStatus::Skipped { reason } => write!(f, "skipped: {reason}"),
            UnitStatus::Planned => write!(f, "planned"),
        }
    }
}

/// Report entry for one resource (or the stack itself)
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub name: String,
    pub type_key: String,
    pub kind: UnitKind,
    pub status: UnitStatus,
    /// Changeset computed by the driver, when planning got that far
    pub changeset: Option<Changeset>,
}

impl UnitReport {
    pub fn new(
        name: impl Into<String>,
        type_key: impl Into<String>,
        kind: UnitKind,
        status: UnitStatus,
    ) -> Self {
        Self {
            name: name.into(),
            type_key: type_key.into(),
            kind,
            status,
            changeset: None,
        }
    }

    pub fn with_changeset(mut self, changeset: Changeset) -> Self {
        self.changeset = Some(changeset);
        self
    }
}

/// Result of one operation on a (stack, environment)
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionReport {
    pub stack: String,
    pub environment: String,
    pub operation: Operation,
    pub preview: bool,
    /// Units in apply order
    pub units: Vec<UnitReport>,
    /// Substituted stack config, sensitive values obfuscated
    pub config: Document,
    /// Version deployed
    pub version: Option<String>,
}

impl ProvisionReport {
    pub fn new(key: &StateKey, operation: Operation, preview: bool) -> Self {
        Self {
            stack: key.stack.clone(),
            environment: key.environment.clone(),
            operation,
            preview,
            units: Vec::new(),
            config: Document::map(),
            version: None,
        }
    }

    pub fn push(&mut self, unit: UnitReport) {
        self.units.push(unit);
    }

    pub fn unit(&self, name: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<&UnitStatus> {
        self.unit(name).map(|u| &u.status)
    }

    fn names_where(&self, predicate: impl Fn(&UnitStatus) -> bool) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| predicate(&u.status))
            .map(|u| u.name.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, UnitStatus::Succeeded))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, UnitStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, UnitStatus::Skipped { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.units.iter().all(|u| u.status.is_success())
    }

    /// No unit reached a driver's apply
    pub fn is_untouched(&self) -> bool {
        !self
            .units
            .iter()
            .any(|u| matches!(u.status, UnitStatus::Succeeded | UnitStatus::Failed { .. }))
    }

    /// Planned changes across units
    pub fn summary(&self) -> ChangeSummary {
        self.units
            .iter()
            .filter_map(|u| u.changeset.as_ref())
            .map(Changeset::summary)
            .fold(ChangeSummary::default(), |acc, s| acc + s)
    }
}

impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.preview { " (preview)" } else { "" };
        writeln!(
            f,
            "{} {}/{}{}",
            self.operation, self.stack, self.environment, mode
        )?;
        for unit in &self.units {
            writeln!(f, "  {} [{}]: {}", unit.name, unit.type_key, unit.status)?;
        }
        write!(f, "  {}", self.summary())
    }
}
