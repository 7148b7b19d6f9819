//! Changeset types produced by a driver's plan

use crate::document::Document;
use crate::provider::{AppliedResource, DesiredResource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Represents a planned action for a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Deterministic identifier (`<resource>:<action>`)
    pub id: String,

    /// Type of action to perform
    pub action_type: ActionType,

    /// Resource type key (e.g., "postgres", "static")
    pub resource_type: String,

    /// Resource name
    pub resource_id: String,

    /// Description of the action
    pub description: String,

    /// Additional driver-specific details
    pub details: BTreeMap<String, Document>,
}

impl Action {
    pub fn new(
        action_type: ActionType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let resource_id = resource_id.into();
        Self {
            id: format!("{}:{}", resource_id, action_type),
            action_type,
            resource_type: resource_type.into(),
            resource_id,
            description: description.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Document) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Create/update/delete operations computed for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// Resource name
    pub resource: String,

    /// Resource type key
    pub resource_type: String,

    /// List of actions to perform
    pub actions: Vec<Action>,

    /// Whether the changeset has any changes
    pub has_changes: bool,

    /// Fully substituted configuration the apply should converge to
    pub desired: Document,

    /// Outputs recorded by the previous apply, if any
    pub previous_outputs: BTreeMap<String, Document>,
}

impl Changeset {
    pub fn new(
        resource: impl Into<String>,
        resource_type: impl Into<String>,
        actions: Vec<Action>,
        desired: Document,
    ) -> Self {
        let has_changes = actions.iter().any(|a| a.action_type != ActionType::NoOp);
        Self {
            resource: resource.into(),
            resource_type: resource_type.into(),
            actions,
            has_changes,
            desired,
            previous_outputs: BTreeMap::new(),
        }
    }

    /// Default diff: create when absent, update when the config or one of
    /// its secrets changed
    pub fn diff(desired: &DesiredResource, current: Option<&AppliedResource>) -> Self {
        let (action_type, description) = match current {
            None => (ActionType::Create, format!("create {}", desired.name)),
            Some(applied) if applied.config != desired.redacted => {
                (ActionType::Update, format!("update {}", desired.name))
            }
            Some(applied) if applied.secret_digest != desired.secret_digest => (
                ActionType::Update,
                format!("update {} (secret changed)", desired.name),
            ),
            Some(_) => (ActionType::NoOp, format!("{} is up to date", desired.name)),
        };
        let action = Action::new(action_type, &desired.type_key, &desired.name, description);
        let mut changeset = Self::new(
            &desired.name,
            &desired.type_key,
            vec![action],
            desired.config.clone(),
        );
        if let Some(applied) = current {
            changeset.previous_outputs = applied.outputs.clone();
        }
        changeset
    }

    /// Deletion changeset for a persisted resource
    pub fn delete(applied: &AppliedResource) -> Self {
        let action = Action::new(
            ActionType::Delete,
            &applied.type_key,
            &applied.name,
            format!("delete {}", applied.name),
        );
        let mut changeset = Self::new(
            &applied.name,
            &applied.type_key,
            vec![action],
            applied.config.clone(),
        );
        changeset.previous_outputs = applied.outputs.clone();
        changeset
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Summary of the changeset
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            delete: self.actions_by_type(ActionType::Delete).len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::ops::Add for ChangeSummary {
    type Output = ChangeSummary;

    fn add(self, other: ChangeSummary) -> ChangeSummary {
        ChangeSummary {
            create: self.create + other.create,
            update: self.update + other.update,
            delete: self.delete + other.delete,
            no_change: self.no_change + other.no_change,
        }
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_change
        )
    }
}
