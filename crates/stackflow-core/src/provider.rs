//! Resource driver and auth provider traits
//!
//! This is the seam between the generic core and cloud-specific code.
//! Providers implement these traits and hand them to the registry; the core
//! never branches on a provider name.

use crate::action::Changeset;
use crate::document::Document;
use crate::error::DriverError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Output properties published by an applied resource
pub type Outputs = BTreeMap<String, Document>;

/// Value produced by a provider decoder
pub type DecodedConfig = Arc<dyn Any + Send + Sync>;

/// Resource driver registered per type key
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Returns the provider name (e.g., "local", "aws")
    fn name(&self) -> &str;

    /// Calculate the changes needed to converge `current` to `desired`
    async fn plan(
        &self,
        desired: &DesiredResource,
        current: Option<&AppliedResource>,
    ) -> Result<Changeset, DriverError>;

    /// Apply a changeset and return the resource outputs
    async fn apply(&self, changeset: &Changeset) -> Result<Outputs, DriverError>;

    /// Destroy a previously applied resource
    ///
    /// `applied.config` carries substituted secret and credential values,
    /// unlike the persisted record.
    async fn destroy(&self, applied: &AppliedResource) -> Result<(), DriverError>;
}

/// Short-lived credential source used by `${auth:<provider>}`
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Request a credential. May fail transiently.
    async fn credential(&self, config: &Document) -> Result<Credential, DriverError>;
}

/// Short-lived credential
#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Whether a unit is a declared resource or the stack's own deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Resource,
    Stack,
}

/// Fully substituted resource handed to a driver's plan
#[derive(Clone)]
pub struct DesiredResource {
    pub name: String,
    pub type_key: String,
    pub owner: String,
    pub kind: UnitKind,
    pub config: Document,
    /// `config` with secret and credential values obfuscated. This is what
    /// gets persisted, so diffs against applied state compare this form.
    pub redacted: Document,
    /// Digest of the secret values in `config`; see [`Resolved::secret_digest`]
    ///
    /// [`Resolved::secret_digest`]: crate::placeholder::Resolved::secret_digest
    pub secret_digest: Option<String>,
    /// Output of the provider's decoder for `config`
    pub typed: DecodedConfig,
}

impl DesiredResource {
    /// Downcast the decoded config to the provider's type
    pub fn typed<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.typed.downcast_ref::<T>()
    }
}

impl fmt::Debug for DesiredResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredResource")
            .field("name", &self.name)
            .field("type_key", &self.type_key)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Persisted record of an applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedResource {
    pub name: String,
    pub type_key: String,
    /// Stack that declared the resource
    pub owner: String,
    pub kind: UnitKind,
    /// Configuration the resource was applied with, secrets obfuscated
    pub config: Document,
    /// Digest of the secret values the resource was applied with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_digest: Option<String>,
    /// Configuration before substitution. Destroy substitutes it again so
    /// drivers see real secret and credential values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Document>,
    pub outputs: Outputs,
    /// Resources of the same run this one was applied after
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

impl AppliedResource {
    pub fn new(
        name: impl Into<String>,
        type_key: impl Into<String>,
        owner: impl Into<String>,
        kind: UnitKind,
        config: Document,
    ) -> Self {
        Self {
            name: name.into(),
            type_key: type_key.into(),
            owner: owner.into(),
            kind,
            config,
            secret_digest: None,
            template: None,
            outputs: Outputs::new(),
            depends_on: Vec::new(),
            applied_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Document) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }
}
