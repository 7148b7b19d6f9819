//! Local provider implementation

use crate::command::{CommandConfig, CommandRunner};
use crate::error::LocalError;
use async_trait::async_trait;
use serde::Deserialize;
use stackflow_core::{
    ActionType, AppliedResource, AuthProvider, Changeset, Credential, DesiredResource,
    Document, DocumentDecoder, DriverError, Outputs, RegistryBuilder, RegistryError,
    ResourceDriver, SerdeDecoder,
};
use std::sync::Arc;

/// Variable read by the `env` auth provider when none is configured
pub const DEFAULT_TOKEN_VARIABLE: &str = "STACKFLOW_TOKEN";

/// Register every local type key
///
/// | namespace | key              | driver          |
/// |-----------|------------------|-----------------|
/// | resource  | `static`         | [`StaticDriver`]  |
/// | resource  | `command`        | [`CommandDriver`] |
/// | template  | `infrastructure` | none            |
/// | template  | `application`    | [`StaticDriver`]  |
/// | auth      | `env`            | [`EnvAuth`]       |
pub fn register(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder
        .register_resource("static", DocumentDecoder, StaticDriver)?
        .register_resource("command", SerdeDecoder::<CommandConfig>::new(), CommandDriver)?
        .register_template("infrastructure", DocumentDecoder, None)?
        .register_template("application", DocumentDecoder, Some(Arc::new(StaticDriver)))?
        .register_auth("env", SerdeDecoder::<EnvAuthConfig>::new(), EnvAuth)?;
    Ok(())
}

/// Resource whose outputs are its own config
///
/// Outputs are the `outputs` map of the config when present, otherwise the
/// whole config.
pub struct StaticDriver;

impl StaticDriver {
    fn outputs(config: &Document) -> Outputs {
        let source = config.get("outputs").unwrap_or(config);
        source
            .as_map()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResourceDriver for StaticDriver {
    fn name(&self) -> &str {
        "static"
    }

    async fn plan(
        &self,
        desired: &DesiredResource,
        current: Option<&AppliedResource>,
    ) -> Result<Changeset, DriverError> {
        Ok(Changeset::diff(desired, current))
    }

    async fn apply(&self, changeset: &Changeset) -> Result<Outputs, DriverError> {
        tracing::debug!(resource = %changeset.resource, "Recording static outputs");
        Ok(Self::outputs(&changeset.desired))
    }

    async fn destroy(&self, applied: &AppliedResource) -> Result<(), DriverError> {
        tracing::debug!(resource = %applied.name, "Forgetting static resource");
        Ok(())
    }
}

/// Resource created and destroyed by shell commands
///
/// The apply command's stdout, if any, is a JSON object of outputs.
pub struct CommandDriver;

fn command_config(config: &Document) -> Result<CommandConfig, DriverError> {
    Ok(config.decode::<CommandConfig>()?)
}

#[async_trait]
impl ResourceDriver for CommandDriver {
    fn name(&self) -> &str {
        "command"
    }

    async fn plan(
        &self,
        desired: &DesiredResource,
        current: Option<&AppliedResource>,
    ) -> Result<Changeset, DriverError> {
        Ok(Changeset::diff(desired, current))
    }

    async fn apply(&self, changeset: &Changeset) -> Result<Outputs, DriverError> {
        let config = command_config(&changeset.desired)?;
        let action = if changeset.actions_by_type(ActionType::Update).is_empty() {
            "create"
        } else {
            "update"
        };
        let outputs = CommandRunner::new(&changeset.resource, &config)
            .apply(action)
            .await?;
        tracing::info!(resource = %changeset.resource, outputs = outputs.len(), "Command applied");
        Ok(outputs)
    }

    async fn destroy(&self, applied: &AppliedResource) -> Result<(), DriverError> {
        let config = command_config(&applied.config)?;
        CommandRunner::new(&applied.name, &config).destroy().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvAuthConfig {
    #[serde(default = "default_variable")]
    pub variable: String,
}

fn default_variable() -> String {
    DEFAULT_TOKEN_VARIABLE.to_string()
}

/// Credential read from an environment variable
pub struct EnvAuth;

#[async_trait]
impl AuthProvider for EnvAuth {
    fn name(&self) -> &str {
        "env"
    }

    async fn credential(&self, config: &Document) -> Result<Credential, DriverError> {
        let config = if config.is_null() {
            EnvAuthConfig {
                variable: default_variable(),
            }
        } else {
            config.decode::<EnvAuthConfig>()?
        };
        let token = std::env::var(&config.variable)
            .map_err(|_| LocalError::MissingVariable(config.variable.clone()))?;
        Ok(Credential::new(token))
    }
}
