//! Shell command runner
//!
//! Runs the argv of a `command` resource and parses its stdout.

use crate::error::{LocalError, Result};
use serde::{Deserialize, Serialize};
use stackflow_core::{Document, Outputs};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Config of a `command` resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    /// argv run on create and update
    pub apply: Vec<String>,

    /// argv run on destroy
    #[serde(default)]
    pub destroy: Option<Vec<String>>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// Command invocation for one resource
pub struct CommandRunner<'a> {
    resource: &'a str,
    config: &'a CommandConfig,
}

impl<'a> CommandRunner<'a> {
    pub fn new(resource: &'a str, config: &'a CommandConfig) -> Self {
        Self { resource, config }
    }

    /// Run the apply argv and return its outputs
    pub async fn apply(&self, action: &str) -> Result<Outputs> {
        let stdout = self.run(&self.config.apply, action).await?;
        parse_outputs(&stdout)
    }

    /// Run the destroy argv, if any
    pub async fn destroy(&self) -> Result<()> {
        match &self.config.destroy {
            Some(argv) => self.run(argv, "delete").await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn run(&self, argv: &[String], action: &str) -> Result<String> {
        let (program, args) = argv.split_first().ok_or(LocalError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&self.config.env);
        cmd.env("STACKFLOW_RESOURCE", self.resource);
        cmd.env("STACKFLOW_ACTION", action);
        if let Some(dir) = &self.config.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // argv may carry substituted secrets
        tracing::debug!(resource = %self.resource, %program, action, "Running command");

        let output = cmd.output().await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => LocalError::CommandNotFound(program.clone()),
            _ => LocalError::IoError(e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LocalError::CommandFailed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Empty stdout means no outputs; anything else must be a JSON object
pub fn parse_outputs(stdout: &str) -> Result<Outputs> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Outputs::new());
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, Document::from(v)))
            .collect()),
        other => Err(LocalError::InvalidOutput(other.to_string())),
    }
}
