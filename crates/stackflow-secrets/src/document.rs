//! Secrets document
//!
//! ```yaml
//! version: 1
//! secrets:
//!   API_KEY:
//!     - recipient: age1...
//!       ciphertext: |
//!         -----BEGIN AGE ENCRYPTED FILE-----
//!         ...
//! ```
//!
//! Every secret carries one ciphertext per recipient.

use crate::error::{Result, SecretError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

pub const DOCUMENT_VERSION: u32 = 1;

/// One recipient's ciphertext of a secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// age public key (`age1...`)
    pub recipient: String,
    /// ASCII-armored age ciphertext
    pub ciphertext: String,
}

/// Encrypted secrets, persisted as YAML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsDocument {
    pub version: u32,
    #[serde(default)]
    pub secrets: BTreeMap<String, Vec<EncryptedValue>>,
}

impl Default for SecretsDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            secrets: BTreeMap::new(),
        }
    }
}

impl SecretsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SecretError::io(path, e))?;
        let document = Self::from_yaml_str(&content).map_err(|e| match e {
            SecretError::Parse { message, .. } => SecretError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        debug!(
            path = %path.display(),
            secrets = document.secrets.len(),
            "Loaded secrets document"
        );
        Ok(document)
    }

    /// Load from a YAML file, or an empty document if the file is missing
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let document: Self = serde_yaml::from_str(content).map_err(|e| SecretError::Parse {
            path: Default::default(),
            message: e.to_string(),
        })?;
        if document.version != DOCUMENT_VERSION {
            return Err(SecretError::UnsupportedVersion(document.version));
        }
        Ok(document)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| SecretError::Parse {
            path: Default::default(),
            message: e.to_string(),
        })
    }

    /// Write atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_yaml_string()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SecretError::io(parent, e))?;
        }
        let temp = path.with_extension("yaml.tmp");
        std::fs::write(&temp, content).map_err(|e| SecretError::io(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| SecretError::io(path, e))?;
        debug!(path = %path.display(), "Saved secrets document");
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.contains_key(name)
    }

    /// Every recipient appearing in the document
    pub fn recipients(&self) -> BTreeSet<String> {
        self.secrets
            .values()
            .flatten()
            .map(|v| v.recipient.clone())
            .collect()
    }

    /// Recipients of one secret
    pub fn recipients_of(&self, name: &str) -> Vec<String> {
        self.secrets
            .get(name)
            .map(|values| values.iter().map(|v| v.recipient.clone()).collect())
            .unwrap_or_default()
    }

    /// `NotFound` with the closest known name
    pub(crate) fn not_found(&self, name: &str) -> SecretError {
        let suggestion = self
            .names()
            .map(|k| (strsim::levenshtein(k, name), k))
            .filter(|(distance, _)| *distance <= 3)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, k)| k.to_string());
        SecretError::NotFound {
            name: name.to_string(),
            suggestion,
        }
    }
}
