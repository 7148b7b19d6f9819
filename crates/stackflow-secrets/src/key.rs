//! Key material
//!
//! The cryptor only needs the public keys a holder can decrypt for and a
//! decrypt operation. [`AgeIdentity`] implements this with an age x25519
//! identity file; other holders (agents, KMS) can implement [`KeyMaterial`].

use crate::error::{Result, SecretError};
use age::secrecy::ExposeSecret;
use age::x25519;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

/// Holder of private keys
pub trait KeyMaterial: Send + Sync {
    /// Public keys this holder can decrypt for
    fn public_keys(&self) -> Vec<String>;

    /// Decrypt an ASCII-armored age ciphertext
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// age x25519 identity
pub struct AgeIdentity {
    inner: x25519::Identity,
    path: Option<PathBuf>,
}

impl AgeIdentity {
    /// Load an identity file (`AGE-SECRET-KEY-...`)
    ///
    /// Comment lines starting with `#` are ignored, as written by `age-keygen`.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading identity");
        if !path.exists() {
            return Err(SecretError::IdentityNotFound(path.to_path_buf()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(path) {
                let mode = metadata.permissions().mode() & 0o777;
                if mode & 0o077 != 0 {
                    warn!(
                        path = %path.display(),
                        mode = format!("{:o}", mode),
                        "Identity file is readable by others. Run: chmod 600"
                    );
                }
            }
        }

        let contents =
            Zeroizing::new(fs::read_to_string(path).map_err(|e| SecretError::io(path, e))?);
        let key = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| SecretError::InvalidIdentity {
                path: path.to_path_buf(),
                message: "no key found".to_string(),
            })?;

        let inner = key
            .parse::<x25519::Identity>()
            .map_err(|e: &str| SecretError::InvalidIdentity {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(Self {
            inner,
            path: Some(path.to_path_buf()),
        })
    }

    /// Generate a new identity and write it with owner-only permissions
    pub fn generate(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Generating identity");
        let inner = x25519::Identity::generate();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SecretError::io(parent, e))?;
        }

        let secret = inner.to_string();
        let contents = Zeroizing::new(format!(
            "# public key: {}\n{}\n",
            inner.to_public(),
            secret.expose_secret()
        ));
        fs::write(path, contents.as_bytes()).map_err(|e| SecretError::io(path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| SecretError::io(path, e))?;
        }

        Ok(Self {
            inner,
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory identity that is never written to disk
    pub fn ephemeral() -> Self {
        Self {
            inner: x25519::Identity::generate(),
            path: None,
        }
    }

    pub fn public_key(&self) -> String {
        self.inner.to_public().to_string()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl KeyMaterial for AgeIdentity {
    fn public_keys(&self) -> Vec<String> {
        vec![self.public_key()]
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        trace!(ciphertext_len = ciphertext.len(), "decrypting");
        let failed = |message: String| SecretError::DecryptionFailed {
            name: String::new(),
            message,
        };

        let reader = age::armor::ArmoredReader::new(ciphertext);
        let decryptor = age::Decryptor::new(reader).map_err(|e| failed(e.to_string()))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        let mut reader = decryptor
            .decrypt(std::iter::once(&self.inner as &dyn age::Identity))
            .map_err(|e| failed(e.to_string()))?;
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| failed(e.to_string()))?;

        trace!(plaintext_len = plaintext.len(), "decrypted");
        Ok(plaintext)
    }
}

impl std::fmt::Debug for AgeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgeIdentity")
            .field("path", &self.path)
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Parse an age public key
pub fn parse_recipient(key: &str) -> Result<x25519::Recipient> {
    key.trim()
        .parse::<x25519::Recipient>()
        .map_err(|_| SecretError::InvalidRecipient(key.to_string()))
}
