//! StackFlow Secrets
//!
//! age-encrypted secrets document (`.stackflow/secrets.yaml`), key material
//! and the decrypted [`SecretsStore`] used by `${secret:<name>}`.

pub mod cryptor;
pub mod document;
pub mod error;
pub mod key;
pub mod store;

// Re-exports
pub use cryptor::{
    DecryptOutcome, add_recipient, add_secret, decrypt_all, encrypt_all, encrypt_value,
    read_secret, remove_secret,
};
pub use document::{DOCUMENT_VERSION, EncryptedValue, SecretsDocument};
pub use error::{Result, SecretError};
pub use key::{AgeIdentity, KeyMaterial, parse_recipient};
pub use stackflow_core::obfuscate;
pub use store::SecretsStore;
