//! Secrets cryptor
//!
//! Encrypts each secret once per recipient with age (x25519, ASCII armor)
//! and decrypts with whatever [`KeyMaterial`] the caller holds.

use crate::document::{EncryptedValue, SecretsDocument};
use crate::error::{Result, SecretError};
use crate::key::{KeyMaterial, parse_recipient};
use crate::store::SecretsStore;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

/// Result of [`decrypt_all`]
#[derive(Debug)]
pub struct DecryptOutcome {
    pub store: Arc<SecretsStore>,
    /// Secrets that could not be decrypted (only with `force_reveal`)
    pub skipped: Vec<String>,
}

/// Encrypt a plaintext for one recipient
pub fn encrypt_value(plaintext: &str, recipient: &str) -> Result<String> {
    let recipient = parse_recipient(recipient)?;
    trace!(plaintext_len = plaintext.len(), "encrypting");

    let encryptor =
        age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
            .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;

    let mut encrypted = Vec::new();
    let armor = age::armor::ArmoredWriter::wrap_output(&mut encrypted, age::armor::Format::AsciiArmor)
        .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;
    let mut writer = encryptor
        .wrap_output(armor)
        .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;
    writer
        .write_all(plaintext.as_bytes())
        .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;
    writer
        .finish()
        .and_then(|armor| armor.finish())
        .map_err(|e| SecretError::EncryptionFailed(e.to_string()))?;

    String::from_utf8(encrypted).map_err(|e| SecretError::EncryptionFailed(e.to_string()))
}

/// Encrypt every secret for every recipient
///
/// Ciphertexts are randomized: encrypting the same input twice yields
/// different documents that decrypt to the same values.
pub fn encrypt_all(
    plaintext: &BTreeMap<String, String>,
    recipients: &[String],
) -> Result<SecretsDocument> {
    if recipients.is_empty() {
        return Err(SecretError::NoRecipients);
    }
    for recipient in recipients {
        parse_recipient(recipient)?;
    }

    let mut document = SecretsDocument::new();
    for (name, value) in plaintext {
        document
            .secrets
            .insert(name.clone(), encrypt_for(value, recipients)?);
    }
    info!(
        secrets = document.secrets.len(),
        recipients = recipients.len(),
        "Encrypted secrets"
    );
    Ok(document)
}

fn encrypt_for(value: &str, recipients: &[String]) -> Result<Vec<EncryptedValue>> {
    recipients
        .iter()
        .map(|recipient| {
            Ok(EncryptedValue {
                recipient: recipient.clone(),
                ciphertext: encrypt_value(value, recipient)?,
            })
        })
        .collect()
}

/// Decrypt every secret the key material has access to
///
/// Without `force_reveal` the first secret with no matching recipient fails
/// with `KeyNotConfigured`. With it, such secrets are skipped and reported.
pub fn decrypt_all(
    document: &SecretsDocument,
    key_material: &dyn KeyMaterial,
    force_reveal: bool,
) -> Result<DecryptOutcome> {
    let mut values = Vec::with_capacity(document.secrets.len());
    let mut skipped = Vec::new();

    for name in document.names() {
        match decrypt_one(document, key_material, name) {
            Ok(value) => values.push((name.to_string(), value)),
            Err(err) if force_reveal => {
                warn!(secret = name, error = %err, "Skipping secret");
                skipped.push(name.to_string());
            }
            Err(err) => return Err(err),
        }
    }

    debug!(
        decrypted = values.len(),
        skipped = skipped.len(),
        "Decrypted secrets"
    );
    Ok(DecryptOutcome {
        store: Arc::new(values.into_iter().collect()),
        skipped,
    })
}

/// Decrypt a single secret
pub fn read_secret(
    document: &SecretsDocument,
    key_material: &dyn KeyMaterial,
    name: &str,
) -> Result<Zeroizing<String>> {
    if !document.contains(name) {
        return Err(document.not_found(name));
    }
    decrypt_one(document, key_material, name)
}

fn decrypt_one(
    document: &SecretsDocument,
    key_material: &dyn KeyMaterial,
    name: &str,
) -> Result<Zeroizing<String>> {
    let values = document
        .secrets
        .get(name)
        .ok_or_else(|| document.not_found(name))?;
    let keys = key_material.public_keys();

    let entry = values
        .iter()
        .find(|v| keys.contains(&v.recipient))
        .ok_or_else(|| SecretError::KeyNotConfigured {
            name: name.to_string(),
            recipients: values.iter().map(|v| v.recipient.clone()).collect(),
        })?;

    let bytes = key_material
        .decrypt(entry.ciphertext.as_bytes())
        .map_err(|e| with_name(e, name))?;
    let text = String::from_utf8(bytes.to_vec()).map_err(|_| SecretError::DecryptionFailed {
        name: name.to_string(),
        message: "plaintext is not UTF-8".to_string(),
    })?;
    Ok(Zeroizing::new(text))
}

fn with_name(err: SecretError, name: &str) -> SecretError {
    match err {
        SecretError::DecryptionFailed { message, .. } => SecretError::DecryptionFailed {
            name: name.to_string(),
            message,
        },
        other => other,
    }
}

/// Add or replace a secret, encrypted for `recipients`
pub fn add_secret(
    document: &mut SecretsDocument,
    name: &str,
    value: &str,
    recipients: &[String],
) -> Result<()> {
    if recipients.is_empty() {
        return Err(SecretError::NoRecipients);
    }
    let encrypted = encrypt_for(value, recipients)?;
    if document.secrets.insert(name.to_string(), encrypted).is_some() {
        info!(secret = name, "Replaced secret");
    } else {
        info!(secret = name, "Added secret");
    }
    Ok(())
}

/// Remove a secret
pub fn remove_secret(document: &mut SecretsDocument, name: &str) -> Result<()> {
    if document.secrets.remove(name).is_none() {
        return Err(document.not_found(name));
    }
    info!(secret = name, "Removed secret");
    Ok(())
}

/// Give a new recipient access to every secret
///
/// Each secret is decrypted with `key_material` and re-encrypted for the
/// new recipient; existing ciphertexts are kept.
pub fn add_recipient(
    document: &mut SecretsDocument,
    key_material: &dyn KeyMaterial,
    recipient: &str,
) -> Result<usize> {
    parse_recipient(recipient)?;

    let names: Vec<String> = document.names().map(str::to_string).collect();
    let mut added = 0;
    for name in names {
        if document.recipients_of(&name).iter().any(|r| r == recipient) {
            continue;
        }
        let plaintext = decrypt_one(document, key_material, &name)?;
        let ciphertext = encrypt_value(&plaintext, recipient)?;
        if let Some(values) = document.secrets.get_mut(&name) {
            values.push(EncryptedValue {
                recipient: recipient.to_string(),
                ciphertext,
            });
            added += 1;
        }
    }
    info!(recipient, secrets = added, "Added recipient");
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::AgeIdentity;

    fn plaintext() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("API_KEY".to_string(), "sk-live-123".to_string()),
            ("DB_PASSWORD".to_string(), "hunter2".to_string()),
        ])
    }

    #[test]
    fn test_round_trip_with_two_recipients() {
        let alice = AgeIdentity::ephemeral();
        let bob = AgeIdentity::ephemeral();
        let recipients = vec![alice.public_key(), bob.public_key()];

        let document = encrypt_all(&plaintext(), &recipients).unwrap();
        assert_eq!(document.secrets["API_KEY"].len(), 2);

        for identity in [&alice, &bob] {
            let outcome = decrypt_all(&document, identity, false).unwrap();
            assert!(outcome.skipped.is_empty());
            assert_eq!(outcome.store.get("API_KEY"), Some("sk-live-123"));
            assert_eq!(outcome.store.get("DB_PASSWORD"), Some("hunter2"));
        }
    }

    #[test]
    fn test_repeated_encryption_round_trips() {
        let alice = AgeIdentity::ephemeral();
        let recipients = vec![alice.public_key()];

        let first = encrypt_all(&plaintext(), &recipients).unwrap();
        let second = encrypt_all(&plaintext(), &recipients).unwrap();

        let a = decrypt_all(&first, &alice, false).unwrap();
        let b = decrypt_all(&second, &alice, false).unwrap();
        assert_eq!(a.store.get("API_KEY"), Some("sk-live-123"));
        assert_eq!(b.store.get("API_KEY"), Some("sk-live-123"));
    }

    #[test]
    fn test_unmatched_key_fails_or_skips() {
        let alice = AgeIdentity::ephemeral();
        let mallory = AgeIdentity::ephemeral();
        let document = encrypt_all(&plaintext(), &[alice.public_key()]).unwrap();

        let err = decrypt_all(&document, &mallory, false).unwrap_err();
        assert!(matches!(err, SecretError::KeyNotConfigured { ref name, .. } if name == "API_KEY"));

        let outcome = decrypt_all(&document, &mallory, true).unwrap();
        assert!(outcome.store.is_empty());
        assert_eq!(outcome.skipped, vec!["API_KEY", "DB_PASSWORD"]);
    }

    #[test]
    fn test_read_secret() {
        let alice = AgeIdentity::ephemeral();
        let document = encrypt_all(&plaintext(), &[alice.public_key()]).unwrap();

        assert_eq!(read_secret(&document, &alice, "DB_PASSWORD").unwrap().as_str(), "hunter2");
        assert!(matches!(
            read_secret(&document, &alice, "DB_PASSWORD2"),
            Err(SecretError::NotFound { .. })
        ));
    }

    #[test]
    fn test_add_and_remove_secret() {
        let alice = AgeIdentity::ephemeral();
        let mut document = SecretsDocument::new();

        add_secret(&mut document, "TOKEN", "abc", &[alice.public_key()]).unwrap();
        assert_eq!(read_secret(&document, &alice, "TOKEN").unwrap().as_str(), "abc");

        add_secret(&mut document, "TOKEN", "xyz", &[alice.public_key()]).unwrap();
        assert_eq!(read_secret(&document, &alice, "TOKEN").unwrap().as_str(), "xyz");

        remove_secret(&mut document, "TOKEN").unwrap();
        assert!(!document.contains("TOKEN"));
        assert!(remove_secret(&mut document, "TOKEN").is_err());
    }

    #[test]
    fn test_add_recipient_grants_access() {
        let alice = AgeIdentity::ephemeral();
        let bob = AgeIdentity::ephemeral();
        let mut document = encrypt_all(&plaintext(), &[alice.public_key()]).unwrap();
        assert!(decrypt_all(&document, &bob, false).is_err());

        let added = add_recipient(&mut document, &alice, &bob.public_key()).unwrap();
        assert_eq!(added, 2);
        let outcome = decrypt_all(&document, &bob, false).unwrap();
        assert_eq!(outcome.store.get("API_KEY"), Some("sk-live-123"));

        // A second grant is a no-op
        assert_eq!(add_recipient(&mut document, &alice, &bob.public_key()).unwrap(), 0);
    }

    #[test]
    fn test_rejects_invalid_recipient_and_empty_set() {
        assert!(matches!(
            encrypt_all(&plaintext(), &["not-a-key".to_string()]),
            Err(SecretError::InvalidRecipient(_))
        ));
        assert!(matches!(
            encrypt_all(&plaintext(), &[]),
            Err(SecretError::NoRecipients)
        ));
    }
}
