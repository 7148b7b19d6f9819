use stackflow_core::SecretLookup;
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// Decrypted secrets
///
/// Immutable once built; values are wiped from memory on drop.
/// Share between tasks through `Arc<SecretsStore>`.
#[derive(Default)]
pub struct SecretsStore {
    values: BTreeMap<String, Zeroizing<String>>,
}

impl SecretsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Zeroizing<String>)> for SecretsStore {
    fn from_iter<I: IntoIterator<Item = (String, Zeroizing<String>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl FromIterator<(String, String)> for SecretsStore {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k, Zeroizing::new(v)))
            .collect()
    }
}

impl SecretLookup for SecretsStore {
    fn secret(&self, name: &str) -> Option<&str> {
        self.get(name)
    }
}

impl fmt::Debug for SecretsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsStore")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}
