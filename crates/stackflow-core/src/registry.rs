//! Provider registry
//!
//! Maps `(namespace, type key)` to provider-supplied decode and driver logic.
//! Providers are registered explicitly by the host during startup through a
//! [`RegistryBuilder`]; once built, the [`Registry`] is immutable and can be
//! shared across tasks without synchronization.

use crate::document::Document;
use crate::error::{DecodeError, RegistryError};
use crate::provider::{AuthProvider, DecodedConfig, ResourceDriver};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Independent key namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Resource,
    Template,
    Auth,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Resource => write!(f, "resource"),
            Namespace::Template => write!(f, "template"),
            Namespace::Auth => write!(f, "auth"),
        }
    }
}

/// Typed decode step a provider runs on a raw config document
pub trait ConfigDecoder: Send + Sync {
    fn decode(&self, config: &Document) -> Result<DecodedConfig, DecodeError>;
}

/// Decoder for any serde-deserializable provider type
pub struct SerdeDecoder<T>(PhantomData<fn() -> T>);

impl<T> SerdeDecoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for SerdeDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConfigDecoder for SerdeDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn decode(&self, config: &Document) -> Result<DecodedConfig, DecodeError> {
        let value: T = config.decode()?;
        Ok(Arc::new(value))
    }
}

/// Accepts any document and hands it through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentDecoder;

impl ConfigDecoder for DocumentDecoder {
    fn decode(&self, config: &Document) -> Result<DecodedConfig, DecodeError> {
        Ok(Arc::new(config.clone()))
    }
}

/// Driver half of a registry entry, one variant per namespace
#[derive(Clone)]
pub enum Driver {
    Resource(Arc<dyn ResourceDriver>),
    /// Templates may deploy the stack itself; infrastructure templates usually don't
    Template(Option<Arc<dyn ResourceDriver>>),
    Auth(Arc<dyn AuthProvider>),
}

impl Driver {
    pub fn namespace(&self) -> Namespace {
        match self {
            Driver::Resource(_) => Namespace::Resource,
            Driver::Template(_) => Namespace::Template,
            Driver::Auth(_) => Namespace::Auth,
        }
    }
}

/// One registered type key
#[derive(Clone)]
pub struct RegistryEntry {
    pub namespace: Namespace,
    pub type_key: String,
    pub decoder: Arc<dyn ConfigDecoder>,
    pub driver: Driver,
}

impl RegistryEntry {
    /// Run the provider decoder
    pub fn decode(&self, config: &Document) -> Result<DecodedConfig, DecodeError> {
        self.decoder.decode(config)
    }

    /// Driver that plans/applies this entry (resource driver or template deployer)
    pub fn resource_driver(&self) -> Option<&Arc<dyn ResourceDriver>> {
        match &self.driver {
            Driver::Resource(driver) => Some(driver),
            Driver::Template(driver) => driver.as_ref(),
            Driver::Auth(_) => None,
        }
    }

    pub fn auth_provider(&self) -> Option<&Arc<dyn AuthProvider>> {
        match &self.driver {
            Driver::Auth(provider) => Some(provider),
            _ => None,
        }
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("namespace", &self.namespace)
            .field("type_key", &self.type_key)
            .finish_non_exhaustive()
    }
}

type Table = HashMap<Namespace, BTreeMap<String, RegistryEntry>>;

/// Startup-phase registry builder
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Table,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type key. Duplicate keys within a namespace are rejected.
    pub fn register(
        &mut self,
        namespace: Namespace,
        type_key: impl Into<String>,
        decoder: Arc<dyn ConfigDecoder>,
        driver: Driver,
    ) -> Result<&mut Self, RegistryError> {
        let type_key = type_key.into();
        if driver.namespace() != namespace {
            return Err(RegistryError::DriverMismatch {
                namespace,
                key: type_key,
            });
        }

        let table = self.entries.entry(namespace).or_default();
        if table.contains_key(&type_key) {
            return Err(RegistryError::Duplicate {
                namespace,
                key: type_key,
            });
        }

        debug!(%namespace, type_key = %type_key, "Registering provider entry");
        table.insert(
            type_key.clone(),
            RegistryEntry {
                namespace,
                type_key,
                decoder,
                driver,
            },
        );
        Ok(self)
    }

    pub fn register_resource(
        &mut self,
        type_key: impl Into<String>,
        decoder: impl ConfigDecoder + 'static,
        driver: impl ResourceDriver + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.register(
            Namespace::Resource,
            type_key,
            Arc::new(decoder),
            Driver::Resource(Arc::new(driver)),
        )
    }

    pub fn register_template(
        &mut self,
        type_key: impl Into<String>,
        decoder: impl ConfigDecoder + 'static,
        deployer: Option<Arc<dyn ResourceDriver>>,
    ) -> Result<&mut Self, RegistryError> {
        self.register(
            Namespace::Template,
            type_key,
            Arc::new(decoder),
            Driver::Template(deployer),
        )
    }

    pub fn register_auth(
        &mut self,
        type_key: impl Into<String>,
        decoder: impl ConfigDecoder + 'static,
        provider: impl AuthProvider + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.register(
            Namespace::Auth,
            type_key,
            Arc::new(decoder),
            Driver::Auth(Arc::new(provider)),
        )
    }

    /// Freeze the registry
    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
        }
    }
}

/// Immutable provider registry
#[derive(Default)]
pub struct Registry {
    entries: Table,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up an entry; the error lists known keys to surface typos
    pub fn lookup(&self, namespace: Namespace, type_key: &str) -> Result<&RegistryEntry, RegistryError> {
        let table = self.entries.get(&namespace);
        if let Some(entry) = table.and_then(|t| t.get(type_key)) {
            return Ok(entry);
        }

        let known: Vec<String> = table
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        let suggestion = known
            .iter()
            .map(|k| (strsim::levenshtein(k, type_key), k))
            .filter(|(distance, _)| *distance <= 3)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, k)| k.clone());

        Err(RegistryError::NotFound {
            namespace,
            key: type_key.to_string(),
            known,
            suggestion,
        })
    }

    pub fn contains(&self, namespace: Namespace, type_key: &str) -> bool {
        self.entries
            .get(&namespace)
            .is_some_and(|t| t.contains_key(type_key))
    }

    /// All entries of a namespace, sorted by key. Introspection only.
    pub fn get_all(&self, namespace: Namespace) -> Vec<&RegistryEntry> {
        self.entries
            .get(&namespace)
            .map(|t| t.values().collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Registry");
        for namespace in [Namespace::Resource, Namespace::Template, Namespace::Auth] {
            let keys: Vec<&str> = self
                .get_all(namespace)
                .iter()
                .map(|e| e.type_key.as_str())
                .collect();
            debug.field(&namespace.to_string(), &keys);
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Changeset;
    use crate::error::DriverError;
    use crate::provider::{AppliedResource, Credential, DesiredResource, Outputs};
    use async_trait::async_trait;
    use serde::Deserialize;

    struct NullDriver;

    #[async_trait]
    impl ResourceDriver for NullDriver {
        fn name(&self) -> &str {
            "null"
        }

        async fn plan(
            &self,
            desired: &DesiredResource,
            current: Option<&AppliedResource>,
        ) -> Result<Changeset, DriverError> {
            Ok(Changeset::diff(desired, current))
        }

        async fn apply(&self, _changeset: &Changeset) -> Result<Outputs, DriverError> {
            Ok(Outputs::new())
        }

        async fn destroy(&self, _applied: &AppliedResource) -> Result<(), DriverError> {
            Ok(())
        }
    }

    struct StaticAuth;

    #[async_trait]
    impl AuthProvider for StaticAuth {
        fn name(&self) -> &str {
            "static"
        }

        async fn credential(&self, _config: &Document) -> Result<Credential, DriverError> {
            Ok(Credential::new("token"))
        }
    }

    #[derive(Debug, Deserialize)]
    struct PostgresConfig {
        version: u32,
    }

    fn sample() -> Registry {
        let mut builder = Registry::builder();
        builder
            .register_resource("postgres", SerdeDecoder::<PostgresConfig>::new(), NullDriver)
            .unwrap()
            .register_template("application", DocumentDecoder, None)
            .unwrap()
            .register_auth("gcp", DocumentDecoder, StaticAuth)
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_lookup_found() {
        let registry = sample();
        let entry = registry.lookup(Namespace::Resource, "postgres").unwrap();
        assert_eq!(entry.type_key, "postgres");
        assert!(entry.resource_driver().is_some());
        assert!(registry.lookup(Namespace::Auth, "gcp").unwrap().auth_provider().is_some());
    }

    #[test]
    fn test_namespaces_are_independent() {
        let registry = sample();
        assert!(registry.contains(Namespace::Template, "application"));
        assert!(!registry.contains(Namespace::Resource, "application"));

        let mut builder = Registry::builder();
        builder
            .register_resource("shared", DocumentDecoder, NullDriver)
            .unwrap()
            .register_template("shared", DocumentDecoder, None)
            .unwrap();
        let registry = builder.build();
        assert!(registry.contains(Namespace::Resource, "shared"));
        assert!(registry.contains(Namespace::Template, "shared"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut builder = Registry::builder();
        builder
            .register_resource("postgres", DocumentDecoder, NullDriver)
            .unwrap();
        let err = builder
            .register_resource("postgres", DocumentDecoder, NullDriver)
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                namespace: Namespace::Resource,
                key: "postgres".to_string()
            }
        );
    }

    #[test]
    fn test_driver_must_match_namespace() {
        let mut builder = Registry::builder();
        let result = builder.register(
            Namespace::Auth,
            "postgres",
            Arc::new(DocumentDecoder),
            Driver::Resource(Arc::new(NullDriver)),
        );
        assert!(matches!(result, Err(RegistryError::DriverMismatch { .. })));
    }

    #[test]
    fn test_not_found_lists_known_keys_and_suggests() {
        let registry = sample();
        let err = registry.lookup(Namespace::Resource, "postgress").unwrap_err();
        match &err {
            RegistryError::NotFound {
                known, suggestion, ..
            } => {
                assert_eq!(known, &vec!["postgres".to_string()]);
                assert_eq!(suggestion.as_deref(), Some("postgres"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("did you mean 'postgres'"));
    }

    #[test]
    fn test_serde_decoder() {
        let registry = sample();
        let entry = registry.lookup(Namespace::Resource, "postgres").unwrap();

        let ok = Document::from_yaml_str("version: 16").unwrap();
        let decoded = entry.decode(&ok).unwrap();
        assert_eq!(decoded.downcast_ref::<PostgresConfig>().unwrap().version, 16);

        let bad = Document::from_yaml_str("version: latest").unwrap();
        assert!(entry.decode(&bad).is_err());
    }

    #[test]
    fn test_get_all_sorted() {
        let mut builder = Registry::builder();
        for key in ["zeta", "alpha", "mid"] {
            builder
                .register_resource(key, DocumentDecoder, NullDriver)
                .unwrap();
        }
        let registry = builder.build();
        let keys: Vec<&str> = registry
            .get_all(Namespace::Resource)
            .iter()
            .map(|e| e.type_key.as_str())
            .collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
        assert!(registry.get_all(Namespace::Auth).is_empty());
    }
}
