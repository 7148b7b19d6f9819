//! StackFlow Core
//!
//! Configuration model, provider registry and resolvers for StackFlow.
//!
//! ```text
//! .stackflow/stacks/*.yaml
//!          │
//!   ┌──────▼──────┐   ┌──────────────┐
//!   │   loader    │──▶│   registry   │  type keys → decoder / driver
//!   └──────┬──────┘   └──────────────┘
//!   ┌──────▼──────┐
//!   │ inheritance │  parent chain, deep merge, environments
//!   └──────┬──────┘
//!   ┌──────▼──────┐
//!   │ placeholder │  ${resource:..} ${secret:..} ${auth:..}
//!   └─────────────┘
//! ```

pub mod action;
pub mod discovery;
pub mod document;
pub mod error;
pub mod inheritance;
pub mod loader;
pub mod model;
pub mod parser;
pub mod placeholder;
pub mod provider;
pub mod registry;

// Re-exports
pub use action::{Action, ActionType, ChangeSummary, Changeset};
pub use discovery::{DiscoveredFiles, discover_files, find_project_root};
pub use document::{Document, Mapping};
pub use error::{
    ConfigError, DecodeError, DriverError, PlaceholderError, RegistryError, Result,
};
pub use inheritance::{MergedDescriptor, deep_merge, resolve, resolve_for_environment};
pub use loader::{Project, load, load_project, load_project_from_root, load_with_registry};
pub use model::{ResourceDefinition, StackDescriptor, StackKind, StacksMap, TemplateDefinition};
pub use parser::parse_descriptor;
pub use placeholder::{
    PlaceholderContext, PlaceholderToken, ResolveMode, Resolved, SecretLookup, SensitiveValues,
    Substituted, TokenKind, obfuscate,
};
pub use provider::{
    AppliedResource, AuthProvider, Credential, DecodedConfig, DesiredResource, Outputs,
    ResourceDriver, UnitKind,
};
pub use registry::{
    ConfigDecoder, DocumentDecoder, Driver, Namespace, Registry, RegistryBuilder, RegistryEntry,
    SerdeDecoder,
};
