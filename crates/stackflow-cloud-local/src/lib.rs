//! Local providers for StackFlow
//!
//! Providers that need no cloud account. Useful for development stacks,
//! for wrapping existing scripts, and in tests.
//!
//! # Example
//!
//! ```ignore
//! use stackflow_core::Registry;
//!
//! let mut builder = Registry::builder();
//! stackflow_cloud_local::register(&mut builder)?;
//! let registry = builder.build();
//! ```
//!
//! ```yaml
//! resources:
//!   - name: db
//!     type: command
//!     config:
//!       apply: [./scripts/create-db.sh]
//!       destroy: [./scripts/drop-db.sh]
//! ```

pub mod command;
pub mod error;
pub mod provider;

pub use command::{CommandConfig, CommandRunner};
pub use error::{LocalError, Result};
pub use provider::{
    CommandDriver, DEFAULT_TOKEN_VARIABLE, EnvAuth, EnvAuthConfig, StaticDriver, register,
};
