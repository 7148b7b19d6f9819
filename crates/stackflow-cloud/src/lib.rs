//! StackFlow Cloud
//!
//! Provisioning orchestrator for StackFlow stacks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 stackflow CLI                    │
//! │     (provision / deploy / destroy / cancel)      │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                stackflow-cloud                   │
//! │  ┌──────────────┐  ┌──────────────┐             │
//! │  │ Provisioner  │──│  StateStore  │  lock, CAS  │
//! │  └──────┬───────┘  └──────────────┘             │
//! │         │ plan / apply / destroy                 │
//! └─────────┼───────────────────────────────────────┘
//!           │
//! ┌─────────▼───────┐
//! │ ResourceDriver  │  registered in stackflow-core
//! └─────────────────┘
//! ```

pub mod cancel;
pub mod error;
pub mod graph;
pub mod provisioner;
pub mod report;
pub mod retry;
pub mod state;

// Re-exports
pub use cancel::CancelToken;
pub use error::{ErrorKind, ProvisionError, Result, StateError};
pub use graph::{Cycle, Dependencies, dependency_order};
pub use provisioner::{
    DeployOptions, ProvisionOptions, Provisioner, ProvisionerOptions, VERSION_KEY, default_owner,
};
pub use report::{ProvisionReport, UnitReport, UnitStatus};
pub use retry::RetryConfig;
pub use state::{
    FileStateStore, LockInfo, MemoryStateStore, Operation, ProvisionState, ProvisionStatus,
    StateKey, StateStore,
};
