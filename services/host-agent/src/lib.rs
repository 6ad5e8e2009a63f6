//! kiln Host Agent Library
//!
//! The host agent keeps the microVMs declared on this host converged with
//! their specs. Clients declare, update and delete specs through
//! [`MicroVmCommands`]; the [`Controller`] notices through the event bus (or
//! its periodic resync) and drives each VM there through a pluggable
//! hypervisor provider and the host's network, image and disk services.
//!
//! ## Architecture
//!
//! ```text
//! MicroVmCommands ──spec──> MicroVmRepository <──status── Controller
//!        │                                                   │  ▲
//!        └───────── vm.created / vm.updated / vm.deleted ────┘  │ resync
//!                                                               │
//!                         machine::plan ──> Executor ──> MicroVmProvider
//!                                                    ├─> NetworkService
//!                                                    ├─> ImageService
//!                                                    └─> DiskService
//! ```
//!
//! ## Modules
//!
//! - `machine`: pure planner from (spec, status) to ordered steps
//! - `executor`: runs a plan against the adapters
//! - `controller`: event loop, single-flight, retry and delete deadline
//! - `repository`: SQLite and in-memory spec/status stores
//! - `network`: TAP adapter over iproute2
//! - `mock`: in-memory adapters with a shared call log

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod machine;
pub mod mock;
pub mod network;
pub mod ports;
pub mod provider;
pub mod repository;

// Re-export commonly used types
pub use commands::MicroVmCommands;
pub use config::{Config, ReconcileConfig};
pub use controller::{Controller, ReconcileOutcome, Requeue};
pub use error::{
    CommandError, ControllerError, ErrorClass, PlanError, PortError, PortResult,
    ReconcileStepError, RepositoryError,
};
pub use executor::{Executor, PassOutcome};
pub use machine::PlanContext;
pub use provider::{Capability, MachineMetrics, MicroVmProvider, ProviderRegistry};
pub use repository::{InMemoryRepository, MicroVmRepository, SqliteRepository};
