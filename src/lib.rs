//! z/VM FCP Operator
//!
//! Manages the pool of FCP (Fibre Channel Protocol) devices of one z/VM
//! partition and orchestrates attaching and detaching SAN volumes to
//! guests through those devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    REST API (axum)  /v1/...                       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │              Volume Orchestrator  (dispatch, rollback)            │
//! │        named locks: assigner-{ID} / template-{ID} / fcp-sync      │
//! ├────────────────────────────────┬─────────────────────────────────┤
//! │        FCP Pool Manager        │    Guest Directory / Config     │
//! │  reserve, usage, templates,    │    (RestGateway over HTTP)      │
//! │  reconciliation, statistics    │                                 │
//! ├────────────────────────────────┼─────────────────────────────────┤
//! │   FcpStore (MemoryStore,       │   Hardware Query (command or    │
//! │   JSON snapshot)               │   gateway) + listing parser     │
//! └────────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, actions, gateway adapter, REST API
//! - [`pool`]: FCP pool manager, selection and statistics
//! - [`hardware`]: range codec, device listing parser, query adapter
//! - [`store`]: transactional persistence engine
//! - [`lock`]: named async locks
//! - [`domain`]: data model and port traits
//! - [`config`]: configuration file
//! - [`error`]: error types

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod lock;
pub mod pool;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;

pub use controlplane::{
    ActionOutput, ApiServer, ApiServerConfig, GatewayConfig, OperatorMetrics, Orchestrator,
    OrchestratorConfig, OrchestratorStatus, RestGateway, VolumeAction, VolumeConnector,
};

pub use domain::ports::{
    FcpDevice, FcpId, FcpRecord, FcpStatus, FcpStore, FcpTemplate, FcpUsage, GuestConfigurator,
    GuestDirectory, HardwareQuery, VolumeConnection,
};

pub use error::{Error, Result};

pub use hardware::{collapse_to_ranges, expand_ranges, parse_fcp_devices, CommandHardwareQuery};

pub use lock::NamedLockManager;

pub use pool::{FcpManager, FcpManagerConfig, PoolEvent};

pub use store::MemoryStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
