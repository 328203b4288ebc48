//! FCP Pool Module
//!
//! Reservation, usage accounting, template lifecycle and statistics for
//! the host's FCP devices.

pub mod events;
pub mod manager;
pub mod selection;
pub mod statistics;

pub use events::PoolEvent;
pub use manager::{
    CreateTemplateRequest, EditTemplateRequest, FcpManager, FcpManagerConfig, Reservation,
    SyncSummary, TemplateDetails, TemplateSummary, UsageChange,
};
pub use statistics::{PathStatistics, UsageBucket};
