//! Volume Control Plane Module
//!
//! Coordinates volume attach/detach across the FCP pool, the guest
//! directory and in-guest configuration, and exposes it over REST.

pub mod action;
pub mod api;
pub mod gateway;
pub mod metrics;
pub mod orchestrator;

pub use action::*;
pub use api::*;
pub use gateway::{GatewayConfig, RestGateway};
pub use metrics::OperatorMetrics;
pub use orchestrator::*;
