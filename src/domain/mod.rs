//! Domain layer - FCP data model and port definitions
//!
//! This module defines the device/template types and the traits (ports)
//! that persistence and remote-execution adapters implement.

pub mod ports;

pub use ports::*;
