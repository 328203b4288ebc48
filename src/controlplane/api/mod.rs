//! API Module
//!
//! REST API for volume attach/detach, connectors, FCP templates and
//! device usage, plus health and metrics endpoints.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
