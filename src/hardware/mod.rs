//! Hardware Module
//!
//! Device range expressions, the hypervisor's FCP device listing parser
//! and a command-backed source for that listing.

pub mod parser;
pub mod query;
pub mod range;

pub use parser::parse_fcp_devices;
pub use query::CommandHardwareQuery;
pub use range::{collapse_paths, collapse_to_ranges, expand_ranges};
