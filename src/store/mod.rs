//! Persistence engines for the FCP pool

pub mod memory;

pub use memory::MemoryStore;
