//! Adaptive Memory System
//!
//! Remembers past runs so later runs can pick up recurring patterns and
//! company preferences.

pub mod store;

pub use store::{MemoryRecord, MemoryStore, DEFAULT_MEMORY_CAPACITY};
