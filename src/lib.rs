//! Fiscal Compliance Orchestrator
//!
//! Automates the fiscal cycle of a small Quebec business:
//! - Computes GST/QST on financial records with exact decimal arithmetic
//! - Tracks recurring and one-off filing deadlines
//! - Runs a fixed multi-stage pipeline with fail-fast error handling
//! - Remembers past runs to surface recurring patterns
//! - Gates every outbound publication behind human approval
//!
//! PIPELINE:
//! COLLECT → ANALYZE → MONITOR_COMPLIANCE → ADVISE → DOCUMENT → REPORT → DONE

pub mod agent;
pub mod api;
pub mod audit;
pub mod calendar;
pub mod config;
pub mod error;
pub mod execution;
pub mod memory;
pub mod models;
pub mod publication;
pub mod tax;
pub mod tools;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use models::*;
