//! `tunkeep` Core Library
//!
//! Shared functionality for `tunkeep` components:
//! - Runtime configuration and identity data model
//! - Address, mask and frequency policy
//! - Control-channel message types and line framing
//! - Agent path resolution
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod ipc;
pub mod model;
pub mod policy;
pub mod tracing_init;

pub use config::AgentPaths;
pub use error::{Error, Result};
pub use model::{IdentityRecord, IpInfo, RuntimeConfig, TransferMetrics};
