//! tunkeep daemon library
//!
//! Core functionality for the tunnel runtime controller:
//! - Crash-safe persistence of runtime state and orphan recovery
//! - Identity registry, credential files and controller-address migration
//! - Virtual interface provisioning behind a network backend seam
//! - Event fan-out and the unix-socket control channels

pub mod context;
pub mod controller;
pub mod events;
pub mod identity;
pub mod net;
pub mod server;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
