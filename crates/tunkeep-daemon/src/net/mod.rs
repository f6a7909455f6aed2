//! Virtual network interface provisioning.

mod backend;
mod cmd;
mod linux;
mod provisioner;

pub use backend::{AdapterRemoval, NetworkBackend};
pub use linux::LinuxBackend;
pub use provisioner::{DnsMode, InterfaceProvisioner, Lifecycle, NetError, RouteEntry};
