use std::io;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

/// Outcome of removing a named adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRemoval {
    Removed,
    NotFound,
}

/// Operating-system networking calls used to provision the virtual interface.
///
/// Implementations block the calling task.
pub trait NetworkBackend: Send + Sync + 'static {
    fn create_device(&self, name: &str, mtu: u32) -> io::Result<()>;

    /// Release the open device handle. The adapter itself may persist.
    fn close_device(&self, name: &str) -> io::Result<()>;

    /// Delete the named adapter from the system.
    fn remove_adapter(&self, name: &str) -> io::Result<AdapterRemoval>;

    fn set_address(&self, name: &str, address: Ipv4Net) -> io::Result<()>;

    /// DNS servers currently configured on the interface.
    fn dns_servers(&self, name: &str) -> io::Result<Vec<IpAddr>>;

    fn add_route(
        &self,
        name: &str,
        destination: Ipv4Net,
        next_hop: Ipv4Addr,
        metric: u32,
    ) -> io::Result<()>;

    fn delete_route(&self, name: &str, destination: Ipv4Net, next_hop: Ipv4Addr) -> io::Result<()>;

    /// Whether the resolver's policy table already sends queries to `address`
    /// without the interface owning DNS.
    fn policy_dns_effective(&self, address: Ipv4Addr) -> io::Result<bool>;

    fn set_dns(&self, name: &str, servers: &[Ipv4Addr]) -> io::Result<()>;

    /// Lower metrics make the interface preferred for DNS resolution.
    fn set_interface_metric(&self, name: &str, metric: u32) -> io::Result<()>;
}
