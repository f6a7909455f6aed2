//! iproute2 / systemd-resolved backend.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use tunkeep_core::policy::DNS_DEPRIORITIZED_METRIC;

use super::backend::{AdapterRemoval, NetworkBackend};
use super::cmd::{cmd_succeeds, run_cmd};

const IP: &str = "ip";
const RESOLVECTL: &str = "resolvectl";

/// Provisions a TUN device with `ip` and configures DNS with `resolvectl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxBackend;

impl LinuxBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl NetworkBackend for LinuxBackend {
    fn create_device(&self, name: &str, mtu: u32) -> io::Result<()> {
        run_cmd(
            "Creating TUN device",
            IP,
            &["tuntap", "add", "dev", name, "mode", "tun"],
        )?;
        let mtu = mtu.to_string();
        run_cmd(
            "Bringing TUN device up",
            IP,
            &["link", "set", "dev", name, "mtu", &mtu, "up"],
        )?;
        Ok(())
    }

    fn close_device(&self, name: &str) -> io::Result<()> {
        run_cmd("Bringing TUN device down", IP, &["link", "set", "dev", name, "down"])?;
        Ok(())
    }

    fn remove_adapter(&self, name: &str) -> io::Result<AdapterRemoval> {
        if !cmd_succeeds(IP, &["link", "show", "dev", name]) {
            return Ok(AdapterRemoval::NotFound);
        }
        run_cmd(
            "Removing TUN adapter",
            IP,
            &["tuntap", "del", "dev", name, "mode", "tun"],
        )?;
        Ok(AdapterRemoval::Removed)
    }

    fn set_address(&self, name: &str, address: Ipv4Net) -> io::Result<()> {
        let cidr = address.to_string();
        run_cmd(
            "Assigning interface address",
            IP,
            &["addr", "replace", &cidr, "dev", name],
        )?;
        Ok(())
    }

    fn dns_servers(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        let out = run_cmd("Reading interface DNS servers", RESOLVECTL, &["dns", name])?;
        Ok(parse_dns_servers(&out))
    }

    fn add_route(
        &self,
        name: &str,
        destination: Ipv4Net,
        next_hop: Ipv4Addr,
        metric: u32,
    ) -> io::Result<()> {
        let dest = destination.to_string();
        let hop = next_hop.to_string();
        let metric = metric.to_string();
        let mut args = vec!["route", "replace", dest.as_str()];
        if !is_on_link(destination, next_hop) {
            args.extend(["via", hop.as_str()]);
        }
        args.extend(["dev", name, "metric", metric.as_str()]);
        run_cmd("Adding route", IP, &args)?;
        Ok(())
    }

    fn delete_route(&self, name: &str, destination: Ipv4Net, next_hop: Ipv4Addr) -> io::Result<()> {
        let dest = destination.to_string();
        let hop = next_hop.to_string();
        let mut args = vec!["route", "del", dest.as_str()];
        if !is_on_link(destination, next_hop) {
            args.extend(["via", hop.as_str()]);
        }
        args.extend(["dev", name]);
        run_cmd("Removing route", IP, &args)?;
        Ok(())
    }

    fn policy_dns_effective(&self, address: Ipv4Addr) -> io::Result<bool> {
        let out = run_cmd("Checking resolver DNS policy", RESOLVECTL, &["dns"])?;
        Ok(parse_dns_servers(&out).contains(&IpAddr::V4(address)))
    }

    fn set_dns(&self, name: &str, servers: &[Ipv4Addr]) -> io::Result<()> {
        let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
        let mut args = vec!["dns", name];
        args.extend(servers.iter().map(String::as_str));
        run_cmd("Assigning interface DNS", RESOLVECTL, &args)?;
        Ok(())
    }

    fn set_interface_metric(&self, name: &str, metric: u32) -> io::Result<()> {
        // systemd-resolved has no numeric link priority; a deprioritised link
        // is kept out of the default DNS route instead.
        let default_route = if metric < DNS_DEPRIORITIZED_METRIC {
            "yes"
        } else {
            "no"
        };
        run_cmd(
            "Setting interface DNS priority",
            RESOLVECTL,
            &["default-route", name, default_route],
        )?;
        Ok(())
    }
}

/// A next hop equal to the network address means the route is on-link.
fn is_on_link(destination: Ipv4Net, next_hop: Ipv4Addr) -> bool {
    next_hop == destination.network() || next_hop.is_unspecified()
}

/// Extract addresses from `resolvectl dns` output, e.g.
/// `Link 7 (tunkeep0): 100.64.0.1 fd00::1`.
fn parse_dns_servers(out: &str) -> Vec<IpAddr> {
    out.lines()
        .filter_map(|line| line.split_once(':').map(|(_, rest)| rest))
        .flat_map(str::split_whitespace)
        .filter_map(|tok| tok.split('#').next()?.parse().ok())
        .collect()
}
