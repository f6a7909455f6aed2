//! Virtual interface lifecycle: creation, addressing, routes, DNS mode and
//! one-shot teardown.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tunkeep_core::IpInfo;
use tunkeep_core::policy::{
    DEFAULT_IPV4, DEFAULT_IPV4_MASK, DNS_DEPRIORITIZED_METRIC, DNS_INTERCEPT_METRIC,
    INTERFACE_MTU, IPV4_MAX_MASK,
};

use super::backend::{AdapterRemoval, NetworkBackend};
use crate::context::RuntimeContext;
use crate::store::StoreError;

/// Errors from interface provisioning.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("error parsing CIDR block {cidr}: {source}")]
    InvalidCidr {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("interface is already open")]
    AlreadyOpen,

    #[error("interface has been closed")]
    DeviceClosed,

    #[error("{op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not persist substituted address: {0}")]
    Persist(#[from] StoreError),
}

fn backend_err(op: &'static str) -> impl FnOnce(std::io::Error) -> NetError {
    move |source| NetError::Backend { op, source }
}

/// Interface lifecycle. Legal transitions: `Idle → Open`, `Idle | Open →
/// Closing → Closed`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Idle = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// How DNS for the tunnel is being resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DnsMode {
    #[default]
    None,
    /// The resolver's policy table already delegates to the tunnel address.
    PolicyDelegated,
    /// DNS is assigned directly on the interface.
    InterfaceAssigned,
}

/// A route installed by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub next_hop: Ipv4Addr,
    pub metric: u32,
}

#[derive(Debug, Default)]
struct InterfaceState {
    device: Option<String>,
    address: Option<Ipv4Net>,
    routes: Vec<RouteEntry>,
    dns_mode: DnsMode,
}

/// Owns the virtual interface for the process lifetime.
pub struct InterfaceProvisioner {
    backend: Arc<dyn NetworkBackend>,
    name: String,
    lifecycle: AtomicU8,
    state: Mutex<InterfaceState>,
}

impl std::fmt::Debug for InterfaceProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceProvisioner")
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl InterfaceProvisioner {
    pub fn new(backend: Arc<dyn NetworkBackend>, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            lifecycle: AtomicU8::new(Lifecycle::Idle as u8),
            state: Mutex::new(InterfaceState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Remove an adapter with our name left behind by a previous run.
    pub fn remove_stale_adapter(&self) {
        match self.backend.remove_adapter(&self.name) {
            Ok(AdapterRemoval::Removed) => {
                info!(name = %self.name, "Removed stale adapter from a previous run");
            }
            Ok(AdapterRemoval::NotFound) => debug!(name = %self.name, "No stale adapter found"),
            Err(e) => warn!(name = %self.name, error = %e, "Could not remove stale adapter"),
        }
    }

    /// Create and configure the interface.
    ///
    /// A blank `address` is replaced by the default address, and a mask more
    /// permissive than the allowed bound is replaced by the default mask.
    /// Each substitution is persisted. The address is parsed before the
    /// device is touched.
    pub async fn create_interface(
        &self,
        ctx: &RuntimeContext,
        address: &str,
        mask: u8,
        inject_dns: bool,
    ) -> Result<Ipv4Addr, NetError> {
        match self.lifecycle() {
            Lifecycle::Idle => {}
            Lifecycle::Open => return Err(NetError::AlreadyOpen),
            Lifecycle::Closing | Lifecycle::Closed => return Err(NetError::DeviceClosed),
        }

        let mut address = address.trim().to_string();
        let mut substituted = false;
        if address.is_empty() {
            info!(default = DEFAULT_IPV4, "Interface address not provided; using default");
            address = DEFAULT_IPV4.to_string();
            let addr = address.clone();
            ctx.update_settings(|s| s.tun_ipv4 = addr).await;
            substituted = true;
        }
        let mut mask = mask;
        if mask < IPV4_MAX_MASK {
            warn!(mask, default = DEFAULT_IPV4_MASK, "Provided mask is too large; using default");
            mask = DEFAULT_IPV4_MASK;
            ctx.update_settings(|s| s.tun_ipv4_mask = mask).await;
            substituted = true;
        }
        if substituted {
            ctx.persist().await?;
        }

        let cidr = format!("{address}/{mask}");
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|source| NetError::InvalidCidr { cidr, source })?;
        let ip = net.addr();

        if !self.transition(Lifecycle::Idle, Lifecycle::Open) {
            return Err(NetError::DeviceClosed);
        }

        info!(name = %self.name, "Creating TUN device");
        if let Err(e) = self.backend.create_device(&self.name, INTERFACE_MTU) {
            self.transition(Lifecycle::Open, Lifecycle::Idle);
            return Err(backend_err("create device")(e));
        }
        let mut state = self.state.lock().await;
        state.device = Some(self.name.clone());

        if let Err(e) = self.configure(&mut state, net, inject_dns) {
            warn!(name = %self.name, error = %e, "Interface setup failed; rolling back");
            self.roll_back(&mut state);
            drop(state);
            self.transition(Lifecycle::Open, Lifecycle::Idle);
            return Err(e);
        }
        drop(state);

        Ok(ip)
    }

    /// Address, route and DNS setup on a freshly created device.
    fn configure(
        &self,
        state: &mut InterfaceState,
        net: Ipv4Net,
        inject_dns: bool,
    ) -> Result<(), NetError> {
        let ip = net.addr();
        info!(%ip, "Setting TUN interface address");
        self.backend
            .set_address(&self.name, net)
            .map_err(backend_err("set address"))?;
        state.address = Some(net);

        match self.backend.dns_servers(&self.name) {
            Ok(servers) => info!(?servers, "TUN DNS servers"),
            Err(e) => warn!(error = %e, "Could not read TUN DNS servers"),
        }

        let route = RouteEntry {
            destination: net.trunc(),
            next_hop: net.network(),
            metric: 0,
        };
        info!(cidr = %route.destination, next_hop = %route.next_hop, "Setting route for interface block");
        self.backend
            .add_route(&self.name, route.destination, route.next_hop, route.metric)
            .map_err(backend_err("add route"))?;
        state.routes.push(route);

        let policy_effective = match self.backend.policy_dns_effective(ip) {
            Ok(effective) => effective,
            Err(e) => {
                warn!(error = %e, "DNS policy check inconclusive; assuming policy delegation");
                true
            }
        };
        let metric = if inject_dns || !policy_effective {
            if inject_dns {
                info!("DNS applied to the interface because DNS injection is enabled");
            } else {
                info!("DNS applied to the interface because resolver policy does not cover it");
            }
            self.backend
                .set_dns(&self.name, &[ip])
                .map_err(backend_err("set DNS"))?;
            state.dns_mode = DnsMode::InterfaceAssigned;
            DNS_INTERCEPT_METRIC
        } else {
            state.dns_mode = DnsMode::PolicyDelegated;
            DNS_DEPRIORITIZED_METRIC
        };
        if let Err(e) = self.backend.set_interface_metric(&self.name, metric) {
            warn!(error = %e, metric, "Could not set interface metric");
        }
        debug!(name = %self.name, metric, "Interface metric set");
        Ok(())
    }

    /// Undo a partial setup so the interface can be created again.
    fn roll_back(&self, state: &mut InterfaceState) {
        for route in &state.routes {
            if let Err(e) = self
                .backend
                .delete_route(&self.name, route.destination, route.next_hop)
            {
                debug!(destination = %route.destination, error = %e, "Could not delete route");
            }
        }
        if let Some(device) = state.device.take()
            && let Err(e) = self.backend.close_device(&device)
        {
            warn!(name = %device, error = %e, "Error closing TUN device");
        }
        if let Err(e) = self.backend.remove_adapter(&self.name) {
            warn!(name = %self.name, error = %e, "Could not remove adapter");
        }
        *state = InterfaceState::default();
    }

    /// Tear the interface down. Runs at most once; later calls return
    /// `false` without doing anything.
    pub async fn close(&self) -> bool {
        if !self.transition(Lifecycle::Open, Lifecycle::Closing)
            && !self.transition(Lifecycle::Idle, Lifecycle::Closing)
        {
            debug!(name = %self.name, "Interface already closed");
            return false;
        }

        let mut state = self.state.lock().await;
        if let Some(device) = state.device.take() {
            info!(name = %device, "Closing TUN device");
            if let Err(e) = self.backend.close_device(&device) {
                warn!(name = %device, error = %e, "Error closing TUN device");
            }
        }
        state.routes.clear();
        state.dns_mode = DnsMode::None;
        drop(state);

        match self.backend.remove_adapter(&self.name) {
            Ok(AdapterRemoval::Removed) => info!(name = %self.name, "Adapter removed"),
            Ok(AdapterRemoval::NotFound) => debug!(name = %self.name, "Adapter already removed"),
            Err(e) => warn!(name = %self.name, error = %e, "Could not remove adapter"),
        }

        self.lifecycle.store(Lifecycle::Closed as u8, Ordering::Release);
        true
    }

    pub async fn add_route(
        &self,
        destination: Ipv4Net,
        next_hop: Ipv4Addr,
        metric: u32,
    ) -> Result<(), NetError> {
        let mut state = self.state.lock().await;
        if self.lifecycle() != Lifecycle::Open {
            return Err(NetError::DeviceClosed);
        }
        let destination = destination.trunc();
        self.backend
            .add_route(&self.name, destination, next_hop, metric)
            .map_err(backend_err("add route"))?;
        state
            .routes
            .retain(|r| !(r.destination == destination && r.next_hop == next_hop));
        state.routes.push(RouteEntry {
            destination,
            next_hop,
            metric,
        });
        drop(state);
        info!(%destination, %next_hop, metric, "Route added");
        Ok(())
    }

    pub async fn remove_route(&self, destination: Ipv4Net, next_hop: Ipv4Addr) -> Result<(), NetError> {
        let mut state = self.state.lock().await;
        if self.lifecycle() != Lifecycle::Open {
            return Err(NetError::DeviceClosed);
        }
        let destination = destination.trunc();
        self.backend
            .delete_route(&self.name, destination, next_hop)
            .map_err(backend_err("delete route"))?;
        state
            .routes
            .retain(|r| !(r.destination == destination && r.next_hop == next_hop));
        drop(state);
        info!(%destination, %next_hop, "Route removed");
        Ok(())
    }

    /// Routes installed by this process.
    pub async fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().await.routes.clone()
    }

    pub async fn dns_mode(&self) -> DnsMode {
        self.state.lock().await.dns_mode
    }

    /// Addressing summary for status snapshots.
    pub async fn ip_info(&self) -> Option<IpInfo> {
        let state = self.state.lock().await;
        let net = state.address?;
        let dns = match state.dns_mode {
            DnsMode::InterfaceAssigned | DnsMode::PolicyDelegated => net.addr().to_string(),
            DnsMode::None => String::new(),
        };
        Some(IpInfo {
            ip: net.addr().to_string(),
            subnet: net.netmask().to_string(),
            mtu: INTERFACE_MTU,
            dns,
        })
    }
}
