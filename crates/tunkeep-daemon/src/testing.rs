//! In-memory doubles for the network backend and session transport.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ipnet::Ipv4Net;
use tokio::sync::Notify;

use tunkeep_core::TransferMetrics;
use tunkeep_core::policy::UNKNOWN_IDENTITY_NAME;

use crate::net::{AdapterRemoval, NetworkBackend};
use crate::transport::{LoadStatus, SessionInfo, SessionRequest, TunnelSession, TunnelTransport};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Backend that records calls instead of touching the system.
#[derive(Debug)]
pub struct RecordingBackend {
    policy: Result<bool, &'static str>,
    device_present: AtomicBool,
    devices_created: AtomicUsize,
    adapters_removed: AtomicUsize,
    metric: Mutex<Option<u32>>,
    dns: Mutex<Vec<Ipv4Addr>>,
    routes: Mutex<Vec<(Ipv4Net, Ipv4Addr, u32)>>,
    failing: Mutex<Option<&'static str>>,
    devices_closed: AtomicUsize,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::with_policy(Ok(false))
    }
}

impl RecordingBackend {
    /// `policy` is what `policy_dns_effective` reports; `Err` simulates an
    /// inconclusive check.
    pub fn with_policy(policy: Result<bool, &'static str>) -> Self {
        Self {
            policy,
            device_present: AtomicBool::new(false),
            devices_created: AtomicUsize::new(0),
            adapters_removed: AtomicUsize::new(0),
            metric: Mutex::new(None),
            dns: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            failing: Mutex::new(None),
            devices_closed: AtomicUsize::new(0),
        }
    }

    /// Pretend an adapter survived a previous run.
    pub fn with_stale_adapter(self) -> Self {
        self.device_present.store(true, Ordering::SeqCst);
        self
    }

    /// Make the named call fail: `"set_address"`, `"add_route"` or `"set_dns"`.
    pub fn fail_on(&self, op: &'static str) {
        *lock(&self.failing) = Some(op);
    }

    /// Let every call succeed again.
    pub fn recover(&self) {
        *lock(&self.failing) = None;
    }

    fn check(&self, op: &'static str) -> io::Result<()> {
        if *lock(&self.failing) == Some(op) {
            return Err(io::Error::other(format!("{op} refused")));
        }
        Ok(())
    }

    pub fn devices_closed(&self) -> usize {
        self.devices_closed.load(Ordering::SeqCst)
    }

    pub fn devices_created(&self) -> usize {
        self.devices_created.load(Ordering::SeqCst)
    }

    pub fn adapters_removed(&self) -> usize {
        self.adapters_removed.load(Ordering::SeqCst)
    }

    pub fn metric(&self) -> Option<u32> {
        *lock(&self.metric)
    }

    pub fn dns(&self) -> Vec<Ipv4Addr> {
        lock(&self.dns).clone()
    }

    pub fn routes(&self) -> Vec<(Ipv4Net, Ipv4Addr, u32)> {
        lock(&self.routes).clone()
    }
}

impl NetworkBackend for RecordingBackend {
    fn create_device(&self, _name: &str, _mtu: u32) -> io::Result<()> {
        self.devices_created.fetch_add(1, Ordering::SeqCst);
        self.device_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_device(&self, _name: &str) -> io::Result<()> {
        self.devices_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_adapter(&self, _name: &str) -> io::Result<AdapterRemoval> {
        if self.device_present.swap(false, Ordering::SeqCst) {
            self.adapters_removed.fetch_add(1, Ordering::SeqCst);
            Ok(AdapterRemoval::Removed)
        } else {
            Ok(AdapterRemoval::NotFound)
        }
    }

    fn set_address(&self, _name: &str, _address: Ipv4Net) -> io::Result<()> {
        self.check("set_address")
    }

    fn dns_servers(&self, _name: &str) -> io::Result<Vec<IpAddr>> {
        Ok(lock(&self.dns).iter().copied().map(IpAddr::V4).collect())
    }

    fn add_route(
        &self,
        _name: &str,
        destination: Ipv4Net,
        next_hop: Ipv4Addr,
        metric: u32,
    ) -> io::Result<()> {
        self.check("add_route")?;
        lock(&self.routes).push((destination, next_hop, metric));
        Ok(())
    }

    fn delete_route(&self, _name: &str, destination: Ipv4Net, next_hop: Ipv4Addr) -> io::Result<()> {
        lock(&self.routes).retain(|(d, h, _)| !(*d == destination && *h == next_hop));
        Ok(())
    }

    fn policy_dns_effective(&self, _address: Ipv4Addr) -> io::Result<bool> {
        self.policy.map_err(io::Error::other)
    }

    fn set_dns(&self, _name: &str, servers: &[Ipv4Addr]) -> io::Result<()> {
        self.check("set_dns")?;
        *lock(&self.dns) = servers.to_vec();
        Ok(())
    }

    fn set_interface_metric(&self, _name: &str, metric: u32) -> io::Result<()> {
        *lock(&self.metric) = Some(metric);
        Ok(())
    }
}

/// Session handle with settable counters.
#[derive(Debug, Default)]
pub struct FakeSession {
    pub up: std::sync::atomic::AtomicU64,
    pub down: std::sync::atomic::AtomicU64,
    mfa: Mutex<Option<(bool, bool)>>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn mfa(&self) -> Option<(bool, bool)> {
        *lock(&self.mfa)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TunnelSession for FakeSession {
    fn metrics(&self) -> TransferMetrics {
        TransferMetrics {
            up: self.up.load(Ordering::SeqCst),
            down: self.down.load(Ordering::SeqCst),
        }
    }

    fn set_mfa(&self, enabled: bool, needed: bool) {
        *lock(&self.mfa) = Some((enabled, needed));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Scripted outcome for one fingerprint.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Loaded { name: String },
    MfaRequired { name: String },
    AuthFailed,
    NetworkError,
}

/// Transport whose results are scripted per fingerprint. Unscripted
/// fingerprints load with the unknown-name sentinel.
#[derive(Debug, Default)]
pub struct FakeTransport {
    outcomes: Mutex<HashMap<String, FakeOutcome>>,
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    attempts: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl FakeTransport {
    pub fn script(&self, fingerprint: &str, outcome: FakeOutcome) {
        lock(&self.outcomes).insert(fingerprint.to_string(), outcome);
    }

    /// Hold every later `establish` call until the returned handle is
    /// notified once per call.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Resolves once an `establish` call has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Most recent session handed out for `fingerprint`.
    pub fn session(&self, fingerprint: &str) -> Option<Arc<FakeSession>> {
        lock(&self.sessions).get(fingerprint).cloned()
    }
}

impl TunnelTransport for FakeTransport {
    async fn establish(&self, request: SessionRequest) -> LoadStatus {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = lock(&self.gate).clone();
        self.entered.notify_one();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let outcome = lock(&self.outcomes)
            .get(&request.fingerprint)
            .cloned()
            .unwrap_or(FakeOutcome::Loaded {
                name: UNKNOWN_IDENTITY_NAME.to_string(),
            });
        let info = |name: String, needed: bool| SessionInfo {
            name,
            controller: request.credential.controller.clone(),
            controller_version: "v0.0.0-test".to_string(),
            mfa_enabled: needed,
            mfa_needed: needed,
        };
        let session = Arc::new(FakeSession::default());
        match outcome {
            FakeOutcome::Loaded { name } => {
                lock(&self.sessions).insert(request.fingerprint.clone(), session.clone());
                LoadStatus::Loaded {
                    info: info(name, false),
                    session,
                }
            }
            FakeOutcome::MfaRequired { name } => {
                lock(&self.sessions).insert(request.fingerprint.clone(), session.clone());
                LoadStatus::MfaRequired {
                    info: info(name, true),
                    session,
                }
            }
            FakeOutcome::AuthFailed => LoadStatus::AuthFailed("rejected".into()),
            FakeOutcome::NetworkError => LoadStatus::NetworkError("unreachable".into()),
        }
    }
}
