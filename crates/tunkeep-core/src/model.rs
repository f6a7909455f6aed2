//! Runtime data model shared by the daemon and its control clients.
//!
//! [`RuntimeConfig`] is both the persisted configuration file and the
//! status payload pushed to clients; the daemon fills in the computed
//! fields (`duration`, `service_version`) before sending or saving.

use serde::{Deserialize, Serialize};

use crate::policy;

/// Persisted snapshot of the tunnel runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub active: bool,
    /// Milliseconds since the tunnel was started. Computed, not meaningful on load.
    pub duration: i64,
    pub identities: Vec<IdentityRecord>,
    pub ip_info: Option<IpInfo>,
    pub log_level: String,
    pub service_version: String,
    pub tun_ipv4: String,
    pub tun_ipv4_mask: u8,
    pub add_dns: bool,
    /// Minutes between MFA expiry notifications.
    pub notification_frequency: u32,
    pub api_page_size: u32,
}

impl RuntimeConfig {
    /// Clamp out-of-range values loaded from disk to policy bounds.
    ///
    /// Returns `true` when anything changed and the config should be saved.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        if self.tun_ipv4_mask > policy::IPV4_MIN_MASK {
            tracing::warn!(
                mask = self.tun_ipv4_mask,
                min = policy::IPV4_MIN_MASK,
                "Configured mask is smaller than the minimum permitted and will be changed"
            );
            self.tun_ipv4_mask = policy::IPV4_MIN_MASK;
            changed = true;
        }
        if self.notification_frequency < policy::MIN_NOTIFICATION_FREQUENCY {
            self.notification_frequency = policy::MIN_NOTIFICATION_FREQUENCY;
            changed = true;
        }
        changed
    }

    /// Look up a persisted identity by fingerprint.
    pub fn identity(&self, fingerprint: &str) -> Option<&IdentityRecord> {
        self.identities.iter().find(|i| i.fingerprint == fingerprint)
    }
}

/// Addressing details of the virtual interface, reported to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpInfo {
    pub ip: String,
    pub subnet: String,
    pub mtu: u32,
    pub dns: String,
}

/// Persisted and reported view of one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityRecord {
    pub name: String,
    pub fingerprint: String,
    pub active: bool,
    /// Controller URL from the credential file, refreshed on load.
    pub controller: String,
    pub controller_version: String,
    pub loaded: bool,
    pub mfa_enabled: bool,
    pub mfa_needed: bool,
    pub mfa_min_timeout: i32,
    pub mfa_max_timeout: i32,
    pub mfa_min_timeout_rem: i32,
    pub mfa_max_timeout_rem: i32,
    /// Unix milliseconds of the last MFA state change.
    pub mfa_last_updated_time: Option<u64>,
    pub notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TransferMetrics>,
}

/// Byte counters of a live tunnel session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetrics {
    pub up: u64,
    pub down: u64,
}
