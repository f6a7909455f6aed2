//! Control-channel message types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{IdentityRecord, RuntimeConfig};

/// Command sent by a client on the command channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum Request {
    /// Full status snapshot.
    Status,
    /// Per-identity metrics snapshot.
    Metrics,
    /// Register a new identity from its credential document.
    AddIdentity { credential: Value },
    /// Turn an identity on (load) or off (unload).
    IdentityOnOff { fingerprint: String, on: bool },
    /// Forget an identity and delete its credential file.
    RemoveIdentity { fingerprint: String },
    UpdateMfa {
        fingerprint: String,
        enabled: bool,
        needed: bool,
    },
    SetNotified { fingerprint: String, notified: bool },
    /// Point an identity at a different controller.
    UpdateControllerAddress { fingerprint: String, address: String },
    SetLogLevel { level: String },
    /// Change the interface addressing; applied on next start.
    UpdateTunIpv4 {
        ip: String,
        mask: u8,
        add_dns: Option<bool>,
        api_page_size: u32,
    },
    SetNotificationFrequency { minutes: u32 },
    AddRoute {
        destination: String,
        next_hop: String,
        metric: u32,
    },
    RemoveRoute { destination: String, next_hop: String },
}

impl Request {
    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Metrics => "metrics",
            Self::AddIdentity { .. } => "add_identity",
            Self::IdentityOnOff { .. } => "identity_on_off",
            Self::RemoveIdentity { .. } => "remove_identity",
            Self::UpdateMfa { .. } => "update_mfa",
            Self::SetNotified { .. } => "set_notified",
            Self::UpdateControllerAddress { .. } => "update_controller_address",
            Self::SetLogLevel { .. } => "set_log_level",
            Self::UpdateTunIpv4 { .. } => "update_tun_ipv4",
            Self::SetNotificationFrequency { .. } => "set_notification_frequency",
            Self::AddRoute { .. } => "add_route",
            Self::RemoveRoute { .. } => "remove_route",
        }
    }
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;

    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: Self::SUCCESS,
            message: message.into(),
            error: None,
            payload: None,
        }
    }

    /// Successful reply carrying a serialized payload.
    pub fn ok_with<T: Serialize>(message: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            payload: Some(serde_json::to_value(payload)?),
            ..Self::ok(message)
        })
    }

    pub fn failure(message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            code: Self::FAILURE,
            message: message.into(),
            error: Some(error.to_string()),
            payload: None,
        }
    }

    pub const fn is_success(&self) -> bool {
        self.code == Self::SUCCESS
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .payload
            .clone()
            .ok_or_else(|| Error::Protocol("response has no payload".into()))?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Server-pushed notification on the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Event {
    IdentityAdded { identity: IdentityRecord },
    IdentityUpdated { identity: IdentityRecord },
    IdentityRemoved { fingerprint: String },
    TunnelStatus { status: RuntimeConfig },
    Metrics { identities: Vec<IdentityRecord> },
    /// The daemon is stopping on purpose; clients should not treat the
    /// following disconnect as a failure.
    Shutdown { reason: String },
}

impl Event {
    /// Operation tag as it appears on the wire.
    pub const fn op(&self) -> &'static str {
        match self {
            Self::IdentityAdded { .. } => "identity-added",
            Self::IdentityUpdated { .. } => "identity-updated",
            Self::IdentityRemoved { .. } => "identity-removed",
            Self::TunnelStatus { .. } => "tunnel-status",
            Self::Metrics { .. } => "metrics",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}
