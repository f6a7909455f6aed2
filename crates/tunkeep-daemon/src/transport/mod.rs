//! Session transport seam.
//!
//! The secure tunnel protocol itself is opaque to the controller: it asks the
//! transport to establish a session for an identity and receives a typed
//! [`LoadStatus`] when the attempt settles.

mod http;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tunkeep_core::TransferMetrics;

use crate::identity::credential::CredentialFile;

pub use http::HttpControllerTransport;

/// What the transport needs to bring an identity online.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub fingerprint: String,
    pub credential_path: PathBuf,
    pub credential: CredentialFile,
    pub refresh_interval: Duration,
    pub api_page_size: u32,
    pub active: bool,
}

/// Details reported by the controller once a session is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Display name as known by the controller; may be the unknown sentinel.
    pub name: String,
    pub controller: String,
    pub controller_version: String,
    pub mfa_enabled: bool,
    pub mfa_needed: bool,
}

/// Live handle to an established tunnel session.
pub trait TunnelSession: Send + Sync {
    fn metrics(&self) -> TransferMetrics;
    fn set_mfa(&self, enabled: bool, needed: bool);
    fn close(&self);
}

/// Result of a session establishment attempt.
#[derive(Clone)]
pub enum LoadStatus {
    Loaded {
        info: SessionInfo,
        session: Arc<dyn TunnelSession>,
    },
    /// Session is up but the identity must complete MFA before use.
    MfaRequired {
        info: SessionInfo,
        session: Arc<dyn TunnelSession>,
    },
    AuthFailed(String),
    NetworkError(String),
}

impl std::fmt::Debug for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded { info, .. } => f.debug_tuple("Loaded").field(info).finish(),
            Self::MfaRequired { info, .. } => f.debug_tuple("MfaRequired").field(info).finish(),
            Self::AuthFailed(e) => f.debug_tuple("AuthFailed").field(e).finish(),
            Self::NetworkError(e) => f.debug_tuple("NetworkError").field(e).finish(),
        }
    }
}

/// Establishes tunnel sessions for identities.
pub trait TunnelTransport: Send + Sync + 'static {
    fn establish(&self, request: SessionRequest) -> impl Future<Output = LoadStatus> + Send;
}
