//! Transport that brings identities online by contacting their controller
//! over HTTPS.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use tunkeep_core::TransferMetrics;
use tunkeep_core::policy::UNKNOWN_IDENTITY_NAME;

use super::{LoadStatus, SessionInfo, SessionRequest, TunnelSession, TunnelTransport};

const VERSION_PATH: &str = "/edge/client/v1/version";

/// Errors building the HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum HttpTransportError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct VersionData {
    #[serde(default)]
    version: String,
}

/// Reaches the controller named in each credential and reports its version.
#[derive(Debug, Clone)]
pub struct HttpControllerTransport {
    http: reqwest::Client,
}

impl HttpControllerTransport {
    pub fn new(timeout: Duration) -> Result<Self, HttpTransportError> {
        // reqwest uses rustls-no-provider; `Err` means a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn fetch_version(&self, controller: &str) -> Result<String, reqwest::Error> {
        let url = format!("{}{VERSION_PATH}", controller.trim_end_matches('/'));
        debug!(%url, "Querying controller version");
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let body: Envelope<VersionData> = resp.json().await?;
        Ok(body.data.version)
    }
}

impl TunnelTransport for HttpControllerTransport {
    async fn establish(&self, request: SessionRequest) -> LoadStatus {
        if !request.credential.id.has_key() {
            return LoadStatus::AuthFailed("credential has no key material".into());
        }
        let controller = request.credential.controller.clone();
        match self.fetch_version(&controller).await {
            Ok(version) => {
                info!(fingerprint = %request.fingerprint, %controller, %version, "Controller reachable");
                let info = SessionInfo {
                    // The version endpoint is anonymous, so the controller
                    // cannot tell us the identity's name.
                    name: UNKNOWN_IDENTITY_NAME.to_string(),
                    controller,
                    controller_version: version,
                    mfa_enabled: false,
                    mfa_needed: false,
                };
                LoadStatus::Loaded {
                    info,
                    session: Arc::new(HttpSession::default()),
                }
            }
            Err(e) if e.status().is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403) => {
                warn!(fingerprint = %request.fingerprint, error = %e, "Controller rejected identity");
                LoadStatus::AuthFailed(e.to_string())
            }
            Err(e) => {
                warn!(fingerprint = %request.fingerprint, error = %e, "Controller unreachable");
                LoadStatus::NetworkError(e.to_string())
            }
        }
    }
}

/// Session handle for [`HttpControllerTransport`].
///
/// No tunnel traffic flows through this transport, so `up` and `down` stay
/// at zero until a data-plane session reports into them.
#[derive(Debug, Default)]
pub struct HttpSession {
    up: AtomicU64,
    down: AtomicU64,
    mfa_enabled: AtomicBool,
    mfa_needed: AtomicBool,
    closed: AtomicBool,
}

impl TunnelSession for HttpSession {
    fn metrics(&self) -> TransferMetrics {
        TransferMetrics {
            up: self.up.load(Ordering::Relaxed),
            down: self.down.load(Ordering::Relaxed),
        }
    }

    fn set_mfa(&self, enabled: bool, needed: bool) {
        self.mfa_enabled.store(enabled, Ordering::Relaxed);
        self.mfa_needed.store(needed, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::credential::CredentialFile;

    #[test]
    fn session_counters_start_at_zero() {
        let session = HttpSession::default();
        session.set_mfa(true, true);
        session.close();
        assert_eq!(session.metrics(), TransferMetrics { up: 0, down: 0 });
        assert!(session.mfa_needed.load(Ordering::Relaxed));
        assert!(session.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn credential_without_key_is_refused_before_any_request() {
        let transport = HttpControllerTransport::new(Duration::from_secs(1)).unwrap();
        let credential: CredentialFile =
            serde_json::from_value(serde_json::json!({"controller": "https://127.0.0.1:9"}))
                .unwrap();
        let request = SessionRequest {
            fingerprint: "fp".into(),
            credential_path: "fp.json".into(),
            credential,
            refresh_interval: Duration::from_secs(10),
            api_page_size: 0,
            active: true,
        };
        assert!(matches!(
            transport.establish(request).await,
            LoadStatus::AuthFailed(_)
        ));
    }
}
