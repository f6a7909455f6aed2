//! Tunnel runtime controller.
//!
//! Coordinates the interface, the identity registry, the session transport
//! and persistence. Every control command ends up here.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tunkeep_core::config::identity_file_in;
use tunkeep_core::ipc::Event;
use tunkeep_core::policy::{self, DEFAULT_REFRESH_INTERVAL};
use tunkeep_core::tracing_init::{LogLevelHandle, normalize_level};
use tunkeep_core::{IdentityRecord, RuntimeConfig};

use crate::context::RuntimeContext;
use crate::identity::Identity;
use crate::identity::credential::{
    self, AddressUpdate, CredentialError, CredentialFile, recover_interrupted_update,
};
use crate::net::{InterfaceProvisioner, NetError};
use crate::store::StoreError;
use crate::transport::{LoadStatus, SessionRequest, TunnelTransport};


/// Errors surfaced to control-channel callers.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no identity with fingerprint {0}")]
    UnknownIdentity(String),

    #[error("identity {0} is already registered")]
    DuplicateIdentity(String),

    #[error(
        "mask {0} is outside the permitted range [{min}, {max}]",
        min = policy::IPV4_MAX_MASK,
        max = policy::IPV4_MIN_MASK
    )]
    InvalidMask(u8),

    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error(
        "notification frequency {0} is outside [{min}, {max}] minutes",
        min = policy::MIN_NOTIFICATION_FREQUENCY,
        max = policy::MAX_NOTIFICATION_FREQUENCY
    )]
    InvalidFrequency(u32),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error(transparent)]
    LogLevel(#[from] tunkeep_core::Error),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Passed to the transport for each identity.
    pub refresh_interval: Duration,
    /// Period of the `metrics` event. Zero disables the ticker.
    pub metrics_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            metrics_interval: Duration::from_secs(5),
        }
    }
}

/// How an identity load attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    AlreadyLoaded,
    /// The credential file is gone; the identity stays unloaded.
    MissingCredential,
    Loaded(IdentityRecord),
    MfaRequired(IdentityRecord),
    Failed(String),
    /// The identity was not registered, or was turned off or removed while
    /// the session was being established, or the runtime is shutting down.
    Cancelled,
}

/// Runtime controller. Cheap to clone; clones share all state.
pub struct TunnelController<T: TunnelTransport> {
    ctx: Arc<RuntimeContext>,
    tun: Arc<InterfaceProvisioner>,
    transport: Arc<T>,
    log_level: Option<LogLevelHandle>,
    options: ControllerOptions,
    shutdown: watch::Sender<bool>,
}

impl<T: TunnelTransport> Clone for TunnelController<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            tun: Arc::clone(&self.tun),
            transport: Arc::clone(&self.transport),
            log_level: self.log_level.clone(),
            options: self.options.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: TunnelTransport> TunnelController<T> {
    pub fn new(
        ctx: Arc<RuntimeContext>,
        tun: Arc<InterfaceProvisioner>,
        transport: Arc<T>,
        options: ControllerOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            tun,
            transport,
            log_level: None,
            options,
            shutdown,
        }
    }

    /// Let `set_log_level` reconfigure the global subscriber.
    #[must_use]
    pub fn with_log_level_handle(mut self, handle: LogLevelHandle) -> Self {
        self.log_level = Some(handle);
        self
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub fn interface(&self) -> &Arc<InterfaceProvisioner> {
        &self.tun
    }

    /// Subscribe to the shutdown flag.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Bring the tunnel up: create the interface, start loading every active
    /// identity and start the metrics ticker.
    pub async fn start(&self) -> Result<Vec<JoinHandle<LoadOutcome>>, ControllerError> {
        self.tun.remove_stale_adapter();

        let settings = self.ctx.settings().await;
        let ip = self
            .tun
            .create_interface(&self.ctx, &settings.tun_ipv4, settings.tun_ipv4_mask, settings.add_dns)
            .await?;
        let ip_info = self.tun.ip_info().await;
        self.ctx
            .update_settings(|s| {
                s.active = true;
                s.ip_info = ip_info;
            })
            .await;
        self.ctx.persist().await?;
        info!(%ip, name = %self.tun.name(), "Tunnel interface up");

        let loads = self.load_active_identities().await;
        if !self.options.metrics_interval.is_zero() {
            self.spawn_metrics_ticker();
        }
        let status = self.status(false).await;
        self.ctx.events().broadcast(Event::TunnelStatus { status }).await;
        Ok(loads)
    }

    /// Spawn a load task for every active identity that is not loaded.
    pub async fn load_active_identities(&self) -> Vec<JoinHandle<LoadOutcome>> {
        let records = self.ctx.registry().records(false).await;
        let mut tasks = Vec::new();
        for record in records.into_iter().filter(|r| r.active && !r.loaded) {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.load_identity(Identity::new(record)).await
            }));
        }
        debug!(count = tasks.len(), "Loading active identities");
        tasks
    }

    /// Establish a session for a registered `identity`.
    ///
    /// Does nothing if it is already loaded. A missing credential file leaves
    /// the identity unloaded without failing anything else.
    pub async fn load_identity(&self, identity: Identity) -> LoadOutcome {
        let fingerprint = identity.fingerprint().to_string();
        if *self.shutdown.borrow() {
            debug!(%fingerprint, "Shutting down; not loading identity");
            return LoadOutcome::Cancelled;
        }
        let Some(current) = self.ctx.registry().find(&fingerprint).await else {
            warn!(%fingerprint, "Identity is not registered; not loading");
            return LoadOutcome::Cancelled;
        };
        if current.is_loaded() {
            warn!(%fingerprint, name = %identity.record.name, "Identity already connected");
            return LoadOutcome::AlreadyLoaded;
        }

        let path = identity_file_in(self.ctx.config_dir(), &fingerprint);
        if let Err(e) = recover_interrupted_update(&path) {
            warn!(path = %path.display(), error = %e, "Could not recover identity file");
        }
        if !path.exists() {
            warn!(%fingerprint, path = %path.display(), "Identity file missing; not loading");
            return LoadOutcome::MissingCredential;
        }
        let credential = match CredentialFile::read(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(%fingerprint, error = %e, "Refusing to load identity");
                return LoadOutcome::Failed(e.to_string());
            }
        };

        if !self.ctx.registry().begin_load(&fingerprint).await {
            return LoadOutcome::AlreadyLoaded;
        }
        info!(%fingerprint, name = %identity.record.name, "Loading identity");
        self.ctx
            .registry()
            .hold_secrets(&fingerprint, credential.id.clone())
            .await;

        let settings = self.ctx.settings().await;
        let request = SessionRequest {
            fingerprint: fingerprint.clone(),
            credential_path: path,
            credential,
            refresh_interval: self.options.refresh_interval,
            api_page_size: settings.api_page_size,
            active: identity.record.active,
        };

        let (info, session, mfa_required) = match self.transport.establish(request).await {
            LoadStatus::Loaded { info, session } => (info, session, false),
            LoadStatus::MfaRequired { mut info, session } => {
                info.mfa_needed = true;
                (info, session, true)
            }
            LoadStatus::AuthFailed(reason) | LoadStatus::NetworkError(reason) => {
                warn!(%fingerprint, %reason, "Identity failed to load");
                self.ctx.registry().fail_load(&fingerprint).await;
                return LoadOutcome::Failed(reason);
            }
        };

        let Some(done) = self
            .ctx
            .registry()
            .complete_load(&fingerprint, &info, Arc::clone(&session))
            .await
        else {
            info!(%fingerprint, "Identity no longer wanted; closing new session");
            session.close();
            return LoadOutcome::Cancelled;
        };
        if done.name_changed {
            self.persist_logged().await;
        }
        self.ctx
            .events()
            .broadcast(Event::IdentityAdded {
                identity: done.record.clone(),
            })
            .await;
        info!(
            %fingerprint,
            mfa_enabled = done.record.mfa_enabled,
            mfa_needed = done.record.mfa_needed,
            "Connecting identity completed"
        );
        if mfa_required {
            LoadOutcome::MfaRequired(done.record)
        } else {
            LoadOutcome::Loaded(done.record)
        }
    }

    /// Turn an identity on (load) or off (unload).
    pub async fn set_identity_active(
        &self,
        fingerprint: &str,
        on: bool,
    ) -> Result<IdentityRecord, ControllerError> {
        let registry = self.ctx.registry();
        let record = registry
            .set_active(fingerprint, on)
            .await
            .ok_or_else(|| ControllerError::UnknownIdentity(fingerprint.to_string()))?;
        self.ctx.persist().await?;

        if on {
            info!(%fingerprint, "Turning identity on");
            let outcome = self.load_identity(Identity::new(record.clone())).await;
            debug!(%fingerprint, ?outcome, "Identity on");
        } else {
            info!(%fingerprint, "Turning identity off");
            if let Some(session) = registry.unload(fingerprint).await {
                session.close();
            }
        }

        let record = registry
            .find(fingerprint)
            .await
            .map_or(record, |id| id.to_record());
        if !on {
            self.ctx
                .events()
                .broadcast(Event::IdentityUpdated {
                    identity: record.clone(),
                })
                .await;
        }
        Ok(record)
    }

    /// Register a new identity from a credential document and load it.
    pub async fn add_identity(&self, document: Value) -> Result<IdentityRecord, ControllerError> {
        let credential = CredentialFile::from_value(document)?;
        let fingerprint = credential.fingerprint();
        if self.ctx.registry().contains(&fingerprint).await {
            return Err(ControllerError::DuplicateIdentity(fingerprint));
        }

        std::fs::create_dir_all(self.ctx.config_dir())?;
        let path = identity_file_in(self.ctx.config_dir(), &fingerprint);
        credential.write(&path)?;
        info!(%fingerprint, path = %path.display(), "Identity file written");

        let name = credential
            .extra
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| fingerprint.chars().take(8).collect(), str::to_string);
        let record = IdentityRecord {
            name,
            fingerprint: fingerprint.clone(),
            active: true,
            controller: credential.controller.clone(),
            ..Default::default()
        };
        if !self.ctx.registry().insert(Identity::new(record.clone())).await {
            return Err(ControllerError::DuplicateIdentity(fingerprint));
        }
        self.ctx.persist().await?;

        let outcome = self.load_identity(Identity::new(record.clone())).await;
        debug!(%fingerprint, ?outcome, "New identity load finished");
        Ok(self
            .ctx
            .registry()
            .find(&fingerprint)
            .await
            .map_or(record, |id| id.to_record()))
    }

    /// Close, unregister and delete an identity.
    pub async fn forget_identity(&self, fingerprint: &str) -> Result<(), ControllerError> {
        let removed = self
            .ctx
            .registry()
            .remove_by_fingerprint(fingerprint)
            .await
            .ok_or_else(|| ControllerError::UnknownIdentity(fingerprint.to_string()))?;
        if let Some(session) = &removed.session {
            session.close();
        }
        let path = identity_file_in(self.ctx.config_dir(), fingerprint);
        if let Err(e) = credential::remove_credential_files(&path) {
            warn!(%fingerprint, error = %e, "Could not delete identity file");
        }
        self.ctx.persist().await?;
        self.ctx
            .events()
            .broadcast(Event::IdentityRemoved {
                fingerprint: fingerprint.to_string(),
            })
            .await;
        info!(%fingerprint, "Identity forgotten");
        Ok(())
    }

    /// Update MFA flags. Unknown fingerprints are a no-op.
    pub async fn update_mfa(
        &self,
        fingerprint: &str,
        enabled: bool,
        needed: bool,
    ) -> Result<Option<IdentityRecord>, ControllerError> {
        let Some(record) = self
            .ctx
            .registry()
            .update_mfa(fingerprint, enabled, needed)
            .await
        else {
            debug!(%fingerprint, "MFA update for unknown identity ignored");
            return Ok(None);
        };
        self.ctx.persist().await?;
        self.ctx
            .events()
            .broadcast(Event::IdentityUpdated {
                identity: record.clone(),
            })
            .await;
        Ok(Some(record))
    }

    /// Set the last-notified flag. Unknown fingerprints are a no-op.
    pub async fn set_notified(
        &self,
        fingerprint: &str,
        notified: bool,
    ) -> Result<Option<IdentityRecord>, ControllerError> {
        let Some(record) = self.ctx.registry().set_notified(fingerprint, notified).await else {
            return Ok(None);
        };
        self.ctx.persist().await?;
        Ok(Some(record))
    }

    /// Point an identity at a new controller URL.
    pub async fn update_controller_address(
        &self,
        fingerprint: &str,
        address: &str,
    ) -> Result<AddressUpdate, ControllerError> {
        if !self.ctx.registry().contains(fingerprint).await {
            return Err(ControllerError::UnknownIdentity(fingerprint.to_string()));
        }
        let path = identity_file_in(self.ctx.config_dir(), fingerprint);
        let update = credential::update_controller_address(&path, address)?;
        if let AddressUpdate::Updated { current, .. } = &update
            && let Some(record) = self.ctx.registry().set_controller(fingerprint, current).await
        {
            self.ctx.persist().await?;
            self.ctx
                .events()
                .broadcast(Event::IdentityUpdated { identity: record })
                .await;
        }
        Ok(update)
    }

    /// Change interface addressing and API page size; applied on next start.
    pub async fn update_tun_ipv4(
        &self,
        ip: &str,
        mask: u8,
        add_dns: Option<bool>,
        api_page_size: u32,
    ) -> Result<RuntimeConfig, ControllerError> {
        if !policy::mask_in_range(mask) {
            return Err(ControllerError::InvalidMask(mask));
        }
        let ip = ip.trim();
        if !ip.is_empty() && ip.parse::<Ipv4Addr>().is_err() {
            return Err(ControllerError::InvalidAddress(ip.to_string()));
        }
        self.ctx
            .update_settings(|s| {
                if !ip.is_empty() {
                    ip.clone_into(&mut s.tun_ipv4);
                    s.tun_ipv4_mask = mask;
                }
                if let Some(add_dns) = add_dns {
                    s.add_dns = add_dns;
                }
                s.api_page_size = api_page_size;
            })
            .await;
        self.ctx.persist().await?;
        info!(ip, mask, ?add_dns, api_page_size, "Interface settings updated");
        Ok(self.ctx.settings().await)
    }

    pub async fn set_notification_frequency(&self, minutes: u32) -> Result<(), ControllerError> {
        if !policy::frequency_in_range(minutes) {
            return Err(ControllerError::InvalidFrequency(minutes));
        }
        self.ctx
            .update_settings(|s| s.notification_frequency = minutes)
            .await;
        self.ctx.persist().await?;
        Ok(())
    }

    /// Change the log level now and for future starts.
    pub async fn set_log_level(&self, level: &str) -> Result<String, ControllerError> {
        let level = normalize_level(level)?;
        if let Some(handle) = &self.log_level {
            handle.set_level(&level)?;
        }
        let stored = level.clone();
        self.ctx.update_settings(|s| s.log_level = stored).await;
        self.ctx.persist().await?;
        info!(%level, "Log level changed");
        Ok(level)
    }

    pub async fn add_route(
        &self,
        destination: &str,
        next_hop: &str,
        metric: u32,
    ) -> Result<(), ControllerError> {
        let (destination, next_hop) = parse_route(destination, next_hop)?;
        self.tun.add_route(destination, next_hop, metric).await?;
        Ok(())
    }

    pub async fn remove_route(&self, destination: &str, next_hop: &str) -> Result<(), ControllerError> {
        let (destination, next_hop) = parse_route(destination, next_hop)?;
        self.tun.remove_route(destination, next_hop).await?;
        Ok(())
    }

    pub async fn status(&self, only_loaded: bool) -> RuntimeConfig {
        self.ctx.status(only_loaded).await
    }

    pub async fn metrics(&self) -> Vec<IdentityRecord> {
        self.ctx.registry().metrics().await
    }

    fn spawn_metrics_ticker(&self) {
        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.options.metrics_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let identities = this.metrics().await;
                        this.ctx.events().broadcast(Event::Metrics { identities }).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Metrics ticker stopped");
        });
    }

    /// Announce shutdown, close sessions, persist and tear down the interface.
    pub async fn shutdown(&self, reason: &str) {
        if self.shutdown.send_replace(true) {
            debug!("Shutdown already in progress");
            return;
        }
        info!(%reason, "Shutting down tunnel");
        self.ctx
            .events()
            .broadcast(Event::Shutdown {
                reason: reason.to_string(),
            })
            .await;

        for session in self.ctx.registry().drain_sessions().await {
            session.close();
        }
        self.ctx.update_settings(|s| s.active = false).await;
        if let Err(e) = self.ctx.persist().await {
            error!(error = %e, "Failed to persist state during shutdown");
        }
        self.tun.close().await;
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.ctx.persist().await {
            error!(error = %e, "Failed to persist state");
        }
    }
}

fn parse_route(destination: &str, next_hop: &str) -> Result<(Ipv4Net, Ipv4Addr), ControllerError> {
    let destination: Ipv4Net = destination
        .trim()
        .parse()
        .or_else(|_| destination.trim().parse::<Ipv4Addr>().map(Ipv4Net::from))
        .map_err(|_| ControllerError::InvalidRoute(format!("bad destination {destination}")))?;
    let next_hop: Ipv4Addr = next_hop
        .trim()
        .parse()
        .map_err(|_| ControllerError::InvalidRoute(format!("bad next hop {next_hop}")))?;
    Ok((destination, next_hop))
}
