//! Fingerprint-keyed map of identities, shared between command handlers,
//! load tasks and the metrics ticker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{debug, info};

use tunkeep_core::IdentityRecord;
use tunkeep_core::policy::UNKNOWN_IDENTITY_NAME;

use super::credential::KeyMaterial;
use super::types::{Identity, LoadState};
use crate::transport::{SessionInfo, TunnelSession};

/// Result of folding a successful session into the registry.
#[derive(Debug, Clone)]
pub struct LoadCompletion {
    pub record: IdentityRecord,
    /// The display name was replaced and the registry should be persisted.
    pub name_changed: bool,
}

/// Registry of known identities. A fingerprint maps to at most one entry.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    identities: RwLock<HashMap<String, Identity>>,
    /// Set by `drain_sessions`; no session may be attached afterwards.
    /// Only written while holding the map's write lock.
    drained: AtomicBool,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        let identities = records
            .into_iter()
            .map(|r| (r.fingerprint.clone(), Identity::new(r)))
            .collect();
        Self {
            identities: RwLock::new(identities),
            drained: AtomicBool::new(false),
        }
    }

    /// Insert an identity. Returns `false` and leaves the map unchanged if the
    /// fingerprint is already present.
    pub async fn insert(&self, identity: Identity) -> bool {
        let mut ids = self.identities.write().await;
        if ids.contains_key(identity.fingerprint()) {
            return false;
        }
        ids.insert(identity.record.fingerprint.clone(), identity);
        true
    }

    /// Look up an identity. `None` means no such identity, not an error.
    pub async fn find(&self, fingerprint: &str) -> Option<Identity> {
        self.identities.read().await.get(fingerprint).cloned()
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        self.identities.read().await.contains_key(fingerprint)
    }

    pub async fn remove_by_fingerprint(&self, fingerprint: &str) -> Option<Identity> {
        let removed = self.identities.write().await.remove(fingerprint);
        if removed.is_some() {
            debug!(%fingerprint, "Identity removed from registry");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.identities.read().await.is_empty()
    }

    /// Mark an identity as loading. Returns `false` if it is unknown, already
    /// loading or loaded.
    pub async fn begin_load(&self, fingerprint: &str) -> bool {
        let mut ids = self.identities.write().await;
        match ids.get_mut(fingerprint) {
            Some(id) if id.state == LoadState::Unloaded => {
                id.state = LoadState::Loading;
                true
            }
            _ => false,
        }
    }

    /// Keep key material on a loading identity until its session is up.
    pub async fn hold_secrets(&self, fingerprint: &str, secrets: KeyMaterial) {
        if let Some(id) = self.identities.write().await.get_mut(fingerprint)
            && id.state == LoadState::Loading
        {
            id.secrets = Some(secrets);
        }
    }

    /// Return a loading identity to `Unloaded` after a failed attempt.
    pub async fn fail_load(&self, fingerprint: &str) {
        if let Some(id) = self.identities.write().await.get_mut(fingerprint)
            && id.state == LoadState::Loading
        {
            id.state = LoadState::Unloaded;
            id.secrets = None;
        }
    }

    /// Fold an established session into the registry.
    ///
    /// Returns `None` if the identity was removed or turned off while the
    /// session was being established, or if sessions were already drained;
    /// the caller owns closing the session in that case.
    pub async fn complete_load(
        &self,
        fingerprint: &str,
        info: &SessionInfo,
        session: Arc<dyn TunnelSession>,
    ) -> Option<LoadCompletion> {
        let mut ids = self.identities.write().await;
        if self.drained.load(Ordering::SeqCst) {
            debug!(%fingerprint, "Sessions drained during load");
            return None;
        }
        let Some(id) = ids.get_mut(fingerprint) else {
            debug!(%fingerprint, "Identity removed during load");
            return None;
        };
        if id.state == LoadState::Unloaded && !id.record.active {
            debug!(%fingerprint, "Identity turned off during load");
            return None;
        }

        id.record.controller.clone_from(&info.controller);
        id.record.controller_version.clone_from(&info.controller_version);
        id.state = LoadState::Loaded;
        let name_changed = adopt_remote_name(&mut id.record, &info.name);
        id.secrets = None;
        id.record.mfa_enabled = info.mfa_enabled;
        id.record.mfa_needed = info.mfa_needed;
        id.session = Some(session);

        info!(%fingerprint, name = %id.record.name, controller = %id.record.controller, "Identity loaded");
        Some(LoadCompletion {
            record: id.to_record(),
            name_changed,
        })
    }

    /// Detach the live session and mark the identity `Unloaded`.
    pub async fn unload(&self, fingerprint: &str) -> Option<Arc<dyn TunnelSession>> {
        let mut ids = self.identities.write().await;
        let id = ids.get_mut(fingerprint)?;
        id.state = LoadState::Unloaded;
        id.secrets = None;
        id.session.take()
    }

    /// Set the persisted active flag. Returns the updated record.
    pub async fn set_active(&self, fingerprint: &str, active: bool) -> Option<IdentityRecord> {
        let mut ids = self.identities.write().await;
        let id = ids.get_mut(fingerprint)?;
        id.record.active = active;
        Some(id.to_record())
    }

    /// Update MFA flags on the record and on the live session. No-op for an
    /// unknown fingerprint.
    pub async fn update_mfa(
        &self,
        fingerprint: &str,
        enabled: bool,
        needed: bool,
    ) -> Option<IdentityRecord> {
        let mut ids = self.identities.write().await;
        let id = ids.get_mut(fingerprint)?;
        id.record.mfa_enabled = enabled;
        id.record.mfa_needed = needed;
        id.record.mfa_last_updated_time = Some(unix_millis());
        if let Some(session) = &id.session {
            session.set_mfa(enabled, needed);
        }
        Some(id.to_record())
    }

    pub async fn set_notified(&self, fingerprint: &str, notified: bool) -> Option<IdentityRecord> {
        let mut ids = self.identities.write().await;
        let id = ids.get_mut(fingerprint)?;
        id.record.notified = notified;
        Some(id.to_record())
    }

    pub async fn set_controller(&self, fingerprint: &str, controller: &str) -> Option<IdentityRecord> {
        let mut ids = self.identities.write().await;
        let id = ids.get_mut(fingerprint)?;
        controller.clone_into(&mut id.record.controller);
        Some(id.to_record())
    }

    /// Records sorted by fingerprint. With `only_loaded`, identities without a
    /// live session are skipped.
    pub async fn records(&self, only_loaded: bool) -> Vec<IdentityRecord> {
        let ids = self.identities.read().await;
        let mut out: Vec<IdentityRecord> = ids
            .values()
            .filter(|id| !only_loaded || id.is_loaded())
            .map(Identity::to_record)
            .collect();
        out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        out
    }

    /// Records as persisted: live metrics and the loaded flag are dropped.
    pub async fn persisted_records(&self) -> Vec<IdentityRecord> {
        let mut out = self.records(false).await;
        for r in &mut out {
            r.loaded = false;
            r.metrics = None;
        }
        out
    }

    /// Per-identity metrics view.
    pub async fn metrics(&self) -> Vec<IdentityRecord> {
        self.records(false)
            .await
            .into_iter()
            .map(|r| IdentityRecord {
                name: r.name,
                fingerprint: r.fingerprint,
                active: r.active,
                mfa_enabled: r.mfa_enabled,
                mfa_needed: r.mfa_needed,
                mfa_min_timeout: r.mfa_min_timeout,
                mfa_max_timeout: r.mfa_max_timeout,
                mfa_min_timeout_rem: r.mfa_min_timeout_rem,
                mfa_max_timeout_rem: r.mfa_max_timeout_rem,
                metrics: r.metrics,
                ..Default::default()
            })
            .collect()
    }

    /// Detach every live session on shutdown. Loads finishing afterwards are
    /// refused by `complete_load`.
    pub async fn drain_sessions(&self) -> Vec<Arc<dyn TunnelSession>> {
        let mut ids = self.identities.write().await;
        self.drained.store(true, Ordering::SeqCst);
        ids.values_mut()
            .filter_map(|id| {
                id.state = LoadState::Unloaded;
                id.session.take()
            })
            .collect()
    }
}

/// Replace the display name unless the remote reports the unknown sentinel.
fn adopt_remote_name(record: &mut IdentityRecord, remote: &str) -> bool {
    if remote.is_empty() || remote == UNKNOWN_IDENTITY_NAME {
        debug!(fingerprint = %record.fingerprint, "Remote name unknown; keeping current name");
        return false;
    }
    if record.name == remote {
        return false;
    }
    remote.clone_into(&mut record.name);
    true
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tunkeep_core::TransferMetrics;

    #[derive(Default)]
    struct FakeSession {
        mfa: Mutex<Option<(bool, bool)>>,
    }

    impl TunnelSession for FakeSession {
        fn metrics(&self) -> TransferMetrics {
            TransferMetrics { up: 7, down: 9 }
        }
        fn set_mfa(&self, enabled: bool, needed: bool) {
            *self.mfa.lock().unwrap() = Some((enabled, needed));
        }
        fn close(&self) {}
    }

    fn record(fp: &str, name: &str) -> IdentityRecord {
        IdentityRecord {
            name: name.into(),
            fingerprint: fp.into(),
            active: true,
            ..Default::default()
        }
    }

    fn info(name: &str) -> SessionInfo {
        SessionInfo {
            name: name.into(),
            controller: "https://ctrl".into(),
            controller_version: "v1.2.3".into(),
            mfa_enabled: true,
            mfa_needed: false,
        }
    }

    #[tokio::test]
    async fn find_unknown_is_none() {
        let reg = IdentityRegistry::new();
        assert!(reg.find("nope").await.is_none());
        assert!(reg.update_mfa("nope", true, true).await.is_none());
        assert!(reg.set_notified("nope", true).await.is_none());
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_fingerprint() {
        let reg = IdentityRegistry::new();
        assert!(reg.insert(record("a", "one").into()).await);
        assert!(!reg.insert(record("a", "two").into()).await);
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.find("a").await.unwrap().record.name, "one");
    }

    #[tokio::test]
    async fn load_completes_and_keeps_name_on_sentinel() {
        let reg = IdentityRegistry::from_records([record("a", "office")]);
        assert!(reg.begin_load("a").await);
        assert!(!reg.begin_load("a").await);

        let done = reg
            .complete_load("a", &info(UNKNOWN_IDENTITY_NAME), Arc::new(FakeSession::default()))
            .await
            .unwrap();
        assert!(!done.name_changed);
        assert_eq!(done.record.name, "office");
        assert!(done.record.loaded);
        assert!(done.record.mfa_enabled);
        assert_eq!(done.record.controller_version, "v1.2.3");
        assert_eq!(done.record.metrics, Some(TransferMetrics { up: 7, down: 9 }));
        assert!(!reg.begin_load("a").await);
    }

    #[tokio::test]
    async fn load_adopts_real_remote_name() {
        let reg = IdentityRegistry::from_records([record("b", "recovered identity")]);
        assert!(reg.begin_load("b").await);
        reg.hold_secrets("b", KeyMaterial::default()).await;
        assert!(reg.find("b").await.unwrap().secrets.is_some());
        let done = reg
            .complete_load("b", &info("laptop"), Arc::new(FakeSession::default()))
            .await
            .unwrap();
        assert!(done.name_changed);
        let stored = reg.find("b").await.unwrap();
        assert_eq!(stored.record.name, "laptop");
        assert!(stored.secrets.is_none());
    }

    #[tokio::test]
    async fn unknown_identity_never_loads() {
        let reg = IdentityRegistry::new();
        assert!(!reg.begin_load("gone").await);
        assert!(
            reg.complete_load("gone", &info("x"), Arc::new(FakeSession::default()))
                .await
                .is_none()
        );
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn removed_during_load_is_not_reinserted() {
        let reg = IdentityRegistry::from_records([record("a", "x")]);
        assert!(reg.begin_load("a").await);
        assert!(reg.remove_by_fingerprint("a").await.is_some());
        assert!(
            reg.complete_load("a", &info("renamed"), Arc::new(FakeSession::default()))
                .await
                .is_none()
        );
        assert!(reg.find("a").await.is_none());
    }

    #[tokio::test]
    async fn no_session_attaches_after_drain() {
        let reg = IdentityRegistry::from_records([record("a", "x")]);
        assert!(reg.begin_load("a").await);
        assert!(reg.drain_sessions().await.is_empty());
        assert!(
            reg.complete_load("a", &info("x"), Arc::new(FakeSession::default()))
                .await
                .is_none()
        );
        assert!(!reg.find("a").await.unwrap().is_loaded());
    }

    #[tokio::test]
    async fn failed_load_returns_to_unloaded() {
        let reg = IdentityRegistry::from_records([record("a", "x")]);
        assert!(reg.begin_load("a").await);
        reg.fail_load("a").await;
        assert_eq!(reg.find("a").await.unwrap().state, LoadState::Unloaded);
        assert!(reg.begin_load("a").await);
    }

    #[tokio::test]
    async fn mfa_update_reaches_live_session() {
        let reg = IdentityRegistry::from_records([record("a", "x")]);
        let session = Arc::new(FakeSession::default());
        reg.complete_load("a", &info("x"), session.clone()).await.unwrap();

        let updated = reg.update_mfa("a", true, true).await.unwrap();
        assert!(updated.mfa_needed);
        assert!(updated.mfa_last_updated_time.is_some());
        assert_eq!(*session.mfa.lock().unwrap(), Some((true, true)));
    }

    #[tokio::test]
    async fn only_loaded_filter_and_persisted_view() {
        let reg = IdentityRegistry::from_records([record("a", "x"), record("b", "y")]);
        reg.complete_load("b", &info("y"), Arc::new(FakeSession::default()))
            .await
            .unwrap();

        let loaded = reg.records(true).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].fingerprint, "b");
        assert_eq!(reg.records(false).await.len(), 2);

        let persisted = reg.persisted_records().await;
        assert!(persisted.iter().all(|r| !r.loaded && r.metrics.is_none()));
    }

    #[tokio::test]
    async fn unload_detaches_session() {
        let reg = IdentityRegistry::from_records([record("a", "x")]);
        reg.complete_load("a", &info("x"), Arc::new(FakeSession::default()))
            .await
            .unwrap();
        assert!(reg.unload("a").await.is_some());
        assert!(reg.unload("a").await.is_none());
        assert!(!reg.find("a").await.unwrap().is_loaded());
    }
}
