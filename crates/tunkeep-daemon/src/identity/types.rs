use std::sync::Arc;

use tunkeep_core::IdentityRecord;

use super::credential::KeyMaterial;
use crate::transport::TunnelSession;

/// Load progress of an identity. Moves only forward; a failed load returns
/// to `Unloaded`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// Registry entry: the persisted record plus live, non-persisted state.
#[derive(Clone)]
pub struct Identity {
    pub record: IdentityRecord,
    pub state: LoadState,
    pub session: Option<Arc<dyn TunnelSession>>,
    /// Key material held only until the session is established.
    pub secrets: Option<KeyMaterial>,
}

impl Identity {
    pub fn new(record: IdentityRecord) -> Self {
        Self {
            record,
            state: LoadState::Unloaded,
            session: None,
            secrets: None,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.record.fingerprint
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    /// Record view with the live loaded flag and metrics filled in.
    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            loaded: self.is_loaded(),
            metrics: self.session.as_ref().map(|s| s.metrics()),
            ..self.record.clone()
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.record.fingerprint)
            .field("name", &self.record.name)
            .field("state", &self.state)
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl From<IdentityRecord> for Identity {
    fn from(record: IdentityRecord) -> Self {
        Self::new(record)
    }
}
