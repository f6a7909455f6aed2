//! Re-adopt credential files that the config file has lost track of.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use tunkeep_core::policy::RECOVERED_IDENTITY_NAME;
use tunkeep_core::{IdentityRecord, RuntimeConfig};

use crate::identity::credential::{CredentialFile, recover_interrupted_update};

const UPDATE_SUFFIX: &str = ".address.update";

/// Walk `dir` for `<fingerprint>.json` credential files that have no entry in
/// `cfg.identities` and append each as a recovered, inactive identity.
///
/// Credential files stranded by an interrupted address update are restored
/// first. Returns the fingerprints that were added; a second scan over the
/// same directory adds nothing.
pub fn scan_for_orphans(cfg: &mut RuntimeConfig, dir: &Path) -> Vec<String> {
    let entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot scan config directory for identities");
            return Vec::new();
        }
    };

    for staged in entries.iter().filter(|p| has_name_suffix(p, UPDATE_SUFFIX)) {
        let Some(target) = strip_name_suffix(staged, UPDATE_SUFFIX) else {
            continue;
        };
        if let Err(e) = recover_interrupted_update(&target) {
            warn!(path = %target.display(), error = %e, "Could not recover identity file");
        }
    }

    let mut added = Vec::new();
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default();
    candidates.sort();

    for path in candidates {
        if path.extension().is_none_or(|ext| ext != "json") || !path.is_file() {
            continue;
        }
        let Some(fingerprint) = fingerprint_from_path(&path) else {
            continue;
        };
        if cfg.identity(&fingerprint).is_some() {
            continue;
        }
        let Some(cred) = CredentialFile::probe(&path) else {
            continue;
        };
        info!(
            path = %path.display(),
            %fingerprint,
            "Identity file found in config directory but not in config; adding it back"
        );
        cfg.identities.push(IdentityRecord {
            name: RECOVERED_IDENTITY_NAME.to_string(),
            fingerprint: fingerprint.clone(),
            active: false,
            controller: cred.controller.clone(),
            ..Default::default()
        });
        added.push(fingerprint);
    }

    debug!(count = added.len(), "Orphan scan complete");
    added
}

/// The fingerprint is the file name up to its first dot.
fn fingerprint_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next()?;
    (!stem.is_empty()).then(|| stem.to_string())
}

fn has_name_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}

fn strip_name_suffix(path: &Path, suffix: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let base = name.strip_suffix(suffix)?;
    Some(path.with_file_name(base))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_credential(dir: &Path, fingerprint: &str) -> PathBuf {
        let path = dir.join(format!("{fingerprint}.json"));
        let doc = json!({
            "controller": "https://ctrl.example.com",
            "id": { "key": "pem:KEY", "cert": format!("pem:{fingerprint}") },
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn orphan_is_added_once() {
        let dir = tempfile::TempDir::new().unwrap();
        write_credential(dir.path(), "abc123");
        let mut cfg = RuntimeConfig::default();

        assert_eq!(scan_for_orphans(&mut cfg, dir.path()), vec!["abc123"]);
        assert!(scan_for_orphans(&mut cfg, dir.path()).is_empty());

        assert_eq!(cfg.identities.len(), 1);
        let record = &cfg.identities[0];
        assert_eq!(record.name, RECOVERED_IDENTITY_NAME);
        assert!(!record.active);
        assert_eq!(record.controller, "https://ctrl.example.com");
    }

    #[test]
    fn known_identities_are_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        write_credential(dir.path(), "abc123");
        let mut cfg = RuntimeConfig {
            identities: vec![IdentityRecord {
                name: "office".into(),
                fingerprint: "abc123".into(),
                active: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(scan_for_orphans(&mut cfg, dir.path()).is_empty());
        assert_eq!(cfg.identities[0].name, "office");
    }

    #[test]
    fn non_credentials_and_archives_are_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"active":false}"#).unwrap();
        std::fs::write(dir.path().join("config.json.backup"), "{}").unwrap();
        let path = write_credential(dir.path(), "abc123");
        std::fs::copy(&path, dir.path().join("abc123.json.original")).unwrap();

        let mut cfg = RuntimeConfig::default();
        assert_eq!(scan_for_orphans(&mut cfg, dir.path()), vec!["abc123"]);
    }

    #[test]
    fn stranded_update_is_restored_and_adopted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc123");
        std::fs::rename(&path, dir.path().join("abc123.json.address.update")).unwrap();

        let mut cfg = RuntimeConfig::default();
        assert_eq!(scan_for_orphans(&mut cfg, dir.path()), vec!["abc123"]);
        assert!(path.exists());
    }

    #[test]
    fn fingerprint_stops_at_first_dot() {
        assert_eq!(
            fingerprint_from_path(Path::new("/x/abc.json")).as_deref(),
            Some("abc")
        );
        assert_eq!(fingerprint_from_path(Path::new("/x/.json")), None);
    }
}
