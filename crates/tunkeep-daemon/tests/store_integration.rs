#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Startup recovery over a real config directory.
//!
//! Exercises the same steps the daemon runs before the tunnel starts:
//! load (with backup fallback), orphan scan, normalization and save.

use serde_json::json;

use tunkeep_core::config::identity_file_in;
use tunkeep_core::policy::{IPV4_MIN_MASK, RECOVERED_IDENTITY_NAME};
use tunkeep_core::{IdentityRecord, RuntimeConfig};
use tunkeep_daemon::identity::credential::{
    AddressUpdate, CredentialFile, original_path, update_controller_address, update_path,
};
use tunkeep_daemon::store::{ConfigStore, StoreError, scan_for_orphans};

fn write_credential(dir: &std::path::Path, key: &str, controller: &str) -> String {
    let cred = CredentialFile::from_value(json!({
        "controller": controller,
        "id": { "key": key, "cert": format!("cert-{key}"), "ca": "ca" },
        "extra_setting": 7
    }))
    .unwrap();
    let fingerprint = cred.fingerprint();
    cred.write(&identity_file_in(dir, &fingerprint)).unwrap();
    fingerprint
}

/// Load, scan and normalize the way the daemon does at startup.
fn startup(store: &ConfigStore) -> RuntimeConfig {
    let mut cfg = store.load_or_purge().unwrap();
    let recovered = scan_for_orphans(&mut cfg, store.dir());
    let normalized = cfg.normalize();
    if !recovered.is_empty() || normalized {
        store.save(&cfg).unwrap();
    }
    cfg
}

#[test]
fn lost_config_recovers_identities_from_credential_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    let a = write_credential(dir.path(), "alpha", "https://ctrl-a.example");
    let b = write_credential(dir.path(), "beta", "https://ctrl-b.example");
    std::fs::write(dir.path().join("notes.json"), "{\"hello\":true}").unwrap();

    let cfg = startup(&store);
    assert_eq!(cfg.identities.len(), 2);
    for fp in [&a, &b] {
        let rec = cfg.identity(fp).unwrap();
        assert_eq!(rec.name, RECOVERED_IDENTITY_NAME);
        assert!(!rec.active);
    }
    assert_eq!(
        cfg.identity(&a).unwrap().controller,
        "https://ctrl-a.example"
    );

    // Persisted, and a second startup adds nothing.
    let again = startup(&store);
    assert_eq!(again, cfg);
}

#[test]
fn known_identities_keep_their_settings() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    let fp = write_credential(dir.path(), "alpha", "https://ctrl.example");
    store
        .save(&RuntimeConfig {
            tun_ipv4_mask: 30,
            notification_frequency: 5,
            identities: vec![IdentityRecord {
                name: "office".into(),
                fingerprint: fp.clone(),
                active: true,
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();

    let cfg = startup(&store);
    assert_eq!(cfg.identities.len(), 1);
    assert_eq!(cfg.identities[0].name, "office");
    assert!(cfg.identities[0].active);
    assert_eq!(cfg.tun_ipv4_mask, IPV4_MIN_MASK);
    assert_eq!(store.load().unwrap().tun_ipv4_mask, IPV4_MIN_MASK);
}

#[test]
fn corrupt_primary_is_recovered_from_backup_on_startup() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    let first = RuntimeConfig {
        log_level: "debug".into(),
        notification_frequency: 10,
        ..Default::default()
    };
    store.save(&first).unwrap();
    store.save(&first).unwrap();
    std::fs::write(store.file(), "{ truncated").unwrap();

    let cfg = startup(&store);
    assert_eq!(cfg.log_level, "debug");
    assert_eq!(cfg.notification_frequency, 10);
}

#[test]
fn unrecoverable_state_is_purged_and_next_start_is_clean() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    std::fs::write(store.file(), "").unwrap();
    std::fs::write(store.backup_file(), "not json").unwrap();

    assert!(matches!(
        store.load_or_purge(),
        Err(StoreError::Corrupt { .. })
    ));
    assert_eq!(store.load_or_purge().unwrap(), RuntimeConfig::default());
}

#[test]
fn interrupted_address_update_is_restored_and_adopted() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    let fp = write_credential(dir.path(), "alpha", "https://old.example");
    let path = identity_file_in(dir.path(), &fp);

    // Simulate a crash after the file was moved aside.
    std::fs::rename(&path, update_path(&path)).unwrap();

    let cfg = startup(&store);
    assert!(path.exists());
    assert!(!update_path(&path).exists());
    assert_eq!(cfg.identity(&fp).unwrap().controller, "https://old.example");
}

#[test]
fn address_updates_archive_the_first_original_only() {
    let dir = tempfile::TempDir::new().unwrap();
    let fp = write_credential(dir.path(), "alpha", "https://old.example");
    let path = identity_file_in(dir.path(), &fp);

    let first = update_controller_address(&path, "new.example").unwrap();
    assert_eq!(
        first,
        AddressUpdate::Updated {
            previous: "https://old.example".into(),
            current: "https://new.example".into(),
        }
    );
    update_controller_address(&path, "https://newer.example").unwrap();
    assert_eq!(
        update_controller_address(&path, "https://newer.example").unwrap(),
        AddressUpdate::Unchanged
    );

    let original = CredentialFile::read(&original_path(&path)).unwrap();
    assert_eq!(original.controller, "https://old.example");
    let current = CredentialFile::read(&path).unwrap();
    assert_eq!(current.controller, "https://newer.example");
    assert_eq!(current.extra.get("extra_setting"), Some(&json!(7)));
    assert_eq!(current.fingerprint(), fp);

    // The archive is not mistaken for a second identity.
    let mut cfg = RuntimeConfig::default();
    assert_eq!(scan_for_orphans(&mut cfg, dir.path()), vec![fp]);
}
