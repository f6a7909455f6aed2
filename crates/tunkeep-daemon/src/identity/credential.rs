//! Identity credential files.
//!
//! One JSON document per identity, named `<fingerprint>.json`, holding the
//! key material and the controller address. Unknown fields are preserved
//! when a file is rewritten.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from reading or rewriting credential files.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("could not read identity file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("identity file {path} is not a valid credential: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("credential has no key material")]
    MissingKey,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize credential: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Secret key material. Wiped from memory on drop.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub ca: String,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("cert_len", &self.cert.len())
            .field("ca_len", &self.ca.len())
            .finish()
    }
}

impl KeyMaterial {
    pub fn has_key(&self) -> bool {
        !self.key.trim().is_empty()
    }
}

/// Parsed credential file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFile {
    /// Controller URL.
    #[serde(default)]
    pub controller: String,
    #[serde(default)]
    pub id: KeyMaterial,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialFile {
    pub fn read(path: &Path) -> Result<Self, CredentialError> {
        let data = std::fs::read(path).map_err(|source| CredentialError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| CredentialError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build a credential from a client-supplied JSON document.
    pub fn from_value(value: Value) -> Result<Self, CredentialError> {
        let cred: Self = serde_json::from_value(value)?;
        if !cred.id.has_key() {
            return Err(CredentialError::MissingKey);
        }
        Ok(cred)
    }

    /// Read a file and return it only if it looks like a credential.
    pub fn probe(path: &Path) -> Option<Self> {
        match Self::read(path) {
            Ok(cred) if cred.id.has_key() => Some(cred),
            Ok(_) => {
                debug!(path = %path.display(), "JSON file does not appear to be an identity");
                None
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "File is not a credential");
                None
            }
        }
    }

    /// Stable fingerprint: lowercase hex SHA-256 of the certificate, or of
    /// the key when no certificate is present.
    pub fn fingerprint(&self) -> String {
        let material = if self.id.cert.trim().is_empty() {
            &self.id.key
        } else {
            &self.id.cert
        };
        hex::encode(Sha256::digest(material.trim().as_bytes()))
    }

    /// Write the credential to `path`, replacing any existing file.
    ///
    /// The contents go to a temporary sibling that is renamed over `path`,
    /// so `path` is never observed half-written.
    pub fn write(&self, path: &Path) -> Result<(), CredentialError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = std::io::BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, self)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        restrict_permissions(tmp.path())?;
        tmp.persist(path).map_err(|e| CredentialError::Io(e.error))?;
        Ok(())
    }
}

/// Outcome of a controller address update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressUpdate {
    Unchanged,
    Updated { previous: String, current: String },
}

/// Prefix `https://` unless already present.
pub fn normalize_controller_address(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{address}")
    }
}

/// Sibling holding the first-ever archived copy of a credential.
pub fn original_path(path: &Path) -> PathBuf {
    with_suffix(path, ".original")
}

/// Transient sibling that exists only while an address update is in flight.
pub fn update_path(path: &Path) -> PathBuf {
    with_suffix(path, ".address.update")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Replace the controller address stored in a credential file.
///
/// The first call archives the untouched file to `.original`; later calls
/// leave that archive alone. The file is moved aside to `.address.update`
/// while the new contents are written, so an interruption leaves either the
/// moved-aside original or the complete new file.
pub fn update_controller_address(
    path: &Path,
    new_address: &str,
) -> Result<AddressUpdate, CredentialError> {
    debug!(path = %path.display(), new_address, "Request to update controller address");
    let mut cred = CredentialFile::read(path)?;

    let new_address = normalize_controller_address(new_address);
    if cred.controller == new_address {
        debug!(path = %path.display(), address = %new_address, "Address already set; not updating");
        return Ok(AddressUpdate::Unchanged);
    }

    archive_original(path)?;

    let staged = update_path(path);
    debug!(from = %path.display(), to = %staged.display(), "Moving identity file aside");
    std::fs::rename(path, &staged)?;

    let previous = std::mem::replace(&mut cred.controller, new_address.clone());
    info!(
        path = %path.display(),
        from = %previous,
        to = %new_address,
        "Updating identity file with new controller address"
    );

    if let Err(e) = cred.write(path) {
        warn!(path = %path.display(), error = %e, "Rewrite failed; restoring previous identity file");
        std::fs::rename(&staged, path)?;
        return Err(e);
    }

    if let Err(e) = std::fs::remove_file(&staged) {
        warn!(path = %staged.display(), error = %e, "Could not remove staged identity file");
    }

    Ok(AddressUpdate::Updated {
        previous,
        current: new_address,
    })
}

/// Copy `path` to its `.original` sibling unless an archive already exists.
/// Returns `true` when a new archive was written.
pub fn archive_original(path: &Path) -> std::io::Result<bool> {
    let original = original_path(path);
    if original.exists() {
        debug!(path = %original.display(), "Original identity already archived; not overwriting");
        return Ok(false);
    }
    debug!(from = %path.display(), to = %original.display(), "Archiving original identity file");
    std::fs::copy(path, &original)?;
    Ok(true)
}

/// Put back a credential left moved-aside by an interrupted address update.
/// Returns `true` when a file was restored.
pub fn recover_interrupted_update(path: &Path) -> std::io::Result<bool> {
    let staged = update_path(path);
    if path.exists() {
        if !staged.exists() {
            return Ok(false);
        }
        if CredentialFile::read(path).is_ok() {
            // The rewrite completed; only the cleanup was lost.
            debug!(path = %staged.display(), "Removing leftover staged identity file");
            std::fs::remove_file(&staged)?;
            return Ok(false);
        }
        warn!(
            path = %path.display(),
            "Identity file is unreadable after interrupted address update; restoring staged copy"
        );
        std::fs::rename(&staged, path)?;
        return Ok(true);
    }
    if !staged.exists() {
        return Ok(false);
    }
    warn!(path = %path.display(), "Restoring identity file from interrupted address update");
    std::fs::rename(&staged, path)?;
    Ok(true)
}

/// Delete a credential file and its archive. Missing files are ignored.
pub fn remove_credential_files(path: &Path) -> std::io::Result<()> {
    for p in [path.to_path_buf(), original_path(path), update_path(path)] {
        match std::fs::remove_file(&p) {
            Ok(()) => debug!(path = %p.display(), "Removed identity file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_credential(dir: &Path, name: &str, controller: &str) -> PathBuf {
        let path = dir.join(name);
        let doc = json!({
            "controller": controller,
            "id": { "key": "pem:KEY", "cert": "pem:CERT", "ca": "pem:CA" },
            "configTypes": ["intercept.v1"],
        });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn address_is_normalized() {
        assert_eq!(
            normalize_controller_address("ctrl.example.com:443"),
            "https://ctrl.example.com:443"
        );
        assert_eq!(
            normalize_controller_address("https://ctrl.example.com"),
            "https://ctrl.example.com"
        );
    }

    #[test]
    fn probe_rejects_files_without_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"active": true}"#).unwrap();
        assert!(CredentialFile::probe(&path).is_none());
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let cred = CredentialFile::from_value(json!({
            "controller": "https://c",
            "id": { "key": "k", "cert": "c" }
        }))
        .unwrap();
        let fp = cred.fingerprint();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, cred.clone().fingerprint());
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn credential_without_key_rejected() {
        let err = CredentialFile::from_value(json!({"controller": "https://c"})).unwrap_err();
        assert!(matches!(err, CredentialError::MissingKey));
    }

    #[test]
    fn first_update_archives_original_and_second_keeps_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://old.example.com");

        let first = update_controller_address(&path, "new.example.com").unwrap();
        assert_eq!(
            first,
            AddressUpdate::Updated {
                previous: "https://old.example.com".into(),
                current: "https://new.example.com".into(),
            }
        );
        let archived = CredentialFile::read(&original_path(&path)).unwrap();
        assert_eq!(archived.controller, "https://old.example.com");

        update_controller_address(&path, "https://newer.example.com").unwrap();
        let archived = CredentialFile::read(&original_path(&path)).unwrap();
        assert_eq!(archived.controller, "https://old.example.com");

        let current = CredentialFile::read(&path).unwrap();
        assert_eq!(current.controller, "https://newer.example.com");
        assert_eq!(current.id.key, "pem:KEY");
        assert!(current.extra.contains_key("configTypes"));
        assert!(!update_path(&path).exists());
    }

    #[test]
    fn same_address_is_a_no_op() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://ctrl");
        assert_eq!(
            update_controller_address(&path, "ctrl").unwrap(),
            AddressUpdate::Unchanged
        );
        assert!(!original_path(&path).exists());
    }

    #[test]
    fn interrupted_update_is_recovered() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://ctrl");
        std::fs::rename(&path, update_path(&path)).unwrap();

        assert!(recover_interrupted_update(&path).unwrap());
        assert!(path.exists());
        assert!(!update_path(&path).exists());
        assert!(!recover_interrupted_update(&path).unwrap());
    }

    #[test]
    fn truncated_rewrite_is_replaced_by_staged_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://ctrl");
        std::fs::rename(&path, update_path(&path)).unwrap();
        std::fs::write(&path, r#"{"controller":"https://ne"#).unwrap();

        assert!(recover_interrupted_update(&path).unwrap());
        assert!(!update_path(&path).exists());
        let restored = CredentialFile::read(&path).unwrap();
        assert_eq!(restored.controller, "https://ctrl");
        assert_eq!(restored.id.key, "pem:KEY");
    }

    #[test]
    fn completed_rewrite_drops_leftover_staged_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://ctrl");
        std::fs::copy(&path, update_path(&path)).unwrap();

        assert!(!recover_interrupted_update(&path).unwrap());
        assert!(!update_path(&path).exists());
        assert_eq!(CredentialFile::read(&path).unwrap().controller, "https://ctrl");
    }

    #[test]
    fn write_replaces_file_and_leaves_no_temp_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://old");
        let mut cred = CredentialFile::read(&path).unwrap();
        cred.controller = "https://new".into();
        cred.write(&path).unwrap();

        assert_eq!(CredentialFile::read(&path).unwrap().controller, "https://new");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn remove_deletes_archive_too() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_credential(dir.path(), "abc.json", "https://ctrl");
        update_controller_address(&path, "https://other").unwrap();
        remove_credential_files(&path).unwrap();
        assert!(!path.exists());
        assert!(!original_path(&path).exists());
        remove_credential_files(&path).unwrap();
    }
}
