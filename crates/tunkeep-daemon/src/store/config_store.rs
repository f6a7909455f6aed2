//! Crash-safe persistence of the runtime configuration.
//!
//! The primary file is mirrored to a `.backup` sibling before every write,
//! and the new contents are written to a temporary file that is renamed
//! over the primary, so a reader never sees a half-written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use tunkeep_core::RuntimeConfig;
use tunkeep_core::config::CONFIG_FILE_NAME;

/// Errors from loading or saving the runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("config file {path} contains no bytes")]
    Empty { path: PathBuf },

    #[error("config file {path} could not be parsed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Neither the primary nor the backup file is usable. Not recoverable.
    #[error("config file is not valid nor is the backup file (primary: {primary}; backup: {backup})")]
    Corrupt { primary: String, backup: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Loads and saves `config.json` in the configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    file: PathBuf,
    backup: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let file = dir.join(CONFIG_FILE_NAME);
        let backup = dir.join(format!("{CONFIG_FILE_NAME}.backup"));
        Self { dir, file, backup }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn backup_file(&self) -> &Path {
        &self.backup
    }

    /// Load the configuration, falling back to the backup when the primary
    /// file is unusable.
    ///
    /// A missing primary file yields a fresh default config. When both the
    /// primary and the backup fail to parse, returns [`StoreError::Corrupt`].
    pub fn load(&self) -> Result<RuntimeConfig, StoreError> {
        let primary_err = match read_config(&self.file) {
            Ok(cfg) => return Ok(cfg),
            Err(e) => e,
        };
        warn!(path = %self.file.display(), error = %primary_err, "Config file unusable, trying backup");

        match read_config(&self.backup) {
            Ok(cfg) => {
                info!(path = %self.backup.display(), "Recovered config from backup");
                Ok(cfg)
            }
            Err(backup_err) => Err(StoreError::Corrupt {
                primary: primary_err.to_string(),
                backup: backup_err.to_string(),
            }),
        }
    }

    /// Load the configuration; if it is unrecoverable, delete both files
    /// before returning the error so the next start begins clean.
    pub fn load_or_purge(&self) -> Result<RuntimeConfig, StoreError> {
        match self.load() {
            Err(e @ StoreError::Corrupt { .. }) => {
                error!(error = %e, "Deleting unusable config and backup files");
                self.purge();
                Err(e)
            }
            other => other,
        }
    }

    /// Delete the primary and backup files.
    pub fn purge(&self) {
        for path in [&self.file, &self.backup] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed config file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove config file"),
            }
        }
    }

    /// Persist the configuration.
    ///
    /// Callers must not run two saves concurrently; the daemon serializes
    /// them through `RuntimeContext::persist`.
    pub fn save(&self, cfg: &RuntimeConfig) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;

        debug!("Backing up config");
        match self.backup_current() {
            Ok(true) => debug!(path = %self.backup.display(), "Config file backed up"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Could not back up config file"),
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = std::io::BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, cfg)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.file).map_err(|e| StoreError::Io(e.error))?;

        debug!(path = %self.file.display(), "State saved");
        Ok(())
    }

    /// Copy the current primary file over the backup. Returns `false` when
    /// there is no primary yet.
    fn backup_current(&self) -> std::io::Result<bool> {
        if !self.file.exists() {
            return Ok(false);
        }
        std::fs::copy(&self.file, &self.backup)?;
        Ok(true)
    }
}

fn read_config(path: &Path) -> Result<RuntimeConfig, StoreError> {
    info!(path = %path.display(), "Reading config file");
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Config file does not exist; normal for a new install");
            return Ok(RuntimeConfig::default());
        }
        Err(e) => return Err(e.into()),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(StoreError::Empty {
            path: path.to_path_buf(),
        });
    }
    serde_json::from_slice(&data).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
