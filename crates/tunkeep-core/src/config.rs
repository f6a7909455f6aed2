//! Agent path resolution.
//!
//! Paths are resolved in priority order:
//! 1. Explicit values (CLI arguments)
//! 2. Environment variables (`TUNKEEP_CONFIG_DIR`, `TUNKEEP_RUNTIME_DIR`)
//! 3. Platform defaults from `dirs`

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the persisted runtime configuration file.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Command channel socket name.
pub const COMMAND_SOCKET_NAME: &str = "command.sock";

/// Event channel socket name.
pub const EVENT_SOCKET_NAME: &str = "events.sock";

/// Filesystem locations used by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    /// Directory holding `config.json` and identity credential files.
    pub config_dir: PathBuf,
    /// Directory holding the control-channel sockets.
    pub runtime_dir: PathBuf,
}

impl AgentPaths {
    /// Build paths from explicit directories.
    pub fn new(config_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Resolve paths, preferring the given overrides, then the environment,
    /// then platform defaults.
    pub fn resolve(config_dir: Option<PathBuf>, runtime_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = config_dir
            .or_else(|| std::env::var_os("TUNKEEP_CONFIG_DIR").map(PathBuf::from))
            .or_else(|| dirs::config_dir().map(|p| p.join("tunkeep")))
            .ok_or_else(|| Error::Config("cannot determine configuration directory".into()))?;
        let runtime_dir = runtime_dir
            .or_else(|| std::env::var_os("TUNKEEP_RUNTIME_DIR").map(PathBuf::from))
            .or_else(|| dirs::runtime_dir().map(|p| p.join("tunkeep")))
            .unwrap_or_else(|| std::env::temp_dir().join("tunkeep"));
        Ok(Self {
            config_dir,
            runtime_dir,
        })
    }

    /// Path of the persisted runtime configuration.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Path of the credential file for an identity.
    pub fn identity_file(&self, fingerprint: &str) -> PathBuf {
        identity_file_in(&self.config_dir, fingerprint)
    }

    /// Command channel socket path.
    pub fn command_socket(&self) -> PathBuf {
        self.runtime_dir.join(COMMAND_SOCKET_NAME)
    }

    /// Event channel socket path.
    pub fn event_socket(&self) -> PathBuf {
        self.runtime_dir.join(EVENT_SOCKET_NAME)
    }
}

/// Credential files are named `<fingerprint>.json`.
pub fn identity_file_in(dir: &Path, fingerprint: &str) -> PathBuf {
    dir.join(format!("{fingerprint}.json"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dirs_win() {
        let paths = AgentPaths::resolve(Some("/etc/tk".into()), Some("/run/tk".into())).unwrap();
        assert_eq!(paths.config_file(), PathBuf::from("/etc/tk/config.json"));
        assert_eq!(paths.command_socket(), PathBuf::from("/run/tk/command.sock"));
        assert_eq!(paths.event_socket(), PathBuf::from("/run/tk/events.sock"));
    }

    #[test]
    fn identity_file_named_by_fingerprint() {
        let paths = AgentPaths::new("/etc/tk", "/run/tk");
        assert_eq!(
            paths.identity_file("abc123"),
            PathBuf::from("/etc/tk/abc123.json")
        );
    }
}
