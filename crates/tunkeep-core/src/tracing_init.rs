//! Shared tracing/logging initialization.
//!
//! The daemon and the CLI use the same pattern for setting up
//! `tracing_subscriber` with an env-filter and optional JSON output. The
//! filter sits behind a reload layer so the daemon can change its level at
//! runtime.

use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Handle for changing the active log filter after initialisation.
#[derive(Clone)]
pub struct LogLevelHandle {
    crate_name: String,
    handle: reload::Handle<EnvFilter, Registry>,
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("crate_name", &self.crate_name)
            .finish_non_exhaustive()
    }
}

impl LogLevelHandle {
    /// Replace the filter with `<crate>=<level>`.
    pub fn set_level(&self, level: &str) -> Result<()> {
        let level = normalize_level(level)?;
        let filter = EnvFilter::try_new(format!("{}={level}", self.crate_name))
            .map_err(|e| Error::Config(e.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Validate a level name and return it lowercased.
pub fn normalize_level(level: &str) -> Result<String> {
    let lower = level.trim().to_ascii_lowercase();
    match lower.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(lower),
        _ => Err(Error::Config(format!("unknown log level: {level}"))),
    }
}

/// Initialise the global tracing subscriber.
///
/// * `crate_name` -- target the level applies to (e.g. `"tunkeep_daemon"`).
/// * `level` -- default level when `RUST_LOG` is not set.
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Logs go to stderr so CLI output on stdout stays clean.
pub fn init_tracing(crate_name: &str, level: &str, log_json: bool) -> LogLevelHandle {
    let env_filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("{crate_name}={level}")),
    );
    let (filter, handle) = reload::Layer::new(env_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    LogLevelHandle {
        crate_name: crate_name.to_string(),
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive() {
        assert_eq!(normalize_level("DEBUG").ok().as_deref(), Some("debug"));
        assert_eq!(normalize_level(" warn ").ok().as_deref(), Some("warn"));
    }

    #[test]
    fn unknown_level_rejected() {
        assert!(normalize_level("verbose").is_err());
    }
}
