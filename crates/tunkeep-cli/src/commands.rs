//! CLI subcommands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Subcommand;
use serde_json::Value;
use tokio::sync::broadcast;

use tunkeep_core::ipc::{Event, Request, Response};
use tunkeep_core::{IdentityRecord, RuntimeConfig};

use crate::session::{ConnectionState, Connector, ControlSession};

/// Subcommands that map onto a single control request.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the tunnel status and identities
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
    /// Show per-identity transfer metrics
    Metrics,
    /// Register an identity from a credential file
    Add {
        /// Path to the credential JSON document
        file: PathBuf,
        /// Display name for the identity
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Turn an identity on
    On { fingerprint: String },
    /// Turn an identity off
    Off { fingerprint: String },
    /// Forget an identity and delete its credential file
    Remove { fingerprint: String },
    /// Record the MFA state of an identity
    Mfa {
        fingerprint: String,
        #[arg(long)]
        enabled: bool,
        #[arg(long)]
        needed: bool,
    },
    /// Set or clear the MFA-notified flag of an identity
    Notified {
        fingerprint: String,
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        value: bool,
    },
    /// Point an identity at a different controller
    SetController { fingerprint: String, address: String },
    /// Change the daemon log level
    LogLevel { level: String },
    /// Change the interface address, mask and DNS handling (applied on restart)
    TunIpv4 {
        /// IPv4 address; leave empty to keep the current one
        #[arg(default_value = "")]
        ip: String,
        #[arg(long, default_value_t = tunkeep_core::policy::DEFAULT_IPV4_MASK)]
        mask: u8,
        #[arg(long)]
        add_dns: Option<bool>,
        #[arg(long, default_value_t = 0)]
        page_size: u32,
    },
    /// Set the MFA notification frequency in minutes
    NotifyFrequency { minutes: u32 },
    /// Add a route through the tunnel interface
    RouteAdd {
        /// Destination CIDR or address
        destination: String,
        /// Gateway address
        next_hop: String,
        #[arg(long, default_value_t = 0)]
        metric: u32,
    },
    /// Remove a route from the tunnel interface
    RouteRemove { destination: String, next_hop: String },
}

impl Command {
    /// Build the control request for this subcommand.
    pub fn into_request(self) -> anyhow::Result<Request> {
        Ok(match self {
            Self::Status { .. } => Request::Status,
            Self::Metrics => Request::Metrics,
            Self::Add { file, name } => Request::AddIdentity {
                credential: read_credential(&file, name)?,
            },
            Self::On { fingerprint } => Request::IdentityOnOff {
                fingerprint,
                on: true,
            },
            Self::Off { fingerprint } => Request::IdentityOnOff {
                fingerprint,
                on: false,
            },
            Self::Remove { fingerprint } => Request::RemoveIdentity { fingerprint },
            Self::Mfa {
                fingerprint,
                enabled,
                needed,
            } => Request::UpdateMfa {
                fingerprint,
                enabled,
                needed,
            },
            Self::Notified { fingerprint, value } => Request::SetNotified {
                fingerprint,
                notified: value,
            },
            Self::SetController {
                fingerprint,
                address,
            } => Request::UpdateControllerAddress {
                fingerprint,
                address,
            },
            Self::LogLevel { level } => Request::SetLogLevel { level },
            Self::TunIpv4 {
                ip,
                mask,
                add_dns,
                page_size,
            } => Request::UpdateTunIpv4 {
                ip,
                mask,
                add_dns,
                api_page_size: page_size,
            },
            Self::NotifyFrequency { minutes } => Request::SetNotificationFrequency { minutes },
            Self::RouteAdd {
                destination,
                next_hop,
                metric,
            } => Request::AddRoute {
                destination,
                next_hop,
                metric,
            },
            Self::RouteRemove {
                destination,
                next_hop,
            } => Request::RemoveRoute {
                destination,
                next_hop,
            },
        })
    }
}

fn read_credential(path: &Path, name: Option<String>) -> anyhow::Result<Value> {
    let data = std::fs::read(path)
        .with_context(|| format!("cannot read credential file {}", path.display()))?;
    let mut credential: Value = serde_json::from_slice(&data)
        .with_context(|| format!("{} is not a JSON document", path.display()))?;
    if let Some(name) = name {
        let Some(obj) = credential.as_object_mut() else {
            bail!("{} is not a JSON object", path.display());
        };
        obj.insert("name".into(), Value::String(name));
    }
    Ok(credential)
}

/// Execute a one-shot subcommand.
pub async fn run<C: Connector>(
    session: &Arc<ControlSession<C>>,
    command: Command,
) -> anyhow::Result<()> {
    let raw_status = matches!(command, Command::Status { json: true });
    let request = command.into_request()?;
    let response = session.send(&request).await?;
    let mut out = io::stdout();
    write_response(&mut out, &request, &response, raw_status)?;
    if !response.is_success() {
        bail!(
            "{}: {}",
            response.message,
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn write_response(
    w: &mut impl Write,
    request: &Request,
    response: &Response,
    raw_status: bool,
) -> anyhow::Result<()> {
    if !response.is_success() {
        return Ok(());
    }
    match request {
        Request::Status if !raw_status => {
            let status: RuntimeConfig = response.payload_as()?;
            write_status(w, &status)?;
        }
        Request::Metrics => {
            let identities: Vec<IdentityRecord> = response.payload_as()?;
            write_metrics(w, &identities)?;
        }
        _ => {
            writeln!(w, "{}", response.message)?;
            if let Some(payload) = &response.payload {
                writeln!(w, "{}", serde_json::to_string_pretty(payload)?)?;
            }
        }
    }
    Ok(())
}

/// Write a status snapshot in human-readable form.
pub fn write_status(w: &mut impl Write, status: &RuntimeConfig) -> io::Result<()> {
    writeln!(
        w,
        "Tunnel:    {}",
        if status.active { "active" } else { "inactive" }
    )?;
    writeln!(w, "Version:   {}", status.service_version)?;
    writeln!(w, "Uptime:    {}s", status.duration / 1000)?;
    writeln!(
        w,
        "Address:   {}/{}",
        status.tun_ipv4, status.tun_ipv4_mask
    )?;
    if let Some(info) = &status.ip_info {
        writeln!(w, "Subnet:    {} (mtu {})", info.subnet, info.mtu)?;
        if !info.dns.is_empty() {
            writeln!(w, "DNS:       {}", info.dns)?;
        }
    }
    writeln!(w, "Log level: {}", status.log_level)?;
    writeln!(w)?;
    if status.identities.is_empty() {
        writeln!(w, "No identities.")?;
        return Ok(());
    }
    writeln!(
        w,
        "{:<16}  {:<6}  {:<6}  {:<5}  {:<16}  CONTROLLER",
        "FINGERPRINT", "ACTIVE", "LOADED", "MFA", "NAME"
    )?;
    for id in &status.identities {
        writeln!(
            w,
            "{:<16}  {:<6}  {:<6}  {:<5}  {:<16}  {}",
            truncate(&id.fingerprint, 16),
            yes_no(id.active),
            yes_no(id.loaded),
            mfa_label(id),
            truncate(&id.name, 16),
            id.controller
        )?;
    }
    Ok(())
}

fn write_metrics(w: &mut impl Write, identities: &[IdentityRecord]) -> io::Result<()> {
    if identities.is_empty() {
        writeln!(w, "No identities.")?;
        return Ok(());
    }
    writeln!(w, "{:<16}  {:<16}  {:>12}  {:>12}", "FINGERPRINT", "NAME", "UP", "DOWN")?;
    for id in identities {
        let metrics = id.metrics.unwrap_or_default();
        writeln!(
            w,
            "{:<16}  {:<16}  {:>12}  {:>12}",
            truncate(&id.fingerprint, 16),
            truncate(&id.name, 16),
            metrics.up,
            metrics.down
        )?;
    }
    Ok(())
}

/// Print events as JSON lines until the daemon shuts down.
///
/// Unexpected disconnects are ridden out by the session's reconnect loop.
pub async fn watch<C: Connector>(session: &Arc<ControlSession<C>>) -> anyhow::Result<()> {
    let mut events = session.subscribe();
    let mut state = session.watch_state();
    let mut out = io::stdout();
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    writeln!(out, "{}", serde_json::to_string(&event)?)?;
                    out.flush()?;
                    if let Event::Shutdown { .. } = event {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Missed events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Disconnected && session.clean_shutdown() {
                    break;
                }
            }
        }
    }
    Ok(())
}

const fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

const fn mfa_label(id: &IdentityRecord) -> &'static str {
    match (id.mfa_enabled, id.mfa_needed) {
        (false, _) => "-",
        (true, true) => "need",
        (true, false) => "ok",
    }
}

/// Truncate a string to max display characters with ellipsis.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max - 1).collect::<String>())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tunkeep_core::TransferMetrics;

    #[test]
    fn off_maps_to_identity_off() {
        let req = Command::Off {
            fingerprint: "abc".into(),
        }
        .into_request()
        .unwrap();
        assert_eq!(
            req,
            Request::IdentityOnOff {
                fingerprint: "abc".into(),
                on: false
            }
        );
    }

    #[test]
    fn add_injects_name_into_credential() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("id.json");
        std::fs::write(&path, r#"{"id":{"key":"k"},"controller":"https://c"}"#).unwrap();
        let req = Command::Add {
            file: path,
            name: Some("office".into()),
        }
        .into_request()
        .unwrap();
        let Request::AddIdentity { credential } = req else {
            panic!("unexpected request");
        };
        assert_eq!(credential["name"], "office");
        assert_eq!(credential["id"]["key"], "k");
    }

    #[test]
    fn add_rejects_non_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("id.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Command::Add { file: path, name: None }.into_request().unwrap_err();
        assert!(err.to_string().contains("not a JSON document"));
    }

    #[test]
    fn status_lists_identities() {
        let status = RuntimeConfig {
            active: true,
            tun_ipv4: "100.64.0.1".into(),
            tun_ipv4_mask: 10,
            identities: vec![IdentityRecord {
                name: "a-very-long-identity-name".into(),
                fingerprint: "0123456789abcdef0123".into(),
                active: true,
                loaded: true,
                mfa_enabled: true,
                mfa_needed: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_status(&mut buf, &status).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Address:   100.64.0.1/10"));
        assert!(text.contains("0123456789abcde…"));
        assert!(text.contains("need"));
    }

    #[test]
    fn failed_responses_print_nothing() {
        let mut buf = Vec::new();
        let resp = Response::failure("could not add route", "device closed");
        write_response(&mut buf, &Request::Metrics, &resp, false).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn metrics_table_shows_counters() {
        let ids = vec![IdentityRecord {
            name: "office".into(),
            fingerprint: "f00d".into(),
            metrics: Some(TransferMetrics { up: 10, down: 2048 }),
            ..Default::default()
        }];
        let mut buf = Vec::new();
        write_metrics(&mut buf, &ids).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("2048"));
        assert!(text.contains("office"));
    }
}
