//! Maps control-channel requests onto controller operations.

use serde::Serialize;
use tracing::{debug, warn};

use tunkeep_core::ipc::{Request, Response};

use crate::controller::TunnelController;
use crate::identity::credential::AddressUpdate;
use crate::transport::TunnelTransport;

fn ok_with<P: Serialize>(message: &str, payload: &P) -> Response {
    Response::ok_with(message, payload)
        .unwrap_or_else(|e| Response::failure("could not encode response", e))
}

/// Execute one request and build its response.
pub async fn handle_request<T: TunnelTransport>(
    controller: &TunnelController<T>,
    request: Request,
) -> Response {
    let name = request.name();
    debug!(command = name, "Handling request");
    let response = match request {
        Request::Status => ok_with("status", &controller.status(false).await),
        Request::Metrics => ok_with("metrics", &controller.metrics().await),
        Request::AddIdentity { credential } => match controller.add_identity(credential).await {
            Ok(record) => ok_with("identity added", &record),
            Err(e) => Response::failure("could not add identity", e),
        },
        Request::IdentityOnOff { fingerprint, on } => {
            match controller.set_identity_active(&fingerprint, on).await {
                Ok(record) => ok_with(if on { "identity on" } else { "identity off" }, &record),
                Err(e) => Response::failure("could not change identity state", e),
            }
        }
        Request::RemoveIdentity { fingerprint } => {
            match controller.forget_identity(&fingerprint).await {
                Ok(()) => Response::ok("identity removed"),
                Err(e) => Response::failure("could not remove identity", e),
            }
        }
        Request::UpdateMfa {
            fingerprint,
            enabled,
            needed,
        } => match controller.update_mfa(&fingerprint, enabled, needed).await {
            Ok(Some(record)) => ok_with("mfa updated", &record),
            Ok(None) => Response::ok("no such identity; nothing updated"),
            Err(e) => Response::failure("could not update mfa", e),
        },
        Request::SetNotified {
            fingerprint,
            notified,
        } => match controller.set_notified(&fingerprint, notified).await {
            Ok(Some(record)) => ok_with("notified flag set", &record),
            Ok(None) => Response::ok("no such identity; nothing updated"),
            Err(e) => Response::failure("could not set notified flag", e),
        },
        Request::UpdateControllerAddress {
            fingerprint,
            address,
        } => match controller.update_controller_address(&fingerprint, &address).await {
            Ok(AddressUpdate::Unchanged) => Response::ok("address unchanged"),
            Ok(AddressUpdate::Updated { current, .. }) => ok_with("address updated", &current),
            Err(e) => Response::failure("could not update controller address", e),
        },
        Request::SetLogLevel { level } => match controller.set_log_level(&level).await {
            Ok(level) => ok_with("log level set", &level),
            Err(e) => Response::failure("could not set log level", e),
        },
        Request::UpdateTunIpv4 {
            ip,
            mask,
            add_dns,
            api_page_size,
        } => match controller
            .update_tun_ipv4(&ip, mask, add_dns, api_page_size)
            .await
        {
            Ok(settings) => ok_with("interface settings updated; applied on restart", &settings),
            Err(e) => Response::failure("could not update interface settings", e),
        },
        Request::SetNotificationFrequency { minutes } => {
            match controller.set_notification_frequency(minutes).await {
                Ok(()) => Response::ok("notification frequency set"),
                Err(e) => Response::failure("could not set notification frequency", e),
            }
        }
        Request::AddRoute {
            destination,
            next_hop,
            metric,
        } => match controller.add_route(&destination, &next_hop, metric).await {
            Ok(()) => Response::ok("route added"),
            Err(e) => Response::failure("could not add route", e),
        },
        Request::RemoveRoute {
            destination,
            next_hop,
        } => match controller.remove_route(&destination, &next_hop).await {
            Ok(()) => Response::ok("route removed"),
            Err(e) => Response::failure("could not remove route", e),
        },
    };
    if !response.is_success() {
        warn!(command = name, error = ?response.error, "Request failed");
    }
    response
}
