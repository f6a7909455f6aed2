//! Address, mask and timing policy shared by the daemon and clients.

use std::time::Duration;

/// Interface address used when none is configured.
pub const DEFAULT_IPV4: &str = "100.64.0.1";

/// Mask substituted when the configured one is too permissive.
pub const DEFAULT_IPV4_MASK: u8 = 10;

/// Most permissive mask accepted for the interface block.
pub const IPV4_MAX_MASK: u8 = 10;

/// Most restrictive mask accepted for the interface block.
pub const IPV4_MIN_MASK: u8 = 24;

/// Notification frequency bounds, in minutes.
pub const MIN_NOTIFICATION_FREQUENCY: u32 = 5;
pub const MAX_NOTIFICATION_FREQUENCY: u32 = 1440;

/// Default name of the virtual interface.
pub const DEFAULT_INTERFACE_NAME: &str = "tunkeep0";

/// MTU of the virtual interface.
pub const INTERFACE_MTU: u32 = 64 * 1024 - 1;

/// Interface metric when DNS is served directly on the interface.
pub const DNS_INTERCEPT_METRIC: u32 = 5;

/// Interface metric when DNS is left to policy-table delegation.
pub const DNS_DEPRIORITIZED_METRIC: u32 = 255;

/// Display name reported by a controller that could not resolve the identity.
pub const UNKNOWN_IDENTITY_NAME: &str = "<unknown>";

/// Name given to identities recovered from orphaned credential files.
pub const RECOVERED_IDENTITY_NAME: &str = "recovered identity";

/// Default identity refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the daemon's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 32;

/// Consecutive empty lines tolerated by the reader before giving up.
pub const EMPTY_LINE_THRESHOLD: usize = 5;

/// Fixed delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2500);

/// Poll interval used while waiting for a connection.
pub const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a mask lies within the accepted range.
pub fn mask_in_range(mask: u8) -> bool {
    (IPV4_MAX_MASK..=IPV4_MIN_MASK).contains(&mask)
}

/// Whether a notification frequency lies within the accepted range.
pub fn frequency_in_range(minutes: u32) -> bool {
    (MIN_NOTIFICATION_FREQUENCY..=MAX_NOTIFICATION_FREQUENCY).contains(&minutes)
}
