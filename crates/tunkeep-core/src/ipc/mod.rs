//! Control-channel protocol between the daemon and local clients.
//!
//! Two channels share the same framing: one JSON document per line, UTF-8.
//! The command channel carries [`Request`]/[`Response`] pairs in order; the
//! event channel carries server-pushed [`Event`]s.

mod framing;
mod types;

pub use framing::{read_message, write_message};
pub use types::*;
