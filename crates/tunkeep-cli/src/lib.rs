//! tunkeep CLI library
//!
//! Control client for the tunkeep daemon: a reconnecting session over the
//! command and event channels, and the subcommands built on it.

pub mod commands;
pub mod session;
