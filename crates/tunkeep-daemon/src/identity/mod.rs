//! Identities: credential files on disk and the in-memory registry of
//! loaded sessions.

pub mod credential;
mod registry;
mod types;

pub use registry::{IdentityRegistry, LoadCompletion};
pub use types::{Identity, LoadState};
