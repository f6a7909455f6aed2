//! Durable state: the runtime config file and the credential files next to it.

mod config_store;
mod orphans;

pub use config_store::{ConfigStore, StoreError};
pub use orphans::scan_for_orphans;
