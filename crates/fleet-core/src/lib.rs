pub mod error;
pub mod index;
pub mod registry;
pub mod session;
pub mod store;

pub use error::FleetError;
pub use index::ChecksumIndex;
pub use registry::{RegistryConfig, SessionRegistry};
pub use store::{AgentRecord, FleetStore, MemoryStore, StoreError, StoredFileRecord, UserRecord};

/// Milliseconds since the unix epoch. The registry and sweep take explicit
/// timestamps so tests can drive the clock; this is the production source.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
