//! Common types for vsync: object identities, errors, ownership markers and
//! retry utilities shared by the mapping engine and the syncer.

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod identity;
pub mod marker;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use identity::{ObjectIdentity, ResourceKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the engine makes
pub const FIELD_MANAGER: &str = "vsync-syncer";

/// Finalizer placed on virtual objects until host cleanup has completed
pub const HOST_CLEANUP_FINALIZER: &str = "vsync.dev/host-cleanup";

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue interval for objects blocked by a foreign host object
pub const REQUEUE_FOREIGN_SECS: u64 = 300;

/// Requeue interval while a host deletion is still in progress
pub const REQUEUE_DELETING_SECS: u64 = 5;
