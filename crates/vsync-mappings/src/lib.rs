//! Identity mapping for vsync.
//!
//! Per-kind [`Mapper`]s derive a physical identity from a virtual one, the
//! [`MapperRegistry`] holds them by kind, and the [`MappingStore`] persists
//! every association so identities stay stable across restarts.

#![deny(missing_docs)]

pub mod mapper;
pub mod naming;
pub mod registry;
pub mod resources;
pub mod store;

pub use mapper::{Mapper, MapperStrategy};
pub use naming::{HashedNameTranslator, NameTranslator};
pub use registry::MapperRegistry;
pub use resources::{register_all, RegisterContext, SyncedKind};
pub use store::{ConfigMapBackend, Mapping, MappingBackend, MappingStore, MemoryBackend};
