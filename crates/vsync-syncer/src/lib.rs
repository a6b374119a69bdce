//! vsync syncer: keeps virtual cluster objects materialized on a shared host
//! cluster.
//!
//! A [`translator::Translator`] and [`syncer::SyncDriver`] per kind turn
//! virtual objects into physical ones; the [`reconciler`] state machine drives
//! them from `kube::runtime::Controller`s built by [`controller_runner`].

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod context;
pub mod controller_runner;
pub mod lifecycle;
pub mod patch;
pub mod reconciler;
pub mod recovery;
pub mod resources;
pub mod syncer;
pub mod translator;

#[cfg(test)]
mod fake;

pub use client::{KubeObjectClient, ObjectClient};
pub use context::{Context, ReconcileSettings, SyncContext};
pub use reconciler::SyncState;
pub use syncer::{GenericSyncer, SyncDriver, UpdateResult};
pub use translator::{GenericTranslator, MetadataUpdate, Translator};
