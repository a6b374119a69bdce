//! Mapper Registry
//!
//! Table of mappers keyed by resource kind. Populated once at startup through
//! `&mut` registration calls, then frozen behind an `Arc` and handed to every
//! reconciler. There is no global instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use vsync_common::{Error, ResourceKind, Result};

use crate::mapper::Mapper;

/// Registry of per-kind mappers
#[derive(Debug, Default)]
pub struct MapperRegistry {
    mappers: BTreeMap<ResourceKind, Arc<Mapper>>,
}

impl MapperRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper. Fails if the kind already has one.
    pub fn add_mapper(&mut self, mapper: Mapper) -> Result<()> {
        let kind = mapper.kind().clone();
        if self.mappers.contains_key(&kind) {
            return Err(Error::registration(&kind, "a mapper is already registered"));
        }
        debug!(kind = %kind, strategy = ?mapper.strategy(), "registered mapper");
        self.mappers.insert(kind, Arc::new(mapper));
        Ok(())
    }

    /// Mapper for a kind, if registered
    pub fn get(&self, kind: &ResourceKind) -> Option<Arc<Mapper>> {
        self.mappers.get(kind).cloned()
    }

    /// Mapper for a kind, or an internal error when the kind was never registered
    pub fn mapper_for(&self, kind: &ResourceKind) -> Result<Arc<Mapper>> {
        self.get(kind).ok_or_else(|| {
            Error::internal_with_context("registry", format!("no mapper registered for {kind}"))
        })
    }

    /// All registered mappers in kind order
    pub fn mappers(&self) -> impl Iterator<Item = &Arc<Mapper>> {
        self.mappers.values()
    }

    /// Registered kinds in order
    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.mappers.keys()
    }

    /// Number of registered mappers
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    /// Whether nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}
