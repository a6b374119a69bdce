use std::sync::Arc;

use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::ApiResource;
use vsync_common::Result;

use super::RegisterContext;
use crate::{Mapper, MapperRegistry};

/// Register the PodDisruptionBudget mapper (namespaced rewrite)
pub fn register_poddisruptionbudgets_mapper(
    registry: &mut MapperRegistry,
    ctx: &RegisterContext,
) -> Result<()> {
    let mapper = Mapper::namespaced(
        ApiResource::erase::<PodDisruptionBudget>(&()),
        Arc::clone(&ctx.name_translator),
    );
    registry.add_mapper(mapper)
}
