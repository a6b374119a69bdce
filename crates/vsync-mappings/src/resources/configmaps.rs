use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ApiResource;
use vsync_common::Result;

use super::RegisterContext;
use crate::{Mapper, MapperRegistry};

/// Register the ConfigMap mapper (namespaced rewrite)
pub fn register_configmaps_mapper(
    registry: &mut MapperRegistry,
    ctx: &RegisterContext,
) -> Result<()> {
    let mapper = Mapper::namespaced(
        ApiResource::erase::<ConfigMap>(&()),
        Arc::clone(&ctx.name_translator),
    );
    registry.add_mapper(mapper)
}
