use std::sync::Arc;

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::ApiResource;
use vsync_common::Result;

use super::RegisterContext;
use crate::{Mapper, MapperRegistry};

/// Register the ServiceAccount mapper (namespaced rewrite)
pub fn register_serviceaccounts_mapper(
    registry: &mut MapperRegistry,
    ctx: &RegisterContext,
) -> Result<()> {
    let mapper = Mapper::namespaced(
        ApiResource::erase::<ServiceAccount>(&()),
        Arc::clone(&ctx.name_translator),
    );
    registry.add_mapper(mapper)
}
