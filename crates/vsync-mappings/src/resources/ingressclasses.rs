use k8s_openapi::api::networking::v1::IngressClass;
use kube::api::ApiResource;
use vsync_common::Result;

use super::RegisterContext;
use crate::{Mapper, MapperRegistry};

/// Register the IngressClass mapper (mirror)
pub fn register_ingressclasses_mapper(
    registry: &mut MapperRegistry,
    _ctx: &RegisterContext,
) -> Result<()> {
    registry.add_mapper(Mapper::mirror(ApiResource::erase::<IngressClass>(&())))
}
