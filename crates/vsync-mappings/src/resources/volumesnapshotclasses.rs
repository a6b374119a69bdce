use kube::api::{ApiResource, GroupVersionKind};
use vsync_common::Result;

use super::RegisterContext;
use crate::{Mapper, MapperRegistry};

/// CSI snapshot API group; not part of k8s-openapi
const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";

/// API resource for `snapshot.storage.k8s.io/v1` VolumeSnapshotClass
pub fn volume_snapshot_class_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(SNAPSHOT_GROUP, "v1", "VolumeSnapshotClass"),
        "volumesnapshotclasses",
    )
}

/// Register the VolumeSnapshotClass mapper (mirror)
pub fn register_volumesnapshotclasses_mapper(
    registry: &mut MapperRegistry,
    _ctx: &RegisterContext,
) -> Result<()> {
    registry.add_mapper(Mapper::mirror(volume_snapshot_class_resource()))
}
