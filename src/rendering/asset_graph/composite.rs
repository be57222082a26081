use glam::Affine3A;
use portalview_files::ObjectId;
use portalview_files::object::types::{CompositeDefinition, ObjectKind};
use portalview_files::source::DataSource;
use tokio_util::sync::CancellationToken;

use crate::rendering::common::errors::PrepareError;
use crate::rendering::common::types::PlacedPart;

/// Flattens a composite into its leaves with their accumulated transforms. Only classifies the
/// leaves, their geometry isn't loaded.
///
/// `root` is looked up as a composite whatever the source classifies it as.
pub fn flatten_composite(
    source: &dyn DataSource,
    root: ObjectId,
    cancel: &CancellationToken,
) -> Result<Vec<PlacedPart>, PrepareError> {
    let composite = source
        .composite(root)
        .ok_or_else(|| PrepareError::missing("composite", root.0))?;

    let mut parts = Vec::new();
    let mut path = vec![root];
    flatten_parts(source, &composite, Affine3A::IDENTITY, &mut path, &mut parts, cancel)?;
    Ok(parts)
}

fn flatten_parts(
    source: &dyn DataSource,
    composite: &CompositeDefinition,
    transform: Affine3A,
    path: &mut Vec<ObjectId>,
    parts: &mut Vec<PlacedPart>,
    cancel: &CancellationToken,
) -> Result<(), PrepareError> {
    for part in &composite.parts {
        if cancel.is_cancelled() {
            return Err(PrepareError::Cancelled);
        }

        let id = part.id;
        if path.contains(&id) {
            return Err(PrepareError::CompositeCycle { id });
        }

        let part_transform = transform * part.frame.to_affine();
        match source.classify(id) {
            ObjectKind::Leaf => parts.push(PlacedPart {
                id,
                transform: part_transform,
            }),
            ObjectKind::Composite => {
                let nested = source
                    .composite(id)
                    .ok_or_else(|| PrepareError::missing("composite", id.0))?;
                path.push(id);
                flatten_parts(source, &nested, part_transform, path, parts, cancel)?;
                path.pop();
            }
            ObjectKind::Unknown => return Err(PrepareError::UnknownObject { id }),
        }
    }
    Ok(())
}
