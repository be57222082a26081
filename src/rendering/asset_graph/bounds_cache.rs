use std::sync::Arc;

use dashmap::DashMap;
use log::warn;
use portalview_files::ObjectId;
use portalview_files::object::types::{CompositeDefinition, ObjectDefinition};
use portalview_files::source::DataSource;

use crate::rendering::common::errors::PrepareError;
use crate::rendering::common::types::BoundingBox;
use crate::rendering::importer::leaf_importer::LeafImporter;

/// Memoized local space bounds per object. Object definitions are static, so there is no
/// invalidation: once computed (or found to be unresolvable), the answer stays.
pub struct BoundsCache {
    source: Arc<dyn DataSource>,
    memo: DashMap<ObjectId, Option<BoundingBox>>,
    /// Ids read as composite records regardless of their classification. Kept apart from `memo`,
    /// where an unclassified id is memoized as absent.
    hinted: DashMap<ObjectId, Option<BoundingBox>>,
}

impl BoundsCache {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            memo: DashMap::with_capacity(1024),
            hinted: DashMap::new(),
        }
    }

    pub fn get_bounds(&self, id: ObjectId) -> Option<BoundingBox> {
        if let Some(hit) = self.memo.get(&id) {
            return *hit;
        }

        let mut path = Vec::new();
        match self.compute(id, &mut path) {
            Ok(bounds) => Some(bounds),
            Err(err) => {
                warn!("Cannot compute the bounds of {id}: {err}");
                self.memo.insert(id, None);
                None
            }
        }
    }

    /// Bounds of `id` read as a composite record, whatever the source classifies it as. Ids that
    /// classify as composites share the memo with [`BoundsCache::get_bounds`].
    pub fn get_composite_bounds(&self, id: ObjectId) -> Option<BoundingBox> {
        if let Some(Some(bounds)) = self.memo.get(&id).map(|hit| *hit) {
            return Some(bounds);
        }
        if let Some(hit) = self.hinted.get(&id) {
            return *hit;
        }

        let bounds = match self.source.composite(id) {
            Some(composite) => {
                let mut path = Vec::new();
                self.union_of_parts(id, &composite, &mut path)
                    .inspect_err(|err| warn!("Cannot compute the bounds of {id}: {err}"))
                    .ok()
            }
            None => None,
        };
        self.hinted.insert(id, bounds);
        bounds
    }

    /// Number of memoized answers, including the negative ones.
    pub fn len(&self) -> usize {
        self.memo.len() + self.hinted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compute(&self, id: ObjectId, path: &mut Vec<ObjectId>) -> Result<BoundingBox, PrepareError> {
        // Never hold a map guard while recursing, the children live in the same map.
        if let Some(hit) = self.memo.get(&id).map(|hit| *hit) {
            return hit.ok_or(PrepareError::UnknownObject { id });
        }

        if path.contains(&id) {
            return Err(PrepareError::CompositeCycle { id });
        }

        let bounds = match self.source.definition(id) {
            Some(ObjectDefinition::Leaf(geometry)) => LeafImporter::bounds(&geometry),
            Some(ObjectDefinition::Composite(composite)) => self.union_of_parts(id, &composite, path)?,
            None => return Err(PrepareError::UnknownObject { id }),
        };

        self.memo.insert(id, Some(bounds));
        Ok(bounds)
    }

    fn union_of_parts(
        &self,
        id: ObjectId,
        composite: &CompositeDefinition,
        path: &mut Vec<ObjectId>,
    ) -> Result<BoundingBox, PrepareError> {
        path.push(id);
        let mut bounds: Option<BoundingBox> = None;
        for part in &composite.parts {
            let part_bounds = self
                .compute(part.id, path)?
                .transformed(&part.frame.to_affine());
            bounds = Some(bounds.map_or(part_bounds, |bb| bb.union(part_bounds)));
        }
        path.pop();
        Ok(bounds.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec2, Vec3};
    use portalview_files::object::types::{CompositePart, Frame, LeafGeometry, SwVertex};
    use portalview_files::object::types::ObjectKind;
    use portalview_files::source::MemoryDataSource;
    use portalview_files::surface::types::{Palette, RenderSurface, Surface, SurfaceTexture};

    fn unit_cube() -> LeafGeometry {
        let mut geometry = LeafGeometry::default();
        for (i, corner) in [Vec3::ZERO, Vec3::ONE].into_iter().enumerate() {
            geometry.vertices.insert(
                i as u16,
                SwVertex {
                    position: corner,
                    normal: Vec3::Z,
                    uvs: vec![Vec2::ZERO],
                },
            );
        }
        geometry
    }

    #[test]
    fn composite_bounds_are_the_union_of_transformed_parts() -> Result<(), anyhow::Error> {
        let source = Arc::new(MemoryDataSource::new());
        source.insert_leaf(ObjectId::leaf(1), unit_cube())?;
        source.insert_composite(
            ObjectId::composite(1),
            CompositeDefinition {
                parts: vec![
                    CompositePart {
                        id: ObjectId::leaf(1),
                        frame: Frame::from_origin(Vec3::new(5.0, 0.0, 0.0)),
                    },
                    CompositePart {
                        id: ObjectId::leaf(1),
                        frame: Frame {
                            origin: Vec3::ZERO,
                            orientation: Quat::from_rotation_z(std::f32::consts::PI),
                            scale: Vec3::ONE,
                        },
                    },
                ],
            },
        )?;

        let cache = BoundsCache::new(source);
        let bounds = cache.get_bounds(ObjectId::composite(1)).unwrap();
        assert!((bounds.min - Vec3::new(-1.0, -1.0, 0.0)).length() < 1e-5);
        assert!((bounds.max - Vec3::new(6.0, 1.0, 1.0)).length() < 1e-5);
        // the leaf has been memoized on the way
        assert_eq!(cache.len(), 2);
        Ok(())
    }

    #[test]
    fn cyclic_composites_have_no_bounds() -> Result<(), anyhow::Error> {
        let source = Arc::new(MemoryDataSource::new());
        source.insert_composite(
            ObjectId::composite(1),
            CompositeDefinition {
                parts: vec![CompositePart {
                    id: ObjectId::composite(1),
                    frame: Frame::default(),
                }],
            },
        )?;

        let cache = BoundsCache::new(source);
        assert!(cache.get_bounds(ObjectId::composite(1)).is_none());
        // memoized negative answer
        assert!(cache.get_bounds(ObjectId::composite(1)).is_none());
        Ok(())
    }

    #[test]
    fn unresolvable_leaf_fails_the_composite() -> Result<(), anyhow::Error> {
        let source = Arc::new(MemoryDataSource::new());
        source.insert_composite(
            ObjectId::composite(1),
            CompositeDefinition {
                parts: vec![CompositePart {
                    id: ObjectId::leaf(42),
                    frame: Frame::default(),
                }],
            },
        )?;
        let cache = BoundsCache::new(source);
        assert!(cache.get_bounds(ObjectId::composite(1)).is_none());
        assert!(cache.get_bounds(ObjectId(0xFF00_0000)).is_none());
        Ok(())
    }

    /// Classifies every composite as unknown.
    struct Unclassified(MemoryDataSource);

    impl DataSource for Unclassified {
        fn classify(&self, id: ObjectId) -> ObjectKind {
            match self.0.classify(id) {
                ObjectKind::Composite => ObjectKind::Unknown,
                kind => kind,
            }
        }

        fn leaf(&self, id: ObjectId) -> Option<Arc<LeafGeometry>> {
            self.0.leaf(id)
        }

        fn composite(&self, id: ObjectId) -> Option<Arc<CompositeDefinition>> {
            self.0.composite(id)
        }

        fn surface(&self, id: u32) -> Option<Arc<Surface>> {
            self.0.surface(id)
        }

        fn surface_texture(&self, id: u32) -> Option<Arc<SurfaceTexture>> {
            self.0.surface_texture(id)
        }

        fn render_surface(&self, id: u32) -> Option<Arc<RenderSurface>> {
            self.0.render_surface(id)
        }

        fn palette(&self, id: u32) -> Option<Arc<Palette>> {
            self.0.palette(id)
        }
    }

    #[test]
    fn composite_reads_are_not_shadowed_by_the_classification() -> Result<(), anyhow::Error> {
        let records = MemoryDataSource::new();
        records.insert_leaf(ObjectId::leaf(1), unit_cube())?;
        records.insert_composite(
            ObjectId::composite(1),
            CompositeDefinition {
                parts: vec![CompositePart {
                    id: ObjectId::leaf(1),
                    frame: Frame::from_origin(Vec3::new(-0.5, -0.5, -0.5)),
                }],
            },
        )?;
        let cache = BoundsCache::new(Arc::new(Unclassified(records)));
        let id = ObjectId::composite(1);

        assert!(cache.get_bounds(id).is_none());
        let bounds = cache.get_composite_bounds(id).unwrap();
        assert_eq!(bounds.min, Vec3::splat(-0.5));
        assert_eq!(bounds.max, Vec3::splat(0.5));
        // and the other way around
        assert!(cache.get_bounds(id).is_none());
        assert_eq!(cache.get_composite_bounds(id), Some(bounds));
        assert!(cache.get_composite_bounds(ObjectId::composite(2)).is_none());
        Ok(())
    }
}
