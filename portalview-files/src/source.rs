use std::sync::Arc;

use dashmap::DashMap;

use crate::RecordError;
use crate::object::types::{CompositeDefinition, LeafGeometry, ObjectDefinition, ObjectId, ObjectKind};
use crate::surface::types::{Palette, RenderSurface, Surface, SurfaceTexture};

/// Typed, read-only record lookups against the archive. Absence is never an error at this level,
/// it is up to the consumer to decide whether a record was optional.
///
/// Implementations are queried concurrently from many preparation workers.
pub trait DataSource: Send + Sync {
    fn classify(&self, id: ObjectId) -> ObjectKind;
    fn leaf(&self, id: ObjectId) -> Option<Arc<LeafGeometry>>;
    fn composite(&self, id: ObjectId) -> Option<Arc<CompositeDefinition>>;
    fn surface(&self, id: u32) -> Option<Arc<Surface>>;
    fn surface_texture(&self, id: u32) -> Option<Arc<SurfaceTexture>>;
    fn render_surface(&self, id: u32) -> Option<Arc<RenderSurface>>;
    fn palette(&self, id: u32) -> Option<Arc<Palette>>;

    fn definition(&self, id: ObjectId) -> Option<ObjectDefinition> {
        match self.classify(id) {
            ObjectKind::Leaf => self.leaf(id).map(ObjectDefinition::Leaf),
            ObjectKind::Composite => self.composite(id).map(ObjectDefinition::Composite),
            ObjectKind::Unknown => None,
        }
    }
}

/// A [`DataSource`] that is entirely held in memory. Records can be inserted while other threads
/// are reading.
#[derive(Default)]
pub struct MemoryDataSource {
    leaves: DashMap<ObjectId, Arc<LeafGeometry>>,
    composites: DashMap<ObjectId, Arc<CompositeDefinition>>,
    surfaces: DashMap<u32, Arc<Surface>>,
    surface_textures: DashMap<u32, Arc<SurfaceTexture>>,
    render_surfaces: DashMap<u32, Arc<RenderSurface>>,
    palettes: DashMap<u32, Arc<Palette>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_leaf(&self, id: ObjectId, leaf: LeafGeometry) -> Result<(), RecordError> {
        if id.kind() != ObjectKind::Leaf {
            return Err(RecordError::KindMismatch {
                id,
                expected: ObjectKind::Leaf,
            });
        }
        self.leaves.insert(id, Arc::new(leaf));
        Ok(())
    }

    pub fn insert_composite(&self, id: ObjectId, composite: CompositeDefinition) -> Result<(), RecordError> {
        if id.kind() != ObjectKind::Composite {
            return Err(RecordError::KindMismatch {
                id,
                expected: ObjectKind::Composite,
            });
        }
        self.composites.insert(id, Arc::new(composite));
        Ok(())
    }

    pub fn insert_surface(&self, id: u32, surface: Surface) {
        self.surfaces.insert(id, Arc::new(surface));
    }

    pub fn insert_surface_texture(&self, id: u32, texture: SurfaceTexture) {
        self.surface_textures.insert(id, Arc::new(texture));
    }

    pub fn insert_render_surface(&self, id: u32, render_surface: RenderSurface) -> Result<(), RecordError> {
        // unknown pixel formats are accepted, decoding is up to the consumer
        if render_surface.width == 0 || render_surface.height == 0 {
            return Err(RecordError::FormatError {
                reason: "render surface without extent",
            });
        }
        let block_compressed = render_surface
            .pixel_format()
            .is_ok_and(|format| format.is_block_compressed());
        if block_compressed && (render_surface.width % 4 != 0 || render_surface.height % 4 != 0) {
            return Err(RecordError::FormatError {
                reason: "block compressed surface is not a multiple of 4",
            });
        }
        self.render_surfaces.insert(id, Arc::new(render_surface));
        Ok(())
    }

    pub fn insert_palette(&self, id: u32, palette: Palette) {
        self.palettes.insert(id, Arc::new(palette));
    }

    pub fn len(&self) -> usize {
        self.leaves.len() + self.composites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataSource for MemoryDataSource {
    fn classify(&self, id: ObjectId) -> ObjectKind {
        id.kind()
    }

    fn leaf(&self, id: ObjectId) -> Option<Arc<LeafGeometry>> {
        self.leaves.get(&id).map(|entry| entry.value().clone())
    }

    fn composite(&self, id: ObjectId) -> Option<Arc<CompositeDefinition>> {
        self.composites.get(&id).map(|entry| entry.value().clone())
    }

    fn surface(&self, id: u32) -> Option<Arc<Surface>> {
        self.surfaces.get(&id).map(|entry| entry.value().clone())
    }

    fn surface_texture(&self, id: u32) -> Option<Arc<SurfaceTexture>> {
        self.surface_textures
            .get(&id)
            .map(|entry| entry.value().clone())
    }

    fn render_surface(&self, id: u32) -> Option<Arc<RenderSurface>> {
        self.render_surfaces
            .get(&id)
            .map(|entry| entry.value().clone())
    }

    fn palette(&self, id: u32) -> Option<Arc<Palette>> {
        self.palettes.get(&id).map(|entry| entry.value().clone())
    }
}
