use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use glam::Vec2;
use itertools::Itertools;
use log::trace;
use portalview_files::ObjectId;
use portalview_files::object::types::{CullMode, LeafGeometry, Polygon, StipplingFlags};
use portalview_files::source::DataSource;
use tokio_util::sync::CancellationToken;

use crate::rendering::common::errors::PrepareError;
use crate::rendering::common::types::{
    BoundingBox, DrawBatchData, MeshContent, MeshData, TextureData, TextureGroup, TextureKey, Vertex,
};
use crate::rendering::importer::texture_importer::TextureImporter;

/// (vertex id, uv index, back side)
type VertexKey = (u16, u8, bool);

pub struct LeafImporter {}

impl LeafImporter {
    /// The bounds of a leaf are the bounds of all of its vertices, whether polygons use them or not.
    pub fn bounds(geometry: &LeafGeometry) -> BoundingBox {
        BoundingBox::from_points(geometry.vertices.values().map(|v| v.position)).unwrap_or_default()
    }

    pub fn create_mesh(
        source: &dyn DataSource,
        id: ObjectId,
        geometry: &LeafGeometry,
        cancel: &CancellationToken,
    ) -> Result<MeshData, PrepareError> {
        let mut builder = LeafMeshBuilder::new(source, id, geometry);

        for polygon in &geometry.polygons {
            if cancel.is_cancelled() {
                return Err(PrepareError::Cancelled);
            }

            if polygon.vertex_ids.len() < 3 {
                trace!("Skipping degenerate polygon of {id}");
                continue;
            }

            if !polygon.stippling.contains(StipplingFlags::NO_POS) {
                if let Some(surface_index) = polygon.pos_surface {
                    builder.add_side(polygon, surface_index, false)?;
                }
            }

            if !polygon.stippling.contains(StipplingFlags::NO_NEG) {
                if let Some(surface_index) = polygon.neg_surface {
                    builder.add_side(polygon, surface_index, true)?;
                }
            }
        }

        Ok(builder.build())
    }
}

struct LeafMeshBuilder<'a> {
    source: &'a dyn DataSource,
    id: ObjectId,
    geometry: &'a LeafGeometry,
    vertices: Vec<Vertex>,
    vertex_lookup: HashMap<VertexKey, u32>,
    textures: HashMap<u16, (TextureKey, Arc<TextureData>)>,
    batches: BTreeMap<TextureGroup, BTreeMap<(TextureKey, CullMode), DrawBatchData>>,
}

impl<'a> LeafMeshBuilder<'a> {
    fn new(source: &'a dyn DataSource, id: ObjectId, geometry: &'a LeafGeometry) -> Self {
        Self {
            source,
            id,
            geometry,
            vertices: Vec::with_capacity(geometry.vertices.len()),
            vertex_lookup: HashMap::with_capacity(geometry.vertices.len()),
            textures: HashMap::new(),
            batches: BTreeMap::new(),
        }
    }

    fn texture(&mut self, surface_index: u16) -> Result<(TextureKey, Arc<TextureData>), PrepareError> {
        if let Some((key, data)) = self.textures.get(&surface_index) {
            return Ok((*key, data.clone()));
        }

        let surface_id = *self
            .geometry
            .surfaces
            .get(surface_index as usize)
            .ok_or_else(|| PrepareError::InvalidGeometry {
                id: self.id,
                reason: format!("surface index {surface_index} out of range"),
            })?;
        let (key, data) = TextureImporter::import_surface(self.source, surface_id)?;
        let data = Arc::new(data);
        self.textures.insert(surface_index, (key, data.clone()));
        Ok((key, data))
    }

    fn vertex_index(&mut self, vertex_id: u16, uv_index: u8, back: bool) -> Result<u32, PrepareError> {
        let entry = match self.vertex_lookup.entry((vertex_id, uv_index, back)) {
            Entry::Occupied(entry) => return Ok(*entry.get()),
            Entry::Vacant(entry) => entry,
        };

        let sw_vertex = self
            .geometry
            .vertices
            .get(&vertex_id)
            .ok_or_else(|| PrepareError::InvalidGeometry {
                id: self.id,
                reason: format!("vertex {vertex_id} does not exist"),
            })?;

        let normal = if back { -sw_vertex.normal } else { sw_vertex.normal };
        // Solid colour surfaces commonly come without texture coordinates.
        let uv = sw_vertex
            .uvs
            .get(uv_index as usize)
            .copied()
            .unwrap_or(Vec2::ZERO);

        let index = self.vertices.len() as u32;
        self.vertices.push(Vertex {
            position: sw_vertex.position,
            normal,
            uv,
        });
        entry.insert(index);
        Ok(index)
    }

    fn add_side(&mut self, polygon: &Polygon, surface_index: u16, back: bool) -> Result<(), PrepareError> {
        let (key, texture) = self.texture(surface_index)?;
        let uv_indices = if back { &polygon.neg_uv_indices } else { &polygon.pos_uv_indices };

        let corners = polygon
            .vertex_ids
            .iter()
            .enumerate()
            .map(|(i, &vertex_id)| self.vertex_index(vertex_id, uv_indices.get(i).copied().unwrap_or(0), back))
            .collect::<Result<Vec<_>, _>>()?;

        let batch = self
            .batches
            .entry(texture.group)
            .or_default()
            .entry((key, polygon.sides))
            .or_insert_with(|| DrawBatchData {
                key,
                cull_mode: polygon.sides,
                indices: Vec::new(),
                texture: texture.clone(),
            });

        // triangle fan around the first corner, the back side winds the other way around
        for (b, c) in corners[1..].iter().tuple_windows() {
            if back {
                batch.indices.extend_from_slice(&[corners[0], *c, *b]);
            } else {
                batch.indices.extend_from_slice(&[corners[0], *b, *c]);
            }
        }
        Ok(())
    }

    fn build(self) -> MeshData {
        let groups = self
            .batches
            .into_iter()
            .map(|(group, batches)| (group, batches.into_values().collect_vec()))
            .collect();

        MeshData {
            id: self.id,
            bounds: LeafImporter::bounds(self.geometry),
            content: MeshContent::Leaf {
                vertices: self.vertices,
                groups,
            },
        }
    }
}
