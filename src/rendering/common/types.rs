use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use glam::{Affine3A, Vec2, Vec3};
use portalview_files::ObjectId;
use portalview_files::object::types::CullMode;
use portalview_files::surface::types::SurfaceFlags;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// None for an empty iterator
    pub fn from_points<I: IntoIterator<Item = Vec3>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::new(first, first), |bb, p| bb.extended(p)))
    }

    pub fn extended(self, point: Vec3) -> Self {
        Self {
            min: self.min.min(point),
            max: self.max.max(point),
        }
    }

    pub fn union(self, other: BoundingBox) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// The axis aligned box around all 8 transformed corners.
    pub fn transformed(&self, transform: &Affine3A) -> Self {
        let corners = self.corners().map(|c| transform.transform_point3(c));
        let mut bb = Self::new(corners[0], corners[0]);
        for corner in &corners[1..] {
            bb = bb.extended(*corner);
        }
        bb
    }
}

/// The canonical formats that texture data is converted into before it reaches an atlas.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureFormat {
    Rgba8,
    Bc1,
    Bc2,
    Bc3,
}

impl TextureFormat {
    /// Bytes of one layer, `None` if that doesn't fit into memory at all.
    pub fn layer_size(self, width: u32, height: u32) -> Option<usize> {
        let (width, height) = (width as usize, height as usize);
        let blocks = || width.div_ceil(4).max(1).checked_mul(height.div_ceil(4).max(1));
        match self {
            TextureFormat::Rgba8 => width.checked_mul(height)?.checked_mul(4),
            TextureFormat::Bc1 => blocks()?.checked_mul(8),
            TextureFormat::Bc2 | TextureFormat::Bc3 => blocks()?.checked_mul(16),
        }
    }
}

/// Atlases are shared between all textures with the same extent and format.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureGroup {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureGroup {
    pub fn layer_size(&self) -> Option<usize> {
        self.format.layer_size(self.width, self.height)
    }
}

/// Identity of texture content for deduplication: the same key always decodes to the same pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey {
    pub surface_id: u32,
    pub palette_id: u32,
    pub variant: SurfaceFlags,
    pub is_solid: bool,
}

#[derive(Clone)]
pub struct TextureData {
    pub group: TextureGroup,
    pub pixels: Vec<u8>,
}

impl Debug for TextureData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ group: {:?}, pixels: [{}] }}", self.group, self.pixels.len())
    }
}

#[derive(Debug, Clone)]
pub struct DrawBatchData {
    pub key: TextureKey,
    pub cull_mode: CullMode,
    pub indices: Vec<u32>,
    pub texture: Arc<TextureData>,
}

/// A leaf referenced by a composite, with the transform accumulated along the way down.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PlacedPart {
    pub id: ObjectId,
    pub transform: Affine3A,
}

#[derive(Debug, Clone)]
pub enum MeshContent {
    Leaf {
        vertices: Vec<Vertex>,
        /// Batches by atlas group first, then by texture key and cull mode (one batch each).
        groups: BTreeMap<TextureGroup, Vec<DrawBatchData>>,
    },
    Composite {
        parts: Vec<PlacedPart>,
    },
}

/// The CPU side result of preparing an object. Immutable once produced and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub id: ObjectId,
    pub bounds: BoundingBox,
    pub content: MeshContent,
}

impl MeshData {
    pub fn is_composite(&self) -> bool {
        matches!(self.content, MeshContent::Composite { .. })
    }

    pub fn parts(&self) -> &[PlacedPart] {
        match &self.content {
            MeshContent::Composite { parts } => parts,
            MeshContent::Leaf { .. } => &[],
        }
    }

    pub fn batches(&self) -> impl Iterator<Item = (&TextureGroup, &DrawBatchData)> {
        let groups = match &self.content {
            MeshContent::Leaf { groups, .. } => Some(groups),
            MeshContent::Composite { .. } => None,
        };
        groups
            .into_iter()
            .flat_map(|groups| groups.iter())
            .flat_map(|(group, batches)| batches.iter().map(move |batch| (group, batch)))
    }

    /// Estimated GPU footprint once uploaded: vertex bytes and index bytes. Textures live in shared
    /// atlases and are not attributed to single objects.
    pub fn memory_size(&self) -> u64 {
        match &self.content {
            MeshContent::Leaf { vertices, groups } => {
                let index_count: usize = groups.values().flatten().map(|b| b.indices.len()).sum();
                (vertices.len() * size_of::<Vertex>() + index_count * size_of::<u32>()) as u64
            }
            MeshContent::Composite { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn transformed_box_covers_rotated_corners() {
        let bb = BoundingBox::new(Vec3::ZERO, Vec3::new(2.0, 1.0, 1.0));
        let rotated = bb.transformed(&Affine3A::from_rotation_translation(
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            Vec3::new(0.0, 0.0, 5.0),
        ));
        assert!((rotated.min - Vec3::new(-1.0, 0.0, 5.0)).length() < 1e-5);
        assert!((rotated.max - Vec3::new(0.0, 2.0, 6.0)).length() < 1e-5);
    }

    #[test]
    fn from_points_is_none_without_points() {
        assert!(BoundingBox::from_points(std::iter::empty()).is_none());
        let bb = BoundingBox::from_points([Vec3::ONE, -Vec3::ONE, Vec3::X * 3.0]).unwrap();
        assert_eq!(bb.min, -Vec3::ONE);
        assert_eq!(bb.max, Vec3::new(3.0, 1.0, 1.0));
    }

    #[test]
    fn block_compressed_layer_sizes() {
        assert_eq!(TextureFormat::Rgba8.layer_size(32, 32), Some(4096));
        assert_eq!(TextureFormat::Bc1.layer_size(8, 8), Some(32));
        assert_eq!(TextureFormat::Bc3.layer_size(8, 4), Some(32));
        assert_eq!(TextureFormat::Bc1.layer_size(2, 2), Some(8));
    }

    #[test]
    fn huge_layer_sizes_do_not_wrap() {
        assert_eq!(TextureFormat::Rgba8.layer_size(u32::MAX, u32::MAX), None);
        assert_eq!(
            TextureFormat::Rgba8.layer_size(65536, 65536),
            (65536usize * 65536).checked_mul(4)
        );
    }
}
