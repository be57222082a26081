use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use bitflags::bitflags;
use glam::{Affine3A, Quat, Vec2, Vec3};

/// Identifies an object definition inside the portal archive. The high byte encodes the record
/// family, which is all that [`ObjectKind::from_id`] looks at.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const LEAF_PREFIX: u32 = 0x0100_0000;
    pub const COMPOSITE_PREFIX: u32 = 0x0200_0000;

    pub fn leaf(index: u32) -> Self {
        Self(Self::LEAF_PREFIX | (index & 0x00FF_FFFF))
    }

    pub fn composite(index: u32) -> Self {
        Self(Self::COMPOSITE_PREFIX | (index & 0x00FF_FFFF))
    }

    pub fn kind(self) -> ObjectKind {
        ObjectKind::from_id(self)
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({:#010X})", self.0)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Leaf,
    Composite,
    Unknown,
}

impl ObjectKind {
    pub fn from_id(id: ObjectId) -> Self {
        match id.0 & 0xFF00_0000 {
            ObjectId::LEAF_PREFIX => ObjectKind::Leaf,
            ObjectId::COMPOSITE_PREFIX => ObjectKind::Composite,
            _ => ObjectKind::Unknown,
        }
    }
}

/// An object definition, classified once. Composites only reference other definitions by id,
/// so resolving them is up to the caller (and so is defending against cycles).
#[derive(Debug, Clone)]
pub enum ObjectDefinition {
    Leaf(Arc<LeafGeometry>),
    Composite(Arc<CompositeDefinition>),
}

#[derive(Debug, Clone, Default)]
pub struct SwVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uvs: Vec<Vec2>,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct StipplingFlags: u8 {
        /// The front (positive) side has no geometry.
        const NO_POS = 0x01;
        /// The back (negative) side has no geometry.
        const NO_NEG = 0x02;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum CullMode {
    None,
    #[default]
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Default)]
pub struct Polygon {
    pub vertex_ids: Vec<u16>,
    pub pos_uv_indices: Vec<u8>,
    pub neg_uv_indices: Vec<u8>,
    /// index into [`LeafGeometry::surfaces`]
    pub pos_surface: Option<u16>,
    pub neg_surface: Option<u16>,
    pub stippling: StipplingFlags,
    pub sides: CullMode,
}

#[derive(Debug, Clone, Default)]
pub struct LeafGeometry {
    pub vertices: BTreeMap<u16, SwVertex>,
    pub polygons: Vec<Polygon>,
    /// Surface record ids, referenced by index from the polygons.
    pub surfaces: Vec<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Frame {
    pub origin: Vec3,
    pub orientation: Quat,
    pub scale: Vec3,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Frame {
    pub fn from_origin(origin: Vec3) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }

    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_scale_rotation_translation(self.scale, self.orientation, self.origin)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct CompositePart {
    pub id: ObjectId,
    pub frame: Frame,
}

#[derive(Debug, Clone, Default)]
pub struct CompositeDefinition {
    pub parts: Vec<CompositePart>,
}
