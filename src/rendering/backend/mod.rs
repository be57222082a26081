//! The render thread side: the graphics capability we consume, the atlas pool and the uploader
//! that turns prepared [`MeshData`](crate::rendering::common::types::MeshData) into GPU resources.
use glam::Affine3A;
use portalview_files::ObjectId;
use portalview_files::object::types::CullMode;
use thiserror::Error;

use crate::rendering::backend::atlas_pool::AtlasId;
use crate::rendering::common::types::{BoundingBox, PlacedPart, TextureGroup, TextureKey, Vertex};

pub mod atlas_pool;
pub mod gpu_uploader;
pub mod headless;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureArrayHandle(pub u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    #[error("Out of device memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },
    #[error("Unknown handle {0}")]
    InvalidHandle(u64),
    #[error("Layer {layer} is out of range for an array of {layers} layers")]
    LayerOutOfRange { layer: u32, layers: u32 },
    #[error("Expected {expected} bytes of texel data, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("The device has been lost")]
    DeviceLost,
}

/// The graphics API wrapper. Implementations are bound to the thread that owns the graphics
/// context, which is why this trait doesn't require `Send`.
pub trait GraphicsDevice {
    fn create_vertex_buffer(&mut self, vertices: &[Vertex]) -> Result<BufferHandle, GraphicsError>;
    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<BufferHandle, GraphicsError>;
    fn delete_buffer(&mut self, buffer: BufferHandle);

    fn create_texture_array(&mut self, group: TextureGroup, layers: u32) -> Result<TextureArrayHandle, GraphicsError>;
    fn write_texture_layer(
        &mut self,
        texture: TextureArrayHandle,
        layer: u32,
        pixels: &[u8],
    ) -> Result<(), GraphicsError>;
    fn delete_texture_array(&mut self, texture: TextureArrayHandle);
}

/// Where the texture of a batch lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AtlasSlot {
    pub atlas: AtlasId,
    pub texture: TextureArrayHandle,
    pub layer: u32,
}

#[derive(Debug, Clone)]
pub struct DrawBatch {
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub group: TextureGroup,
    pub key: TextureKey,
    pub slot: AtlasSlot,
    pub cull_mode: CullMode,
}

/// A resident object. Composites are placeholders without GPU objects of their own, they keep
/// their parts resident instead.
#[derive(Debug)]
pub struct RenderResource {
    pub id: ObjectId,
    pub vertex_buffer: Option<BufferHandle>,
    pub batches: Vec<DrawBatch>,
    pub bounds: BoundingBox,
    pub memory_size: u64,
    pub parts: Option<Vec<PlacedPart>>,
}

impl RenderResource {
    pub fn is_composite(&self) -> bool {
        self.parts.is_some()
    }

    pub fn parts(&self) -> &[PlacedPart] {
        self.parts.as_deref().unwrap_or_default()
    }

    /// The world space bounds when placed with `transform`.
    pub fn placed_bounds(&self, transform: &Affine3A) -> BoundingBox {
        self.bounds.transformed(transform)
    }
}
