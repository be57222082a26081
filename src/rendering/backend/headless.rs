use std::collections::HashMap;

use log::{error, trace};

use crate::rendering::backend::{BufferHandle, GraphicsDevice, GraphicsError, TextureArrayHandle};
use crate::rendering::common::types::{TextureGroup, Vertex};

#[derive(Debug)]
struct TextureArray {
    layer_size: usize,
    layers: u32,
}

/// A [`GraphicsDevice`] without a GPU: it only keeps track of what has been allocated. Used by the
/// demo and the tests, which can also make it fail allocations on purpose.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    next_handle: u64,
    buffers: HashMap<u64, usize>,
    textures: HashMap<u64, TextureArray>,
    layer_writes: usize,
    /// Deletions of handles that weren't live.
    double_frees: usize,
    /// Allocations left before every further allocation fails.
    allocations_left: Option<usize>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets the next `count` allocations succeed and every one after that fail with
    /// [`GraphicsError::OutOfMemory`].
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocations_left = Some(count);
    }

    pub fn stop_failing(&mut self) {
        self.allocations_left = None;
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffers.values().sum()
    }

    pub fn texture_bytes(&self) -> usize {
        self.textures
            .values()
            .map(|array| array.layer_size * array.layers as usize)
            .sum()
    }

    pub fn layer_writes(&self) -> usize {
        self.layer_writes
    }

    pub fn double_frees(&self) -> usize {
        self.double_frees
    }

    fn allocate(&mut self, size: usize) -> Result<u64, GraphicsError> {
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(GraphicsError::OutOfMemory { requested: size });
            }
            *left -= 1;
        }

        self.next_handle += 1;
        Ok(self.next_handle)
    }

    fn create_buffer(&mut self, size: usize) -> Result<BufferHandle, GraphicsError> {
        let handle = self.allocate(size)?;
        self.buffers.insert(handle, size);
        trace!("Created buffer {handle} ({size} bytes)");
        Ok(BufferHandle(handle))
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn create_vertex_buffer(&mut self, vertices: &[Vertex]) -> Result<BufferHandle, GraphicsError> {
        self.create_buffer(size_of_val(vertices))
    }

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<BufferHandle, GraphicsError> {
        self.create_buffer(size_of_val(indices))
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.0).is_none() {
            error!("Double free of buffer {}", buffer.0);
            self.double_frees += 1;
        }
    }

    fn create_texture_array(&mut self, group: TextureGroup, layers: u32) -> Result<TextureArrayHandle, GraphicsError> {
        let layer_size = group.layer_size().ok_or(GraphicsError::OutOfMemory { requested: usize::MAX })?;
        let size = layer_size
            .checked_mul(layers as usize)
            .ok_or(GraphicsError::OutOfMemory { requested: usize::MAX })?;
        let handle = self.allocate(size)?;
        self.textures.insert(handle, TextureArray { layer_size, layers });
        Ok(TextureArrayHandle(handle))
    }

    fn write_texture_layer(
        &mut self,
        texture: TextureArrayHandle,
        layer: u32,
        pixels: &[u8],
    ) -> Result<(), GraphicsError> {
        let array = self
            .textures
            .get(&texture.0)
            .ok_or(GraphicsError::InvalidHandle(texture.0))?;

        if layer >= array.layers {
            return Err(GraphicsError::LayerOutOfRange {
                layer,
                layers: array.layers,
            });
        }

        let expected = array.layer_size;
        if pixels.len() != expected {
            return Err(GraphicsError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        self.layer_writes += 1;
        Ok(())
    }

    fn delete_texture_array(&mut self, texture: TextureArrayHandle) {
        if self.textures.remove(&texture.0).is_none() {
            error!("Double free of texture array {}", texture.0);
            self.double_frees += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::common::types::TextureFormat;

    #[test]
    fn injected_failures_start_after_the_given_count() {
        let mut device = HeadlessDevice::new();
        device.fail_allocations_after(1);
        let buffer = device.create_index_buffer(&[0, 1, 2]).unwrap();
        assert_eq!(device.buffer_bytes(), 12);
        assert_eq!(
            device.create_index_buffer(&[0]),
            Err(GraphicsError::OutOfMemory { requested: 4 })
        );

        device.stop_failing();
        device.delete_buffer(buffer);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn layer_writes_are_validated() {
        let mut device = HeadlessDevice::new();
        let group = TextureGroup {
            width: 8,
            height: 8,
            format: TextureFormat::Bc1,
        };
        let texture = device.create_texture_array(group, 2).unwrap();
        assert_eq!(device.texture_bytes(), 64);

        assert!(device.write_texture_layer(texture, 1, &[0; 32]).is_ok());
        assert!(matches!(
            device.write_texture_layer(texture, 2, &[0; 32]),
            Err(GraphicsError::LayerOutOfRange { layer: 2, layers: 2 })
        ));
        assert!(matches!(
            device.write_texture_layer(texture, 0, &[0; 16]),
            Err(GraphicsError::SizeMismatch { .. })
        ));
        assert_eq!(device.layer_writes(), 1);
    }

    #[test]
    fn double_frees_are_reported_not_fatal() {
        let mut device = HeadlessDevice::new();
        let buffer = device.create_index_buffer(&[0, 1, 2]).unwrap();
        device.delete_buffer(buffer);
        device.delete_buffer(buffer);
        device.delete_texture_array(TextureArrayHandle(42));
        assert_eq!(device.double_frees(), 2);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn oversized_texture_arrays_fail_to_allocate() {
        let mut device = HeadlessDevice::new();
        let group = TextureGroup {
            width: u32::MAX,
            height: u32::MAX,
            format: TextureFormat::Rgba8,
        };
        assert!(matches!(
            device.create_texture_array(group, 1),
            Err(GraphicsError::OutOfMemory { .. })
        ));
        assert_eq!(device.live_textures(), 0);
    }
}
