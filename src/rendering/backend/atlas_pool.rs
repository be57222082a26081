use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::rendering::backend::{AtlasSlot, GraphicsDevice, GraphicsError, TextureArrayHandle};
use crate::rendering::common::types::{TextureGroup, TextureKey};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtlasId(pub u32);

#[derive(Debug)]
struct SlotEntry {
    layer: u32,
    /// Number of batches (of any object) drawing from this slot.
    references: u32,
}

#[derive(Debug)]
struct AtlasInstance {
    id: AtlasId,
    texture: TextureArrayHandle,
    capacity: u32,
    slots: HashMap<TextureKey, SlotEntry>,
    free_layers: Vec<u32>,
}

impl AtlasInstance {
    fn slot(&self, layer: u32) -> AtlasSlot {
        AtlasSlot {
            atlas: self.id,
            texture: self.texture,
            layer,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AtlasStats {
    pub groups: usize,
    pub atlases: usize,
    pub used_layers: usize,
    pub free_layers: usize,
}

/// Texture arrays shared between all objects, one set per [`TextureGroup`]. A [`TextureKey`] is
/// uploaded once and occupies one layer for as long as any batch references it.
#[derive(Debug)]
pub struct AtlasPool {
    layers_per_atlas: u32,
    groups: HashMap<TextureGroup, Vec<AtlasInstance>>,
    next_id: u32,
}

impl AtlasPool {
    pub fn new(layers_per_atlas: u32) -> Self {
        Self {
            layers_per_atlas: layers_per_atlas.max(1),
            groups: HashMap::new(),
            next_id: 0,
        }
    }

    /// Takes a reference on the slot holding `key`, uploading `pixels` only when the key isn't
    /// present in any atlas of the group yet.
    pub fn acquire<D: GraphicsDevice>(
        &mut self,
        device: &mut D,
        group: TextureGroup,
        key: TextureKey,
        pixels: &[u8],
    ) -> Result<AtlasSlot, GraphicsError> {
        profiling::scope!("AtlasPool::acquire");
        let atlases = self.groups.entry(group).or_default();

        for atlas in atlases.iter_mut() {
            if let Some(entry) = atlas.slots.get_mut(&key) {
                entry.references += 1;
                let layer = entry.layer;
                return Ok(atlas.slot(layer));
            }
        }

        let with_free_layer = atlases
            .iter_mut()
            .find_map(|atlas| atlas.free_layers.pop().map(|layer| (atlas, layer)));
        if let Some((atlas, layer)) = with_free_layer {
            if let Err(err) = device.write_texture_layer(atlas.texture, layer, pixels) {
                atlas.free_layers.push(layer);
                return Err(err);
            }
            atlas.slots.insert(key, SlotEntry { layer, references: 1 });
            trace!("{key:?} uploaded to layer {layer} of {:?}", atlas.id);
            return Ok(atlas.slot(layer));
        }

        let texture = device.create_texture_array(group, self.layers_per_atlas)?;
        if let Err(err) = device.write_texture_layer(texture, 0, pixels) {
            device.delete_texture_array(texture);
            return Err(err);
        }

        let id = AtlasId(self.next_id);
        self.next_id += 1;
        debug!(
            "New atlas {id:?} with {} layers for {}x{} {:?}",
            self.layers_per_atlas, group.width, group.height, group.format
        );

        let mut atlas = AtlasInstance {
            id,
            texture,
            capacity: self.layers_per_atlas,
            slots: HashMap::new(),
            // popped from the back, so the lowest layers are handed out first
            free_layers: (1..self.layers_per_atlas).rev().collect(),
        };
        atlas.slots.insert(key, SlotEntry { layer: 0, references: 1 });
        let slot = atlas.slot(0);
        atlases.push(atlas);
        Ok(slot)
    }

    /// Drops one reference on the slot of `key`. The layer is freed once nothing references it,
    /// the whole atlas once all of its layers are free.
    pub fn release<D: GraphicsDevice>(&mut self, device: &mut D, group: TextureGroup, atlas: AtlasId, key: TextureKey) {
        let Some(atlases) = self.groups.get_mut(&group) else {
            warn!("Releasing {key:?} from unknown group {group:?}");
            return;
        };
        let Some(position) = atlases.iter().position(|instance| instance.id == atlas) else {
            warn!("Releasing {key:?} from unknown atlas {atlas:?}");
            return;
        };

        let instance = &mut atlases[position];
        let Some(entry) = instance.slots.get_mut(&key) else {
            warn!("Releasing {key:?}, which isn't part of {atlas:?}");
            return;
        };

        entry.references -= 1;
        if entry.references > 0 {
            return;
        }

        let layer = entry.layer;
        instance.slots.remove(&key);
        instance.free_layers.push(layer);
        trace!("Freed layer {layer} of {atlas:?}");

        if instance.slots.is_empty() {
            let instance = atlases.swap_remove(position);
            debug!("Deleting empty atlas {:?}", instance.id);
            device.delete_texture_array(instance.texture);
            if atlases.is_empty() {
                self.groups.remove(&group);
            }
        }
    }

    /// The slot currently holding `key`, without taking a reference.
    pub fn lookup(&self, group: TextureGroup, key: TextureKey) -> Option<AtlasSlot> {
        self.groups.get(&group)?.iter().find_map(|atlas| {
            atlas.slots.get(&key).map(|entry| atlas.slot(entry.layer))
        })
    }

    pub fn references(&self, group: TextureGroup, key: TextureKey) -> u32 {
        self.groups
            .get(&group)
            .and_then(|atlases| atlases.iter().find_map(|atlas| atlas.slots.get(&key)))
            .map_or(0, |entry| entry.references)
    }

    pub fn stats(&self) -> AtlasStats {
        let mut stats = AtlasStats {
            groups: self.groups.len(),
            ..AtlasStats::default()
        };
        for atlas in self.groups.values().flatten() {
            stats.atlases += 1;
            stats.used_layers += atlas.slots.len();
            stats.free_layers += atlas.free_layers.len();
            debug_assert_eq!(atlas.slots.len() + atlas.free_layers.len(), atlas.capacity as usize);
        }
        stats
    }

    /// Deletes every atlas, regardless of references.
    pub fn clear<D: GraphicsDevice>(&mut self, device: &mut D) {
        for atlas in self.groups.drain().flat_map(|(_, atlases)| atlases) {
            device.delete_texture_array(atlas.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::backend::headless::HeadlessDevice;
    use crate::rendering::common::types::TextureFormat;
    use portalview_files::surface::types::SurfaceFlags;

    const GROUP: TextureGroup = TextureGroup {
        width: 4,
        height: 4,
        format: TextureFormat::Rgba8,
    };

    fn key(surface_id: u32) -> TextureKey {
        TextureKey {
            surface_id,
            palette_id: 0,
            variant: SurfaceFlags::BASE1_IMAGE,
            is_solid: false,
        }
    }

    fn pixels() -> Vec<u8> {
        vec![0xAB; GROUP.layer_size().unwrap()]
    }

    #[test]
    fn same_key_shares_one_layer() {
        let mut device = HeadlessDevice::new();
        let mut pool = AtlasPool::new(4);

        let a = pool.acquire(&mut device, GROUP, key(1), &pixels()).unwrap();
        let b = pool.acquire(&mut device, GROUP, key(1), &pixels()).unwrap();
        assert_eq!(a, b);
        assert_eq!(device.layer_writes(), 1);
        assert_eq!(pool.references(GROUP, key(1)), 2);

        let c = pool.acquire(&mut device, GROUP, key(2), &pixels()).unwrap();
        assert_eq!(c.atlas, a.atlas);
        assert_ne!(c.layer, a.layer);
    }

    #[test]
    fn full_atlases_spill_into_new_ones_and_empty_ones_are_deleted() {
        let mut device = HeadlessDevice::new();
        let mut pool = AtlasPool::new(2);

        let slots = (0..3)
            .map(|i| pool.acquire(&mut device, GROUP, key(i), &pixels()).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(pool.stats().atlases, 2);
        assert_ne!(slots[0].atlas, slots[2].atlas);
        assert_eq!(device.live_textures(), 2);

        pool.release(&mut device, GROUP, slots[2].atlas, key(2));
        assert_eq!(pool.stats().atlases, 1);
        assert_eq!(device.live_textures(), 1);

        // the freed layer of the first atlas is reused
        pool.release(&mut device, GROUP, slots[0].atlas, key(0));
        let reused = pool.acquire(&mut device, GROUP, key(5), &pixels()).unwrap();
        assert_eq!(reused, slots[0]);
        assert_eq!(pool.stats().free_layers, 0);
    }

    #[test]
    fn slot_survives_until_the_last_reference() {
        let mut device = HeadlessDevice::new();
        let mut pool = AtlasPool::new(4);
        let slot = pool.acquire(&mut device, GROUP, key(1), &pixels()).unwrap();
        pool.acquire(&mut device, GROUP, key(1), &pixels()).unwrap();

        pool.release(&mut device, GROUP, slot.atlas, key(1));
        assert_eq!(pool.lookup(GROUP, key(1)), Some(slot));
        pool.release(&mut device, GROUP, slot.atlas, key(1));
        assert_eq!(pool.lookup(GROUP, key(1)), None);
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn failed_writes_leave_nothing_behind() {
        let mut device = HeadlessDevice::new();
        let mut pool = AtlasPool::new(4);

        assert!(pool.acquire(&mut device, GROUP, key(1), &[0u8; 3]).is_err());
        assert_eq!(device.live_textures(), 0);
        assert_eq!(pool.stats().atlases, 0);

        pool.acquire(&mut device, GROUP, key(1), &pixels()).unwrap();
        assert!(pool.acquire(&mut device, GROUP, key(2), &[0u8; 3]).is_err());
        let stats = pool.stats();
        assert_eq!((stats.used_layers, stats.free_layers), (1, 3));
    }
}
