use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use log::{debug, trace, warn};
use portalview_files::ObjectId;

use crate::rendering::asset_graph::idle_list::IdleList;
use crate::rendering::backend::RenderResource;

#[derive(Debug)]
struct CacheEntry {
    resource: Arc<RenderResource>,
    usage: u32,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ObjectId, CacheEntry>,
    idle: IdleList,
    memory_used: u64,
    /// Evicted resources whose GPU objects still have to be freed on the render thread.
    graveyard: Vec<Arc<RenderResource>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub resident: usize,
    pub idle: usize,
    pub memory_used: u64,
    pub memory_budget: u64,
}

/// The reference counted set of resident resources and the evictor that keeps it within the
/// memory budget.
///
/// All transitions of a resident id (active ⇄ idle → evicted) happen in here, under one lock, so
/// the idle list always contains exactly the resident ids with a usage count of zero. Acquiring and
/// releasing is fine from any thread. Eviction only does the bookkeeping, the GPU objects of evicted
/// resources are handed to the render thread through [`ResourceCache::take_evicted`].
#[derive(Debug)]
pub struct ResourceCache {
    state: RwLock<CacheState>,
    memory_budget: u64,
}

impl ResourceCache {
    pub fn new(memory_budget: u64) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            memory_budget,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().expect("Resource cache write lock")
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    pub fn memory_used(&self) -> u64 {
        self.state.read().expect("Resource cache read lock").memory_used
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read().expect("Resource cache read lock");
        CacheStats {
            resident: state.entries.len(),
            idle: state.idle.len(),
            memory_used: state.memory_used,
            memory_budget: self.memory_budget,
        }
    }

    pub fn is_resident(&self, id: ObjectId) -> bool {
        self.state
            .read()
            .expect("Resource cache read lock")
            .entries
            .contains_key(&id)
    }

    /// None when not resident.
    pub fn usage_count(&self, id: ObjectId) -> Option<u32> {
        self.state
            .read()
            .expect("Resource cache read lock")
            .entries
            .get(&id)
            .map(|entry| entry.usage)
    }

    pub fn is_idle(&self, id: ObjectId) -> bool {
        self.state
            .read()
            .expect("Resource cache read lock")
            .idle
            .contains(id)
    }

    /// Oldest release first.
    pub fn idle_ids(&self) -> Vec<ObjectId> {
        self.state
            .read()
            .expect("Resource cache read lock")
            .idle
            .iter()
            .collect()
    }

    /// Non-owning lookup for per-frame use: neither the usage count nor the idle order change.
    pub fn try_get_render_data(&self, id: ObjectId) -> Option<Arc<RenderResource>> {
        self.state
            .read()
            .expect("Resource cache read lock")
            .entries
            .get(&id)
            .map(|entry| entry.resource.clone())
    }

    /// Owning lookup, the caller has to [`ResourceCache::release`] the object again.
    pub fn get_render_data(&self, id: ObjectId) -> Option<Arc<RenderResource>> {
        self.acquire(id)
    }

    pub fn acquire(&self, id: ObjectId) -> Option<Arc<RenderResource>> {
        let mut state = self.write();
        let state = &mut *state;
        let entry = state.entries.get_mut(&id)?;
        entry.usage += 1;
        if entry.usage == 1 && state.idle.remove(id) {
            trace!("{id} is active again");
        }
        Some(entry.resource.clone())
    }

    /// Drops one reference. When that was the last one, the object becomes idle and the evictor
    /// runs. Returns the remaining usage count, None if the id wasn't resident.
    pub fn release(&self, id: ObjectId) -> Option<u32> {
        let mut state = self.write();
        let remaining = Self::release_locked(&mut state, id)?;
        if remaining == 0 {
            Self::sweep_locked(&mut state, self.memory_budget);
        }
        Some(remaining)
    }

    pub fn increment_ref_count(&self, id: ObjectId) -> bool {
        self.acquire(id).is_some()
    }

    pub fn decrement_ref_count(&self, id: ObjectId) -> Option<u32> {
        self.release(id)
    }

    /// Runs the evictor without releasing anything, e.g. after uploads grew the resident set.
    /// Returns the number of evicted objects.
    pub fn evict_to_budget(&self) -> usize {
        Self::sweep_locked(&mut self.write(), self.memory_budget)
    }

    /// Registers a freshly uploaded resource as active with one reference (the uploader's caller's).
    /// If the id is resident already nothing changes and the resident resource is returned as error,
    /// the caller has to discard what it has built.
    pub(crate) fn register(&self, resource: Arc<RenderResource>) -> Result<(), Arc<RenderResource>> {
        let mut state = self.write();
        if let Some(existing) = state.entries.get(&resource.id) {
            return Err(existing.resource.clone());
        }

        trace!("Registering {} ({} bytes)", resource.id, resource.memory_size);
        state.memory_used += resource.memory_size;
        state.entries.insert(resource.id, CacheEntry { resource, usage: 1 });
        Ok(())
    }

    /// Evicted resources that still hold GPU objects. Render thread only.
    pub(crate) fn take_evicted(&self) -> Vec<Arc<RenderResource>> {
        std::mem::take(&mut self.write().graveyard)
    }

    /// Forgets everything, returning every resource that holds GPU objects. Used on teardown.
    pub(crate) fn drain_all(&self) -> Vec<Arc<RenderResource>> {
        let mut state = self.write();
        let mut resources = std::mem::take(&mut state.graveyard);
        resources.extend(state.entries.drain().map(|(_, entry)| entry.resource));
        state.idle.clear();
        state.memory_used = 0;
        resources
    }

    fn release_locked(state: &mut CacheState, id: ObjectId) -> Option<u32> {
        let Some(entry) = state.entries.get_mut(&id) else {
            warn!("Releasing {id}, which is not resident");
            return None;
        };

        if entry.usage == 0 {
            // clamped, it already is idle
            debug!("Releasing {id}, which has no references left");
            return Some(0);
        }

        entry.usage -= 1;
        if entry.usage == 0 {
            trace!("{id} is idle");
            state.idle.push_back(id);
        }
        Some(entry.usage)
    }

    fn sweep_locked(state: &mut CacheState, memory_budget: u64) -> usize {
        let mut evicted = 0;
        while state.memory_used > memory_budget {
            let Some(id) = state.idle.pop_front() else {
                break;
            };

            // It may have been acquired again since it has been released.
            if state.entries.get(&id).is_none_or(|entry| entry.usage != 0) {
                continue;
            }
            let Some(entry) = state.entries.remove(&id) else {
                continue;
            };

            let resource = entry.resource;
            debug_assert!(state.memory_used >= resource.memory_size);
            state.memory_used = state.memory_used.saturating_sub(resource.memory_size);
            trace!("Evicting {id} ({} bytes)", resource.memory_size);

            if let Some(parts) = resource.parts.as_ref() {
                for part in parts {
                    Self::release_locked(state, part.id);
                }
            }

            state.graveyard.push(resource);
            evicted += 1;
        }

        if evicted > 0 {
            debug!(
                "Evicted {evicted} objects, {} of {memory_budget} bytes in use",
                state.memory_used
            );
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::common::types::{BoundingBox, PlacedPart};
    use glam::Affine3A;

    fn resource(id: u32, memory_size: u64) -> Arc<RenderResource> {
        Arc::new(RenderResource {
            id: ObjectId::leaf(id),
            vertex_buffer: None,
            batches: vec![],
            bounds: BoundingBox::default(),
            memory_size,
            parts: None,
        })
    }

    fn composite(id: u32, parts: &[u32]) -> Arc<RenderResource> {
        Arc::new(RenderResource {
            id: ObjectId::composite(id),
            vertex_buffer: None,
            batches: vec![],
            bounds: BoundingBox::default(),
            memory_size: 0,
            parts: Some(
                parts
                    .iter()
                    .map(|&p| PlacedPart {
                        id: ObjectId::leaf(p),
                        transform: Affine3A::IDENTITY,
                    })
                    .collect(),
            ),
        })
    }

    fn assert_idle_consistency(cache: &ResourceCache) {
        let state = cache.state.read().unwrap();
        for (id, entry) in &state.entries {
            assert_eq!(entry.usage == 0, state.idle.contains(*id), "{id}");
        }
        assert!(state.idle.iter().all(|id| state.entries.contains_key(&id)));
        let sum: u64 = state.entries.values().map(|e| e.resource.memory_size).sum();
        assert_eq!(sum, state.memory_used);
    }

    #[test]
    fn acquire_release_keeps_idle_list_consistent() {
        let cache = ResourceCache::new(1000);
        let id = ObjectId::leaf(1);
        assert!(cache.acquire(id).is_none());

        cache.register(resource(1, 10)).unwrap();
        assert_eq!(cache.usage_count(id), Some(1));
        assert_idle_consistency(&cache);

        assert!(cache.acquire(id).is_some());
        assert_eq!(cache.release(id), Some(1));
        assert!(!cache.is_idle(id));
        assert_eq!(cache.release(id), Some(0));
        assert!(cache.is_idle(id));
        assert_idle_consistency(&cache);

        // clamped at zero, and not listed twice
        assert_eq!(cache.release(id), Some(0));
        assert_eq!(cache.idle_ids(), vec![id]);

        assert!(cache.get_render_data(id).is_some());
        assert!(!cache.is_idle(id));
        assert_idle_consistency(&cache);
    }

    #[test]
    fn non_owning_lookup_changes_nothing() {
        let cache = ResourceCache::new(1000);
        cache.register(resource(1, 10)).unwrap();
        cache.release(ObjectId::leaf(1));

        assert!(cache.try_get_render_data(ObjectId::leaf(1)).is_some());
        assert_eq!(cache.usage_count(ObjectId::leaf(1)), Some(0));
        assert!(cache.is_idle(ObjectId::leaf(1)));
        assert_eq!(cache.evict_to_budget(), 0);
        assert!(cache.is_resident(ObjectId::leaf(1)));
    }

    #[test]
    fn evicts_oldest_released_until_within_budget() {
        let cache = ResourceCache::new(25);
        for i in 1..=4 {
            cache.register(resource(i, 10)).unwrap();
        }
        // 40 bytes resident, all active: nothing can go
        assert_eq!(cache.evict_to_budget(), 0);

        cache.release(ObjectId::leaf(3));
        assert!(!cache.is_resident(ObjectId::leaf(3)));
        assert_eq!(cache.memory_used(), 30);

        cache.release(ObjectId::leaf(1));
        assert!(!cache.is_resident(ObjectId::leaf(1)));
        assert_eq!(cache.memory_used(), 20);

        cache.release(ObjectId::leaf(2));
        assert!(cache.is_resident(ObjectId::leaf(2)));
        assert_eq!(cache.take_evicted().len(), 2);
        assert!(cache.take_evicted().is_empty());
        assert_idle_consistency(&cache);
    }

    #[test]
    fn reacquired_head_is_skipped() {
        let cache = ResourceCache::new(5);
        cache.register(resource(1, 10)).unwrap();
        cache.register(resource(2, 10)).unwrap();
        {
            // both idle without triggering the sweep on the way
            let mut state = cache.write();
            ResourceCache::release_locked(&mut state, ObjectId::leaf(1));
            ResourceCache::release_locked(&mut state, ObjectId::leaf(2));
            // simulate a stale head
            state.entries.get_mut(&ObjectId::leaf(1)).unwrap().usage = 1;
        }

        assert_eq!(cache.evict_to_budget(), 1);
        assert!(cache.is_resident(ObjectId::leaf(1)));
        assert!(!cache.is_resident(ObjectId::leaf(2)));
        assert!(cache.idle_ids().is_empty());
    }

    #[test]
    fn evicting_a_composite_releases_its_parts() {
        let cache = ResourceCache::new(0);
        cache.register(resource(1, 10)).unwrap();
        cache.register(resource(2, 10)).unwrap();
        cache.register(composite(1, &[1, 2])).unwrap();
        // the parts are only referenced by the composite now
        assert_eq!(cache.usage_count(ObjectId::leaf(1)), Some(1));

        cache.release(ObjectId::composite(1));
        // composite evicted first, parts became idle and were evicted in the same sweep
        assert_eq!(cache.stats().resident, 0);
        assert_eq!(cache.memory_used(), 0);
        assert_eq!(cache.take_evicted().len(), 3);
    }

    #[test]
    fn register_is_idempotent() {
        let cache = ResourceCache::new(100);
        cache.register(resource(1, 10)).unwrap();
        let existing = cache.register(resource(1, 99)).unwrap_err();
        assert_eq!(existing.memory_size, 10);
        assert_eq!(cache.memory_used(), 10);
        assert_eq!(cache.usage_count(ObjectId::leaf(1)), Some(1));
    }

    #[test]
    fn concurrent_acquire_release_never_goes_negative() {
        let cache = Arc::new(ResourceCache::new(u64::MAX));
        let id = ObjectId::leaf(1);
        cache.register(resource(1, 10)).unwrap();

        let threads = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        cache.acquire(id);
                        cache.release(id);
                        // unbalanced releases are clamped
                        cache.release(id);
                        cache.acquire(id);
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(cache.usage_count(id).is_some());
        assert_idle_consistency(&cache);
    }
}
