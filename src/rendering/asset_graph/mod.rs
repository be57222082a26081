//! This module keeps track of which objects are being prepared, which ones are resident on the GPU
//! and which ones may be evicted, together with the derived data (bounds) that is memoized per
//! object.
//!
//! Every object goes through the same states: it is unprepared, then a [`mesh_preparer::MeshPreparer`]
//! turns it into CPU side mesh data on a worker thread, the render thread uploads that data and
//! registers it in the [`resource_cache::ResourceCache`], where it is either active (someone holds a
//! reference) or idle. Idle objects are kept around until the memory budget is exceeded, then the
//! ones that have been released the longest time ago are evicted first.
//!
//! Preparation is deduplicated per id: whoever asks first starts the work, everyone asking while it
//! runs waits for the same result. Preparation never touches the cache or the GPU, so cancelling it
//! has no side effects.
//!
//! Composites don't own geometry, they own references to their (flattened) leaf parts instead:
//! uploading a composite acquires each part, evicting it releases them again. The source data does
//! not guarantee that composites are acyclic, so every traversal carries the path it came down.
pub mod bounds_cache;
pub mod composite;
pub mod idle_list;
pub mod mesh_preparer;
pub mod resource_cache;
