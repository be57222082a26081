use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use dashmap::DashMap;
use itertools::Itertools;
use log::{debug, trace, warn};
use portalview_files::ObjectId;
use portalview_files::source::DataSource;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::rendering::asset_graph::bounds_cache::BoundsCache;
use crate::rendering::asset_graph::mesh_preparer::{MeshPreparer, PreparerStats};
use crate::rendering::asset_graph::resource_cache::{CacheStats, ResourceCache};
use crate::rendering::backend::atlas_pool::AtlasStats;
use crate::rendering::backend::gpu_uploader::{GpuUploader, UploadJob, UploadOutcome};
use crate::rendering::backend::{GraphicsDevice, RenderResource};
use crate::rendering::common::types::{BoundingBox, MeshData};
use crate::settings::ResourceSettings;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourceState {
    Unprepared,
    Preparing,
    /// Prepared and waiting for the render thread.
    Prepared,
    ResidentActive(u32),
    ResidentIdle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Handed to the render thread, see [`FrameStats::uploaded`] for the upload.
    Enqueued,
    AlreadyResident,
    Cancelled,
    Failed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameStats {
    pub uploaded: Vec<(ObjectId, UploadOutcome)>,
    pub evicted: usize,
    pub freed: usize,
    pub memory_used: u64,
    pub memory_budget: u64,
}

impl FrameStats {
    /// Objects that became resident this frame, each with one reference owned by the requester.
    pub fn registered(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.uploaded
            .iter()
            .filter(|(_, outcome)| *outcome == UploadOutcome::Registered)
            .map(|(id, _)| *id)
    }
}

/// The thread safe half of the resource management: bounds, preparation and reference counting.
/// Everything that needs the graphics device lives in the [`RenderThread`] created alongside.
pub struct ResourceManager {
    bounds: Arc<BoundsCache>,
    cache: Arc<ResourceCache>,
    preparer: Arc<MeshPreparer>,
    upload_queue: Sender<UploadJob>,
    queued: Arc<DashMap<ObjectId, u32>>,
    runtime: Handle,
}

impl ResourceManager {
    pub fn new<D: GraphicsDevice>(
        source: Arc<dyn DataSource>,
        device: D,
        settings: &ResourceSettings,
        runtime: Handle,
    ) -> (Arc<Self>, RenderThread<D>) {
        let bounds = Arc::new(BoundsCache::new(source.clone()));
        let cache = Arc::new(ResourceCache::new(settings.memory_budget));
        let preparer = Arc::new(MeshPreparer::new(source, bounds.clone(), cache.clone()));
        let queued = Arc::new(DashMap::new());
        let (sender, receiver) = channel();

        debug!(
            "Resource manager with a budget of {} bytes and {} layers per atlas",
            settings.memory_budget, settings.atlas_layers
        );

        let manager = Arc::new(Self {
            bounds,
            cache: cache.clone(),
            preparer,
            upload_queue: sender,
            queued: queued.clone(),
            runtime,
        });

        let render_thread = RenderThread {
            uploader: GpuUploader::new(device, settings.atlas_layers, cache.clone()),
            queue: receiver,
            queued,
            cache,
        };

        (manager, render_thread)
    }

    pub fn get_bounds(&self, id: ObjectId) -> Option<BoundingBox> {
        self.bounds.get_bounds(id)
    }

    /// Prepares without enqueueing the result for upload.
    pub async fn prepare(&self, id: ObjectId, is_composite_hint: bool, cancel: CancellationToken) -> Option<Arc<MeshData>> {
        self.preparer.prepare(id, is_composite_hint, cancel).await
    }

    /// Prepares `id` in the background and hands it to the render thread. Composites are
    /// enqueued together with those parts that aren't resident.
    pub fn request(self: &Arc<Self>, id: ObjectId, cancel: CancellationToken) -> JoinHandle<RequestOutcome> {
        self.request_with_hint(id, false, cancel)
    }

    /// [`ResourceManager::request`] for ids the data source may not classify, see
    /// [`MeshPreparer::prepare`].
    pub fn request_with_hint(
        self: &Arc<Self>,
        id: ObjectId,
        is_composite_hint: bool,
        cancel: CancellationToken,
    ) -> JoinHandle<RequestOutcome> {
        let this = self.clone();
        self.runtime
            .spawn(async move { this.prepare_and_enqueue(id, is_composite_hint, cancel).await })
    }

    async fn prepare_and_enqueue(&self, id: ObjectId, is_composite_hint: bool, cancel: CancellationToken) -> RequestOutcome {
        let Some(mesh) = self.preparer.prepare(id, is_composite_hint, cancel.clone()).await else {
            return self.absent_outcome(id, &cancel);
        };

        let mut job = UploadJob::new(mesh);
        if job.mesh.is_composite() {
            let missing = job
                .mesh
                .parts()
                .iter()
                .map(|part| part.id)
                .unique()
                .filter(|part| !self.cache.is_resident(*part))
                .collect_vec();

            let mut preparations = JoinSet::new();
            for part in missing {
                let preparer = self.preparer.clone();
                let cancel = cancel.clone();
                preparations.spawn(async move { (part, preparer.prepare(part, false, cancel).await) });
            }

            while let Some(joined) = preparations.join_next().await {
                match joined {
                    Ok((_, Some(part))) => job.parts.push(part),
                    // got resident in the meantime
                    Ok((part, None)) if self.cache.is_resident(part) => {}
                    Ok((part, None)) => {
                        if cancel.is_cancelled() {
                            return RequestOutcome::Cancelled;
                        }
                        warn!("Not enqueuing {id}, its part {part} could not be prepared");
                        return RequestOutcome::Failed;
                    }
                    Err(err) => {
                        warn!("Not enqueuing {id}, preparing a part did not finish: {err}");
                        return RequestOutcome::Failed;
                    }
                }
            }
        }

        self.enqueue(job)
    }

    fn absent_outcome(&self, id: ObjectId, cancel: &CancellationToken) -> RequestOutcome {
        if self.cache.is_resident(id) {
            RequestOutcome::AlreadyResident
        } else if cancel.is_cancelled() {
            RequestOutcome::Cancelled
        } else {
            RequestOutcome::Failed
        }
    }

    fn enqueue(&self, job: UploadJob) -> RequestOutcome {
        let id = job.id();
        *self.queued.entry(id).or_default() += 1;

        if self.upload_queue.send(job).is_err() {
            warn!("Dropping {id}, the render thread is gone");
            dequeue(&self.queued, id);
            return RequestOutcome::Failed;
        }

        trace!("Enqueued {id} for upload");
        RequestOutcome::Enqueued
    }

    pub fn state(&self, id: ObjectId) -> ResourceState {
        match self.cache.usage_count(id) {
            Some(0) => ResourceState::ResidentIdle,
            Some(usage) => ResourceState::ResidentActive(usage),
            None if self.preparer.is_in_flight(id) => ResourceState::Preparing,
            None if self.queued.contains_key(&id) => ResourceState::Prepared,
            None => ResourceState::Unprepared,
        }
    }

    pub fn acquire(&self, id: ObjectId) -> Option<Arc<RenderResource>> {
        self.cache.acquire(id)
    }

    pub fn release(&self, id: ObjectId) -> Option<u32> {
        self.cache.release(id)
    }

    pub fn increment_ref_count(&self, id: ObjectId) -> bool {
        self.cache.increment_ref_count(id)
    }

    pub fn decrement_ref_count(&self, id: ObjectId) -> Option<u32> {
        self.cache.decrement_ref_count(id)
    }

    pub fn get_render_data(&self, id: ObjectId) -> Option<Arc<RenderResource>> {
        self.cache.get_render_data(id)
    }

    pub fn try_get_render_data(&self, id: ObjectId) -> Option<Arc<RenderResource>> {
        self.cache.try_get_render_data(id)
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn preparer_stats(&self) -> PreparerStats {
        self.preparer.stats()
    }

    pub fn waiting_callers(&self, id: ObjectId) -> usize {
        self.preparer.waiting_callers(id)
    }
}

fn dequeue(queued: &DashMap<ObjectId, u32>, id: ObjectId) {
    queued.remove_if_mut(&id, |_, count| {
        *count -= 1;
        *count == 0
    });
}

/// The render thread half: owns the device, uploads what has been prepared and frees what has
/// been evicted. Not `Send` when the device isn't.
pub struct RenderThread<D: GraphicsDevice> {
    uploader: GpuUploader<D>,
    queue: Receiver<UploadJob>,
    queued: Arc<DashMap<ObjectId, u32>>,
    cache: Arc<ResourceCache>,
}

impl<D: GraphicsDevice> RenderThread<D> {
    /// Once per frame: uploads everything that has been prepared since the last frame, then
    /// enforces the memory budget and frees the GPU objects of evicted resources.
    pub fn maintain(&mut self) -> FrameStats {
        profiling::scope!("RenderThread::maintain");
        let mut stats = FrameStats::default();

        while let Ok(job) = self.queue.try_recv() {
            let outcome = self.uploader.upload_job(&job);
            dequeue(&self.queued, job.id());
            stats.uploaded.push((job.id(), outcome));
        }

        stats.evicted = self.cache.evict_to_budget();
        stats.freed = self.uploader.collect_garbage();
        stats.memory_used = self.cache.memory_used();
        stats.memory_budget = self.cache.memory_budget();

        if !stats.uploaded.is_empty() || stats.freed > 0 {
            trace!(
                "Frame: {} uploads, {} freed, {}/{} bytes",
                stats.uploaded.len(),
                stats.freed,
                stats.memory_used,
                stats.memory_budget
            );
        }
        stats
    }

    pub fn uploader(&self) -> &GpuUploader<D> {
        &self.uploader
    }

    pub fn device(&self) -> &D {
        self.uploader.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.uploader.device_mut()
    }

    pub fn atlas_stats(&self) -> AtlasStats {
        self.uploader.atlases().stats()
    }

    /// Frees every resident resource and atlas. Jobs still in the queue are dropped.
    pub fn teardown(self) -> D {
        let dropped = self.queue.try_iter().count();
        if dropped > 0 {
            debug!("Dropping {dropped} pending uploads on teardown");
        }
        self.queued.clear();
        self.uploader.teardown()
    }
}
