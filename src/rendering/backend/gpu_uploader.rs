use std::sync::Arc;

use log::{debug, error, trace};
use portalview_files::ObjectId;
use thiserror::Error;

use crate::rendering::asset_graph::resource_cache::ResourceCache;
use crate::rendering::backend::atlas_pool::{AtlasId, AtlasPool};
use crate::rendering::backend::{BufferHandle, DrawBatch, GraphicsDevice, GraphicsError, RenderResource};
use crate::rendering::common::types::{MeshContent, MeshData, TextureGroup, TextureKey};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Graphics(#[from] GraphicsError),
    #[error("Part {part} of {id} is neither resident nor part of the upload")]
    MissingPart { id: ObjectId, part: ObjectId },
    #[error("Part {part} of {id} is not a leaf")]
    InvalidPart { id: ObjectId, part: ObjectId },
}

/// A prepared object on its way to the render thread. Composites bring the prepared data of
/// those parts that weren't resident at preparation time.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub mesh: Arc<MeshData>,
    pub parts: Vec<Arc<MeshData>>,
}

impl UploadJob {
    pub fn new(mesh: Arc<MeshData>) -> Self {
        Self { mesh, parts: vec![] }
    }

    pub fn id(&self) -> ObjectId {
        self.mesh.id
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Resident now, with one reference owned by whoever asked for the object.
    Registered,
    /// Nothing has been uploaded, the resident resource is unchanged.
    AlreadyResident,
    Failed,
}

/// GPU objects allocated so far by an upload that may still fail.
#[derive(Default)]
struct PartialUpload {
    vertex_buffer: Option<BufferHandle>,
    index_buffers: Vec<BufferHandle>,
    slots: Vec<(TextureGroup, AtlasId, TextureKey)>,
}

/// Turns [`MeshData`] into [`RenderResource`]s and frees them again. Owns the device and thus
/// lives on the render thread.
pub struct GpuUploader<D: GraphicsDevice> {
    device: D,
    atlases: AtlasPool,
    cache: Arc<ResourceCache>,
}

impl<D: GraphicsDevice> GpuUploader<D> {
    pub fn new(device: D, layers_per_atlas: u32, cache: Arc<ResourceCache>) -> Self {
        Self {
            device,
            atlases: AtlasPool::new(layers_per_atlas),
            cache,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn atlases(&self) -> &AtlasPool {
        &self.atlases
    }

    /// Uploads `mesh` and registers it with one reference. Composite parts have to be resident.
    /// When the object is resident already, the resident resource is returned as is.
    pub fn upload(&mut self, mesh: &MeshData) -> Option<Arc<RenderResource>> {
        self.upload_with_parts(mesh, &[]).map(|(resource, _)| resource)
    }

    pub fn upload_job(&mut self, job: &UploadJob) -> UploadOutcome {
        match self.upload_with_parts(&job.mesh, &job.parts) {
            Some((_, true)) => UploadOutcome::Registered,
            Some((_, false)) => UploadOutcome::AlreadyResident,
            None => UploadOutcome::Failed,
        }
    }

    /// Frees the GPU objects of everything the evictor has removed from the cache.
    pub fn collect_garbage(&mut self) -> usize {
        let evicted = self.cache.take_evicted();
        for resource in &evicted {
            self.free(resource);
        }
        evicted.len()
    }

    /// Frees every resident resource and every atlas, handing the device back.
    pub fn teardown(mut self) -> D {
        let resources = self.cache.drain_all();
        debug!("Tearing down {} resources", resources.len());
        for resource in &resources {
            self.free(resource);
        }
        self.atlases.clear(&mut self.device);
        self.device
    }

    fn upload_with_parts(&mut self, mesh: &MeshData, parts: &[Arc<MeshData>]) -> Option<(Arc<RenderResource>, bool)> {
        profiling::scope!("GpuUploader::upload");
        if let Some(existing) = self.cache.try_get_render_data(mesh.id) {
            trace!("{} is resident already, discarding the upload", mesh.id);
            return Some((existing, false));
        }

        let result = match &mesh.content {
            MeshContent::Composite { .. } => self.upload_composite(mesh, parts),
            MeshContent::Leaf { .. } => self.upload_leaf(mesh),
        };

        match result {
            Ok(resource) => Some(self.register(resource)),
            Err(err) => {
                error!("Failed to upload {}: {err}", mesh.id);
                None
            }
        }
    }

    fn register(&mut self, resource: RenderResource) -> (Arc<RenderResource>, bool) {
        let resource = Arc::new(resource);
        match self.cache.register(resource.clone()) {
            Ok(()) => (resource, true),
            Err(existing) => {
                self.free(&resource);
                (existing, false)
            }
        }
    }

    fn upload_composite(&mut self, mesh: &MeshData, parts: &[Arc<MeshData>]) -> Result<RenderResource, UploadError> {
        let mut acquired = Vec::with_capacity(mesh.parts().len());

        for part in mesh.parts() {
            if self.cache.acquire(part.id).is_some() {
                acquired.push(part.id);
                continue;
            }

            let uploaded = match parts.iter().find(|data| data.id == part.id) {
                Some(data) if data.is_composite() => Err(UploadError::InvalidPart {
                    id: mesh.id,
                    part: part.id,
                }),
                Some(data) => self.upload_leaf(data),
                None => Err(UploadError::MissingPart {
                    id: mesh.id,
                    part: part.id,
                }),
            };

            match uploaded {
                Ok(resource) => {
                    // the part's first reference belongs to the composite
                    self.register(resource);
                    acquired.push(part.id);
                }
                Err(err) => {
                    for id in acquired {
                        self.cache.release(id);
                    }
                    return Err(err);
                }
            }
        }

        Ok(RenderResource {
            id: mesh.id,
            vertex_buffer: None,
            batches: vec![],
            bounds: mesh.bounds,
            memory_size: mesh.memory_size(),
            parts: Some(mesh.parts().to_vec()),
        })
    }

    fn upload_leaf(&mut self, mesh: &MeshData) -> Result<RenderResource, UploadError> {
        let mut partial = PartialUpload::default();
        match self.allocate_leaf(mesh, &mut partial) {
            Ok(batches) => Ok(RenderResource {
                id: mesh.id,
                vertex_buffer: partial.vertex_buffer,
                batches,
                bounds: mesh.bounds,
                memory_size: mesh.memory_size(),
                parts: None,
            }),
            Err(err) => {
                self.roll_back(partial);
                Err(err)
            }
        }
    }

    fn allocate_leaf(&mut self, mesh: &MeshData, partial: &mut PartialUpload) -> Result<Vec<DrawBatch>, UploadError> {
        let MeshContent::Leaf { vertices, groups } = &mesh.content else {
            return Ok(vec![]);
        };

        if !vertices.is_empty() {
            partial.vertex_buffer = Some(self.device.create_vertex_buffer(vertices)?);
        }

        let mut batches = Vec::with_capacity(groups.values().map(Vec::len).sum());
        for (group, data) in groups.iter().flat_map(|(group, batches)| batches.iter().map(move |b| (*group, b))) {
            let slot = self
                .atlases
                .acquire(&mut self.device, group, data.key, &data.texture.pixels)?;
            partial.slots.push((group, slot.atlas, data.key));

            let index_buffer = self.device.create_index_buffer(&data.indices)?;
            partial.index_buffers.push(index_buffer);

            batches.push(DrawBatch {
                index_buffer,
                index_count: data.indices.len() as u32,
                group,
                key: data.key,
                slot,
                cull_mode: data.cull_mode,
            });
        }

        Ok(batches)
    }

    fn roll_back(&mut self, partial: PartialUpload) {
        for buffer in partial.index_buffers {
            self.device.delete_buffer(buffer);
        }
        for (group, atlas, key) in partial.slots {
            self.atlases.release(&mut self.device, group, atlas, key);
        }
        if let Some(buffer) = partial.vertex_buffer {
            self.device.delete_buffer(buffer);
        }
    }

    fn free(&mut self, resource: &RenderResource) {
        trace!("Freeing the GPU objects of {}", resource.id);
        for batch in &resource.batches {
            self.device.delete_buffer(batch.index_buffer);
            self.atlases
                .release(&mut self.device, batch.group, batch.slot.atlas, batch.key);
        }
        if let Some(buffer) = resource.vertex_buffer {
            self.device.delete_buffer(buffer);
        }
    }
}
