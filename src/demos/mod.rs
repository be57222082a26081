//! A synthetic archive and a frame loop that churns objects in and out of view, exercising the
//! whole pipeline without any real data or GPU.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{Quat, Vec2, Vec3};
use log::{info, trace, warn};
use portalview_files::ObjectId;
use portalview_files::object::types::{
    CompositeDefinition, CompositePart, CullMode, Frame, LeafGeometry, Polygon, StipplingFlags, SwVertex,
};
use portalview_files::source::{DataSource, MemoryDataSource};
use portalview_files::surface::types::{Palette, PixelFormat, RenderSurface, Surface, SurfaceFlags, SurfaceTexture};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rendering::backend::gpu_uploader::UploadOutcome;
use crate::rendering::backend::headless::HeadlessDevice;
use crate::rendering::resource_manager::{RequestOutcome, ResourceManager};
use crate::settings::ResourceSettings;

const SURFACE_BASE: u32 = 0x0800_0000;
const SURFACE_TEXTURE_BASE: u32 = 0x0500_0000;
const RENDER_SURFACE_BASE: u32 = 0x0600_0000;
const PALETTE_BASE: u32 = 0x0400_0000;
const TEXTURE_SIZE: u32 = 8;

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub objects: u32,
    pub detail: u32,
    pub shared_surfaces: u32,
    pub composites: u32,
    pub frames: u32,
    pub seed: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            objects: 200,
            detail: 2,
            shared_surfaces: 8,
            composites: 20,
            frames: 30,
            seed: 0x5EED,
        }
    }
}

pub struct DemoWorld {
    pub source: Arc<MemoryDataSource>,
    pub leaves: Vec<ObjectId>,
    pub composites: Vec<ObjectId>,
    /// Leaves whose surface cannot be decoded.
    pub broken: Vec<ObjectId>,
}

impl DemoWorld {
    pub fn generate(config: &DemoConfig) -> Result<Self, anyhow::Error> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let source = Arc::new(MemoryDataSource::new());

        let shared_surfaces = config.shared_surfaces.max(1);
        for index in 0..shared_surfaces {
            insert_shared_surface(&source, index, &mut rng)?;
        }

        // One surface that no decoder understands.
        let broken_surface = SURFACE_BASE + shared_surfaces;
        insert_image_surface(
            &source,
            broken_surface,
            RenderSurface {
                width: TEXTURE_SIZE,
                height: TEXTURE_SIZE,
                format: 999,
                data: vec![0; (TEXTURE_SIZE * TEXTURE_SIZE) as usize],
                default_palette_id: None,
            },
        )?;

        let detail = config.detail.clamp(1, 64);
        let mut leaves = Vec::with_capacity(config.objects as usize);
        let mut broken = Vec::new();
        for index in 0..config.objects {
            let id = ObjectId::leaf(index);
            let surfaces = if rng.random_bool(0.01) {
                broken.push(id);
                vec![broken_surface]
            } else {
                (0..rng.random_range(1..=3))
                    .map(|_| SURFACE_BASE + rng.random_range(0..shared_surfaces))
                    .collect()
            };
            let half_extent = Vec3::new(
                rng.random_range(0.5..4.0),
                rng.random_range(0.5..4.0),
                rng.random_range(0.5..4.0),
            );
            source.insert_leaf(id, box_leaf(half_extent, detail, surfaces))?;
            leaves.push(id);
        }

        let mut composites: Vec<ObjectId> = Vec::with_capacity(config.composites as usize);
        for index in 0..config.composites {
            let id = ObjectId::composite(index);
            let mut parts = Vec::new();
            for _ in 0..rng.random_range(2..=5) {
                // Only ever nest earlier composites, so the generated world is acyclic.
                let part = if !composites.is_empty() && rng.random_bool(0.2) {
                    composites[rng.random_range(0..composites.len())]
                } else if !leaves.is_empty() {
                    leaves[rng.random_range(0..leaves.len())]
                } else {
                    continue;
                };
                parts.push(CompositePart {
                    id: part,
                    frame: Frame {
                        origin: Vec3::new(
                            rng.random_range(-20.0..20.0),
                            rng.random_range(-20.0..20.0),
                            0.0,
                        ),
                        orientation: Quat::from_rotation_z(rng.random_range(0.0..std::f32::consts::TAU)),
                        scale: Vec3::splat(rng.random_range(0.5..2.0)),
                    },
                });
            }
            source.insert_composite(id, CompositeDefinition { parts })?;
            composites.push(id);
        }

        info!(
            "Generated {} leaves ({} broken) and {} composites sharing {} surfaces",
            leaves.len(),
            broken.len(),
            composites.len(),
            shared_surfaces
        );

        Ok(Self {
            source,
            leaves,
            composites,
            broken,
        })
    }

    pub fn objects(&self) -> Vec<ObjectId> {
        self.leaves.iter().chain(self.composites.iter()).copied().collect()
    }
}

pub fn solid_surface(color: u32) -> Surface {
    Surface {
        flags: SurfaceFlags::BASE1_SOLID,
        color,
        translucency: 0.0,
        texture_id: None,
        palette_id: None,
    }
}

/// Inserts `render_surface` together with the surface and surface texture records pointing to it,
/// all three under ids derived from `surface_id`.
pub fn insert_image_surface(
    source: &MemoryDataSource,
    surface_id: u32,
    render_surface: RenderSurface,
) -> Result<(), anyhow::Error> {
    let index = surface_id & 0x00FF_FFFF;
    source.insert_render_surface(RENDER_SURFACE_BASE + index, render_surface)?;
    source.insert_surface_texture(
        SURFACE_TEXTURE_BASE + index,
        SurfaceTexture {
            render_surfaces: vec![RENDER_SURFACE_BASE + index],
        },
    );
    source.insert_surface(
        surface_id,
        Surface {
            flags: SurfaceFlags::BASE1_IMAGE,
            color: 0,
            translucency: 0.0,
            texture_id: Some(SURFACE_TEXTURE_BASE + index),
            palette_id: None,
        },
    );
    Ok(())
}

fn insert_shared_surface(source: &MemoryDataSource, index: u32, rng: &mut StdRng) -> Result<(), anyhow::Error> {
    let surface_id = SURFACE_BASE + index;
    let texels = (TEXTURE_SIZE * TEXTURE_SIZE) as usize;
    let render_surface = |format: PixelFormat, data: Vec<u8>, default_palette_id: Option<u32>| RenderSurface {
        width: TEXTURE_SIZE,
        height: TEXTURE_SIZE,
        format: format as u32,
        data,
        default_palette_id,
    };

    match index % 4 {
        0 => source.insert_surface(surface_id, solid_surface(rng.random::<u32>() | 0xFF00_0000)),
        1 => {
            let palette = Palette {
                colors: (0..256).map(|_| rng.random::<u32>()).collect(),
            };
            source.insert_palette(PALETTE_BASE + index, palette);
            let data = (0..texels).map(|_| rng.random::<u8>()).collect();
            insert_image_surface(
                source,
                surface_id,
                render_surface(PixelFormat::P8, data, Some(PALETTE_BASE + index)),
            )?;
        }
        2 => {
            let data = (0..texels * 2).map(|_| rng.random::<u8>()).collect();
            insert_image_surface(source, surface_id, render_surface(PixelFormat::R5G6B5, data, None))?;
        }
        _ => {
            // 8 bytes per 4x4 block
            let data = (0..texels / 2).map(|_| rng.random::<u8>()).collect();
            insert_image_surface(source, surface_id, render_surface(PixelFormat::Dxt1, data, None))?;
        }
    }
    Ok(())
}

/// An axis aligned box around the origin, each face split into `detail`² quads. Face `n` uses
/// surface index `n % surfaces.len()`.
pub fn box_leaf(half_extent: Vec3, detail: u32, surfaces: Vec<u32>) -> LeafGeometry {
    let detail = detail.max(1);
    let faces = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];

    let mut vertices = BTreeMap::new();
    let mut polygons = Vec::new();
    let row = detail + 1;

    for (face, (normal, u_axis, v_axis)) in faces.into_iter().enumerate() {
        let base = face as u32 * row * row;
        for v in 0..=detail {
            for u in 0..=detail {
                let uv = Vec2::new(u as f32 / detail as f32, v as f32 / detail as f32);
                let position = (normal + u_axis * (uv.x * 2.0 - 1.0) + v_axis * (uv.y * 2.0 - 1.0)) * half_extent;
                vertices.insert(
                    (base + v * row + u) as u16,
                    SwVertex {
                        position,
                        normal,
                        uvs: vec![uv],
                    },
                );
            }
        }

        let surface = if surfaces.is_empty() {
            None
        } else {
            Some((face % surfaces.len()) as u16)
        };
        for v in 0..detail {
            for u in 0..detail {
                let corner = base + v * row + u;
                polygons.push(Polygon {
                    vertex_ids: [corner, corner + 1, corner + row + 1, corner + row]
                        .map(|id| id as u16)
                        .to_vec(),
                    pos_uv_indices: vec![0; 4],
                    neg_uv_indices: vec![],
                    pos_surface: surface,
                    neg_surface: None,
                    stippling: StipplingFlags::empty(),
                    sides: CullMode::Clockwise,
                });
            }
        }
    }

    LeafGeometry {
        vertices,
        polygons,
        surfaces,
    }
}

#[derive(Debug, Default, Clone)]
pub struct DemoReport {
    pub frames: u32,
    pub uploads: usize,
    pub failed: usize,
    pub evicted: usize,
    pub peak_memory: u64,
    pub memory_budget: u64,
    pub leaked_buffers: usize,
    pub leaked_textures: usize,
}

struct PendingRequest {
    task: JoinHandle<RequestOutcome>,
    cancel: CancellationToken,
}

/// Runs the frame loop on the calling thread, which acts as the render thread. Every frame some
/// objects enter the view (and are requested or acquired) while others leave it (and are released
/// or cancelled).
pub fn run_demo(config: &DemoConfig, settings: &ResourceSettings, runtime: &Runtime) -> Result<DemoReport, anyhow::Error> {
    let world = DemoWorld::generate(config)?;
    let objects = world.objects();
    let source: Arc<dyn DataSource> = world.source.clone();
    let (manager, mut render_thread) =
        ResourceManager::new(source, HeadlessDevice::new(), settings, runtime.handle().clone());

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let mut visible: HashSet<ObjectId> = HashSet::new();
    let mut pending: HashMap<ObjectId, PendingRequest> = HashMap::new();
    let mut enqueued: HashSet<ObjectId> = HashSet::new();
    let mut report = DemoReport {
        memory_budget: settings.memory_budget,
        ..DemoReport::default()
    };

    let started = Instant::now();
    for frame in 0..config.frames {
        if objects.is_empty() {
            break;
        }

        for _ in 0..(objects.len() / 20).max(1) {
            let id = objects[rng.random_range(0..objects.len())];
            if visible.contains(&id) || pending.contains_key(&id) || enqueued.contains(&id) {
                continue;
            }
            if manager.acquire(id).is_some() {
                visible.insert(id);
            } else {
                let cancel = CancellationToken::new();
                let task = manager.request(id, cancel.clone());
                pending.insert(id, PendingRequest { task, cancel });
            }
        }

        let leaving = visible
            .iter()
            .filter(|_| rng.random_bool(0.05))
            .copied()
            .collect::<Vec<_>>();
        for id in leaving {
            visible.remove(&id);
            manager.release(id);
        }
        for request in pending.values() {
            if rng.random_bool(0.02) {
                request.cancel.cancel();
            }
        }

        let finished = pending
            .iter()
            .filter(|(_, request)| request.task.is_finished())
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in finished {
            let Some(request) = pending.remove(&id) else {
                continue;
            };
            match runtime.block_on(request.task) {
                Ok(RequestOutcome::Enqueued) => {
                    enqueued.insert(id);
                }
                Ok(RequestOutcome::AlreadyResident) => {
                    if manager.acquire(id).is_some() {
                        visible.insert(id);
                    }
                }
                Ok(RequestOutcome::Cancelled) => trace!("Request for {id} has been cancelled"),
                Ok(RequestOutcome::Failed) => report.failed += 1,
                Err(err) => warn!("Request for {id} did not finish: {err}"),
            }
        }

        let stats = render_thread.maintain();
        for (id, outcome) in &stats.uploaded {
            let ours = enqueued.remove(id) || pending.remove(id).is_some();
            match outcome {
                UploadOutcome::Registered if ours => {
                    report.uploads += 1;
                    visible.insert(*id);
                }
                // nobody waits for it anymore, hand the reference back
                UploadOutcome::Registered => {
                    manager.release(*id);
                }
                UploadOutcome::AlreadyResident if ours && !visible.contains(id) => {
                    if manager.acquire(*id).is_some() {
                        visible.insert(*id);
                    }
                }
                UploadOutcome::AlreadyResident => {}
                UploadOutcome::Failed => report.failed += 1,
            }
        }

        report.frames += 1;
        report.evicted += stats.evicted;
        report.peak_memory = report.peak_memory.max(stats.memory_used);

        if frame % 10 == 0 {
            let cache = manager.cache_stats();
            let atlases = render_thread.atlas_stats();
            info!(
                "Frame {frame}: {} visible, {} resident ({} idle), {}/{} bytes, {} atlases with {} layers in use",
                visible.len(),
                cache.resident,
                cache.idle,
                cache.memory_used,
                cache.memory_budget,
                atlases.atlases,
                atlases.used_layers
            );
        }

        profiling::finish_frame!();
        std::thread::sleep(Duration::from_millis(1));
    }

    for (id, request) in pending.drain() {
        request.cancel.cancel();
        if let Ok(RequestOutcome::Enqueued) = runtime.block_on(request.task) {
            enqueued.insert(id);
        }
    }
    let stats = render_thread.maintain();
    for id in stats.registered() {
        manager.release(id);
    }
    for id in visible.drain() {
        manager.release(id);
    }
    render_thread.maintain();

    let preparer = manager.preparer_stats();
    info!(
        "{} frames in {:?}: {} uploads, {} failures, {} evictions, peak {} of {} bytes, {} preparations ({} cancelled)",
        report.frames,
        started.elapsed(),
        report.uploads,
        report.failed,
        report.evicted,
        report.peak_memory,
        report.memory_budget,
        preparer.started,
        preparer.cancelled
    );

    let device = render_thread.teardown();
    report.leaked_buffers = device.live_buffers();
    report.leaked_textures = device.live_textures();
    if report.leaked_buffers > 0 || report.leaked_textures > 0 {
        warn!(
            "{} buffers and {} texture arrays are still alive after teardown",
            report.leaked_buffers, report.leaked_textures
        );
    }

    Ok(report)
}
