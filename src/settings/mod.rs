use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "portalview")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Mesh and texture residency for a portal archive object viewer")]
pub struct CliArgs {
    #[arg(long, env = "PORTALVIEW_MEMORY_BUDGET_MB", default_value_t = 64)]
    pub memory_budget_mb: u64,

    #[arg(long, env = "PORTALVIEW_ATLAS_LAYERS", default_value_t = 64)]
    pub atlas_layers: u32,

    /// Defaults to the number of cores.
    #[arg(long, env = "PORTALVIEW_WORKER_THREADS")]
    pub worker_threads: Option<usize>,

    #[command(subcommand)]
    pub operation_mode: OperationMode,
}

#[derive(Subcommand, Debug)]
pub enum OperationMode {
    /// Generates a synthetic archive and simulates objects entering and leaving the view.
    Demo {
        #[arg(long, default_value_t = 4000)]
        objects: u32,
        /// Quads along each edge of a box face.
        #[arg(long, default_value_t = 8)]
        detail: u32,
        #[arg(long, default_value_t = 24)]
        shared_surfaces: u32,
        #[arg(long, default_value_t = 100)]
        composites: u32,
        #[arg(long, default_value_t = 120)]
        frames: u32,
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
    },
}

#[derive(Debug, Clone)]
pub struct ResourceSettings {
    /// Bytes of vertex and index data that may stay resident.
    pub memory_budget: u64,
    pub atlas_layers: u32,
    pub worker_threads: Option<usize>,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            memory_budget: 64 * 1024 * 1024,
            atlas_layers: 64,
            worker_threads: None,
        }
    }
}

impl From<&CliArgs> for ResourceSettings {
    fn from(args: &CliArgs) -> Self {
        Self {
            memory_budget: args.memory_budget_mb.saturating_mul(1024 * 1024),
            atlas_layers: args.atlas_layers.max(1),
            worker_threads: args.worker_threads,
        }
    }
}
