use clap::Parser;
use log::info;
use portalview::demos::{DemoConfig, run_demo};
use portalview::settings::{CliArgs, OperationMode, ResourceSettings};

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let settings = ResourceSettings::from(&args);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("portalview-worker");
    if let Some(worker_threads) = settings.worker_threads {
        builder.worker_threads(worker_threads.max(1));
    }
    let runtime = builder.build()?;

    match args.operation_mode {
        OperationMode::Demo {
            objects,
            detail,
            shared_surfaces,
            composites,
            frames,
            seed,
        } => {
            let config = DemoConfig {
                objects,
                detail,
                shared_surfaces,
                composites,
                frames,
                seed,
            };
            let report = run_demo(&config, &settings, &runtime)?;
            info!("{report:?}");
        }
    }

    Ok(())
}
