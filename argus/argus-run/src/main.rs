use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use tracing::{error, info, warn};

use argus::lifecycle::{teardown_all, ComponentRegistry, SetupManager};
use argus::registry::{DomainRef, DomainSetup};
use argus::Argus;
use argus_config_data::{parse_config_file, Config};
use argus_db::Database;
use argus_types::Domain;

mod components;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "/config/argus.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Storage tier worker subprocess; spawned by the main process, not
    /// meant to be invoked by hand.
    #[command(hide = true)]
    StorageWorker {
        #[arg(long)]
        database: PathBuf,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long)]
        cpulimit: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::StorageWorker {
            database,
            workers,
            cpulimit,
        }) => {
            env_tracing_logger::init_for_subprocess()
                .map_err(|e| eyre::eyre!("could not initialize logging: {e}"))?;
            tier_engine::subprocess::run_worker(&database, workers, cpulimit)
        }
        None => run(&cli.config),
    }
}

fn run(config_path: &Path) -> Result<()> {
    let _log_guard = env_tracing_logger::init();
    info!("-------------------------------------------");
    info!("argus {} initializing", env!("CARGO_PKG_VERSION"));

    let config = parse_config_file(config_path).wrap_err("configuration load failed")?;
    let db = Arc::new(
        Database::open(Path::new(&config.storage.database_path))
            .wrap_err("database open failed")?,
    );

    let argus = Argus::new();

    // Storage worker subprocess and tier scheduler. A failed initial spawn
    // aborts startup.
    let storage = components::setup_storage(&config, db.clone())?;

    let mut registry = ComponentRegistry::new();
    register_components(&mut registry, &config, db);
    SetupManager::default().run(&argus, registry);

    // Process-wide termination handling; inability to install it aborts
    // startup.
    let (signal_tx, signal_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .wrap_err("could not install signal handler")?;

    info!("initialization complete");
    let _ = signal_rx.recv();
    info!("kill received, shutting down");

    teardown_all(&argus);
    if let Some(storage) = storage {
        storage.shutdown();
    }
    let clean = argus.stop_core();
    if !clean {
        error!("shutdown was not clean");
        std::process::exit(1);
    }
    info!("exiting");
    Ok(())
}

/// Explicit component registry: every component registers its domains here
/// at program initialization.
fn register_components(registry: &mut ComponentRegistry, config: &Config, db: Arc<Database>) {
    let cameras = config.cameras.clone();
    let camera_db = db.clone();
    registry.register("camera_ingest", move |argus: &Arc<Argus>| {
        for (identifier, camera_config) in cameras {
            let db = camera_db.clone();
            argus.registry.register(DomainSetup {
                component: "camera_ingest".to_string(),
                domain: Domain::Camera,
                identifier: identifier.clone(),
                setup: Arc::new(move |argus: &Arc<Argus>| {
                    camera_ingest::setup_camera(
                        argus,
                        db.clone(),
                        &identifier,
                        camera_config.clone(),
                    )
                }),
                require: vec![],
                optional: vec![],
            });
        }
        Ok(())
    });

    // Detector components (motion_detector / object_detector sections) bind
    // concrete algorithm implementations to the scanner runtimes in
    // argus-nvr; they register through this same registry. Without one
    // linked in, configured scanner sections are inert.
    if config.motion_detector.is_some() || config.object_detector.is_some() {
        warn!(
            "scanner sections configured; a detector component must register \
             their implementations for scanning to run"
        );
    }

    if let Some(nvr) = &config.nvr {
        let cameras = nvr.cameras.clone();
        registry.register("nvr", move |argus: &Arc<Argus>| {
            for identifier in cameras {
                argus.registry.register(DomainSetup {
                    component: "nvr".to_string(),
                    domain: Domain::Nvr,
                    identifier: identifier.clone(),
                    setup: {
                        let identifier = identifier.clone();
                        Arc::new(move |argus: &Arc<Argus>| argus_nvr::setup_nvr(argus, &identifier))
                    },
                    require: vec![DomainRef::new(Domain::Camera, identifier.clone())],
                    optional: vec![
                        DomainRef::new(Domain::MotionDetector, identifier.clone()),
                        DomainRef::new(Domain::ObjectDetector, identifier),
                    ],
                });
            }
            Ok(())
        });
    }
}
