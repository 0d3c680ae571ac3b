//! Storage bring-up: the worker subprocess, and the scheduler that feeds it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argus_config_data::{Config, TierBudget};
use argus_db::Database;
use eyre::{Result, WrapErr};
use tier_engine::proto::BudgetParams;
use tier_engine::scheduler::{TierScheduler, TierSpec};
use tier_engine::supervisor::{StorageWorker, StorageWorkerConfig};
use tracing::info;

pub struct StorageRuntime {
    worker: Arc<StorageWorker>,
    scheduler: TierScheduler,
}

impl StorageRuntime {
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.worker.shutdown();
    }
}

fn budget(budget: &TierBudget) -> BudgetParams {
    BudgetParams {
        max_bytes: budget.max_bytes as i64,
        min_bytes: budget.min_bytes as i64,
        max_age_secs: budget.max_age.map(|v| v as i64),
        min_age_secs: budget.min_age.map(|v| v as i64),
    }
}

/// Spawn the storage worker subprocess and the periodic tier scheduler.
/// Returns `None` when no tiers are configured; a failed worker spawn is
/// fatal to startup.
pub fn setup_storage(config: &Config, db: Arc<Database>) -> Result<Option<StorageRuntime>> {
    if config.storage.tiers.is_empty() {
        info!("no storage tiers configured, tier engine disabled");
        return Ok(None);
    }

    let worker = Arc::new(
        StorageWorker::spawn(StorageWorkerConfig::new(
            PathBuf::from(&config.storage.database_path),
            config.storage.workers,
            config.storage.cpulimit,
        ))
        .wrap_err("storage worker spawn failed")?,
    );

    let tiers: Vec<TierSpec> = config
        .storage
        .tiers
        .iter()
        .enumerate()
        .map(|(index, tier)| TierSpec {
            tier_id: index as i64,
            path: PathBuf::from(&tier.path),
            continuous: tier.continuous.as_ref().map(budget),
            events: tier.events.as_ref().map(budget),
            throttle_period_secs: tier.throttle_period as i64,
        })
        .collect();

    let segment_dirs: HashMap<String, PathBuf> = config
        .cameras
        .iter()
        .map(|(identifier, camera)| {
            (
                identifier.clone(),
                PathBuf::from(&camera.recorder.segments_folder).join(identifier),
            )
        })
        .collect();

    let scheduler = TierScheduler::spawn(
        worker.clone(),
        db,
        config.cameras.keys().cloned().collect(),
        segment_dirs,
        tiers,
        Duration::from_secs(config.storage.check_interval),
    );

    Ok(Some(StorageRuntime { worker, scheduler }))
}
