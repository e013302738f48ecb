use std::path::{Path, PathBuf};
use std::sync::Arc;

use pace_core::config::StoreKind;
use pace_core::{
    ConsumerNode, CoordinatedMaxRateStore, CoordinationStore, MaxRateStore, MemoryCoordinator,
    Metrics, PaceConfig, RocksDbCoordinator, StaticAssignments,
};
use tracing::info;

fn load_config() -> PaceConfig {
    let paths = ["pace.toml", "/etc/pace/pace.toml"];

    for path in &paths {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        info!(path, "loaded configuration");
                        return config;
                    }
                    Err(e) => {
                        eprintln!("error parsing {path}: {e}");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("error reading {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    info!("no config file found, using defaults");
    PaceConfig::default()
}

fn open_store(config: &PaceConfig) -> Result<Arc<dyn MaxRateStore>, Box<dyn std::error::Error>> {
    let coordinator: Arc<dyn CoordinationStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryCoordinator::new()),
        StoreKind::RocksDb => {
            let data_dir = std::env::var("PACE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| config.store.data_dir.clone());
            info!(data_dir = %data_dir.display(), "opening rocksdb coordination store");
            Arc::new(RocksDbCoordinator::open(&data_dir)?)
        }
    };
    Ok(Arc::new(CoordinatedMaxRateStore::new(
        coordinator,
        &config.node.coordination_root,
        config.negotiation.store_retries,
    )))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pace_core::telemetry::init_tracing();

    let config = load_config();
    config.validate()?;

    let store = open_store(&config)?;
    let assignments = Arc::new(StaticAssignments::from_config(&config.subscriptions));
    let metrics = Arc::new(Metrics::new());

    let node = ConsumerNode::start(&config, store, assignments, metrics)?;
    info!(
        consumer_id = node.consumer_id(),
        controllers = node.local_consumers().len(),
        "pace node running"
    );

    shutdown_signal().await;

    info!("shutting down consumer node");
    // Joining supervisor threads blocks; keep it off the async workers.
    tokio::task::spawn_blocking(move || node.shutdown()).await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to install CTRL+C handler");
    }

    info!("received shutdown signal");
}
