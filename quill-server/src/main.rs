//! quill server: wires the collaboration engine together and serves it.

mod http;
mod settings;

use std::sync::Arc;

use log::info;
use quill_collab::{
    spawn_listener, CollabServer, DocumentRegistry, DocumentStore, FanoutHub, LocalBus,
    MemoryStore, RedisBus, ReplicaId, ReplicationBus, RocksStore, SnapshotCoordinator, StoreConfig,
};

use settings::Settings;

fn open_store(settings: &Settings) -> Result<Arc<dyn DocumentStore>, Box<dyn std::error::Error>> {
    match &settings.data_dir {
        Some(dir) => Ok(Arc::new(RocksStore::open(StoreConfig::at(dir))?)),
        None => {
            info!("No data directory configured, documents are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn open_bus(settings: &Settings) -> Result<Arc<dyn ReplicationBus>, Box<dyn std::error::Error>> {
    match &settings.redis_url {
        Some(url) => Ok(Arc::new(RedisBus::connect(url).await?)),
        None => {
            info!("No Redis configured, replicating within this process only");
            Ok(Arc::new(LocalBus::default()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = Settings::from_env()?;
    let replica_id = ReplicaId::random();
    info!("Starting quill server as replica {replica_id}");

    let store = open_store(&settings)?;
    let bus = open_bus(&settings).await?;
    let registry = Arc::new(DocumentRegistry::new(replica_id, store.clone(), settings.registry.clone()));
    let snapshots = Arc::new(SnapshotCoordinator::new(
        registry.clone(),
        store.clone(),
        settings.snapshot.clone(),
    ));
    let hub = Arc::new(FanoutHub::new(registry, snapshots.clone(), store, bus.clone()));

    let listener = spawn_listener(bus, hub.clone()).await?;
    let timer = snapshots.clone().spawn();
    let server = CollabServer::new(settings.server.clone(), hub.clone());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
            }
        }
        _ = http::serve(settings.http_addr, hub) => {
            log::error!("HTTP endpoints stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    timer.abort();
    listener.abort();
    let report = snapshots.flush().await;
    info!(
        "Final snapshot: {} saved, {} failed, {} superseded",
        report.saved, report.failed, report.superseded
    );
    Ok(())
}
