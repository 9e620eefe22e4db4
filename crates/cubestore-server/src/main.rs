mod config;
mod spawn;

use std::sync::Arc;
use std::time::Duration;

use config::ServerConfig;
use cubestore_world::{
    ChunkGenerator, ChunkManager, ChunkVec, FlatGenerator, Housekeeping, NoLighting,
    ResidencyProvider, StorageError, WorldStorage,
};
use spawn::SpawnArea;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match ServerConfig::load("server.toml") {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load server.toml: {e}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        "Cubestore v{} starting, world: {}",
        env!("CARGO_PKG_VERSION"),
        config.world.directory
    );
    info!(
        "Generation threads: {}, unload after {} ticks",
        config.storage.generation_threads, config.storage.unload_ticks
    );

    let generator: Arc<dyn ChunkGenerator> =
        Arc::new(FlatGenerator::new(config.world.surface_height));
    let manager = match ChunkManager::new(
        WorldStorage::new(&config.world.directory),
        generator,
        Arc::new(NoLighting),
        config.storage.clone(),
    ) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!("Failed to start chunk manager: {e}");
            std::process::exit(1);
        }
    };
    manager.set_error_hook(Arc::new(|pos: ChunkVec, e: &StorageError| {
        warn!("Chunk {pos} is unavailable: {e}");
    }));

    // Probe the spawn column before anything else touches the world.
    let probe = manager.clone();
    let spawn_height = match tokio::task::spawn_blocking(move || probe.read_height(0, 0)).await {
        Ok(Ok(Some(height))) => height,
        Ok(Ok(None)) => {
            warn!("Spawn column is empty, using the configured surface height");
            config.world.surface_height
        }
        Ok(Err(e)) => {
            error!("Failed to probe spawn height: {e}");
            config.world.surface_height
        }
        Err(e) => {
            error!("Spawn probe panicked: {e}");
            config.world.surface_height
        }
    };
    let spawn = ChunkVec::containing_block(0, spawn_height, 0);
    info!("Spawn surface at y={spawn_height} (chunk {spawn})");

    let providers: Vec<Arc<dyn ResidencyProvider>> =
        vec![Arc::new(SpawnArea::new(spawn, config.world.spawn_radius))];
    for provider in &providers {
        manager.refresh(provider.leases());
    }
    let housekeeping = match Housekeeping::start(manager.clone(), providers, &config.storage) {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to start housekeeping threads: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    // Handle Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut tick_interval = tokio::time::interval(Duration::from_millis(50));
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                manager.tick();
                ticks += 1;
                if ticks % 1200 == 0 {
                    info!("Tick {ticks}: {} region columns open", manager.regions().column_count());
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Saving world before shutdown...");
    let closing = manager.clone();
    let closed = tokio::task::spawn_blocking(move || {
        housekeeping.shutdown();
        closing.close()
    })
    .await;
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to close world cleanly: {e}"),
        Err(e) => error!("Shutdown task panicked: {e}"),
    }
    // The manager owns a runtime; drop it where blocking is allowed.
    let _ = tokio::task::spawn_blocking(move || drop(manager)).await;
    info!("Server shut down.");
}
