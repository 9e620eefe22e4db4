//! Periodic save and residency refresh, each on its own thread.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::StorageConfig;
use crate::coords::ChunkVec;
use crate::manager::ChunkManager;
use crate::ticket::ChunkLoadTicket;

/// Source of residency leases, e.g. the chunks around connected players.
pub trait ResidencyProvider: Send + Sync {
    fn leases(&self) -> Vec<(ChunkVec, ChunkLoadTicket)>;
}

pub struct Housekeeping {
    shutdown_tx: watch::Sender<bool>,
    threads: Vec<JoinHandle<()>>,
}

impl Housekeeping {
    /// Start the `chunk-save` and `chunk-refresh` threads. An interval of
    /// zero disables the corresponding thread.
    pub fn start(
        manager: Arc<ChunkManager>,
        providers: Vec<Arc<dyn ResidencyProvider>>,
        config: &StorageConfig,
    ) -> io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut threads = Vec::new();

        if let Some(interval) = config.save_interval() {
            let manager = manager.clone();
            threads.push(spawn_periodic("chunk-save", interval, shutdown_rx.clone(), move || {
                if let Err(e) = manager.save() {
                    error!("Periodic save failed: {e}");
                }
            })?);
        }

        if let Some(interval) = config.refresh_interval() {
            threads.push(spawn_periodic("chunk-refresh", interval, shutdown_rx, move || {
                let leases: Vec<_> = providers.iter().flat_map(|p| p.leases()).collect();
                debug!("Refreshing {} residency leases", leases.len());
                manager.refresh(leases);
            })?);
        }

        info!("Started {} housekeeping threads", threads.len());
        Ok(Self {
            shutdown_tx,
            threads,
        })
    }

    /// Signal both threads and wait for them to exit.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("Housekeeping thread panicked");
            }
        }
    }
}

fn spawn_periodic(
    name: &str,
    period: Duration,
    shutdown_rx: watch::Receiver<bool>,
    mut task: impl FnMut() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let label = name.to_string();
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            runtime.block_on(run_every(period, shutdown_rx, || {
                debug!("Running {label}");
                task();
            }));
        })
}

fn run_every(
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut task: impl FnMut(),
) -> impl Future<Output = ()> {
    async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => task(),
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}
