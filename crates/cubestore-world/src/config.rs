use std::time::Duration;

use serde::Deserialize;

/// Tuning for the chunk manager and its housekeeping threads.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Upper bound on concurrently running generations.
    #[serde(default = "default_generation_threads")]
    pub generation_threads: usize,
    /// Ticks a chunk stays resident without a lease.
    #[serde(default = "default_unload_ticks")]
    pub unload_ticks: u64,
    /// Periodic save interval in seconds. 0 = disabled.
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
    /// Residency refresh interval in seconds. 0 = disabled.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Write freshly generated chunks on unload even if nobody changed them.
    #[serde(default = "default_persist_generated")]
    pub persist_generated: bool,
}

fn default_generation_threads() -> usize {
    8
}

fn default_unload_ticks() -> u64 {
    100
}

fn default_save_interval() -> u64 {
    300
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    15
}

fn default_persist_generated() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            generation_threads: default_generation_threads(),
            unload_ticks: default_unload_ticks(),
            save_interval_secs: default_save_interval(),
            refresh_interval_secs: default_refresh_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            persist_generated: default_persist_generated(),
        }
    }
}

impl StorageConfig {
    pub fn save_interval(&self) -> Option<Duration> {
        (self.save_interval_secs > 0).then(|| Duration::from_secs(self.save_interval_secs))
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
