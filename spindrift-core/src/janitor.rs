//! Periodic disk-sweep janitor.
//!
//! Consumes only the registry and the coordinator's cleanup entry point:
//! every sweep it collects streams idle beyond the age threshold — the
//! registry itself exempts anything still downloading or converting — and
//! removes them entirely.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::JanitorConfig;
use crate::coordinator::StreamCoordinator;
use crate::registry::StreamRegistry;

/// Sweeps idle streams on a fixed interval.
pub struct Janitor {
    registry: Arc<StreamRegistry>,
    coordinator: StreamCoordinator,
    config: JanitorConfig,
}

impl Janitor {
    /// Creates a janitor over the shared registry and coordinator.
    pub fn new(
        registry: Arc<StreamRegistry>,
        coordinator: StreamCoordinator,
        config: JanitorConfig,
    ) -> Self {
        Self {
            registry,
            coordinator,
            config,
        }
    }

    /// Runs one sweep, returning how many streams were removed.
    pub async fn sweep(&self) -> usize {
        let sweepable = self.registry.sweepable_older_than(self.config.max_age).await;
        let count = sweepable.len();

        for stream in sweepable {
            info!(
                "Janitor: sweeping stream {} (status {}, idle past {:?})",
                stream.id, stream.status, self.config.max_age
            );
            self.coordinator.cleanup(stream.id).await;
        }

        if count > 0 {
            debug!("Janitor: removed {} streams", count);
        }
        count
    }

    /// Spawns the sweep loop.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh boot
            // does not sweep before anything has aged.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
