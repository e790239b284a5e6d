//! Periodic quota cycle reset.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::quota::AdmissionGate;

/// Calls [`AdmissionGate::reset_cycle`] once per interval until shut down.
///
/// The first reset happens one full interval after the scheduler starts. A
/// failed reset is logged and retried on the next tick.
pub struct ResetScheduler<G: AdmissionGate + 'static> {
    gate: Arc<G>,
    interval: Duration,
}

impl<G: AdmissionGate + 'static> ResetScheduler<G> {
    /// Create a scheduler for the given gate.
    pub fn new(gate: Arc<G>, interval: Duration) -> Self {
        Self { gate, interval }
    }

    /// Run the scheduler on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` changes or its sender is dropped.
    ///
    /// Returns the number of successful resets.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Reset scheduler started");

        let mut cycles = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.gate.reset_cycle().await {
                        Ok(()) => {
                            cycles += 1;
                            info!(cycle = cycles, "Cycle was reset");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reset quota cycle");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(cycles = cycles, "Reset scheduler stopping");
                    break;
                }
            }
        }

        cycles
    }
}
