// Periodic driver for the settlement reconciler

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::settlement::Reconciler;

/// Runs the reconciler on a fixed interval. Ticks never overlap: a slow
/// pass simply delays the next one.
pub struct SettlementScheduler {
    reconciler: Arc<Reconciler>,
    tick_interval: Duration,
}

impl SettlementScheduler {
    pub fn new(reconciler: Arc<Reconciler>, tick_interval: Duration) -> Self {
        Self {
            reconciler,
            tick_interval,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Settlement scheduler started, tick interval {}s",
                self.tick_interval.as_secs()
            );

            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                match self.reconciler.run_tick().await {
                    Ok(summary) => {
                        if summary.evaluated + summary.skipped + summary.failed > 0 {
                            info!(
                                "Settlement tick: {} evaluated, {} skipped, {} failed, {} deferred",
                                summary.evaluated,
                                summary.skipped,
                                summary.failed,
                                summary.deferred
                            );
                        }
                    }
                    Err(e) => {
                        // A failed pass is retried on the next tick from
                        // persisted state
                        error!("Settlement tick failed: {}", e);
                    }
                }
            }
        })
    }
}
