//! Background reconciliation loop.

use std::sync::Arc;

use store::SagaStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use transport::MessageBus;

use crate::engine::SagaOrchestrator;

/// Handle to the periodic reconciliation task.
///
/// The loop calls [`SagaOrchestrator::reconcile_once`] on the configured
/// interval until [`Reconciler::stop`] is called or the handle is dropped.
/// Missed ticks are skipped rather than bursted, so a slow sweep never
/// piles up behind itself.
pub struct Reconciler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reconciler {
    /// Spawns the reconciliation loop for an orchestrator.
    pub fn spawn<S, B>(orchestrator: Arc<SagaOrchestrator<S, B>>) -> Self
    where
        S: SagaStore + 'static,
        B: MessageBus + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = orchestrator.config().reconcile_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_ms = interval.as_millis() as u64, "reconciler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match orchestrator.reconcile_once().await {
                            Ok(examined) if examined > 0 => {
                                tracing::debug!(examined, "reconciliation sweep finished");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "reconciliation sweep failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("reconciler stopping");
                            break;
                        }
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(self) {
        // Receiver is gone only if the task already exited.
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
