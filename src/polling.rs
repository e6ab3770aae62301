//! Background refresh task.
//!
//! While the machine is `Running`, [`PollingLoop`] calls
//! [`AcquisitionMachine::refresh`] once per period. Refreshes run one after the other in a
//! single task, and ticks that fall due while a refresh is still in flight are skipped
//! rather than queued. The loop leaves its ticker as soon as a state change away from
//! `Running` is observed and sleeps on the snapshot channel until the next start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::acquisition::{AcquisitionMachine, RefreshOutcome, Snapshot};
use crate::types::AcquisitionState;

/// Periodic refresh driver.
pub struct PollingLoop {
    machine: Arc<AcquisitionMachine>,
    period: Duration,
}

/// Handle to a spawned [`PollingLoop`].
pub struct PollingHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    refreshes: Arc<AtomicU64>,
}

impl PollingLoop {
    /// Poll `machine` every `period`.
    pub fn new(machine: Arc<AcquisitionMachine>, period: Duration) -> Self {
        Self { machine, period }
    }

    /// Spawn the loop on the current runtime.
    pub fn spawn(self) -> PollingHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let refreshes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&refreshes);
        let task = tokio::spawn(async move { self.run(shutdown_rx, counter).await });
        PollingHandle {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            refreshes,
        }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>, refreshes: Arc<AtomicU64>) {
        let mut states = self.machine.subscribe();
        loop {
            if !wait_until_running(&mut states, &mut shutdown_rx).await {
                break;
            }
            tracing::debug!(period = ?self.period, "Polling started");

            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the first refresh is one period in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    changed = states.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let state = states.borrow_and_update().state;
                        if state != AcquisitionState::Running {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        refreshes.fetch_add(1, Ordering::Relaxed);
                        match self.machine.refresh().await {
                            Ok(RefreshOutcome::AcquisitionComplete) => {
                                tracing::info!("Acquisition complete");
                            }
                            Ok(outcome) => tracing::trace!(?outcome, "Refresh"),
                            Err(err) if err.is_transport_fault() => {
                                tracing::error!(error = %err, "Refresh failed, polling suspended");
                            }
                            Err(err) => tracing::debug!(error = %err, "Refresh incomplete"),
                        }
                        if self.machine.state() != AcquisitionState::Running {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(state = %self.machine.state(), "Polling paused");
        }
    }
}

/// Block until the state is `Running`. Returns `false` on shutdown.
async fn wait_until_running(
    states: &mut watch::Receiver<Snapshot>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    loop {
        let state = states.borrow_and_update().state;
        if state == AcquisitionState::Running {
            return true;
        }
        tokio::select! {
            _ = &mut *shutdown_rx => return false,
            changed = states.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

impl PollingHandle {
    /// Number of refreshes issued so far.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Stop the loop and wait for it to finish its current refresh.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Polling task ended abnormally");
            }
        }
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::MachineOptions;
    use crate::simulation::SimulatedCorrelator;

    #[tokio::test]
    async fn idle_machine_is_never_refreshed() {
        let sim = SimulatedCorrelator::new();
        let control = sim.control();
        let machine = Arc::new(AcquisitionMachine::new(
            Box::new(sim),
            MachineOptions {
                address: "sim".into(),
                ..Default::default()
            },
        ));
        machine.connect().await.unwrap();
        let after_connect = control.history().len();

        let handle = PollingLoop::new(Arc::clone(&machine), Duration::from_millis(5)).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.refreshes(), 0);
        assert_eq!(control.history().len(), after_connect);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_returns_promptly() {
        let machine = Arc::new(AcquisitionMachine::new(
            Box::new(SimulatedCorrelator::new()),
            MachineOptions::default(),
        ));
        let handle = PollingLoop::new(machine, Duration::from_secs(60)).spawn();
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
