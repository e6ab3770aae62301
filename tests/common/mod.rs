//! Shared helpers for the integration tests.

#![allow(dead_code)]

use lsi_correlator::acquisition::{AcquisitionMachine, MachineOptions};
use lsi_correlator::simulation::{SimulatedCorrelator, SimulatorControl};
use lsi_correlator::types::{AcquisitionConfig, AcquisitionState};
use std::sync::Arc;
use std::time::Duration;

/// Command timeout used by test machines.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(200);

/// Machine around a simulator running `time_scale` real seconds per simulated second.
pub fn simulated_machine(
    time_scale: f64,
    config: AcquisitionConfig,
) -> (Arc<AcquisitionMachine>, SimulatorControl) {
    simulated_machine_with(SimulatedCorrelator::new().with_time_scale(time_scale), config)
}

/// Machine around a preconfigured simulator.
pub fn simulated_machine_with(
    sim: SimulatedCorrelator,
    config: AcquisitionConfig,
) -> (Arc<AcquisitionMachine>, SimulatorControl) {
    let control = sim.control();
    let machine = AcquisitionMachine::new(
        Box::new(sim),
        MachineOptions {
            address: "simulated".into(),
            command_timeout: COMMAND_TIMEOUT,
            config,
            ..Default::default()
        },
    );
    (Arc::new(machine), control)
}

/// Connected machine in `Idle`.
pub async fn idle_machine(
    time_scale: f64,
    config: AcquisitionConfig,
) -> (Arc<AcquisitionMachine>, SimulatorControl) {
    let (machine, control) = simulated_machine(time_scale, config);
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
    (machine, control)
}

/// Wait until the machine publishes `state`. Returns whether it did within `limit`.
pub async fn wait_for_state(
    machine: &AcquisitionMachine,
    state: AcquisitionState,
    limit: Duration,
) -> bool {
    let mut updates = machine.subscribe();
    let reached = tokio::time::timeout(limit, async {
        loop {
            if updates.borrow_and_update().state == state {
                return;
            }
            if updates.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    reached.is_ok() && machine.state() == state
}

/// One-second windows, everything else default.
pub fn short_config() -> AcquisitionConfig {
    AcquisitionConfig {
        measurement_duration_s: 1,
        ..Default::default()
    }
}
