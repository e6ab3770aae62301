//! Integration tests for the acquisition state machine against the simulated correlator.

mod common;

use common::{idle_machine, short_config, simulated_machine, simulated_machine_with, wait_for_state};
use lsi_correlator::acquisition::{AcquisitionMachine, MachineOptions, RefreshOutcome};
use lsi_correlator::error::ErrorKind;
use lsi_correlator::simulation::{SimulatedCorrelator, SimulatedFault};
use lsi_correlator::storage::DataFileWriter;
use lsi_correlator::types::{
    AcquisitionConfig, AcquisitionState, CorrelationType, Normalization, SamplingTimeMultiT,
    SwapChannels, TransferRate,
};
use std::sync::Arc;
use std::time::Duration;

/// Refresh until the acquisition completes, collecting every other outcome.
async fn refresh_until_complete(machine: &AcquisitionMachine) -> Vec<RefreshOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        match machine.refresh().await {
            Ok(RefreshOutcome::AcquisitionComplete) => return outcomes,
            Ok(outcome) => outcomes.push(outcome),
            Err(err) if err.kind() == ErrorKind::NoDataYet => {}
            Err(err) => panic!("unexpected refresh failure: {}", err),
        }
    }
    panic!("acquisition did not complete; outcomes so far: {:?}", outcomes);
}

#[tokio::test]
async fn test_configure_is_last_write_wins() {
    let (machine, _) = idle_machine(1.0, AcquisitionConfig::default()).await;

    let first = AcquisitionConfig {
        correlation_type: CorrelationType::Cross,
        normalization: Normalization::Uncompensated,
        measurement_duration_s: 5,
        swap_channels: SwapChannels::ChB_ChA,
        sampling_time: SamplingTimeMultiT::Ns12_5,
        transfer_rate: TransferRate::Ms2000,
        overload_limit_mcps: 50,
        overload_interval_ms: 100,
        repetitions: 4,
        wait_between_s: 2.0,
        min_time_lag_ns: 100.0,
    };
    let last = AcquisitionConfig {
        measurement_duration_s: 11,
        ..AcquisitionConfig::default()
    };

    machine.configure(first).await.unwrap();
    machine
        .configure(AcquisitionConfig {
            measurement_duration_s: 7,
            ..Default::default()
        })
        .await
        .unwrap();
    machine.configure(last.clone()).await.unwrap();

    // Nothing from the earlier writes survives.
    assert_eq!(*machine.snapshot().config, last);
    assert_eq!(machine.state(), AcquisitionState::Idle);
}

#[tokio::test]
async fn test_start_outside_idle_is_state_conflict() {
    let (machine, control) = simulated_machine(0.1, short_config());

    let err = machine.start().await.unwrap_err();
    assert!(err.is_state_conflict());
    assert_eq!(err.kind(), ErrorKind::StateConflict);
    assert_eq!(machine.state(), AcquisitionState::Disconnected);

    machine.connect().await.unwrap();
    control.inject(SimulatedFault::Disconnect { request: "START" });
    assert!(machine.start().await.unwrap_err().is_transport_fault());
    assert_eq!(machine.state(), AcquisitionState::Error);

    let err = machine.start().await.unwrap_err();
    assert!(err.is_state_conflict());
    assert_eq!(machine.state(), AcquisitionState::Error);
}

#[tokio::test]
async fn test_result_exists_only_after_refresh() {
    let (machine, _) = idle_machine(1.0, short_config()).await;
    machine.start().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Running);
    assert!(machine.snapshot().result.is_none());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(machine.refresh().await.unwrap(), RefreshOutcome::Updated);

    let snapshot = machine.snapshot();
    let result = snapshot.result.expect("result after refresh");
    assert!(!result.is_empty());
    assert!(!result.complete);
    assert_eq!(result.repetition, 1);
    assert!(result.correlation.iter().all(|v| v.is_finite()));
    assert_eq!(result.trace_time.len(), result.trace_a.len());
}

#[tokio::test]
async fn test_refresh_when_not_running_is_noop() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    let before = machine.snapshot();
    let sent = control.history().len();

    assert_eq!(machine.refresh().await.unwrap(), RefreshOutcome::NotRunning);

    let after = machine.snapshot();
    assert_eq!(after.state, before.state);
    assert!(after.result.is_none());
    assert_eq!(control.history().len(), sent);
    assert_eq!(control.count("DATA?"), 0);
}

#[tokio::test]
async fn test_transport_error_requires_reset() {
    let (machine, control) = idle_machine(0.1, short_config()).await;
    machine.start().await.unwrap();
    control.inject(SimulatedFault::Disconnect { request: "DATA?" });

    let err = machine.refresh().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(machine.state(), AcquisitionState::Error);

    assert!(machine.refresh().await.is_err());
    assert!(machine.start().await.is_err());
    assert!(machine.configure(short_config()).await.is_err());
    assert_eq!(machine.state(), AcquisitionState::Error);

    machine.reset().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Disconnected);
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
    assert!(machine.snapshot().last_error.is_none());
}

#[tokio::test]
async fn test_concurrent_configure_and_start_never_tear_config() {
    for _ in 0..10 {
        let (machine, _) = idle_machine(1.0, AcquisitionConfig::default()).await;
        let requested = AcquisitionConfig {
            measurement_duration_s: 42,
            repetitions: 3,
            ..Default::default()
        };

        let (configured, started) =
            tokio::join!(machine.configure(requested.clone()), machine.start());

        assert!(started.is_ok());
        assert_eq!(machine.state(), AcquisitionState::Running);
        let config = machine.snapshot().config;
        match configured {
            Ok(()) => assert_eq!(*config, requested),
            Err(err) => {
                assert!(err.is_state_conflict());
                assert_eq!(err.kind(), ErrorKind::DeviceBusy);
                assert_eq!(*config, AcquisitionConfig::default());
            }
        }
    }
}

#[tokio::test]
async fn test_concurrent_starts_exactly_one_wins() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;

    let (a, b) = tokio::join!(machine.start(), machine.start());

    assert!(a.is_ok() ^ b.is_ok(), "exactly one start must succeed");
    let loser = a.err().or(b.err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::DeviceBusy);
    assert_eq!(control.count("START"), 1);
}

#[tokio::test]
async fn test_measurement_scenario() {
    let (machine, _) = idle_machine(1.0, AcquisitionConfig::default()).await;

    machine.configure(short_config()).await.unwrap();
    machine.start().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Running);

    tokio::time::sleep(Duration::from_millis(250)).await;
    machine.refresh().await.unwrap();
    let result = machine.snapshot().result.unwrap();
    assert!(result.pairs().count() > 0);

    machine.stop().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);

    machine
        .configure(AcquisitionConfig {
            measurement_duration_s: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(machine.snapshot().config.measurement_duration_s, 2);
}

#[tokio::test]
async fn test_start_while_running_is_busy() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    machine.start().await.unwrap();

    let err = machine.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    assert_eq!(machine.state(), AcquisitionState::Running);
    assert_eq!(control.count("START"), 1);
}

#[tokio::test]
async fn test_timeout_during_refresh_then_recover() {
    let (machine, control) = idle_machine(0.1, short_config()).await;
    machine.start().await.unwrap();
    control.inject(SimulatedFault::Timeout { request: "STAT?" });

    let err = machine.refresh().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(machine.state(), AcquisitionState::Error);
    let record = machine.snapshot().last_error.unwrap();
    assert_eq!(record.kind, ErrorKind::Timeout);
    assert!(record.message.contains("STAT?"));

    machine.reset().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Disconnected);
    // The record survives reset so operators can still see what happened.
    assert!(machine.snapshot().last_error.is_some());

    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
}

#[tokio::test]
async fn test_config_rejection_keeps_state_and_config() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    control.inject(SimulatedFault::RejectConfig(
        "SAMPLING TIME NOT AVAILABLE IN CROSS MODE".into(),
    ));

    let err = machine
        .configure_with(|c| c.correlation_type = CorrelationType::Cross)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigRejected);
    assert!(err
        .to_string()
        .ends_with("SAMPLING TIME NOT AVAILABLE IN CROSS MODE"));
    assert_eq!(machine.state(), AcquisitionState::Idle);
    assert_eq!(machine.snapshot().config.correlation_type, CorrelationType::Auto);
    assert_eq!(
        machine.snapshot().last_error.unwrap().kind,
        ErrorKind::ConfigRejected
    );

    // Distinguishable from a transport fault, and the next success clears the record.
    assert!(!err.is_transport_fault());
    machine
        .configure_with(|c| c.correlation_type = CorrelationType::Cross)
        .await
        .unwrap();
    assert!(machine.snapshot().last_error.is_none());
}

#[tokio::test]
async fn test_device_range_check_surfaces_verbatim() {
    let (machine, _) = idle_machine(1.0, AcquisitionConfig::default()).await;
    let err = machine
        .configure_with(|c| c.measurement_duration_s = 99_999)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigRejected);
    assert!(err.to_string().contains("MEASUREMENT DURATION 99999 OUT OF RANGE"));
    assert_eq!(machine.snapshot().config.measurement_duration_s, 300);
}

#[tokio::test]
async fn test_no_data_yet_keeps_running() {
    let (machine, _) = idle_machine(1.0, AcquisitionConfig::default()).await;
    machine.start().await.unwrap();

    let err = machine.refresh().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDataYet);
    assert_eq!(machine.state(), AcquisitionState::Running);
    assert!(machine.snapshot().result.is_none());
    // Waiting for the first transfer is normal and leaves nothing in the error record.
    assert!(machine.snapshot().last_error.is_none());
    assert!(machine.refresh().await.is_err());
    assert!(machine.snapshot().last_error.is_none());
}

#[tokio::test]
async fn test_stop_while_starting_cancels_start() {
    let sim = SimulatedCorrelator::new().with_latency(Duration::from_millis(60));
    let (machine, control) = simulated_machine_with(sim, AcquisitionConfig::default());
    machine.connect().await.unwrap();

    let starter = {
        let machine = Arc::clone(&machine);
        tokio::spawn(async move { machine.start().await })
    };
    assert!(wait_for_state(&machine, AcquisitionState::Starting, Duration::from_secs(1)).await);

    machine.stop().await.unwrap();
    let started = starter.await.unwrap();

    assert_eq!(started.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(machine.state(), AcquisitionState::Idle);
    assert_eq!(control.count("STOP"), 1);
}

#[tokio::test]
async fn test_stop_from_idle_is_rejected() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    let err = machine.stop().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
    assert_eq!(control.count("STOP"), 0);
}

#[tokio::test]
async fn test_repetitions_save_each_window() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedCorrelator::new().with_time_scale(0.01);
    let machine = AcquisitionMachine::new(
        Box::new(sim),
        MachineOptions {
            address: "simulated".into(),
            command_timeout: common::COMMAND_TIMEOUT,
            config: AcquisitionConfig {
                repetitions: 2,
                ..short_config()
            },
            storage: Some(DataFileWriter::new(
                dir.path().join("user"),
                dir.path().join("archive"),
                "LSICORR",
            )),
            ..Default::default()
        },
    );
    machine.connect().await.unwrap();
    machine.update_metadata(|m| m.experiment_name = "latex beads".into());
    machine.start().await.unwrap();

    let outcomes = refresh_until_complete(&machine).await;

    assert!(outcomes.contains(&RefreshOutcome::RepetitionComplete(1)));
    let snapshot = machine.snapshot();
    assert_eq!(snapshot.state, AcquisitionState::Idle);
    assert_eq!(snapshot.current_repetition, 2);
    let result = snapshot.result.unwrap();
    assert!(result.complete);
    assert_eq!(result.repetition, 2);

    let user_files: Vec<_> = std::fs::read_dir(dir.path().join("user"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(user_files.len(), 2);
    assert!(user_files.iter().all(|f| f.starts_with("latex_beads_")));
    assert_eq!(std::fs::read_dir(dir.path().join("archive")).unwrap().count(), 2);

    let output = snapshot.output_file.unwrap();
    assert!(output.to_string_lossy().ends_with("_2.dat"));
}

#[tokio::test]
async fn test_wait_between_repetitions() {
    let config = AcquisitionConfig {
        repetitions: 2,
        wait_between_s: 0.2,
        ..short_config()
    };
    let (machine, control) = idle_machine(0.01, config).await;
    machine.start().await.unwrap();

    let mut completed_first = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if let Ok(RefreshOutcome::RepetitionComplete(1)) = machine.refresh().await {
            completed_first = true;
            break;
        }
    }
    assert!(completed_first);
    assert_eq!(machine.refresh().await.unwrap(), RefreshOutcome::Waiting);
    assert_eq!(control.count("START"), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        machine.refresh().await.unwrap(),
        RefreshOutcome::RepetitionStarted(2)
    );
    assert_eq!(machine.snapshot().current_repetition, 2);
    assert_eq!(control.count("START"), 2);
}

#[tokio::test]
async fn test_disconnect_from_error_releases_handle() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    control.inject(SimulatedFault::Disconnect { request: "CONF" });
    assert!(machine.configure(short_config()).await.is_err());
    assert_eq!(machine.state(), AcquisitionState::Error);

    machine.disconnect().await;
    assert_eq!(machine.state(), AcquisitionState::Disconnected);
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
}

#[tokio::test]
async fn test_connect_failure_moves_to_error() {
    let (machine, control) = simulated_machine(1.0, AcquisitionConfig::default());
    control.set_unreachable(true);

    let err = machine.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert_eq!(machine.state(), AcquisitionState::Error);

    control.set_unreachable(false);
    machine.reset().await.unwrap();
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
}

#[tokio::test]
async fn test_reconnect_stops_window_left_running() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    machine.start().await.unwrap();
    control.inject(SimulatedFault::Disconnect { request: "STAT?" });
    assert!(machine.refresh().await.unwrap_err().is_transport_fault());
    assert_eq!(machine.state(), AcquisitionState::Error);

    // The device kept measuring after the link dropped.
    machine.reset().await.unwrap();
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
    assert_eq!(control.count("STOP"), 1);
    assert!(!machine.snapshot().taking_data);

    machine.start().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Running);
    assert_eq!(control.count("START"), 2);
}

#[tokio::test]
async fn test_reconnect_to_idle_device_sends_no_stop() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    control.inject(SimulatedFault::Disconnect { request: "CONF" });
    assert!(machine.configure(short_config()).await.is_err());

    machine.reset().await.unwrap();
    machine.connect().await.unwrap();
    assert_eq!(machine.state(), AcquisitionState::Idle);
    assert_eq!(control.count("STOP"), 0);
}

#[tokio::test]
async fn test_fault_during_reconnect_check_moves_to_error() {
    let (machine, control) = simulated_machine(1.0, AcquisitionConfig::default());
    control.inject(SimulatedFault::Timeout { request: "STAT?" });

    let err = machine.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(machine.state(), AcquisitionState::Error);
    assert!(machine.snapshot().identity.is_none());
}

#[tokio::test]
async fn test_refused_calls_keep_recorded_fault() {
    let (machine, control) = idle_machine(0.1, short_config()).await;
    machine.start().await.unwrap();
    control.inject(SimulatedFault::Timeout { request: "STAT?" });
    assert_eq!(
        machine.refresh().await.unwrap_err().kind(),
        ErrorKind::Timeout
    );

    assert!(machine.start().await.unwrap_err().is_state_conflict());
    assert!(machine.stop().await.unwrap_err().is_state_conflict());
    assert!(machine.refresh().await.unwrap_err().is_state_conflict());
    assert!(machine
        .configure(short_config())
        .await
        .unwrap_err()
        .is_state_conflict());

    let record = machine.snapshot().last_error.unwrap();
    assert_eq!(record.kind, ErrorKind::Timeout);
    assert!(record.message.contains("STAT?"));
}

#[tokio::test]
async fn test_stop_during_start_timeout_keeps_timeout_record() {
    let (machine, control) = idle_machine(1.0, AcquisitionConfig::default()).await;
    control.inject(SimulatedFault::Timeout { request: "START" });

    let starter = {
        let machine = Arc::clone(&machine);
        tokio::spawn(async move { machine.start().await })
    };
    assert!(wait_for_state(&machine, AcquisitionState::Starting, Duration::from_secs(1)).await);

    let stopped = machine.stop().await;
    let started = starter.await.unwrap();
    assert_eq!(started.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(stopped.unwrap_err().is_state_conflict());
    assert_eq!(machine.state(), AcquisitionState::Error);
    assert_eq!(
        machine.snapshot().last_error.unwrap().kind,
        ErrorKind::Timeout
    );
}

#[tokio::test]
async fn test_busy_next_repetition_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedCorrelator::new().with_time_scale(0.01);
    let control = sim.control();
    let machine = AcquisitionMachine::new(
        Box::new(sim),
        MachineOptions {
            address: "simulated".into(),
            command_timeout: common::COMMAND_TIMEOUT,
            config: AcquisitionConfig {
                repetitions: 2,
                ..short_config()
            },
            storage: Some(DataFileWriter::new(
                dir.path().join("user"),
                dir.path().join("archive"),
                "LSICORR",
            )),
            ..Default::default()
        },
    );
    machine.connect().await.unwrap();
    machine.start().await.unwrap();
    control.inject(SimulatedFault::Busy);

    let outcomes = refresh_until_complete(&machine).await;

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == RefreshOutcome::RepetitionComplete(1))
            .count(),
        1
    );
    assert!(outcomes.contains(&RefreshOutcome::RepetitionStarted(2)));
    assert_eq!(control.count("START"), 3);

    let snapshot = machine.snapshot();
    assert_eq!(snapshot.current_repetition, 2);
    assert_eq!(snapshot.result.unwrap().repetition, 2);
    assert_eq!(std::fs::read_dir(dir.path().join("user")).unwrap().count(), 2);
}
