//! End-to-end automatic test scenarios on the simulated rig.

mod common;

use common::{sim_rig, sim_rig_with, wait_until, SimRig};
use friction_rig::config::RigConfig;
use friction_rig::events::{RigEvent, TestOutcome};
use friction_rig::motion::{JogDirection, OperatingMode};
use friction_rig::test_run::TestParameters;
use friction_rig::RigError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn scenario() -> TestParameters {
    TestParameters::new(0.0, 100.0, 50.0, 10.0).with_label("scenario")
}

/// Drain events until the test completes.
async fn completion(events: &mut broadcast::Receiver<RigEvent>) -> (String, TestOutcome) {
    loop {
        match events.recv().await.unwrap() {
            RigEvent::TestCompleted { name, outcome } => return (name, outcome),
            _ => continue,
        }
    }
}

fn spawn_test(
    sim: &SimRig,
    params: TestParameters,
) -> tokio::task::JoinHandle<friction_rig::RigResult<friction_rig::test_run::TestReport>> {
    let orchestrator = Arc::clone(sim.rig.orchestrator());
    tokio::spawn(async move { orchestrator.start_automatic_test(params).await })
}

// =============================================================================
// Automatic test
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_successful_run_persists_run_and_samples() {
    let sim = sim_rig().await;
    let mut events = sim.rig.events().subscribe();

    let report = sim
        .rig
        .orchestrator()
        .start_automatic_test(scenario())
        .await
        .unwrap();

    let run = report.run.clone().expect("run saved");
    assert_eq!(report.run_id, Some(1));
    assert!(report.samples_saved);
    assert_eq!(run.distance, 100.0);
    assert!(run.name.starts_with("scenario_"));
    assert!(run.sample_count > 100, "got {} samples", run.sample_count);
    // triangular profile: 2 * sqrt(100 / 10) s
    assert!(run.duration_secs > 5.5 && run.duration_secs < 7.0);

    let samples = sim.store.samples(1).expect("samples saved");
    assert_eq!(samples.len(), run.sample_count);
    assert!(samples
        .windows(2)
        .all(|pair| pair[1].position > pair[0].position + 0.01));
    assert!(samples.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
    assert!(samples.last().map_or(false, |s| s.position > 99.0));

    assert_eq!(sim.rig.controller().mode(), OperatingMode::Automatic);
    assert!(!sim.rig.orchestrator().is_test_in_progress());
    assert_eq!(sim.rig.acquisition().buffered(), 0);
    assert!(sim.port.output(2));

    match events.recv().await.unwrap() {
        RigEvent::TestStarted { name } => assert_eq!(name, run.name),
        other => panic!("unexpected first event {other:?}"),
    }
    let (name, outcome) = completion(&mut events).await;
    assert_eq!(name, run.name);
    assert_eq!(
        outcome,
        TestOutcome::Completed {
            run_id: Some(1),
            sample_count: run.sample_count
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_reverse_run_keeps_signed_distance() {
    let sim = sim_rig().await;
    let params = TestParameters::new(100.0, 0.0, 50.0, 10.0).with_label("reverse");

    let report = sim
        .rig
        .orchestrator()
        .start_automatic_test(params)
        .await
        .unwrap();

    let run = report.run.expect("run saved");
    assert_eq!(run.distance, -100.0);
    let samples = sim.store.samples(1).expect("samples saved");
    assert!(samples.windows(2).all(|pair| pair[1].position < pair[0].position));
}

#[tokio::test(start_paused = true)]
async fn test_estop_mid_run_cancels_without_persisting() {
    let sim = sim_rig().await;
    let mut events = sim.rig.events().subscribe();
    let test = spawn_test(&sim, scenario());

    let controller = Arc::clone(sim.rig.controller());
    wait_until(Duration::from_secs(10), || {
        let controller = Arc::clone(&controller);
        async move { controller.last_position() >= 40.0 }
    })
    .await;
    sim.port.press_estop();

    let result = test.await.unwrap();
    assert!(matches!(result, Err(RigError::OperationCancelled)));
    assert!(sim.store.runs().is_empty());
    assert_eq!(sim.rig.orchestrator().tests().active_count(), 0);
    assert_eq!(controller.mode(), OperatingMode::EStopped);
    assert_eq!(sim.rig.acquisition().buffered(), 0);

    let (_, outcome) = completion(&mut events).await;
    assert_eq!(outcome, TestOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_second_test_is_refused_while_running() {
    let sim = sim_rig().await;
    let first = spawn_test(&sim, scenario());

    let orchestrator = Arc::clone(sim.rig.orchestrator());
    wait_until(Duration::from_secs(1), || {
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.is_test_in_progress() }
    })
    .await;

    let refused = orchestrator.start_automatic_test(scenario()).await;
    assert!(matches!(refused, Err(RigError::TestInProgress)));
    let refused = orchestrator.speed_test(scenario(), 1).await;
    assert!(matches!(refused, Err(RigError::TestInProgress)));

    first.await.unwrap().unwrap();
    assert_eq!(sim.store.runs().len(), 1);
    assert!(!orchestrator.is_test_in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_manual_mode_refuses_test_without_side_effects() {
    let sim = sim_rig().await;
    let mut events = sim.rig.events().subscribe();
    sim.rig
        .controller()
        .start_jog(JogDirection::Positive)
        .await
        .unwrap();

    let refused = sim
        .rig
        .orchestrator()
        .start_automatic_test(scenario())
        .await;
    assert!(matches!(
        refused,
        Err(RigError::ModeConflict {
            requested: OperatingMode::Automatic,
            active: OperatingMode::Jogging
        })
    ));
    assert!(events.try_recv().is_err());
    assert_eq!(sim.rig.orchestrator().tests().active_count(), 0);
    assert_eq!(sim.rig.controller().mode(), OperatingMode::Jogging);
}

#[tokio::test(start_paused = true)]
async fn test_sample_save_failure_keeps_header() {
    let sim = sim_rig().await;
    sim.store.fail_samples(true);

    let report = sim
        .rig
        .orchestrator()
        .start_automatic_test(TestParameters::new(0.0, 10.0, 50.0, 100.0))
        .await
        .unwrap();
    assert!(!report.samples_saved);
    assert_eq!(report.run_id, Some(1));
    assert_eq!(sim.store.runs().len(), 1);
    assert!(sim.store.samples(1).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_header_save_failure_fails_the_test() {
    let sim = sim_rig().await;
    let mut events = sim.rig.events().subscribe();
    sim.store.fail_runs(true);

    let err = sim
        .rig
        .orchestrator()
        .start_automatic_test(TestParameters::new(0.0, 10.0, 50.0, 100.0))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Persistence(_)));
    assert!(!sim.rig.orchestrator().is_test_in_progress());

    let (_, outcome) = completion(&mut events).await;
    assert!(matches!(outcome, TestOutcome::Failed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_stop_test_cancels_and_halts() {
    let sim = sim_rig().await;
    let test = spawn_test(&sim, scenario());

    let controller = Arc::clone(sim.rig.controller());
    wait_until(Duration::from_secs(10), || {
        let controller = Arc::clone(&controller);
        async move { controller.last_position() >= 10.0 }
    })
    .await;
    sim.rig.orchestrator().stop_test().await.unwrap();

    assert!(test.await.unwrap().unwrap_err().is_cancellation());
    assert!(!sim.port.is_moving());
    assert_eq!(controller.mode(), OperatingMode::Automatic);
    assert_eq!(sim.rig.acquisition().buffered(), 0);
    assert!(sim.store.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_test_still_tears_down() {
    let sim = sim_rig().await;
    let mut events = sim.rig.events().subscribe();
    let orchestrator = sim.rig.orchestrator();

    let result = orchestrator
        .run_until_interrupted(
            orchestrator.start_automatic_test(scenario()),
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await;

    assert!(result.unwrap_err().is_cancellation());
    assert!(!sim.port.is_moving());
    assert!(!orchestrator.is_test_in_progress());
    assert_eq!(sim.rig.acquisition().buffered(), 0);
    assert!(sim.store.runs().is_empty());

    let (_, outcome) = completion(&mut events).await;
    assert_eq!(outcome, TestOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_uninterrupted_test_runs_to_completion() {
    let sim = sim_rig().await;
    let orchestrator = sim.rig.orchestrator();

    let report = orchestrator
        .run_until_interrupted(
            orchestrator.start_automatic_test(scenario()),
            std::future::pending(),
        )
        .await
        .unwrap();
    assert_eq!(report.run_id, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_run_without_gated_samples_persists_nothing() {
    let sim = sim_rig().await;
    // start and end coincide: no displacement, nothing passes the gate
    let report = sim
        .rig
        .orchestrator()
        .start_automatic_test(TestParameters::new(0.0, 0.0, 50.0, 10.0))
        .await
        .unwrap();
    assert!(report.run.is_none());
    assert!(sim.store.runs().is_empty());
}

// =============================================================================
// Speed test and reset to origin
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_speed_test_runs_all_cycles() {
    let sim = sim_rig().await;
    let cycles = sim
        .rig
        .orchestrator()
        .speed_test(TestParameters::new(0.0, 10.0, 50.0, 100.0), 3)
        .await
        .unwrap();

    assert_eq!(cycles, 3);
    assert_eq!(sim.rig.controller().get_current_position().await, 0.0);
    assert!(sim.store.runs().is_empty());
    assert!(!sim.rig.orchestrator().is_test_in_progress());
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_origin_clears_alarm_first() {
    let sim = sim_rig().await;
    let controller = sim.rig.controller();
    controller
        .move_to(30.0, 50.0, 100.0, &CancellationToken::new())
        .await
        .unwrap();
    sim.port.raise_alarm();
    controller.axis_status().await.unwrap();
    assert_eq!(controller.mode(), OperatingMode::Alarm);

    sim.rig.orchestrator().reset_to_origin().await.unwrap();
    assert_eq!(controller.mode(), OperatingMode::Automatic);
    assert_eq!(controller.get_current_position().await, 0.0);
    assert!(sim.port.output(2));
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_origin_is_bounded() {
    let mut config = RigConfig::default();
    config.motion.reset_timeout_secs = 1;
    config.axis.home_return_speed = 1.0;
    config.axis.home_return_acceleration = 1.0;
    let sim = sim_rig_with(config).await;
    let controller = sim.rig.controller();
    controller
        .move_to(30.0, 50.0, 100.0, &CancellationToken::new())
        .await
        .unwrap();

    let err = sim.rig.orchestrator().reset_to_origin().await.unwrap_err();
    assert!(matches!(err, RigError::Timeout(_)));
    assert!(!sim.port.is_moving());
    // stopped signal: red lamp
    assert!(sim.port.output(0));
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_origin_is_refused_during_a_test() {
    let sim = sim_rig().await;
    let test = spawn_test(&sim, scenario());

    let controller = Arc::clone(sim.rig.controller());
    wait_until(Duration::from_secs(10), || {
        let controller = Arc::clone(&controller);
        async move { controller.last_position() >= 30.0 }
    })
    .await;

    let refused = sim.rig.orchestrator().reset_to_origin().await;
    assert!(matches!(refused, Err(RigError::TestInProgress)));

    let report = test.await.unwrap().unwrap();
    assert_eq!(report.run.expect("run saved").distance, 100.0);
    assert_eq!(sim.store.runs().len(), 1);
    assert!(!sim.rig.orchestrator().is_test_in_progress());

    sim.rig.orchestrator().reset_to_origin().await.unwrap();
    assert_eq!(controller.get_current_position().await, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_origin_is_refused_during_a_move() {
    let sim = sim_rig().await;
    let controller = Arc::clone(sim.rig.controller());
    let mover = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .move_to(50.0, 10.0, 10.0, &CancellationToken::new())
                .await
        })
    };
    wait_until(Duration::from_secs(1), || {
        let controller = Arc::clone(&controller);
        async move { controller.is_move_active() }
    })
    .await;

    let refused = sim.rig.orchestrator().reset_to_origin().await;
    assert!(matches!(refused, Err(RigError::InvalidCommand(_))));
    assert!(!sim.rig.orchestrator().is_test_in_progress());

    mover.await.unwrap().unwrap();
    assert_eq!(controller.get_current_position().await, 50.0);
}
