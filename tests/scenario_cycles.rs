//! Built-in scenarios run against the simulated device on a paused clock.

mod common;

use common::{builtin, config, device, run_control_config, BASE};
use daq_verify::counters::CounterId;
use daq_verify::error::ErrorKind;
use daq_verify::scenario::{ScenarioRunner, ScenarioStatus, Step, SweepAxis};
use std::time::Duration;
use tracing_test::traced_test;

#[tokio::test(start_paused = true)]
async fn start_stop_passes_all_cycles() {
    let config = config();
    let device = device(&config);

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("start_stop"), BASE)
        .await;

    assert_eq!(outcome.status, ScenarioStatus::Success, "{:?}", outcome.reason);
    assert_eq!(outcome.cycles_completed, 100);
    assert_eq!(device.write_count(":Start").await, 100);
    assert_eq!(device.write_count(":Stop").await, 100);
    assert!(!device.is_acquiring().await);
}

#[tokio::test(start_paused = true)]
async fn state_mismatch_on_cycle_three_stops_the_run() {
    let config = config();
    let device = device(&config);
    device.lag_state_on_start(3, Duration::from_secs(2)).await;

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("start_stop"), BASE)
        .await;

    assert_eq!(outcome.status, ScenarioStatus::Failure);
    assert_eq!(outcome.error_kind, Some(ErrorKind::StateMismatch));
    assert_eq!(outcome.failed_cycle, Some(3));
    assert_eq!(outcome.cycles_completed, 3);
    // Cycles 4.. never ran: the failing start was the last command.
    assert_eq!(device.write_count(":Start").await, 4);
    assert_eq!(device.write_count(":Stop").await, 3);
    assert!(outcome
        .reason
        .unwrap()
        .contains("expected Acquiring (1), observed 0"));
}

#[tokio::test(start_paused = true)]
async fn stalled_stop_is_a_timeout() {
    let config = config();
    let device = device(&config);
    device.stall_acknowledgements("Stop", 1).await;

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("rapid_cycle"), BASE)
        .await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(outcome.failed_cycle, Some(0));
    assert_eq!(outcome.cycles_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn opt_in_retry_recovers_stalled_command() {
    let config = config();
    let device = device(&config);
    device.stall_acknowledgements("Start", 1).await;

    let mut definition = builtin("rapid_cycle");
    definition.cycles = 3;
    definition.command_attempts = 2;

    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert_eq!(device.write_count(":Start").await, 4);
}

#[tokio::test(start_paused = true)]
async fn device_not_idle_fails_setup() {
    let config = config();
    let device = device(&config);
    device.force_start().await;

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("start_stop"), BASE)
        .await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::StateMismatch));
    assert_eq!(outcome.failed_cycle, None);
    assert_eq!(device.write_count(":Start").await, 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_is_communication_failure() {
    let config = config();
    let device = device(&config);
    device.set_connected(false).await;

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("counters"), BASE)
        .await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::Communication));
    assert_eq!(outcome.failed_cycle, None);
}

#[tokio::test(start_paused = true)]
async fn counters_increase_while_acquiring() {
    let config = config();
    let device = device(&config);

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("counters"), BASE)
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert_eq!(outcome.cycles_completed, 10);
}

#[tokio::test(start_paused = true)]
async fn idle_detector_fails_unless_marked_idle_source() {
    let config = config();
    let device = device(&config);
    device.set_event_rate(2, 0.0).await;

    let mut definition = builtin("counters");
    definition.cycles = 2;

    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::InvariantViolation));
    assert_eq!(outcome.failed_cycle, Some(0));
    assert!(outcome.reason.unwrap().contains("Det2:EventTotal_RBV"));

    // The failed run left the first device acquiring.
    let device = common::device(&config);
    device.set_event_rate(2, 0.0).await;
    definition.idle_sources = vec![CounterId::EventTotal(2)];
    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert!(outcome.is_success(), "{:?}", outcome.reason);
}

#[tokio::test(start_paused = true)]
async fn start_reset_detects_counters_not_reset() {
    let config = config();

    let healthy = device(&config);
    let outcome = ScenarioRunner::new(&healthy, &config)
        .run(&builtin("start_reset"), BASE)
        .await;
    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert_eq!(outcome.cycles_completed, 100);

    let faulty = device(&config);
    faulty.skip_reset_on_start(4).await;
    let outcome = ScenarioRunner::new(&faulty, &config)
        .run(&builtin("start_reset"), BASE)
        .await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::InvariantViolation));
    assert_eq!(outcome.failed_cycle, Some(4));
    assert_eq!(outcome.cycles_completed, 4);
    let reason = outcome.reason.unwrap();
    assert!(reason.contains("reset-on-start invariant violated on cycle 4"), "{reason}");
    assert!(reason.contains("Det1:EventTotal_RBV"));
    assert!(reason.contains("Det2:EventTotal_RBV"));
}

#[tokio::test(start_paused = true)]
async fn lingering_rate_needs_settle_window() {
    let mut config = config();
    let mut definition = builtin("counters");
    definition.cycles = 2;

    let device = device(&config);
    device.linger_rate_after_stop(Duration::from_millis(500)).await;
    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::InvariantViolation));
    assert!(outcome.reason.unwrap().contains("zero-rate"));

    config.timing.settle_timeout = Duration::from_secs(2);
    let device = common::device(&config);
    device.linger_rate_after_stop(Duration::from_millis(500)).await;
    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert!(outcome.is_success(), "{:?}", outcome.reason);
}

#[tokio::test(start_paused = true)]
async fn roi_reset_keeps_acquiring_between_resets() {
    let config = config();
    let device = device(&config);

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("roi_reset"), BASE)
        .await;

    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert_eq!(device.write_count(":Start").await, 1);
    assert_eq!(device.write_count(":Reset").await, 100);
    assert_eq!(device.write_count(":Stop").await, 1);
    assert!(!device.is_acquiring().await);
}

#[tokio::test(start_paused = true)]
async fn run_control_cycle_checks_layered_state() {
    let config = run_control_config();
    let device = device(&config);
    let mut definition = builtin("run_control_cycle");
    definition.cycles = 25;

    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert_eq!(device.write_count("RunControl:Start").await, 25);
    assert_eq!(device.write_count(&format!("{BASE}:Start")).await, 0);
}

#[tokio::test(start_paused = true)]
async fn run_control_cycle_needs_run_control_configuration() {
    let config = config();
    let device = device(&config);

    let outcome = ScenarioRunner::new(&device, &config)
        .run(&builtin("run_control_cycle"), BASE)
        .await;
    assert_eq!(outcome.error_kind, Some(ErrorKind::Configuration));
    assert!(device.call_log().await.is_empty());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn diagnostics_are_attached_but_do_not_pass_the_check() {
    let config = run_control_config();
    let device = device(&config);
    device.lag_state_on_start(2, Duration::from_millis(500)).await;
    device.set_status_message("Waiting for run start").await;
    let mut definition = builtin("run_control_cycle");
    definition.cycles = 10;

    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::StateMismatch));
    assert_eq!(outcome.failed_cycle, Some(2));
    let reason = outcome.reason.unwrap();
    assert!(reason.contains("BL99:CS:RunControl:StateEnum"), "{reason}");
    assert!(reason.contains("delayed read after 1s: 1"), "{reason}");
    assert!(reason.contains("Waiting for run start"), "{reason}");
    assert!(logs_contain("State mismatch diagnostics"));
}

#[tokio::test(start_paused = true)]
async fn xy_roi_sweep_enables_filter_and_walks_axes() {
    let config = config();
    let device = device(&config);
    let mut definition = builtin("xy_roi_sweep");
    for step in &mut definition.cycle {
        if let Step::Sweep { axes, .. } = step {
            for axis in axes.iter_mut() {
                *axis = SweepAxis::new(&axis.endpoint, 0, 2, 1);
            }
        }
    }

    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;
    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert_eq!(device.write_count("PixelROIFilterEnable").await, 2);
    // Per cycle: outer axes change less often than inner ones.
    assert_eq!(device.write_count("ROI:1:MinX").await, 2 * 2);
    assert_eq!(device.write_count("ROI:1:MinY").await, 2 * 4);
    assert_eq!(device.write_count("ROI:1:SizeX").await, 2 * 8);
    assert_eq!(device.write_count("ROI:1:SizeY").await, 2 * 16);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn start_race_logs_totals_around_each_start() {
    let config = config();
    let device = device(&config);
    let mut definition = builtin("start_race");
    definition.cycles = 3;

    let outcome = ScenarioRunner::new(&device, &config).run(&definition, BASE).await;

    assert!(outcome.is_success(), "{:?}", outcome.reason);
    assert!(logs_contain("Counter PostStop -> PostStart"));
    assert!(logs_contain("Det1:EventTotal_RBV"));
    assert!(logs_contain("Det2:EventTotal_RBV"));
}
