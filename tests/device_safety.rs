//! Integration tests for the safety invariants of `Device`.

use morbidostat::error::ComponentErrorKind;
use morbidostat::hardware::{
    ChannelListener, Device, DeviceConfig, DeviceEvent, DeviceEvents, PumpRole, StirrerSpeed,
    VialStatus,
};
use morbidostat::simulation::{
    ErrorConfig, ErrorScenario, MockMode, SimComponent, SimulatedRig, SimulationBuilder,
    SimulationConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_test::traced_test;

fn builder() -> SimulationBuilder {
    SimulationBuilder::new(SimulationConfig::default())
        .mode(MockMode::Instant)
        .seed(11)
}

fn rig_with_events() -> (SimulatedRig, UnboundedReceiver<DeviceEvent>) {
    let (listener, rx) = ChannelListener::new();
    let rig = builder()
        .events(DeviceEvents::new().with_listener(Arc::new(listener)))
        .build()
        .unwrap();
    (rig, rx)
}

fn drain(rx: &mut UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn pumped(rig: &SimulatedRig, role: PumpRole) -> f64 {
    rig.device.pump_status()[&role].pumped_volume_ml
}

fn all_valves_closed(device: &Device) -> bool {
    (1..=device.n_vials()).all(|vial| !device.valve_is_open(vial).unwrap())
}

#[tokio::test]
async fn test_invalid_vial_is_rejected_without_hardware_action() {
    let (rig, mut rx) = rig_with_events();

    for vial in [0u8, 8, 255] {
        let err = rig.device.measure_vial(vial).await.unwrap_err();
        assert!(err.is_validation(), "vial {}: {}", vial, err);

        let err = rig.device.make_dilution(vial, 5.0, 0.0).await.unwrap_err();
        assert!(err.is_validation(), "vial {}: {}", vial, err);

        let err = rig.device.set_valve(vial, true).await.unwrap_err();
        assert!(err.is_validation());
    }

    for role in PumpRole::ALL {
        assert_eq!(pumped(&rig, role), 0.0);
    }
    assert!(all_valves_closed(&rig.device));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_invalid_volumes_are_rejected_without_hardware_action() {
    let (rig, mut rx) = rig_with_events();

    assert!(rig
        .device
        .make_dilution(1, -1.0, 0.0)
        .await
        .unwrap_err()
        .is_validation());
    assert!(rig
        .device
        .make_dilution(1, f64::NAN, 0.0)
        .await
        .unwrap_err()
        .is_validation());
    // Each part within range, total above max_volume_ml
    assert!(rig
        .device
        .make_dilution(1, 20.0, 20.0)
        .await
        .unwrap_err()
        .is_validation());
    assert!(rig
        .device
        .pump(PumpRole::Media, 31.0)
        .await
        .unwrap_err()
        .is_validation());

    assert_eq!(pumped(&rig, PumpRole::Waste), 0.0);
    assert_eq!(pumped(&rig, PumpRole::Media), 0.0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_dilution_sequence_and_events() {
    let (rig, mut rx) = rig_with_events();

    rig.device.make_dilution(2, 6.0, 1.5).await.unwrap();

    assert!(!rig.device.valve_is_open(2).unwrap());
    assert_eq!(pumped(&rig, PumpRole::Waste), 7.5);
    assert_eq!(pumped(&rig, PumpRole::Media), 6.0);
    assert_eq!(pumped(&rig, PumpRole::Drug), 1.5);

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            DeviceEvent::Valve { valve_id: 2, open: true },
            DeviceEvent::Pump { pump_id: 4, active: true },
            DeviceEvent::Pump { pump_id: 4, active: false },
            DeviceEvent::Pump { pump_id: 1, active: true },
            DeviceEvent::Pump { pump_id: 1, active: false },
            DeviceEvent::Pump { pump_id: 2, active: true },
            DeviceEvent::Pump { pump_id: 2, active: false },
            DeviceEvent::Valve { valve_id: 2, open: false },
        ]
    );
}

#[tokio::test]
async fn test_dilution_changes_simulated_culture() {
    let rig = builder().build().unwrap();
    rig.bench.set_od(1, 0.4);

    // 12 ml working volume plus 12 ml exchange halves the density
    rig.device.make_dilution(1, 12.0, 0.0).await.unwrap();
    let od = rig.bench.od(1).unwrap();
    assert!((od - 0.2).abs() < 1e-9, "od after dilution: {}", od);
}

#[tokio::test]
#[traced_test]
async fn test_failed_dilution_closes_valve_and_stops_everything() {
    let rig = builder()
        .with_errors(
            SimComponent::Pump(PumpRole::Media),
            ErrorConfig::always_fail("pump"),
        )
        .build()
        .unwrap();

    // Stirrers running before the failure
    rig.device.measure_vial(3).await.unwrap();
    assert_eq!(rig.stirrer.speed(3), Some(StirrerSpeed::High));

    let err = rig.device.make_dilution(3, 5.0, 1.0).await.unwrap_err();
    assert!(err.is_device(), "{}", err);
    assert!(err.to_string().contains("Dilution failed"));

    assert!(all_valves_closed(&rig.device));
    assert_eq!(rig.stirrer.speed(3), Some(StirrerSpeed::Stopped));
    // Waste ran, media failed, drug never started
    assert_eq!(pumped(&rig, PumpRole::Waste), 6.0);
    assert_eq!(pumped(&rig, PumpRole::Drug), 0.0);
    assert!(rig.device.pump_status().values().all(|p| !p.is_pumping));
    assert!(logs_contain("Emergency stop"));
}

#[tokio::test]
async fn test_valve_close_failure_triggers_emergency_stop() {
    let rig = builder()
        .with_errors(SimComponent::Valves, ErrorConfig::always_fail("close"))
        .build()
        .unwrap();
    rig.device.measure_vial(1).await.unwrap();

    let err = rig.device.make_dilution(1, 3.0, 0.0).await.unwrap_err();
    assert!(err.is_device());

    // close_all still succeeds during the emergency stop
    assert!(all_valves_closed(&rig.device));
    assert_eq!(rig.stirrer.speed(1), Some(StirrerSpeed::Stopped));
}

#[tokio::test]
async fn test_emergency_stop_attempts_every_action() {
    let rig = builder()
        .with_errors(SimComponent::Stirrer, ErrorConfig::always_fail("stop_all"))
        .with_errors(SimComponent::Valves, ErrorConfig::always_fail("close_all"))
        .with_errors(
            SimComponent::Pump(PumpRole::Drug),
            ErrorConfig::always_fail("stop"),
        )
        .build()
        .unwrap();

    let report = rig.device.emergency_stop().await;
    assert!(!report.is_clean());
    assert_eq!(report.failures.len(), 3, "{:?}", report.failures);
    assert!(report.failures.iter().any(|f| f.starts_with("pump drug")));
    assert!(report.failures.iter().any(|f| f.starts_with("stirrer")));
    assert!(report.failures.iter().any(|f| f.starts_with("valves")));
}

#[tokio::test]
async fn test_emergency_stop_on_idle_bench_is_clean() {
    let (rig, mut rx) = rig_with_events();
    let report = rig.device.emergency_stop().await;
    assert!(report.is_clean());
    // Nothing was active, so nothing changed state
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_emergency_stop_closes_open_valves() {
    let (rig, mut rx) = rig_with_events();
    rig.device.set_valve(4, true).await.unwrap();
    rig.device.set_valve(6, true).await.unwrap();
    drain(&mut rx);

    let report = rig.device.emergency_stop().await;
    assert!(report.is_clean());
    assert!(all_valves_closed(&rig.device));
    assert_eq!(
        drain(&mut rx),
        vec![
            DeviceEvent::Valve { valve_id: 4, open: false },
            DeviceEvent::Valve { valve_id: 6, open: false },
        ]
    );
}

#[tokio::test]
async fn test_concurrent_use_of_one_pump_fails_fast() {
    let rig = builder().mode(MockMode::Realistic).build().unwrap();

    let started = std::time::Instant::now();
    let (first, second) = tokio::join!(
        rig.device.pump(PumpRole::Media, 0.3),
        rig.device.pump(PumpRole::Media, 0.3),
    );

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(err.is_busy(), "{}", err);
    // The second call did not queue behind the first
    assert!(started.elapsed() < Duration::from_millis(550));
    assert!((pumped(&rig, PumpRole::Media) - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_different_pumps_run_concurrently() {
    let rig = builder().mode(MockMode::Realistic).build().unwrap();
    let (media, drug) = tokio::join!(
        rig.device.pump(PumpRole::Media, 0.2),
        rig.device.pump(PumpRole::Drug, 0.2),
    );
    assert!(media.is_ok());
    assert!(drug.is_ok());
}

#[tokio::test]
async fn test_stuck_component_times_out() {
    let rig = builder()
        .device_config(DeviceConfig {
            operation_timeout_ms: 100,
            ..Default::default()
        })
        .with_errors(
            SimComponent::Valves,
            ErrorConfig::scenario(ErrorScenario::Stall { operation: "open" }),
        )
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let err = rig.device.make_dilution(5, 2.0, 0.0).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    let cause = err.component_error().expect("component cause");
    assert_eq!(cause.kind, ComponentErrorKind::Timeout);
    assert_eq!(pumped(&rig, PumpRole::Waste), 0.0);
    assert!(all_valves_closed(&rig.device));
}

#[tokio::test]
async fn test_timed_out_pump_is_reported_idle() {
    let (listener, mut rx) = ChannelListener::new();
    let rig = builder()
        .device_config(DeviceConfig {
            operation_timeout_ms: 50,
            ..Default::default()
        })
        .events(DeviceEvents::new().with_listener(Arc::new(listener)))
        .with_errors(
            SimComponent::Pump(PumpRole::Media),
            ErrorConfig::scenario(ErrorScenario::Stall { operation: "pump" }),
        )
        .build()
        .unwrap();

    for _ in 0..2 {
        let err = rig.device.pump(PumpRole::Media, 0.01).await.unwrap_err();
        let cause = err.component_error().expect("component cause");
        assert_eq!(cause.kind, ComponentErrorKind::Timeout);
        assert!(!rig.device.pump_status()[&PumpRole::Media].is_pumping);
    }

    // Each attempt announces start and end
    assert_eq!(
        drain(&mut rx),
        vec![
            DeviceEvent::Pump { pump_id: 1, active: true },
            DeviceEvent::Pump { pump_id: 1, active: false },
            DeviceEvent::Pump { pump_id: 1, active: true },
            DeviceEvent::Pump { pump_id: 1, active: false },
        ]
    );
    assert_eq!(pumped(&rig, PumpRole::Media), 0.0);
}

#[tokio::test]
async fn test_vial_status_reports_partial_results() {
    let rig = builder()
        .with_errors(
            SimComponent::OdSensor,
            ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: "measure_od",
                count: 2,
            }),
        )
        .build()
        .unwrap();

    let status = rig.device.vial_status().await;
    assert_eq!(status.len(), 7);

    for vial in [1u8, 2] {
        let s = &status[&vial];
        assert!(s.error.is_none());
        assert!(s.od > 0.0);
        assert!(s.temperature > 30.0);
    }
    for vial in 3u8..=7 {
        let s: &VialStatus = &status[&vial];
        assert_eq!(s.od, -1.0);
        assert_eq!(s.temperature, -1.0);
        assert_eq!(s.rpm, -1.0);
        assert!(s.error.as_deref().unwrap().contains("measure_od"));
    }
    // A failed reading still leaves the stirrer at high speed
    assert_eq!(rig.stirrer.speed(5), Some(StirrerSpeed::High));
}
