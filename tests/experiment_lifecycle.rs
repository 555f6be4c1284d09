//! Integration tests for the experiment state machine, end conditions and persistence.

use chrono::{TimeZone, Utc};
use morbidostat::experiment::{Experiment, ExperimentConfig, ExperimentStatus, PersistedExperiment};
use morbidostat::hardware::DeviceConfig;
use morbidostat::protocol::{
    ChemostatConfig, ChemostatProtocol, GrowthControlProtocol, MorbidostatConfig,
    MorbidostatProtocol,
};
use morbidostat::simulation::{
    ErrorConfig, ErrorScenario, MockMode, SimComponent, SimulatedRig, SimulationBuilder,
    SimulationConfig,
};

const N_VIALS: u8 = 3;

fn device_config() -> DeviceConfig {
    DeviceConfig {
        n_vials: N_VIALS,
        ..Default::default()
    }
}

fn builder() -> SimulationBuilder {
    SimulationBuilder::new(SimulationConfig::default())
        .mode(MockMode::Instant)
        .seed(5)
        .device_config(device_config())
        .start_time(Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap())
}

fn config() -> ExperimentConfig {
    ExperimentConfig {
        device: device_config(),
        ..Default::default()
    }
}

fn morbidostat() -> Box<dyn GrowthControlProtocol> {
    Box::new(MorbidostatProtocol::new(MorbidostatConfig::default()).unwrap())
}

fn experiment(rig: &SimulatedRig, config: ExperimentConfig) -> Experiment {
    Experiment::builder(rig.device.clone())
        .name("lifecycle")
        .config(config)
        .protocol(morbidostat())
        .clock(rig.clock.clone())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_builder_defaults() {
    let rig = builder().build().unwrap();
    let experiment = Experiment::builder(rig.device.clone())
        .clock(rig.clock.clone())
        .build()
        .unwrap();

    assert_eq!(experiment.name(), "20240301_083000");
    assert_eq!(experiment.status(), ExperimentStatus::Initialized);
    assert_eq!(experiment.cultures().len(), N_VIALS as usize);
    assert_eq!(experiment.protocol_status().name, "morbidostat");
    assert!(experiment.error().is_none());
}

#[tokio::test]
async fn test_builder_rejects_more_vials_than_device() {
    let rig = builder().build().unwrap();
    let err = Experiment::builder(rig.device.clone())
        .config(ExperimentConfig::default())
        .build()
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_builder_rejects_exchange_above_device_maximum() {
    let rig = builder().build().unwrap();
    let mut config = config();
    config.culture.current_volume_ml = 60.0;
    assert!(config.validate().unwrap_err().is_validation());

    let err = Experiment::builder(rig.device.clone())
        .config(config)
        .clock(rig.clock.clone())
        .build()
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_illegal_transitions_leave_state_untouched() {
    let rig = builder().build().unwrap();
    let mut experiment = experiment(&rig, config());

    assert!(experiment.pause().unwrap_err().is_state());
    assert!(experiment.resume().unwrap_err().is_state());
    assert_eq!(experiment.status(), ExperimentStatus::Initialized);

    experiment.start().await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Running);
    assert!(experiment.start().await.unwrap_err().is_state());
    assert!(experiment.resume().unwrap_err().is_state());
    assert_eq!(experiment.status(), ExperimentStatus::Running);
}

#[tokio::test]
async fn test_pause_resume_and_restart_from_pause() {
    let rig = builder().build().unwrap();
    let mut experiment = experiment(&rig, config());

    experiment.start().await.unwrap();
    experiment.pause().unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Paused);
    assert!(experiment.pause().unwrap_err().is_state());

    experiment.resume().unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Running);

    experiment.pause().unwrap();
    experiment.start().await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Running);
}

#[tokio::test]
async fn test_start_takes_baseline_of_every_vial() {
    let rig = builder().build().unwrap();
    let mut experiment = experiment(&rig, config());

    experiment.start().await.unwrap();
    for culture in experiment.cultures().values() {
        assert_eq!(culture.measurements().len(), 1);
    }
    let snapshot = experiment.snapshot();
    assert_eq!(snapshot.status, ExperimentStatus::Running);
    assert_eq!(snapshot.cultures.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(snapshot.cultures.values().all(|c| c.od.is_some()));
}

#[tokio::test]
async fn test_stop_is_reachable_from_every_state() {
    for before in ["initialized", "running", "paused", "stopped"] {
        let rig = builder().build().unwrap();
        let mut experiment = experiment(&rig, config());
        match before {
            "running" => experiment.start().await.unwrap(),
            "paused" => {
                experiment.start().await.unwrap();
                experiment.pause().unwrap();
            }
            "stopped" => experiment.stop().await,
            _ => {}
        }

        experiment.stop().await;
        assert_eq!(experiment.status(), ExperimentStatus::Stopped, "from {}", before);
        assert!(experiment.start().await.unwrap_err().is_state());
        assert!((1..=N_VIALS).all(|v| !rig.device.valve_is_open(v).unwrap()));
    }
}

#[tokio::test]
async fn test_update_is_noop_unless_running() {
    let rig = builder().build().unwrap();
    let mut experiment = experiment(&rig, config());

    experiment.update().await.unwrap();
    assert!(experiment.protocol_history().is_empty());

    experiment.start().await.unwrap();
    experiment.pause().unwrap();
    experiment.update().await.unwrap();
    assert!(experiment.protocol_history().is_empty());
}

#[tokio::test]
async fn test_update_visits_vials_in_order() {
    let rig = builder().build().unwrap();
    let mut experiment = experiment(&rig, config());

    experiment.start().await.unwrap();
    rig.bench.advance_minutes(10.0);
    experiment.update().await.unwrap();
    rig.bench.advance_minutes(10.0);
    experiment.update().await.unwrap();

    let vials: Vec<u8> = experiment.protocol_history().iter().map(|r| r.vial).collect();
    assert_eq!(vials, vec![1, 2, 3, 1, 2, 3]);
}

#[tokio::test]
async fn test_baseline_failure_moves_to_error() {
    let rig = builder()
        .with_errors(
            SimComponent::Thermometer,
            ErrorConfig::always_fail("measure_temperature"),
        )
        .build()
        .unwrap();
    let mut experiment = experiment(&rig, config());

    let err = experiment.start().await.unwrap_err();
    assert!(err.is_device());
    assert_eq!(experiment.status(), ExperimentStatus::Error);
    assert!(experiment.error().is_some());

    // Error is terminal, but stop still drives the bench safe
    experiment.stop().await;
    assert_eq!(experiment.status(), ExperimentStatus::Error);
}

#[tokio::test]
async fn test_update_failure_moves_to_error() {
    let rig = builder()
        .with_errors(
            SimComponent::OdSensor,
            ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: "measure_od",
                count: N_VIALS as u32 + 1,
            }),
        )
        .build()
        .unwrap();
    let mut experiment = experiment(&rig, config());

    experiment.start().await.unwrap();
    let err = experiment.update().await.unwrap_err();
    assert!(err.is_device());
    assert_eq!(experiment.status(), ExperimentStatus::Error);
    assert!(experiment.error().unwrap().contains("measure_od"));
    // Vial 1 was processed before vial 2 failed
    assert_eq!(experiment.protocol_history().len(), 1);
}

#[tokio::test]
async fn test_stop_records_emergency_stop_failures() {
    let rig = builder()
        .with_errors(SimComponent::Valves, ErrorConfig::always_fail("close_all"))
        .build()
        .unwrap();
    let mut experiment = experiment(&rig, config());
    experiment.start().await.unwrap();

    experiment.stop().await;
    assert_eq!(experiment.status(), ExperimentStatus::Stopped);
    assert!(experiment
        .error()
        .unwrap()
        .contains("Emergency stop incomplete"));
}

#[tokio::test]
async fn test_stops_after_max_generations() {
    let rig = builder().build().unwrap();
    let mut experiment = Experiment::builder(rig.device.clone())
        .config(ExperimentConfig {
            max_generations: Some(1.0),
            ..config()
        })
        .protocol(Box::new(ChemostatProtocol::new(ChemostatConfig::default())))
        .clock(rig.clock.clone())
        .build()
        .unwrap();

    experiment.start().await.unwrap();
    // log2(1.6) ~ 0.68 generations per dilution
    experiment.update().await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Running);
    experiment.update().await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Stopped);
}

#[tokio::test]
async fn test_stops_after_max_duration() {
    let rig = builder().build().unwrap();
    let mut experiment = experiment(
        &rig,
        ExperimentConfig {
            max_duration_hours: Some(0.5),
            ..config()
        },
    );

    experiment.start().await.unwrap();
    rig.bench.advance_minutes(20.0);
    experiment.update().await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Running);
    assert!((experiment.duration_hours() - 20.0 / 60.0).abs() < 1e-9);

    rig.bench.advance_minutes(15.0);
    experiment.update().await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Stopped);
}

#[tokio::test]
async fn test_persisted_state_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs").join("lifecycle.json");

    let rig = builder().build().unwrap();
    let mut experiment = experiment(
        &rig,
        ExperimentConfig {
            max_generations: Some(25.0),
            ..config()
        },
    );
    experiment.start().await.unwrap();
    experiment.save_state(&path).unwrap();

    let persisted = PersistedExperiment::load(&path).unwrap();
    assert_eq!(persisted.status, ExperimentStatus::Running);
    assert_eq!(persisted.run_id, experiment.run_id());

    let restored = Experiment::load_state(&path, rig.device.clone(), morbidostat(), rig.clock.clone())
        .unwrap();
    assert_eq!(restored.name(), "lifecycle");
    assert_eq!(restored.run_id(), experiment.run_id());
    assert_eq!(restored.config(), experiment.config());
    assert_eq!(restored.start_time(), experiment.start_time());
    // No live loop after a restore
    assert_eq!(restored.status(), ExperimentStatus::Paused);
}

#[tokio::test]
async fn test_restored_error_stays_terminal() {
    let rig = builder().build().unwrap();
    let experiment = experiment(&rig, config());
    let mut persisted = experiment.to_persisted();
    persisted.status = ExperimentStatus::Error;
    persisted.error = Some("pump jammed".to_string());

    let mut restored =
        Experiment::from_persisted(rig.device.clone(), persisted, morbidostat(), rig.clock.clone())
            .unwrap();
    assert_eq!(restored.status(), ExperimentStatus::Error);
    assert_eq!(restored.error(), Some("pump jammed"));
    assert!(restored.start().await.unwrap_err().is_state());
}
