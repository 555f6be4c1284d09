//! Integration tests for culture bookkeeping and control protocols on a simulated bench.

use morbidostat::culture::{Culture, CultureConfig};
use morbidostat::hardware::{DeviceConfig, PumpRole};
use morbidostat::protocol::{
    ChemostatConfig, ChemostatProtocol, ControlAction, GrowthControlProtocol, MorbidostatConfig,
    MorbidostatProtocol, TurbidostatConfig, TurbidostatProtocol,
};
use morbidostat::simulation::{MockMode, SimulatedRig, SimulationBuilder, SimulationConfig};

const VIAL: u8 = 1;

fn rig() -> SimulatedRig {
    SimulationBuilder::new(SimulationConfig {
        od_noise: 0.0,
        ..Default::default()
    })
    .mode(MockMode::Instant)
    .seed(3)
    .device_config(DeviceConfig {
        n_vials: 3,
        ..Default::default()
    })
    .build()
    .unwrap()
}

fn culture(rig: &SimulatedRig, config: CultureConfig) -> Culture {
    Culture::new(VIAL, rig.device.clone(), config, rig.clock.clone()).unwrap()
}

/// Two measurements `minutes` apart, at the given densities.
async fn observe(rig: &SimulatedRig, culture: &mut Culture, od_before: f64, od_after: f64, minutes: f64) {
    rig.bench.set_od(VIAL, od_before);
    culture.measure().await.unwrap();
    rig.clock.advance_minutes(minutes);
    rig.bench.set_od(VIAL, od_after);
}

#[tokio::test]
async fn test_growth_rate_of_one_doubling_per_hour() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());

    observe(&rig, &mut culture, 0.1, 0.2, 60.0).await;
    culture.measure().await.unwrap();

    let rate = culture.calculate_growth_rate(90.0).unwrap();
    assert!((rate - std::f64::consts::LN_2).abs() < 1e-9, "rate = {}", rate);

    // Window holding only the newest point
    assert!(culture.calculate_growth_rate(30.0).is_none());
}

#[tokio::test]
async fn test_growth_rate_window_beyond_time_range() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());

    observe(&rig, &mut culture, 0.1, 0.2, 60.0).await;
    culture.measure().await.unwrap();

    // Reaches past the earliest representable instant: every point counts
    let rate = culture.calculate_growth_rate(1e12).unwrap();
    assert!((rate - std::f64::consts::LN_2).abs() < 1e-9);
    assert!(culture.calculate_growth_rate(f64::INFINITY).is_some());
    assert!(culture.calculate_growth_rate(-5.0).is_none());
    assert!(culture.calculate_growth_rate(f64::NAN).is_none());

    let err = MorbidostatProtocol::new(MorbidostatConfig {
        measurement_window_minutes: 1e12,
        ..Default::default()
    })
    .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_culture_rejects_exchange_above_device_maximum() {
    let rig = rig();
    // 60 ml * 0.6 = 36 ml per dilution, device takes 30 ml
    let result = Culture::new(
        VIAL,
        rig.device.clone(),
        CultureConfig {
            current_volume_ml: 60.0,
            ..Default::default()
        },
        rig.clock.clone(),
    );
    assert!(result.unwrap_err().is_validation());
}

#[tokio::test]
async fn test_growth_rate_needs_two_points() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    assert!(culture.calculate_growth_rate(30.0).is_none());

    culture.measure().await.unwrap();
    assert!(culture.calculate_growth_rate(30.0).is_none());
    assert!(culture.status().growth_rate.is_none());
    assert!(culture.status().od.is_some());
}

#[tokio::test]
async fn test_dilution_factor_two_halves_density() {
    let rig = rig();
    let mut culture = culture(
        &rig,
        CultureConfig {
            dilution_factor: 2.0,
            ..Default::default()
        },
    );
    rig.bench.set_od(VIAL, 0.4);

    let record = culture.make_dilution(None).await.unwrap();
    assert_eq!(record.media_volume_ml, 12.0);
    assert_eq!(record.drug_volume_ml, 0.0);

    let measured = culture.measure().await.unwrap();
    assert!((measured.od() - 0.2).abs() < 1e-9);
    assert!((culture.current_generations() - 1.0).abs() < 1e-12);
    assert_eq!(culture.generation_history().len(), 2);
    assert_eq!(culture.drug_concentration_history().len(), 2);
}

#[tokio::test]
async fn test_dilution_splits_exchange_volume_by_target() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());

    let record = culture.make_dilution(Some(50.0)).await.unwrap();
    // 12 ml * (1.6 - 1) = 7.2 ml exchanged, half of it drug stock
    assert!((record.drug_volume_ml - 3.6).abs() < 1e-9);
    assert!((record.media_volume_ml - 3.6).abs() < 1e-9);
    assert_eq!(culture.current_drug_concentration(), 50.0);

    let generations = culture.current_generations();
    assert!((generations - 1.6f64.log2()).abs() < 1e-12);

    let status = rig.device.pump_status();
    assert!((status[&PumpRole::Waste].pumped_volume_ml - 7.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_target_above_maximum_is_rejected() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());

    let err = culture.make_dilution(Some(150.0)).await.unwrap_err();
    assert!(err.is_validation());
    let err = culture.make_dilution(Some(-1.0)).await.unwrap_err();
    assert!(err.is_validation());

    assert!(culture.dilutions().is_empty());
    assert_eq!(culture.current_drug_concentration(), 0.0);
    let status = rig.device.pump_status();
    assert!(status.values().all(|p| p.pumped_volume_ml == 0.0));
}

#[tokio::test]
async fn test_culture_rejects_vial_outside_device() {
    let rig = rig();
    let result = Culture::new(4, rig.device.clone(), CultureConfig::default(), rig.clock.clone());
    assert!(result.unwrap_err().is_validation());
}

#[tokio::test]
async fn test_morbidostat_raises_drug_for_fast_growth() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    let mut protocol = MorbidostatProtocol::new(MorbidostatConfig {
        drug_seed_concentration: 2.0,
        ..Default::default()
    })
    .unwrap();

    // One doubling in 30 minutes
    observe(&rig, &mut culture, 0.25, 0.5, 30.0).await;
    let record = protocol.update(&mut culture).await.unwrap();

    assert_eq!(
        record.action,
        Some(ControlAction::IncreaseDrug {
            target_concentration: 2.0
        })
    );
    assert_eq!(record.drug_concentration, 0.0);
    assert!(record.growth_rate.unwrap() > 1.0);
    assert_eq!(culture.current_drug_concentration(), 2.0);
    assert!((rig.bench.od(VIAL).unwrap() - 0.5 / 1.6).abs() < 1e-9);

    // Next increase is multiplicative
    rig.clock.advance_minutes(1.0);
    observe(&rig, &mut culture, 0.25, 0.5, 30.0).await;
    let record = protocol.update(&mut culture).await.unwrap();
    assert_eq!(
        record.action,
        Some(ControlAction::IncreaseDrug {
            target_concentration: 3.0
        })
    );
    assert_eq!(protocol.history().len(), 2);
    assert_eq!(protocol.status().history_len, 2);
}

#[tokio::test]
async fn test_morbidostat_waits_below_threshold() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    let mut protocol = MorbidostatProtocol::new(MorbidostatConfig::default()).unwrap();

    observe(&rig, &mut culture, 0.05, 0.1, 30.0).await;
    let record = protocol.update(&mut culture).await.unwrap();

    assert_eq!(record.action, None);
    assert!(culture.dilutions().is_empty());
}

#[tokio::test]
async fn test_morbidostat_rescues_collapsing_culture() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    culture.make_dilution(Some(30.0)).await.unwrap();
    let mut protocol = MorbidostatProtocol::new(MorbidostatConfig {
        measurement_window_minutes: 90.0,
        ..Default::default()
    })
    .unwrap();

    // Halving in an hour, below the threshold
    observe(&rig, &mut culture, 0.2, 0.1, 60.0).await;
    let record = protocol.update(&mut culture).await.unwrap();

    assert_eq!(
        record.action,
        Some(ControlAction::RescueDilution {
            target_concentration: 20.0
        })
    );
    assert_eq!(culture.dilutions().len(), 2);
    assert_eq!(culture.current_drug_concentration(), 20.0);
}

#[tokio::test]
async fn test_morbidostat_decreases_and_maintains() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    culture.make_dilution(Some(30.0)).await.unwrap();
    let mut protocol = MorbidostatProtocol::new(MorbidostatConfig {
        measurement_window_minutes: 90.0,
        ..Default::default()
    })
    .unwrap();

    // ~0.05 per hour: too slow
    observe(&rig, &mut culture, 0.4, 0.42, 60.0).await;
    let record = protocol.update(&mut culture).await.unwrap();
    assert_eq!(
        record.action,
        Some(ControlAction::DecreaseDrug {
            target_concentration: 20.0
        })
    );

    // Exactly on target
    rig.clock.advance_minutes(120.0);
    observe(&rig, &mut culture, 0.4, 0.4 * 0.15f64.exp(), 60.0).await;
    let record = protocol.update(&mut culture).await.unwrap();
    assert_eq!(
        record.action,
        Some(ControlAction::Maintain {
            target_concentration: 20.0
        })
    );
}

#[tokio::test]
async fn test_turbidostat_dilutes_only_above_threshold() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    let mut protocol = TurbidostatProtocol::new(TurbidostatConfig::default());

    rig.bench.set_od(VIAL, 0.1);
    let record = protocol.update(&mut culture).await.unwrap();
    assert!(record.action.is_none());

    rig.bench.set_od(VIAL, 0.45);
    let record = protocol.update(&mut culture).await.unwrap();
    assert_eq!(
        record.action,
        Some(ControlAction::Maintain {
            target_concentration: 0.0
        })
    );
    assert_eq!(culture.dilutions().len(), 1);
}

#[tokio::test]
async fn test_chemostat_dilutes_every_update() {
    let rig = rig();
    let mut culture = culture(&rig, CultureConfig::default());
    let mut protocol = ChemostatProtocol::new(ChemostatConfig {
        drug_concentration: 5.0,
        ..Default::default()
    });

    for _ in 0..3 {
        protocol.update(&mut culture).await.unwrap();
        rig.clock.advance_minutes(10.0);
    }
    assert_eq!(culture.dilutions().len(), 3);
    assert_eq!(culture.current_drug_concentration(), 5.0);
    assert_eq!(protocol.name(), "chemostat");
}
