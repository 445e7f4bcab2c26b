//! Full cycles against the file interface: CSV inputs, JSON static data,
//! built-in components, and outputs written to and read back from the
//! results file.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio_test::assert_ok;

use meridian::file::ResultsDocument;
use meridian::project::{Project, Settings};
use meridian_runtime::{ComponentStatus, CycleStatus, NoCalculation};
use meridian_types::{InterfaceKind, PointAddress, Value};

const CONFIG: &str = r#"{
    "name": "storage-controller",
    "interfaces": { "file": true },
    "inputs": {
        "temp_top": { "entity": "tank1", "attribute": "T1", "unit": "CEL", "default": 55.0 },
        "temp_window": { "entity": "tank1", "attribute": "T1_window",
                         "attribute_interface": "T1", "read_mode": "range" }
    },
    "outputs": {
        "pump": { "entity": "pump1", "attribute": "command" },
        "temp_mean": { "entity": "tank1", "attribute": "T1_mean", "unit": "CEL" }
    },
    "staticdata": {
        "setpoint": { "entity": "params", "attribute": "setpoint", "unit": "CEL" }
    },
    "controller_components": [
        { "id": "tpc", "type": "two_point_controller",
          "inputs": { "current_value": { "entity": "tank1", "attribute": "T1" },
                      "latest_control_signal": { "entity": "pump1", "attribute": "command", "default": 0 } },
          "outputs": { "control_signal": { "entity": "pump1", "attribute": "command" } },
          "staticdata": { "setpoint": { "entity": "params", "attribute": "setpoint" } },
          "config": { "hysteresis": { "value": 5.0, "unit": "CEL" } } },
        { "id": "mean", "type": "moving_average",
          "inputs": { "value": { "entity": "tank1", "attribute": "T1_window" } },
          "outputs": { "average": { "entity": "tank1", "attribute": "T1_mean" } } }
    ],
    "controller_settings": {
        "time_settings": {
            "calculation": { "sampling_time": 1, "sampling_time_unit": "minute",
                             "timerange": 1, "timerange_unit": "hour" }
        }
    }
}"#;

const STATIC_DATA: &str = r#"{
    "staticdata": [
        { "id": "params", "attributes": [ { "id": "setpoint", "value": 60.0, "unit": "CEL" } ] }
    ]
}"#;

/// CSV rows 30, 20 and 10 minutes old
fn write_input(path: &Path, values: [&str; 3]) {
    let now = Utc::now();
    let mut csv = String::from("Time;T1\n");
    for (minutes, value) in [30, 20, 10].into_iter().zip(values) {
        let time = (now - Duration::minutes(minutes)).format("%Y-%m-%d %H:%M:%S");
        csv.push_str(&format!("{time};{value}\n"));
    }
    std::fs::write(path, csv).unwrap();
}

fn setup(dir: &TempDir) -> Settings {
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, CONFIG).unwrap();
    std::fs::write(dir.path().join("static.json"), STATIC_DATA).unwrap();
    write_input(&dir.path().join("input.csv"), ["50,0", "52,0", "54,0"]);

    Settings {
        config_path,
        input_file: Some(dir.path().join("input.csv")),
        static_file: Some(dir.path().join("static.json")),
        results_file: dir.path().join("results").join("results.json"),
        ..Settings::default()
    }
}

#[tokio::test]
async fn test_cycles_write_and_feed_back_outputs() {
    let dir = TempDir::new().unwrap();
    let settings = setup(&dir);
    let results_path = settings.results_file.clone();

    let project = assert_ok!(Project::load(settings));
    let mut runner = assert_ok!(project.runner(Arc::new(NoCalculation)));

    // First cycle: no previous command yet, so the default is used
    let first = runner.run_calculation(Utc::now()).await;
    assert_eq!(first.status, CycleStatus::Partial);
    assert_eq!(first.defaults_used, 1);
    assert!(
        first
            .component_outcomes
            .iter()
            .all(|o| matches!(o.status, ComponentStatus::Succeeded { outputs: 1 }))
    );
    assert_eq!(first.write_outcomes.len(), 2);
    assert_eq!(first.failed_writes(), 0);

    let results = assert_ok!(ResultsDocument::load(&results_path).await);
    let pump = PointAddress::new("pump1", "command", InterfaceKind::File);
    let mean = PointAddress::new("tank1", "T1_mean", InterfaceKind::File);
    // 54 is below setpoint minus hysteresis
    assert_eq!(results.latest(&pump).unwrap().value, Value::Int(1));
    assert_eq!(results.latest(&mean).unwrap().value, Value::Float(52.0));

    // Second cycle: 57 lies inside the band, the previous "on" is held
    write_input(&dir.path().join("input.csv"), ["56,0", "57,0", "57,0"]);
    let second = runner.run_calculation(Utc::now()).await;
    assert_eq!(second.status, CycleStatus::Succeeded);
    assert_eq!(second.defaults_used, 0);

    let results = assert_ok!(ResultsDocument::load(&results_path).await);
    assert_eq!(results.latest(&pump).unwrap().value, Value::Int(1));
    let average = results.latest(&mean).unwrap().value.as_f64().unwrap();
    assert!((average - 56.666).abs() < 0.01);
}

#[tokio::test]
async fn test_missing_input_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let mut settings = setup(&dir);
    settings.input_file = Some(dir.path().join("absent.csv"));

    let project = assert_ok!(Project::load(settings));
    let mut runner = assert_ok!(project.runner(Arc::new(NoCalculation)));
    let report = runner.run_calculation(Utc::now()).await;

    // temp_top falls back to 55.0; the range input has no default
    assert_eq!(report.status, CycleStatus::Partial);
    assert!(report.read_failures.iter().any(|f| f.key == "temp_window" && !f.fell_back));
    let failed: Vec<_> = report
        .component_outcomes
        .iter()
        .filter(|o| o.is_failure())
        .map(|o| o.component_id.as_str())
        .collect();
    assert_eq!(failed, vec!["mean"]);
}

#[tokio::test]
async fn test_unknown_component_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    let settings = setup(&dir);
    let broken = CONFIG.replace("moving_average", "exponential_average");
    std::fs::write(&settings.config_path, broken).unwrap();

    let err = Project::load(settings).unwrap_err();
    assert!(err.to_string().contains("exponential_average"));
}
