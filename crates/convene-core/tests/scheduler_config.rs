use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveTime;
use convene_core::SchedulerConfig;
use convene_core::config::ConflictPolicy;
use convene_core::models::CoreErrorKind;

fn temp_config_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "convene-{test_name}-{}-{nanos}.json",
        std::process::id()
    ))
}

#[test]
fn loads_partial_config_from_disk() {
    let path = temp_config_path("partial");
    std::fs::write(
        &path,
        r#"{
            "business_hours": { "start": "08:30", "end": "17:00", "utc_offset_minutes": -300 },
            "lookahead_days": 3,
            "workflow_timeout_ms": 2500,
            "conflict": { "policy": "surface" },
            "agents": { "booking": 2 }
        }"#,
    )
    .expect("config file should be written");

    let config = SchedulerConfig::from_path(&path).expect("config should load");
    let _ = std::fs::remove_file(&path);

    let hours = config.business_hours().unwrap();
    assert_eq!(hours.start, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
    assert_eq!(hours.utc_offset_minutes, -300);
    assert_eq!(config.lookahead_days, 3);
    assert_eq!(config.workflow_deadline(), Some(Duration::from_millis(2500)));
    assert_eq!(config.conflict.policy, ConflictPolicy::Surface);
    assert_eq!(config.max_reselections(), 0);
    assert_eq!(config.agents.booking, 2);
    assert_eq!(config.agents.calendar, 5);
    assert_eq!(config.granularity_minutes, 30);
    assert_eq!(config.max_candidates, 10);
}

#[test]
fn missing_file_is_a_validation_error() {
    let path = temp_config_path("missing");
    let error = SchedulerConfig::from_path(&path).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Validation);
    assert!(error.message.contains("failed to read scheduler config"));
}

#[test]
fn rejects_unusable_values() {
    for raw in [
        r#"{ "business_hours": { "start": "18:00", "end": "09:00" } }"#,
        r#"{ "business_hours": { "start": "9am" } }"#,
        r#"{ "granularity_minutes": 0 }"#,
        r#"{ "retry": { "max_attempts": 0 } }"#,
        r#"{ "agents": { "notification": 0 } }"#,
        r#"{ "workflow_timeout_ms": 0 }"#,
        r#"{ "notification_template": "  " }"#,
        r#"{ "lookahead_days": "soon" }"#,
    ] {
        let error = SchedulerConfig::from_json_str(raw).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Validation, "{raw}");
    }
}
