use super::*;
use std::time::Duration;

#[test]
fn default_config_matches_documented_values() {
    let config = NodeConfig::default();
    assert_eq!(config.app, "logsql");
    assert_eq!(config.data_dir, PathBuf::from(".logsql-data"));
    assert_eq!(config.snapshot_interval, Duration::from_secs(7200));
    assert_eq!(config.snapshot_threshold, 1024);
    assert_eq!(config.snapshot_cooldown, Duration::from_secs(1800));
    assert_eq!(config.fault_backoff, Duration::from_secs(2));
}

#[test]
fn derived_paths_live_in_data_dir() {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = NodeConfig::builder()
        .data_dir(tmp.path().to_path_buf())
        .app("orders".to_string())
        .build();
    assert_eq!(config.subject(), "orders.push");
    assert_eq!(config.db_path(), tmp.path().join("logsql.db"));
    assert_eq!(config.uid_path(), tmp.path().join("uid"));
}

#[test]
fn error_classification() {
    assert!(DbError::Storage("corrupt".into()).is_fatal());
    assert!(DbError::Io(io::Error::other("disk")).is_fatal());
    assert!(!DbError::Apply("constraint".into()).is_fatal());
    assert!(DbError::Transport("closed".into()).is_transport());
    assert!(!DbError::Publish("closed".into()).is_transport());
}

#[test]
fn error_messages_carry_kind_prefix() {
    assert_eq!(
        DbError::Validation("empty array".into()).to_string(),
        "validation: empty array"
    );
    assert_eq!(DbError::Apply("no such table: t".into()).to_string(), "apply: no such table: t");
}

#[test]
fn elapsed_is_reported_in_milliseconds() {
    assert!((elapsed_ms(Duration::from_micros(1500)) - 1.5).abs() < 1e-9);
}

#[test]
fn unix_millis_is_monotone_enough() {
    let a = unix_millis();
    let b = unix_millis();
    assert!(b >= a);
    assert_eq!(unix_millis_of(UNIX_EPOCH), 0);
}
