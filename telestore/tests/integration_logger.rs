//! Integration tests for the logger lifecycle.
//!
//! These tests verify opening and closing, state errors after close,
//! persistence across reopen, replacement of non-container files, and that
//! no container handle outlives a call, including calls that fail.

use std::fs;

use telestore::config::{FlushPolicy, LoggerConfig};
use telestore::error::StateError;
use telestore::{AttributeValue, ErrorKind, Level, Logger, ManualClock, TelestoreError};
use tempfile::tempdir;

fn fast_config() -> LoggerConfig {
    LoggerConfig {
        flush_policy: FlushPolicy::OnClose,
        sync_on_flush: false,
    }
}

#[test]
fn test_version_is_reported() {
    assert!(!telestore::version().is_empty());
}

#[test]
fn test_init_and_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.tlm");

    let mut logger = Logger::init(&path).expect("init should succeed");
    assert!(logger.is_open());
    logger.close().unwrap();
    assert!(!logger.is_open());
    assert!(path.is_file());
}

#[test]
fn test_init_with_empty_path_fails() {
    assert!(Logger::init("").is_none());
}

#[test]
fn test_init_in_missing_directory_fails() {
    let dir = tempdir().unwrap();
    assert!(Logger::init(dir.path().join("no/such/dir/t.tlm")).is_none());
}

#[test]
fn test_double_close_is_state_error() {
    let dir = tempdir().unwrap();
    let mut logger = Logger::open(dir.path().join("t.tlm"), fast_config()).unwrap();

    logger.close().unwrap();
    let err = logger.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(matches!(err, TelestoreError::State(StateError::AlreadyClosed)));
}

#[test]
fn test_every_operation_fails_after_close() {
    let dir = tempdir().unwrap();
    let mut logger = Logger::open(dir.path().join("t.tlm"), fast_config()).unwrap();
    logger.close().unwrap();

    let results = [
        logger.log_text(Level::Info, "x"),
        logger.log_text_to_group("custom", Level::Info, "x"),
        logger.log_array_1d("numeric_data", "a", &[1.0f32]),
        logger.log_image("images", "i", &[0], 1, 1, 1),
        logger.set_size_limit("text_logs/info", 3),
        logger.set_time_limit("text_logs/info", 1.0),
        logger.add_attribute("numeric_data", "k", 1u64),
        logger.flush(),
    ];
    for result in results {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::State);
    }
    assert_eq!(logger.open_handles().unwrap_err().kind(), ErrorKind::State);
}

#[test]
fn test_reopen_preserves_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.tlm");

    {
        let mut logger = Logger::open(&path, fast_config()).unwrap();
        logger.set_size_limit("text_logs/errors", 3).unwrap();
        logger.set_time_limit("text_logs/errors", 60.0).unwrap();
        logger.log_text(Level::Error, "first failure").unwrap();
        logger
            .log_array_2d("numeric_data/run1", "matrix", &[1.0f64, 2.0, 3.0, 4.0], 2, 2)
            .unwrap();
        logger.add_attribute("numeric_data/run1", "operator", "alice").unwrap();
        logger.close().unwrap();
    }

    let mut logger = Logger::open(&path, fast_config()).unwrap();
    let entries = logger.read_log_entries("text_logs/errors").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "first failure");

    let policy = logger.retention_policy("text_logs/errors").unwrap();
    assert_eq!(policy.max_entries, Some(3));
    assert_eq!(policy.max_age_seconds, Some(60.0));

    let matrix = logger.read_array::<f64>("numeric_data/run1", "matrix").unwrap();
    assert_eq!(matrix.shape, vec![2, 2]);
    assert_eq!(matrix.values, vec![1.0, 2.0, 3.0, 4.0]);

    assert_eq!(
        logger.attribute("numeric_data/run1", "operator").unwrap(),
        Some(AttributeValue::Text("alice".to_string()))
    );
    logger.close().unwrap();
}

#[test]
fn test_drop_flushes_open_logger() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.tlm");

    {
        let mut logger = Logger::open(&path, fast_config()).unwrap();
        logger.log_text(Level::Info, "written before drop").unwrap();
    }

    let logger = Logger::open(&path, fast_config()).unwrap();
    assert_eq!(logger.log_len("text_logs/info").unwrap(), 1);
}

#[test]
fn test_batched_flush_policy() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("batched.tlm");
    let config = LoggerConfig {
        flush_policy: FlushPolicy::Batched { writes: 2 },
        sync_on_flush: false,
    };

    let mut logger = Logger::open(&path, config).unwrap();
    let before = fs::read(&path).unwrap();
    logger.log_text(Level::Debug, "one").unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
    logger.log_text(Level::Debug, "two").unwrap();
    assert_ne!(fs::read(&path).unwrap(), before);
    logger.close().unwrap();
}

#[test]
fn test_non_container_file_is_replaced() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    fs::write(&path, "this is not a container").unwrap();

    let mut logger = Logger::open(&path, fast_config()).unwrap();
    logger.log_text(Level::Info, "fresh").unwrap();
    logger.close().unwrap();

    let logger = Logger::open(&path, fast_config()).unwrap();
    assert_eq!(logger.log_len("text_logs/info").unwrap(), 1);
}

#[test]
fn test_corrupted_container_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.tlm");
    let mut logger = Logger::open(&path, fast_config()).unwrap();
    logger.close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(20);
    fs::write(&path, &bytes).unwrap();

    let err = Logger::open(&path, fast_config()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageBackend);
    assert!(Logger::init(&path).is_none());
}

#[test]
fn test_no_handles_leak_after_failures() {
    let dir = tempdir().unwrap();
    let mut logger =
        Logger::open_with_clock(dir.path().join("t.tlm"), fast_config(), ManualClock::new(0.0))
            .unwrap();

    logger.log_text_to_group("sensors", Level::Info, "ok").unwrap();
    logger.log_array_1d("sensors", "readings", &[1.0f32, 2.0]).unwrap();

    // Each of these fails somewhere in the middle of its work.
    assert!(logger.log_text_to_group("", Level::Info, "x").is_err());
    assert!(logger.log_text_to_group("sensors/readings/deeper", Level::Info, "x").is_err());
    assert!(logger.log_image("images", "bad", &[0; 5], 2, 2, 1).is_err());
    assert!(logger.log_image("images", "bad", &[0; 4], 2, 2, 5).is_err());
    assert!(logger.add_attribute("nowhere", "k", 1.0).is_err());
    assert!(logger.read_array::<f64>("sensors", "readings").is_err());
    assert!(logger.read_image("sensors", "missing").is_err());
    assert!(logger.set_time_limit("sensors", -1.0).is_err());

    assert_eq!(logger.open_handles().unwrap(), 0);
    logger.close().unwrap();
}
