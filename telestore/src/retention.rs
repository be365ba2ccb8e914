//! Append-only log streams and their retention policies.
//!
//! Every namespace can hold one log stream, the dataset `log_entries`. A
//! namespace may cap the stream by entry count (`max_entries`) and by the age
//! of its oldest record (`max_time_seconds`); both are stored as namespace
//! attributes and read again on every append.
//!
//! # Append Algorithm
//!
//! 1. The namespace and stream are created if missing.
//! 2. Size step: when the stream already holds `max_entries` records, every
//!    record moves down one slot and the last slot is reused. Otherwise the
//!    stream grows by one.
//! 3. Age step: when the stream was not empty and its first record is older
//!    than `max_time_seconds`, the whole stream is dropped and recreated with
//!    a single slot.
//! 4. The new record is written to the last slot.
//!
//! The age step discards every record, not only the expired ones.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attribute;
use crate::dataset;
use crate::container::{
    AttributeTarget, AttributeValue, Container, DatasetHandle, DatasetSpec, ElementType,
    GroupHandle, LOG_RECORD_BYTES, Layout, MaxExtent,
};
use crate::error::{ArgumentError, Result, TelestoreError};
use crate::level::Level;
use crate::namespace::{self, NamespacePath};

/// Name of the log stream dataset inside a namespace.
pub const LOG_DATASET: &str = "log_entries";

/// Records per chunk of a log stream.
pub const LOG_CHUNK_RECORDS: u64 = 64;

/// Longest message kept, in bytes. Longer messages are cut silently.
pub const MAX_MESSAGE_BYTES: usize = 1023;

/// Namespace attribute holding the entry cap.
pub const MAX_ENTRIES_ATTR: &str = "max_entries";

/// Namespace attribute holding the age limit in seconds.
pub const MAX_AGE_ATTR: &str = "max_time_seconds";

const LEVEL_RANGE: Range<usize> = 0..4;
const TIMESTAMP_RANGE: Range<usize> = 4..12;
const MESSAGE_OFFSET: usize = 12;

const _: () = assert!(MESSAGE_OFFSET + MAX_MESSAGE_BYTES + 1 == LOG_RECORD_BYTES);

/// Retention limits of one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum number of records in the log stream.
    pub max_entries: Option<u64>,
    /// Maximum age of the oldest record, in seconds.
    pub max_age_seconds: Option<f64>,
}

impl RetentionPolicy {
    /// Reads the policy from the attributes of a namespace.
    ///
    /// Attributes of an unusable type are ignored.
    ///
    /// # Errors
    ///
    /// Returns a container error if the namespace no longer exists.
    pub fn load(group: &GroupHandle<'_>) -> Result<Self> {
        Ok(Self {
            max_entries: group.attribute(MAX_ENTRIES_ATTR)?.as_ref().and_then(entry_cap),
            max_age_seconds: group
                .attribute(MAX_AGE_ATTR)?
                .as_ref()
                .and_then(AttributeValue::as_f64),
        })
    }
}

/// Accepts a float cap overwritten through the generic attribute API.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // checked non-negative
fn entry_cap(value: &AttributeValue) -> Option<u64> {
    match value {
        AttributeValue::UInt(n) => Some(*n),
        AttributeValue::Float(f) if f.is_finite() && *f >= 0.0 => Some(*f as u64),
        _ => None,
    }
}

/// One record of a log stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Raw level code.
    pub level: i32,
    /// Seconds since the Unix epoch when the record was appended.
    pub timestamp: f64,
    /// The message, at most [`MAX_MESSAGE_BYTES`] bytes.
    pub message: String,
}

impl LogEntry {
    /// Returns the level, if the code is a known one.
    pub fn level(&self) -> Option<Level> {
        Level::try_from(self.level).ok()
    }

    fn encode(level: i32, timestamp: f64, message: &str) -> Vec<u8> {
        let mut record = vec![0u8; LOG_RECORD_BYTES];
        record[LEVEL_RANGE].copy_from_slice(&level.to_le_bytes());
        record[TIMESTAMP_RANGE].copy_from_slice(&timestamp.to_le_bytes());
        let bytes = message.as_bytes();
        let kept = bytes.len().min(MAX_MESSAGE_BYTES);
        record[MESSAGE_OFFSET..MESSAGE_OFFSET + kept].copy_from_slice(&bytes[..kept]);
        record
    }

    /// Decodes one packed record. The message ends at its first NUL byte.
    fn decode(record: &[u8]) -> Self {
        let mut level = [0u8; 4];
        level.copy_from_slice(&record[LEVEL_RANGE]);
        let field = &record[MESSAGE_OFFSET..];
        let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
        Self {
            level: i32::from_le_bytes(level),
            timestamp: record_timestamp(record),
            message: String::from_utf8_lossy(&field[..end]).into_owned(),
        }
    }
}

fn record_timestamp(record: &[u8]) -> f64 {
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&record[TIMESTAMP_RANGE]);
    f64::from_le_bytes(timestamp)
}

/// What an append did to the existing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The stream grew by one record.
    Appended,
    /// The oldest record was dropped to stay within `max_entries`.
    EvictedOldest,
    /// The oldest record was too old; the stream now holds only the new one.
    Reset,
}

/// Spec of an empty log stream.
pub fn log_stream_spec() -> DatasetSpec {
    DatasetSpec {
        element_type: ElementType::LogRecord,
        shape: vec![0],
        max_extent: MaxExtent::Unlimited,
        layout: Layout::Chunked {
            chunk: vec![LOG_CHUNK_RECORDS],
            compression: None,
        },
    }
}

/// Sets the entry cap of `namespace`, creating the namespace if needed.
///
/// # Errors
///
/// Returns a container error if the namespace cannot be created.
pub fn set_max_entries(container: &Container, namespace: &NamespacePath, max: u64) -> Result<()> {
    let group = namespace::ensure(container, namespace)?;
    attribute::replace(&group, MAX_ENTRIES_ATTR, AttributeValue::UInt(max))
}

/// Sets the age limit of `namespace`, creating the namespace if needed.
///
/// # Errors
///
/// - [`ArgumentError::InvalidTimeLimit`] if `seconds` is negative or NaN
/// - a container error if the namespace cannot be created
pub fn set_max_age(container: &Container, namespace: &NamespacePath, seconds: f64) -> Result<()> {
    if seconds.is_nan() || seconds < 0.0 {
        return Err(ArgumentError::InvalidTimeLimit { seconds }.into());
    }
    let group = namespace::ensure(container, namespace)?;
    attribute::replace(&group, MAX_AGE_ATTR, AttributeValue::Float(seconds))
}

/// Returns the retention policy of an existing namespace.
///
/// # Errors
///
/// Returns a container error if the namespace does not exist.
pub fn policy(container: &Container, namespace: &NamespacePath) -> Result<RetentionPolicy> {
    RetentionPolicy::load(&container.open_group(namespace.as_str())?)
}

/// Appends a record to the log stream of `namespace`, applying its
/// retention policy.
///
/// # Errors
///
/// - [`TelestoreError::ResourceExhausted`] if the eviction buffer cannot be
///   allocated
/// - [`ContainerError::TypeMismatch`](crate::error::ContainerError::TypeMismatch)
///   if `log_entries` is not a log stream; nothing is modified
/// - a container error if the namespace or stream cannot be written
pub fn append_log_entry(
    container: &Container,
    namespace: &NamespacePath,
    level: i32,
    message: &str,
    now: f64,
) -> Result<AppendOutcome> {
    let group = namespace::ensure(container, namespace)?;
    let dataset = open_or_create_stream(&group)?;
    let policy = RetentionPolicy::load(&group)?;
    let count = dataset.len()?;

    let (mut len, mut outcome) = match policy.max_entries {
        Some(max) if count > 0 && count >= max => {
            evict_oldest(&dataset, count)?;
            info!(
                namespace = %namespace,
                max_entries = max,
                records = count,
                "log stream full, evicted oldest entry"
            );
            (count, AppendOutcome::EvictedOldest)
        }
        _ => {
            dataset.extend(count + 1)?;
            (count + 1, AppendOutcome::Appended)
        }
    };

    let dataset = match policy.max_age_seconds {
        Some(max_age) if count > 0 => {
            let age = now - record_timestamp(&dataset.read_rows(0, 1)?);
            if age > max_age {
                drop(dataset);
                group.delete_dataset(LOG_DATASET)?;
                let fresh = group.create_dataset(LOG_DATASET, log_stream_spec())?;
                fresh.extend(1)?;
                info!(
                    namespace = %namespace,
                    max_age_seconds = max_age,
                    age,
                    dropped = count,
                    "oldest log entry expired, stream reset"
                );
                len = 1;
                outcome = AppendOutcome::Reset;
                fresh
            } else {
                dataset
            }
        }
        _ => dataset,
    };

    dataset.write_rows(len - 1, &LogEntry::encode(level, now, message))?;
    Ok(outcome)
}

/// Reads every record of the log stream of `namespace`, oldest first.
///
/// A namespace without a stream yields no records.
///
/// # Errors
///
/// Returns a container error if the namespace does not exist.
pub fn read_log_entries(container: &Container, namespace: &NamespacePath) -> Result<Vec<LogEntry>> {
    let group = container.open_group(namespace.as_str())?;
    let Some(dataset) = open_stream(&group)? else {
        return Ok(Vec::new());
    };
    let bytes = dataset.read_all()?;
    Ok(bytes
        .chunks_exact(LOG_RECORD_BYTES)
        .map(LogEntry::decode)
        .collect())
}

/// Returns the number of records in the log stream of `namespace`.
///
/// # Errors
///
/// Returns a container error if the namespace does not exist.
pub fn log_len(container: &Container, namespace: &NamespacePath) -> Result<u64> {
    let group = container.open_group(namespace.as_str())?;
    match open_stream(&group)? {
        Some(dataset) => dataset.len(),
        None => Ok(0),
    }
}

/// Opens the log stream of `group` if it has one.
///
/// A `log_entries` dataset of another element type is a
/// [`ContainerError::TypeMismatch`](crate::error::ContainerError::TypeMismatch).
fn open_stream<'c>(group: &GroupHandle<'c>) -> Result<Option<DatasetHandle<'c>>> {
    if !group.dataset_exists(LOG_DATASET) {
        return Ok(None);
    }
    let dataset = group.open_dataset(LOG_DATASET)?;
    dataset::typed_spec(&dataset, ElementType::LogRecord)?;
    Ok(Some(dataset))
}

fn open_or_create_stream<'c>(group: &GroupHandle<'c>) -> Result<DatasetHandle<'c>> {
    if let Some(dataset) = open_stream(group)? {
        return Ok(dataset);
    }
    debug!(namespace = group.path(), "creating log stream");
    group.create_dataset(LOG_DATASET, log_stream_spec())
}

/// Moves records `1..count` to `0..count - 1`, leaving the length unchanged.
fn evict_oldest(dataset: &DatasetHandle<'_>, count: u64) -> Result<()> {
    let survivors = count - 1;
    if survivors == 0 {
        return Ok(());
    }

    let bytes = usize::try_from(survivors)
        .unwrap_or(usize::MAX)
        .saturating_mul(LOG_RECORD_BYTES);
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|source| TelestoreError::ResourceExhausted {
            records: survivors,
            source,
        })?;

    dataset.read_rows_into(1, survivors, &mut buffer)?;
    dataset.write_rows(0, &buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn ns(p: &str) -> NamespacePath {
        NamespacePath::parse(p).unwrap()
    }

    fn messages(container: &Container, namespace: &NamespacePath) -> Vec<String> {
        read_log_entries(container, namespace)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_record_encoding() {
        let record = LogEntry::encode(3, 1234.5, "disk full");
        assert_eq!(record.len(), LOG_RECORD_BYTES);
        let entry = LogEntry::decode(&record);
        assert_eq!(entry.level, 3);
        assert_eq!(entry.level(), Some(Level::Error));
        assert_eq!(entry.timestamp, 1234.5);
        assert_eq!(entry.message, "disk full");
        assert_eq!(record[LOG_RECORD_BYTES - 1], 0);
    }

    #[test]
    fn test_long_message_truncated() {
        let long = "x".repeat(2000);
        let record = LogEntry::encode(1, 0.0, &long);
        assert_eq!(record.len(), LOG_RECORD_BYTES);
        assert_eq!(LogEntry::decode(&record).message.len(), MAX_MESSAGE_BYTES);
    }

    #[test]
    fn test_append_without_policy_grows() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("text_logs/info");

        for i in 0..3 {
            let outcome = append_log_entry(&container, &target, 1, &format!("m{i}"), 10.0).unwrap();
            assert_eq!(outcome, AppendOutcome::Appended);
        }
        assert_eq!(messages(&container, &target), vec!["m0", "m1", "m2"]);
        assert_eq!(log_len(&container, &target).unwrap(), 3);
        assert_eq!(container.open_handles(), 0);
    }

    #[test]
    fn test_size_limit_keeps_latest() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("limited");
        set_max_entries(&container, &target, 5).unwrap();

        for i in 0..10 {
            append_log_entry(&container, &target, 1, &format!("Message {i}"), 0.0).unwrap();
        }

        let expected: Vec<String> = (5..10).map(|i| format!("Message {i}")).collect();
        assert_eq!(messages(&container, &target), expected);
        assert_eq!(container.open_handles(), 0);
    }

    #[test]
    fn test_single_entry_cap_overwrites() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("one");
        set_max_entries(&container, &target, 1).unwrap();

        assert_eq!(
            append_log_entry(&container, &target, 0, "a", 0.0).unwrap(),
            AppendOutcome::Appended
        );
        assert_eq!(
            append_log_entry(&container, &target, 0, "b", 0.0).unwrap(),
            AppendOutcome::EvictedOldest
        );
        assert_eq!(messages(&container, &target), vec!["b"]);
    }

    #[test]
    fn test_zero_cap_behaves_like_one() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("zero");
        set_max_entries(&container, &target, 0).unwrap();

        append_log_entry(&container, &target, 0, "a", 0.0).unwrap();
        append_log_entry(&container, &target, 0, "b", 0.0).unwrap();
        assert_eq!(messages(&container, &target), vec!["b"]);
    }

    #[test]
    fn test_lowered_cap_keeps_existing_length() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("lowered");
        for i in 0..4 {
            append_log_entry(&container, &target, 1, &format!("{i}"), 0.0).unwrap();
        }
        set_max_entries(&container, &target, 2).unwrap();
        append_log_entry(&container, &target, 1, "4", 0.0).unwrap();

        assert_eq!(messages(&container, &target), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn test_age_limit_resets_stream() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("aged");
        set_max_age(&container, &target, 2.0).unwrap();

        append_log_entry(&container, &target, 1, "first", 100.0).unwrap();
        append_log_entry(&container, &target, 1, "second", 101.0).unwrap();
        let outcome = append_log_entry(&container, &target, 1, "third", 103.0).unwrap();

        assert_eq!(outcome, AppendOutcome::Reset);
        let entries = read_log_entries(&container, &target).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "third");
        assert_eq!(entries[0].timestamp, 103.0);
        assert_eq!(container.open_handles(), 0);
    }

    #[test]
    fn test_age_exactly_at_limit_is_kept() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("edge");
        set_max_age(&container, &target, 2.0).unwrap();

        append_log_entry(&container, &target, 1, "a", 10.0).unwrap();
        let outcome = append_log_entry(&container, &target, 1, "b", 12.0).unwrap();
        assert_eq!(outcome, AppendOutcome::Appended);
        assert_eq!(log_len(&container, &target).unwrap(), 2);
    }

    #[test]
    fn test_age_checked_after_size_shift() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("both");
        set_max_entries(&container, &target, 2).unwrap();
        set_max_age(&container, &target, 5.0).unwrap();

        append_log_entry(&container, &target, 1, "old", 0.0).unwrap();
        append_log_entry(&container, &target, 1, "mid", 4.0).unwrap();
        // "old" is shifted out first, so the age check sees "mid" (age 5).
        let outcome = append_log_entry(&container, &target, 1, "new", 9.0).unwrap();

        assert_eq!(outcome, AppendOutcome::EvictedOldest);
        assert_eq!(messages(&container, &target), vec!["mid", "new"]);
    }

    #[test]
    fn test_policy_round_trip_and_validation() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("p");

        set_max_entries(&container, &target, 7).unwrap();
        set_max_age(&container, &target, 1.5).unwrap();
        set_max_entries(&container, &target, 9).unwrap();
        assert_eq!(
            policy(&container, &target).unwrap(),
            RetentionPolicy {
                max_entries: Some(9),
                max_age_seconds: Some(1.5),
            }
        );

        for bad in [-1.0, f64::NAN] {
            let err = set_max_age(&container, &target, bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(policy(&container, &target).unwrap().max_age_seconds, Some(1.5));
    }

    #[test]
    fn test_float_cap_accepted() {
        assert_eq!(entry_cap(&AttributeValue::Float(3.0)), Some(3));
        assert_eq!(entry_cap(&AttributeValue::Float(-1.0)), None);
        assert_eq!(entry_cap(&AttributeValue::Text("3".into())), None);
    }

    #[test]
    fn test_foreign_stream_dataset_left_untouched() {
        use crate::dataset::Element;

        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("r.tlm"), false).unwrap();
        let target = ns("ns");
        let values: Vec<f32> = (0..1000u16).map(f32::from).collect();
        {
            let group = namespace::ensure(&container, &target).unwrap();
            let foreign = DatasetSpec {
                element_type: ElementType::F32,
                shape: vec![1000],
                max_extent: MaxExtent::Fixed,
                layout: Layout::Contiguous,
            };
            let dataset = group.create_dataset(LOG_DATASET, foreign).unwrap();
            dataset.write_all(&f32::encode_slice(&values)).unwrap();
        }
        set_max_entries(&container, &target, 5).unwrap();

        let err = append_log_entry(&container, &target, 1, "hello", 1.0).unwrap_err();
        assert!(matches!(
            err,
            TelestoreError::Container(crate::error::ContainerError::TypeMismatch { .. })
        ));
        assert!(read_log_entries(&container, &target).is_err());
        assert!(log_len(&container, &target).is_err());

        let stored: dataset::ArrayData<f32> =
            dataset::read_array(&container, &target, LOG_DATASET).unwrap();
        assert_eq!(stored.shape, vec![1000]);
        assert_eq!(stored.values, values);
        assert_eq!(container.open_handles(), 0);
    }
}
