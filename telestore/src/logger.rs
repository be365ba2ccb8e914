//! The telemetry logger.
//!
//! A [`Logger`] owns one container file for its whole lifetime. It routes
//! text, arrays, images and metadata to namespaces inside the container and
//! applies each namespace's retention policy to its log stream.
//!
//! # Lifecycle
//!
//! ```text
//! Logger::init / Logger::open ──► Open ──close()──► Closed
//! ```
//!
//! Every operation on a closed logger fails with
//! [`StateError::Closed`](crate::error::StateError::Closed); a second
//! `close` fails with [`StateError::AlreadyClosed`](crate::error::StateError::AlreadyClosed).
//! Dropping an open logger flushes it.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use telestore::{Level, Logger};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut logger = Logger::init("telemetry.tlm").ok_or("cannot open container")?;
//!
//! logger.set_size_limit("text_logs/errors", 1000)?;
//! logger.log_text(Level::Error, "sensor 3 stopped responding")?;
//! logger.log_array_1d("numeric_data", "temperatures", &[21.5f32, 21.7, 22.0])?;
//! logger.add_attribute("numeric_data/temperatures", "unit", "celsius")?;
//!
//! logger.close()?;
//! # Ok(())
//! # }
//! ```

use std::mem;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::attribute;
use crate::clock::{Clock, SystemClock};
use crate::config::LoggerConfig;
use crate::container::{AttributeValue, Container, DatasetSpec};
use crate::dataset::{self, ArrayData, ArrayElement, Image};
use crate::error::{ArgumentError, Result, StateError};
use crate::level::{Level, default_namespace_for_code};
use crate::namespace::{self, NamespacePath};
use crate::retention::{self, LogEntry, RetentionPolicy};

/// Namespaces created when a logger opens its container.
pub const TOP_LEVEL_NAMESPACES: [&str; 3] = ["text_logs", "numeric_data", "images"];

/// Handle to an open telemetry container.
///
/// # Thread Safety
///
/// A logger can move between threads but is not `Sync`. Callers sharing one
/// across threads must serialize access themselves.
#[derive(Debug)]
pub struct Logger {
    /// Path of the container file.
    filename: PathBuf,
    config: LoggerConfig,
    clock: Box<dyn Clock>,
    state: State,
    /// Successful mutating calls since the last flush.
    unflushed_writes: u32,
}

#[derive(Debug)]
enum State {
    Open(Container),
    Closed,
}

impl Logger {
    /// Opens or creates the container at `filename` with the default
    /// configuration.
    ///
    /// Returns `None` if `filename` is empty or the container cannot be
    /// opened or created. Use [`Logger::open`] to get the error instead.
    pub fn init<P: AsRef<Path>>(filename: P) -> Option<Self> {
        Self::open(filename, LoggerConfig::default()).ok()
    }

    /// Opens or creates the container at `filename`.
    ///
    /// A missing file, or a file that is not a container, is replaced by a
    /// new container. The namespaces in [`TOP_LEVEL_NAMESPACES`] are created
    /// if missing and the container is written before returning.
    ///
    /// # Errors
    ///
    /// - [`ArgumentError::EmptyPath`] if `filename` is empty
    /// - [`ArgumentError::InvalidConfig`] if `config` fails validation
    /// - a container error if the file cannot be read, created or written
    pub fn open<P: AsRef<Path>>(filename: P, config: LoggerConfig) -> Result<Self> {
        Self::open_with_clock(filename, config, SystemClock)
    }

    /// Like [`Logger::open`], but timestamps come from `clock`.
    ///
    /// # Errors
    ///
    /// See [`Logger::open`].
    pub fn open_with_clock<P, C>(filename: P, config: LoggerConfig, clock: C) -> Result<Self>
    where
        P: AsRef<Path>,
        C: Clock + 'static,
    {
        let filename = filename.as_ref().to_path_buf();
        if filename.as_os_str().is_empty() {
            return Err(ArgumentError::EmptyPath.into());
        }
        config.validate()?;

        let container = Container::create_or_open(&filename, config.sync_on_flush)?;
        for name in TOP_LEVEL_NAMESPACES {
            namespace::ensure(&container, &NamespacePath::parse(name)?)?;
        }
        container.flush()?;
        debug!(path = %filename.display(), "logger opened");

        Ok(Self {
            filename,
            config,
            clock: Box::new(clock),
            state: State::Open(container),
            unflushed_writes: 0,
        })
    }

    /// Returns the path of the container file.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Returns true until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    /// Returns the number of container handles currently alive.
    ///
    /// Between calls this is always zero.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed.
    pub fn open_handles(&self) -> Result<usize> {
        Ok(self.container("open_handles")?.open_handles())
    }

    /// Appends `message` to the default namespace of `level`.
    ///
    /// # Errors
    ///
    /// See [`log_text_to_group`](Self::log_text_to_group).
    pub fn log_text(&mut self, level: Level, message: &str) -> Result<()> {
        self.append(level.default_namespace(), level.code(), message, "log_text")
    }

    /// Appends `message` with a raw level code.
    ///
    /// Codes that are not a [`Level`] go to `text_logs/unknown`.
    ///
    /// # Errors
    ///
    /// See [`log_text_to_group`](Self::log_text_to_group).
    pub fn log_text_code(&mut self, code: i32, message: &str) -> Result<()> {
        self.append(default_namespace_for_code(code), code, message, "log_text_code")
    }

    /// Appends `message` to the log stream of the namespace at `path`.
    ///
    /// The namespace is created if needed and its retention policy applied.
    /// Messages longer than 1023 bytes are truncated.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - [`ArgumentError::EmptyPath`] if `path` is empty
    /// - [`TelestoreError::ResourceExhausted`](crate::TelestoreError::ResourceExhausted)
    ///   if eviction cannot allocate its buffer
    /// - a container error if the stream cannot be written
    pub fn log_text_to_group(&mut self, path: &str, level: Level, message: &str) -> Result<()> {
        self.append(path, level.code(), message, "log_text_to_group")
    }

    fn append(&mut self, path: &str, code: i32, message: &str, operation: &'static str) -> Result<()> {
        self.mutate(operation, |container, now| {
            let namespace = NamespacePath::parse(path)?;
            retention::append_log_entry(container, &namespace, code, message, now).map(|_| ())
        })
    }

    /// Stores `data` as a one-dimensional array.
    ///
    /// # Errors
    ///
    /// See [`log_array`](Self::log_array).
    pub fn log_array_1d<T: ArrayElement>(&mut self, path: &str, name: &str, data: &[T]) -> Result<()> {
        self.log_array(path, name, data, &[data.len() as u64])
    }

    /// Stores `data` as a `rows` x `cols` array in row-major order.
    ///
    /// # Errors
    ///
    /// See [`log_array`](Self::log_array).
    pub fn log_array_2d<T: ArrayElement>(
        &mut self,
        path: &str,
        name: &str,
        data: &[T],
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        self.log_array(path, name, data, &[rows as u64, cols as u64])
    }

    /// Stores `data` as a `dim1` x `dim2` x `dim3` array in row-major order.
    ///
    /// # Errors
    ///
    /// See [`log_array`](Self::log_array).
    pub fn log_array_3d<T: ArrayElement>(
        &mut self,
        path: &str,
        name: &str,
        data: &[T],
        dim1: usize,
        dim2: usize,
        dim3: usize,
    ) -> Result<()> {
        self.log_array(path, name, data, &[dim1 as u64, dim2 as u64, dim3 as u64])
    }

    /// Stores `data` with the given `shape` as the dataset `name` in the
    /// namespace at `path`, replacing any dataset of that name.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - an [`ArgumentError`] for an empty path, a rank outside 1 to 3, a
    ///   zero dimension or a length mismatch, before anything is written
    /// - a container error if the dataset cannot be written
    pub fn log_array<T: ArrayElement>(
        &mut self,
        path: &str,
        name: &str,
        data: &[T],
        shape: &[u64],
    ) -> Result<()> {
        self.mutate("log_array", |container, now| {
            let namespace = NamespacePath::parse(path)?;
            dataset::write_array(container, &namespace, name, data, shape, now)
        })
    }

    /// Stores an 8-bit image as the dataset `name` in the namespace at `path`.
    ///
    /// `pixels` is row-major `(height, width, channels)`.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - an [`ArgumentError`] for an empty path, a channel count outside 1
    ///   to 4, a zero width or height, or a wrong pixel count; nothing is
    ///   written
    /// - a container error if the dataset cannot be written
    pub fn log_image(
        &mut self,
        path: &str,
        name: &str,
        pixels: &[u8],
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<()> {
        self.mutate("log_image", |container, now| {
            let namespace = NamespacePath::parse(path)?;
            dataset::write_image(
                container,
                &namespace,
                name,
                pixels,
                width as u64,
                height as u64,
                channels as u64,
                now,
            )
        })
    }

    /// Caps the log stream of the namespace at `path` to `max_entries`
    /// records.
    ///
    /// A cap of zero keeps only the latest record.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - [`ArgumentError::EmptyPath`] if `path` is empty
    /// - a container error if the namespace cannot be created
    pub fn set_size_limit(&mut self, path: &str, max_entries: u64) -> Result<()> {
        self.mutate("set_size_limit", |container, _| {
            retention::set_max_entries(container, &NamespacePath::parse(path)?, max_entries)
        })
    }

    /// Resets the log stream of the namespace at `path` whenever its oldest
    /// record is more than `max_age_seconds` old at append time.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - [`ArgumentError::InvalidTimeLimit`] if the limit is negative or NaN
    /// - a container error if the namespace cannot be created
    pub fn set_time_limit(&mut self, path: &str, max_age_seconds: f64) -> Result<()> {
        self.mutate("set_time_limit", |container, _| {
            retention::set_max_age(container, &NamespacePath::parse(path)?, max_age_seconds)
        })
    }

    /// Sets the attribute `name` on the namespace or dataset at `path`.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - [`TelestoreError::NotFound`](crate::TelestoreError::NotFound) if
    ///   nothing lives at `path`
    pub fn add_attribute(
        &mut self,
        path: &str,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<()> {
        let value = value.into();
        self.mutate("add_attribute", |container, _| {
            attribute::set_attribute(container, &NamespacePath::parse(path)?, name, value)
        })
    }

    /// Writes pending changes to the container file.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if the logger is closed
    /// - a container error if the file cannot be written
    pub fn flush(&mut self) -> Result<()> {
        self.container("flush")?.flush()?;
        self.unflushed_writes = 0;
        Ok(())
    }

    /// Flushes and closes the container.
    ///
    /// The logger is closed afterwards even if the final flush fails.
    ///
    /// # Errors
    ///
    /// - [`StateError::AlreadyClosed`] on a second call
    /// - a container error if the final flush fails
    pub fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Open(container) => {
                self.unflushed_writes = 0;
                container.flush()?;
                debug!(path = %self.filename.display(), "logger closed");
                Ok(())
            }
            State::Closed => Err(StateError::AlreadyClosed.into()),
        }
    }

    /// Reads the log stream of the namespace at `path`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed or a container
    /// error if the namespace does not exist.
    pub fn read_log_entries(&self, path: &str) -> Result<Vec<LogEntry>> {
        let container = self.container("read_log_entries")?;
        retention::read_log_entries(container, &NamespacePath::parse(path)?)
    }

    /// Returns the number of records in the log stream at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed or a container
    /// error if the namespace does not exist.
    pub fn log_len(&self, path: &str) -> Result<u64> {
        let container = self.container("log_len")?;
        retention::log_len(container, &NamespacePath::parse(path)?)
    }

    /// Returns the retention policy of the namespace at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed or a container
    /// error if the namespace does not exist.
    pub fn retention_policy(&self, path: &str) -> Result<RetentionPolicy> {
        let container = self.container("retention_policy")?;
        retention::policy(container, &NamespacePath::parse(path)?)
    }

    /// Reads the array `name` from the namespace at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed, or a container
    /// error if the array does not exist or stores another element type.
    pub fn read_array<T: ArrayElement>(&self, path: &str, name: &str) -> Result<ArrayData<T>> {
        let container = self.container("read_array")?;
        dataset::read_array(container, &NamespacePath::parse(path)?, name)
    }

    /// Reads the image `name` from the namespace at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed, or a container
    /// error if the image does not exist.
    pub fn read_image(&self, path: &str, name: &str) -> Result<Image> {
        let container = self.container("read_image")?;
        dataset::read_image(container, &NamespacePath::parse(path)?, name)
    }

    /// Returns the shape, type and layout of the dataset `name` at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed, or a container
    /// error if the dataset does not exist.
    pub fn dataset_spec(&self, path: &str, name: &str) -> Result<DatasetSpec> {
        let container = self.container("dataset_spec")?;
        dataset::dataset_spec(container, &NamespacePath::parse(path)?, name)
    }

    /// Reads the attribute `name` of the namespace or dataset at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] if the logger is closed or
    /// [`TelestoreError::NotFound`](crate::TelestoreError::NotFound) if
    /// nothing lives at `path`.
    pub fn attribute(&self, path: &str, name: &str) -> Result<Option<AttributeValue>> {
        let container = self.container("attribute")?;
        attribute::get_attribute(container, &NamespacePath::parse(path)?, name)
    }

    fn container(&self, operation: &'static str) -> Result<&Container> {
        match &self.state {
            State::Open(container) => Ok(container),
            State::Closed => Err(StateError::Closed { operation }.into()),
        }
    }

    /// Runs a mutating operation, then flushes if the policy says so.
    fn mutate<R>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&Container, f64) -> Result<R>,
    ) -> Result<R> {
        let now = self.clock.now();
        let result = f(self.container(operation)?, now)?;
        self.unflushed_writes = self.unflushed_writes.saturating_add(1);
        if self.config.flush_due(self.unflushed_writes) {
            self.flush()?;
        }
        Ok(result)
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let State::Open(container) = &self.state
            && let Err(e) = container.flush()
        {
            warn!(path = %self.filename.display(), error = %e, "failed to flush container on drop");
        }
    }
}
