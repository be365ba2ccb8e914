//! Error types for the telestore telemetry store.

use std::collections::TryReserveError;

use thiserror::Error;

/// The main error type for all telestore operations.
///
/// Every failure is returned as a value; nothing in the crate panics on bad
/// input. Use [`TelestoreError::kind`] to classify an error without matching
/// on the nested variants.
#[derive(Error, Debug)]
pub enum TelestoreError {
    /// A caller-supplied argument was rejected before any write happened.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),

    /// The operation is not allowed in the logger's current state.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The path given as an attribute target names neither a namespace nor a
    /// dataset.
    #[error("no namespace or dataset at '{path}'")]
    NotFound {
        /// The path that could not be resolved.
        path: String,
    },

    /// The container backend failed to create, open, read, write or delete.
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// The eviction shift buffer could not be allocated.
    #[error("cannot allocate eviction buffer for {records} records: {source}")]
    ResourceExhausted {
        /// Number of records the buffer had to hold.
        records: u64,
        /// The allocator failure.
        #[source]
        source: TryReserveError,
    },
}

/// Coarse classification of a [`TelestoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Empty path, zero-sized shape, bad channel count and the like.
    InvalidArgument,
    /// Operation outside the open state, or a second close.
    State,
    /// Attribute target does not exist.
    NotFound,
    /// Any underlying create/open/read/write/delete failure.
    StorageBackend,
    /// Allocation failure.
    ResourceExhaustion,
}

impl TelestoreError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::State(_) => ErrorKind::State,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Container(_) => ErrorKind::StorageBackend,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhaustion,
        }
    }
}

/// Arguments rejected by validation.
#[derive(Error, Debug)]
pub enum ArgumentError {
    /// A namespace path was empty.
    #[error("path must not be empty")]
    EmptyPath,

    /// A dataset or attribute name is unusable.
    #[error("invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An array rank outside 1..=3.
    #[error("array rank {rank} is not supported (expected 1 to 3)")]
    InvalidRank {
        /// The requested rank.
        rank: usize,
    },

    /// A shape with at least one zero-length axis.
    #[error("shape {shape:?} has a zero dimension")]
    ZeroDimension {
        /// The offending shape.
        shape: Vec<u64>,
    },

    /// The number of supplied elements does not match the shape.
    #[error("data holds {actual} elements but shape requires {expected}")]
    DataLengthMismatch {
        /// Elements implied by the shape.
        expected: u64,
        /// Elements actually supplied.
        actual: u64,
    },

    /// An image channel count outside 1..=4.
    #[error("image channel count {channels} is out of range (expected 1 to 4)")]
    InvalidChannels {
        /// The rejected channel count.
        channels: u64,
    },

    /// An image with zero width or height.
    #[error("image size {width}x{height} is empty")]
    EmptyImage {
        /// Image width in pixels.
        width: u64,
        /// Image height in pixels.
        height: u64,
    },

    /// A negative or NaN age limit.
    #[error("time limit {seconds} must be a non-negative number of seconds")]
    InvalidTimeLimit {
        /// The rejected value.
        seconds: f64,
    },

    /// A logger configuration failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },
}

/// Lifecycle violations on a [`Logger`](crate::Logger).
#[derive(Error, Debug)]
pub enum StateError {
    /// The logger has been closed.
    #[error("logger is closed; '{operation}' is not allowed")]
    Closed {
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// `close` was called on a logger that is already closed.
    #[error("logger is already closed")]
    AlreadyClosed,
}

/// Errors raised by the container backend.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The container file could not be created or opened.
    #[error("failed to access container '{path}': {source}")]
    Access {
        /// The container file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping the container file failed.
    #[error("memory mapping failed for container '{path}': {source}")]
    MemoryMap {
        /// The container file path.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the container file failed.
    #[error("failed to write container '{path}': {source}")]
    WriteFailed {
        /// The file being written.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The container starts with the magic bytes but is otherwise invalid.
    #[error("container '{path}' is corrupted: {reason}")]
    CorruptedContainer {
        /// The container file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// The index could not be encoded or decoded.
    #[error("container index serialization failed: {0}")]
    IndexSerialize(#[from] serde_json::Error),

    /// A chunk failed to compress.
    #[error("failed to compress chunk of '{dataset}': {source}")]
    Compression {
        /// Path of the dataset owning the chunk.
        dataset: String,
        /// The underlying I/O error from the encoder.
        #[source]
        source: std::io::Error,
    },

    /// A chunk failed to decompress.
    #[error("failed to decompress chunk of '{dataset}': {source}")]
    Decompression {
        /// Path of the dataset owning the chunk.
        dataset: String,
        /// The underlying I/O error from the decoder.
        #[source]
        source: std::io::Error,
    },

    /// An object already exists where one was to be created.
    #[error("object already exists at '{path}'")]
    AlreadyExists {
        /// The conflicting path.
        path: String,
    },

    /// No group exists at the path.
    #[error("no group at '{path}'")]
    NoSuchGroup {
        /// The missing group path.
        path: String,
    },

    /// No dataset exists at the path.
    #[error("no dataset at '{path}'")]
    NoSuchDataset {
        /// The missing dataset path.
        path: String,
    },

    /// A dataset description is not usable.
    #[error("invalid dataset layout for '{path}': {reason}")]
    InvalidLayout {
        /// The dataset path.
        path: String,
        /// What is wrong with the layout.
        reason: String,
    },

    /// The dataset has a fixed extent and cannot be resized.
    #[error("dataset '{path}' has a fixed extent")]
    NotExtendable {
        /// The dataset path.
        path: String,
    },

    /// A row range reaches past the end of the dataset.
    #[error("rows {start}..{end} are out of bounds for '{path}' with {len} rows")]
    OutOfBounds {
        /// The dataset path.
        path: String,
        /// First requested row.
        start: u64,
        /// One past the last requested row.
        end: u64,
        /// Current number of rows.
        len: u64,
    },

    /// A buffer does not hold a whole number of rows of the right size.
    #[error("buffer of {actual} bytes does not match {expected} bytes expected for '{path}'")]
    BufferSize {
        /// The dataset path.
        path: String,
        /// Expected byte count.
        expected: u64,
        /// Actual byte count.
        actual: u64,
    },

    /// The stored element type differs from the requested one.
    #[error("dataset '{path}' stores {found} elements, not {expected}")]
    TypeMismatch {
        /// The dataset path.
        path: String,
        /// The requested element type.
        expected: &'static str,
        /// The stored element type.
        found: &'static str,
    },
}

/// Type alias for `Result<T, TelestoreError>`.
pub type Result<T> = std::result::Result<T, TelestoreError>;
