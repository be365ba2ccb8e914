//! # telestore
//!
//! Structured telemetry store in a single container file.
//!
//! telestore persists text log lines, numeric arrays, images and metadata
//! under a hierarchical namespace, and enforces per-namespace retention
//! limits on the log stream of each namespace.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One file holds everything; writes are persisted atomically
//! - Namespaces are created lazily, parents included
//! - Log streams can be capped by entry count and by age
//! - Larger arrays and all images are chunked and deflate-compressed
//! - Synchronous and single-threaded; no background work
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use telestore::{Level, Logger};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut logger = Logger::init("./telemetry.tlm").ok_or("cannot open container")?;
//!
//! // Keep at most 500 warnings, none older than an hour
//! logger.set_size_limit("text_logs/warnings", 500)?;
//! logger.set_time_limit("text_logs/warnings", 3600.0)?;
//! logger.log_text(Level::Warning, "fan speed above threshold")?;
//!
//! // A 2x3 matrix and a grayscale image
//! logger.log_array_2d("numeric_data/imu", "covariance", &[1.0f64, 0.0, 0.0, 0.0, 1.0, 0.0], 2, 3)?;
//! logger.log_image("images/cam0", "frame_0001", &[0u8; 64 * 48], 64, 48, 1)?;
//!
//! // Read back
//! for entry in logger.read_log_entries("text_logs/warnings")? {
//!     println!("{} {}", entry.timestamp, entry.message);
//! }
//!
//! logger.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Logger`] — Owns the container; every public operation goes through it
//! - [`Level`] — Log severity and its default namespace
//! - [`LoggerConfig`] — Flush policy and durability settings
//! - [`RetentionPolicy`] — Entry and age limits of a namespace
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`logger`] — Logger lifecycle and operations
//! - [`retention`] — Log streams and eviction
//! - [`dataset`] — Typed arrays and images, layout selection
//! - [`attribute`] — Metadata on namespaces and datasets
//! - [`namespace`] — Path normalization and lazy namespace creation
//! - [`container`] — The single-file hierarchical storage backend
//! - [`config`] — Logger configuration
//! - [`clock`] — Time sources
//! - [`level`] — Log levels
//! - [`error`] — Error types

pub mod attribute;
pub mod clock;
pub mod config;
pub mod container;
pub mod dataset;
pub mod error;
pub mod level;
pub mod logger;
pub mod namespace;
pub mod retention;

// Re-export primary API types at crate root for convenience.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FlushPolicy, LoggerConfig};
pub use container::AttributeValue;
pub use dataset::{ArrayData, ArrayElement, Element, Image};
pub use error::{ErrorKind, Result, TelestoreError};
pub use level::Level;
pub use logger::Logger;
pub use retention::{AppendOutcome, LogEntry, RetentionPolicy};

/// Returns the library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
