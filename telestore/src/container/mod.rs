//! Single-file hierarchical container backing the telemetry store.
//!
//! The container is the storage engine the rest of the crate talks to. It
//! holds a tree of groups (namespaces), each owning named datasets and
//! attributes, and persists the whole tree into one file.
//!
//! # Design
//!
//! - The tree lives in memory behind a `RefCell`; every mutation marks the
//!   container dirty and [`Container::flush`] rewrites the file atomically
//! - Groups are addressed by canonical absolute paths (`/`, `/a/b`)
//! - Every group or dataset handed out is an RAII handle counted by the
//!   container, so leaked handles are observable through
//!   [`Container::open_handles`]
//! - Chunked datasets are split and deflate-compressed only when persisted
//!
//! # File Layout
//!
//! ```text
//! [0..4)          Magic bytes "TLMC"
//! [4..8)          Format version (u32 LE)
//! [8..16)         Index length L (u64 LE)
//! [16..16+L)      JSON index: groups, dataset descriptors, attributes, chunk table
//! [16+L..)        Blob region: raw or deflate-compressed chunk payloads
//! ```
//!
//! # Thread Safety
//!
//! A container is `!Sync`. Callers must serialize all access.

mod chunk;
mod format;
mod handle;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ContainerError, Result};

pub use handle::{AttributeTarget, DatasetHandle, GroupHandle};

/// Size in bytes of one packed log record element.
///
/// Layout: `i32` level, `f64` timestamp, then a 1024-byte NUL-padded message.
pub const LOG_RECORD_BYTES: usize = 4 + 8 + 1024;

/// Highest deflate level accepted for chunk compression.
const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Element type stored in a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    /// 32-bit IEEE float, little endian.
    F32,
    /// 64-bit IEEE float, little endian.
    F64,
    /// Unsigned byte.
    U8,
    /// Packed log record of [`LOG_RECORD_BYTES`] bytes.
    LogRecord,
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
            Self::U8 => 1,
            Self::LogRecord => LOG_RECORD_BYTES,
        }
    }

    /// Short name used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::U8 => "u8",
            Self::LogRecord => "log_record",
        }
    }
}

/// Maximum extent of a dataset along its first axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxExtent {
    /// The shape given at creation is final.
    Fixed,
    /// The first axis may grow or shrink through [`DatasetHandle::extend`].
    Unlimited,
}

/// Physical layout of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    /// One block, stored uncompressed.
    Contiguous,
    /// Fixed-size blocks, each stored independently.
    Chunked {
        /// Chunk extent per axis.
        chunk: Vec<u64>,
        /// Deflate level (0-9), or `None` for raw chunks.
        compression: Option<u32>,
    },
}

/// Everything needed to create a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Type of every element.
    pub element_type: ElementType,
    /// Current extent per axis.
    pub shape: Vec<u64>,
    /// Whether the first axis can change after creation.
    pub max_extent: MaxExtent,
    /// Storage layout.
    pub layout: Layout,
}

impl DatasetSpec {
    /// Checks the spec for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::InvalidLayout`] if the rank is zero, the
    /// chunk shape does not match the rank or has a zero extent, the
    /// compression level is above 9, or an unlimited dataset is not chunked.
    pub fn validate(&self, path: &str) -> Result<()> {
        let invalid = |reason: String| -> crate::error::TelestoreError {
            ContainerError::InvalidLayout {
                path: path.to_string(),
                reason,
            }
            .into()
        };

        if self.shape.is_empty() {
            return Err(invalid("rank must be at least 1".to_string()));
        }

        match &self.layout {
            Layout::Contiguous => {
                if self.max_extent == MaxExtent::Unlimited {
                    return Err(invalid("unlimited datasets must be chunked".to_string()));
                }
            }
            Layout::Chunked { chunk, compression } => {
                if chunk.len() != self.shape.len() {
                    return Err(invalid(format!(
                        "chunk rank {} does not match dataset rank {}",
                        chunk.len(),
                        self.shape.len()
                    )));
                }
                if chunk.contains(&0) {
                    return Err(invalid(format!("chunk shape {chunk:?} has a zero extent")));
                }
                if let Some(level) = compression
                    && *level > MAX_COMPRESSION_LEVEL
                {
                    return Err(invalid(format!("compression level {level} exceeds 9")));
                }
            }
        }

        self.byte_len()
            .map(|_| ())
            .ok_or_else(|| invalid(format!("shape {:?} is too large", self.shape)))
    }

    /// Bytes in one row, the product of every axis but the first.
    pub(crate) fn row_bytes(&self) -> u64 {
        self.shape[1..]
            .iter()
            .fold(self.element_type.size() as u64, |acc, d| acc.saturating_mul(*d))
    }

    /// Total size of the dataset in bytes, or `None` on overflow.
    pub(crate) fn byte_len(&self) -> Option<usize> {
        let elements = self
            .shape
            .iter()
            .try_fold(1u64, |acc, d| acc.checked_mul(*d))?;
        let bytes = elements.checked_mul(self.element_type.size() as u64)?;
        usize::try_from(bytes).ok()
    }
}

/// Value of a metadata attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Scalar 64-bit float.
    Float(f64),
    /// Scalar unsigned integer.
    UInt(u64),
    /// String, stored with its terminator.
    Text(String),
}

impl AttributeValue {
    /// Number of bytes the value occupies when stored.
    ///
    /// Strings take their exact length plus one terminator byte.
    pub fn stored_size(&self) -> usize {
        match self {
            Self::Float(_) | Self::UInt(_) => 8,
            Self::Text(s) => s.len() + 1,
        }
    }

    /// Returns the value as a float, converting integers.
    #[allow(clippy::cast_precision_loss)] // attribute integers are small counts
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::UInt(v) => Some(*v as f64),
            Self::Text(_) => None,
        }
    }

    /// Returns the value as an unsigned integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a string slice, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::UInt(u64::from(value))
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// What kind of object lives at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A group (namespace).
    Group,
    /// A dataset.
    Dataset,
}

/// In-memory dataset contents.
#[derive(Debug, Clone)]
pub(crate) struct DatasetNode {
    pub(crate) spec: DatasetSpec,
    /// Row-major element bytes.
    pub(crate) data: Vec<u8>,
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
}

/// In-memory group contents.
#[derive(Debug, Clone, Default)]
pub(crate) struct GroupNode {
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
    pub(crate) datasets: BTreeMap<String, DatasetNode>,
}

/// The full group tree, keyed by canonical group path.
#[derive(Debug, Clone)]
pub(crate) struct Tree {
    pub(crate) groups: BTreeMap<String, GroupNode>,
}

impl Tree {
    fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert("/".to_string(), GroupNode::default());
        Self { groups }
    }
}

/// Joins a canonical group path and a child name.
pub(crate) fn join(group: &str, name: &str) -> String {
    if group == "/" {
        format!("/{name}")
    } else {
        format!("{group}/{name}")
    }
}

/// Splits a canonical path into its parent group and final segment.
///
/// Returns `None` for the root.
pub(crate) fn split_parent(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, name))
}

/// Returns true if `path` is `/` or `/seg(/seg)*` with non-empty segments.
pub(crate) fn is_canonical(path: &str) -> bool {
    path == "/"
        || (path.starts_with('/') && path[1..].split('/').all(|seg| !seg.is_empty()))
}

/// An open container file.
///
/// Created or opened with [`Container::create_or_open`]; persisted with
/// [`Container::flush`]. Dropping a container does not flush it.
#[derive(Debug)]
pub struct Container {
    /// Path to the container file.
    path: PathBuf,
    /// The group tree.
    tree: RefCell<Tree>,
    /// Number of live group and dataset handles.
    open_handles: Cell<usize>,
    /// Whether the tree changed since the last flush.
    dirty: Cell<bool>,
    /// Whether flush calls `fsync` before renaming.
    sync_on_flush: bool,
}

impl Container {
    /// Opens the container at `path`, or creates it.
    ///
    /// A file that does not exist, or does not start with the container
    /// magic bytes, is replaced by a new empty container which is written
    /// immediately. A file with the magic bytes is loaded in full.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::Access`] if the file cannot be read or created
    /// - [`ContainerError::CorruptedContainer`] if an existing container is invalid
    pub fn create_or_open<P: AsRef<Path>>(path: P, sync_on_flush: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (tree, dirty) = if format::has_magic(&path) {
            let tree = format::load(&path)?;
            debug!(path = %path.display(), groups = tree.groups.len(), "opened container");
            (tree, false)
        } else {
            debug!(path = %path.display(), "creating container");
            (Tree::new(), true)
        };

        let container = Self {
            path,
            tree: RefCell::new(tree),
            open_handles: Cell::new(0),
            dirty: Cell::new(dirty),
            sync_on_flush,
        };

        if container.dirty.get() {
            container.flush()?;
        }

        Ok(container)
    }

    /// Returns the path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of group and dataset handles currently alive.
    pub fn open_handles(&self) -> usize {
        self.open_handles.get()
    }

    /// Returns true if there are changes not yet flushed to disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Writes the tree to disk if it changed since the last flush.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::WriteFailed`] or a compression error if the
    /// file cannot be written.
    pub fn flush(&self) -> Result<()> {
        if !self.dirty.get() {
            return Ok(());
        }
        format::save(&self.tree.borrow(), &self.path, self.sync_on_flush)?;
        self.dirty.set(false);
        debug!(path = %self.path.display(), "flushed container");
        Ok(())
    }

    /// Returns a handle to the root group.
    pub fn root(&self) -> GroupHandle<'_> {
        GroupHandle::new(self, "/".to_string())
    }

    /// Returns true if a group exists at `path`.
    pub fn group_exists(&self, path: &str) -> bool {
        self.tree.borrow().groups.contains_key(path)
    }

    /// Returns what kind of object lives at `path`, if any.
    pub fn object_kind(&self, path: &str) -> Option<ObjectKind> {
        let tree = self.tree.borrow();
        if tree.groups.contains_key(path) {
            return Some(ObjectKind::Group);
        }
        let (parent, name) = split_parent(path)?;
        tree.groups
            .get(parent)
            .filter(|group| group.datasets.contains_key(name))
            .map(|_| ObjectKind::Dataset)
    }

    /// Creates the group at `path` together with any missing parents.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::AlreadyExists`] if a group already exists at
    ///   `path`, or a dataset occupies `path` or one of its parents
    /// - [`ContainerError::NoSuchGroup`] if `path` is not canonical
    pub fn create_group(&self, path: &str) -> Result<GroupHandle<'_>> {
        if !is_canonical(path) {
            return Err(ContainerError::NoSuchGroup {
                path: path.to_string(),
            }
            .into());
        }

        {
            let mut tree = self.tree.borrow_mut();
            if tree.groups.contains_key(path) {
                return Err(ContainerError::AlreadyExists {
                    path: path.to_string(),
                }
                .into());
            }

            // Validate every missing prefix before inserting any of them.
            let prefixes: Vec<String> = path[1..]
                .split('/')
                .scan(String::new(), |acc, seg| {
                    acc.push('/');
                    acc.push_str(seg);
                    Some(acc.clone())
                })
                .collect();

            for prefix in &prefixes {
                if tree.groups.contains_key(prefix) {
                    continue;
                }
                if let Some((parent, name)) = split_parent(prefix) {
                    let occupied = tree
                        .groups
                        .get(parent)
                        .is_some_and(|group| group.datasets.contains_key(name));
                    if occupied {
                        return Err(ContainerError::AlreadyExists {
                            path: prefix.clone(),
                        }
                        .into());
                    }
                }
            }

            for prefix in prefixes {
                tree.groups.entry(prefix).or_default();
            }
        }

        self.dirty.set(true);
        debug!(path, "created group");
        Ok(GroupHandle::new(self, path.to_string()))
    }

    /// Opens the existing group at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchGroup`] if no group exists there.
    pub fn open_group(&self, path: &str) -> Result<GroupHandle<'_>> {
        if !self.group_exists(path) {
            return Err(ContainerError::NoSuchGroup {
                path: path.to_string(),
            }
            .into());
        }
        Ok(GroupHandle::new(self, path.to_string()))
    }

    pub(crate) fn acquire(&self) {
        self.open_handles.set(self.open_handles.get() + 1);
    }

    pub(crate) fn release(&self) {
        self.open_handles.set(self.open_handles.get().saturating_sub(1));
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    pub(crate) fn tree(&self) -> &RefCell<Tree> {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_spec() -> DatasetSpec {
        DatasetSpec {
            element_type: ElementType::F64,
            shape: vec![3],
            max_extent: MaxExtent::Fixed,
            layout: Layout::Contiguous,
        }
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(split_parent("/a/b"), Some(("/a", "b")));
        assert_eq!(split_parent("/a"), Some(("/", "a")));
        assert_eq!(split_parent("/"), None);
        assert!(is_canonical("/"));
        assert!(is_canonical("/a/b"));
        assert!(!is_canonical("a/b"));
        assert!(!is_canonical("/a//b"));
        assert!(!is_canonical("/a/"));
    }

    #[test]
    fn test_create_new_container_writes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.tlm");

        let container = Container::create_or_open(&path, false).unwrap();
        assert!(path.is_file());
        assert!(!container.is_dirty());
        assert!(container.group_exists("/"));
        assert_eq!(container.open_handles(), 0);
    }

    #[test]
    fn test_create_group_with_intermediates() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("c.tlm"), false).unwrap();

        let group = container.create_group("/a/b/c").unwrap();
        assert_eq!(group.path(), "/a/b/c");
        assert!(container.group_exists("/a"));
        assert!(container.group_exists("/a/b"));
        assert!(container.group_exists("/a/b/c"));
        assert_eq!(container.open_handles(), 1);
        drop(group);
        assert_eq!(container.open_handles(), 0);

        let err = container.create_group("/a/b").unwrap_err();
        assert!(matches!(
            err,
            crate::error::TelestoreError::Container(ContainerError::AlreadyExists { .. })
        ));
        assert_eq!(container.open_handles(), 0);
    }

    #[test]
    fn test_group_cannot_shadow_dataset() {
        let dir = tempdir().unwrap();
        let container = Container::create_or_open(dir.path().join("c.tlm"), false).unwrap();

        let group = container.create_group("/data").unwrap();
        group.create_dataset("values", small_spec()).unwrap();
        drop(group);

        assert!(container.create_group("/data/values/inner").is_err());
        assert!(!container.group_exists("/data/values"));
        assert_eq!(container.object_kind("/data/values"), Some(ObjectKind::Dataset));
        assert_eq!(container.object_kind("/data"), Some(ObjectKind::Group));
        assert_eq!(container.object_kind("/nothing"), None);
    }

    #[test]
    fn test_spec_validation() {
        let mut spec = small_spec();
        assert!(spec.validate("/x").is_ok());

        spec.max_extent = MaxExtent::Unlimited;
        assert!(spec.validate("/x").is_err());

        spec.layout = Layout::Chunked {
            chunk: vec![64],
            compression: None,
        };
        assert!(spec.validate("/x").is_ok());

        spec.layout = Layout::Chunked {
            chunk: vec![2, 2],
            compression: None,
        };
        assert!(spec.validate("/x").is_err());

        spec.layout = Layout::Chunked {
            chunk: vec![4],
            compression: Some(10),
        };
        assert!(spec.validate("/x").is_err());

        spec.shape = vec![];
        assert!(spec.validate("/x").is_err());
    }

    #[test]
    fn test_attribute_value_sizes() {
        assert_eq!(AttributeValue::from("abc").stored_size(), 4);
        assert_eq!(AttributeValue::from("").stored_size(), 1);
        assert_eq!(AttributeValue::from(1.5).stored_size(), 8);
        assert_eq!(AttributeValue::from(3u32).as_u64(), Some(3));
        assert_eq!(AttributeValue::from(3u64).as_f64(), Some(3.0));
        assert_eq!(AttributeValue::from("x").as_str(), Some("x"));
    }
}
