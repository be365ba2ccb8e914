//! RAII handles onto groups and datasets of a [`Container`].
//!
//! A handle registers itself with its container on creation and releases
//! itself on drop, so every exit path of a caller, including `?` returns,
//! gives its handles back in reverse acquisition order.

use std::collections::BTreeMap;

use crate::container::{AttributeValue, Container, DatasetNode, DatasetSpec, MaxExtent, join};
use crate::error::{ContainerError, Result};

/// Handle to a group (namespace) inside a container.
#[derive(Debug)]
pub struct GroupHandle<'c> {
    container: &'c Container,
    path: String,
}

/// Handle to a dataset inside a container.
#[derive(Debug)]
pub struct DatasetHandle<'c> {
    container: &'c Container,
    group: String,
    name: String,
}

/// Metadata access shared by groups and datasets.
pub trait AttributeTarget {
    /// Absolute path of the object.
    fn object_path(&self) -> String;

    /// Creates or replaces the attribute `name`.
    ///
    /// # Errors
    ///
    /// Returns a container error if the object no longer exists.
    fn set_attribute(&self, name: &str, value: AttributeValue) -> Result<()>;

    /// Reads the attribute `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns a container error if the object no longer exists.
    fn attribute(&self, name: &str) -> Result<Option<AttributeValue>>;

    /// Returns true if the attribute `name` is present.
    ///
    /// # Errors
    ///
    /// Returns a container error if the object no longer exists.
    fn attribute_exists(&self, name: &str) -> Result<bool> {
        Ok(self.attribute(name)?.is_some())
    }

    /// Deletes the attribute `name`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a container error if the object no longer exists.
    fn delete_attribute(&self, name: &str) -> Result<bool>;
}

impl<'c> GroupHandle<'c> {
    pub(crate) fn new(container: &'c Container, path: String) -> Self {
        container.acquire();
        Self { container, path }
    }

    /// Returns the canonical path of the group.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns true if a dataset called `name` exists in this group.
    pub fn dataset_exists(&self, name: &str) -> bool {
        self.container
            .tree()
            .borrow()
            .groups
            .get(&self.path)
            .is_some_and(|group| group.datasets.contains_key(name))
    }

    /// Returns the names of all datasets in this group, sorted.
    pub fn dataset_names(&self) -> Vec<String> {
        self.container
            .tree()
            .borrow()
            .groups
            .get(&self.path)
            .map(|group| group.datasets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Creates a zero-filled dataset called `name`.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::AlreadyExists`] if a dataset or child group of
    ///   that name exists
    /// - [`ContainerError::InvalidLayout`] if the name or spec is unusable
    /// - [`ContainerError::NoSuchGroup`] if this group was removed
    pub fn create_dataset(&self, name: &str, spec: DatasetSpec) -> Result<DatasetHandle<'c>> {
        let path = join(&self.path, name);
        if name.is_empty() || name.contains('/') {
            return Err(ContainerError::InvalidLayout {
                path,
                reason: "dataset names must be non-empty and contain no '/'".to_string(),
            }
            .into());
        }
        spec.validate(&path)?;
        let byte_len = spec.byte_len().ok_or_else(|| ContainerError::InvalidLayout {
            path: path.clone(),
            reason: format!("shape {:?} is too large", spec.shape),
        })?;

        {
            let mut tree = self.container.tree().borrow_mut();
            if tree.groups.contains_key(&path) {
                return Err(ContainerError::AlreadyExists { path }.into());
            }
            let group = tree
                .groups
                .get_mut(&self.path)
                .ok_or_else(|| ContainerError::NoSuchGroup {
                    path: self.path.clone(),
                })?;
            if group.datasets.contains_key(name) {
                return Err(ContainerError::AlreadyExists { path }.into());
            }
            group.datasets.insert(
                name.to_string(),
                DatasetNode {
                    spec,
                    data: vec![0; byte_len],
                    attributes: BTreeMap::new(),
                },
            );
        }

        self.container.mark_dirty();
        tracing::debug!(dataset = %path, "created dataset");
        Ok(DatasetHandle::new(self.container, self.path.clone(), name.to_string()))
    }

    /// Opens the existing dataset called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if it does not exist.
    pub fn open_dataset(&self, name: &str) -> Result<DatasetHandle<'c>> {
        if !self.dataset_exists(name) {
            return Err(ContainerError::NoSuchDataset {
                path: join(&self.path, name),
            }
            .into());
        }
        Ok(DatasetHandle::new(self.container, self.path.clone(), name.to_string()))
    }

    /// Deletes the dataset called `name` with its contents and attributes.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if it does not exist.
    pub fn delete_dataset(&self, name: &str) -> Result<()> {
        let removed = self
            .container
            .tree()
            .borrow_mut()
            .groups
            .get_mut(&self.path)
            .and_then(|group| group.datasets.remove(name));

        match removed {
            Some(_) => {
                self.container.mark_dirty();
                tracing::debug!(dataset = %join(&self.path, name), "deleted dataset");
                Ok(())
            }
            None => Err(ContainerError::NoSuchDataset {
                path: join(&self.path, name),
            }
            .into()),
        }
    }

    fn with_attributes<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, AttributeValue>) -> R,
    ) -> Result<R> {
        let mut tree = self.container.tree().borrow_mut();
        let group = tree
            .groups
            .get_mut(&self.path)
            .ok_or_else(|| ContainerError::NoSuchGroup {
                path: self.path.clone(),
            })?;
        Ok(f(&mut group.attributes))
    }
}

impl AttributeTarget for GroupHandle<'_> {
    fn object_path(&self) -> String {
        self.path.clone()
    }

    fn set_attribute(&self, name: &str, value: AttributeValue) -> Result<()> {
        self.with_attributes(|attrs| attrs.insert(name.to_string(), value))?;
        self.container.mark_dirty();
        Ok(())
    }

    fn attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.with_attributes(|attrs| attrs.get(name).cloned())
    }

    fn delete_attribute(&self, name: &str) -> Result<bool> {
        let existed = self.with_attributes(|attrs| attrs.remove(name).is_some())?;
        if existed {
            self.container.mark_dirty();
        }
        Ok(existed)
    }
}

impl Drop for GroupHandle<'_> {
    fn drop(&mut self) {
        self.container.release();
    }
}

impl<'c> DatasetHandle<'c> {
    fn new(container: &'c Container, group: String, name: String) -> Self {
        container.acquire();
        Self {
            container,
            group,
            name,
        }
    }

    /// Returns the absolute path of the dataset.
    pub fn path(&self) -> String {
        join(&self.group, &self.name)
    }

    fn with_node<R>(&self, f: impl FnOnce(&mut DatasetNode) -> Result<R>) -> Result<R> {
        let mut tree = self.container.tree().borrow_mut();
        let node = tree
            .groups
            .get_mut(&self.group)
            .and_then(|group| group.datasets.get_mut(&self.name))
            .ok_or_else(|| ContainerError::NoSuchDataset { path: self.path() })?;
        f(node)
    }

    /// Returns a copy of the dataset's spec, including its current shape.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if the dataset was deleted.
    pub fn spec(&self) -> Result<DatasetSpec> {
        self.with_node(|node| Ok(node.spec.clone()))
    }

    /// Returns the current shape.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if the dataset was deleted.
    pub fn shape(&self) -> Result<Vec<u64>> {
        self.with_node(|node| Ok(node.spec.shape.clone()))
    }

    /// Returns the extent along the first axis.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if the dataset was deleted.
    pub fn len(&self) -> Result<u64> {
        self.with_node(|node| Ok(node.spec.shape[0]))
    }

    /// Returns true if the first axis has zero extent.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if the dataset was deleted.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Resizes the first axis to `new_len` rows.
    ///
    /// New rows are zero-filled; shrinking discards trailing rows.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::NotExtendable`] if the dataset has a fixed extent
    /// - [`ContainerError::InvalidLayout`] if the new size overflows
    pub fn extend(&self, new_len: u64) -> Result<()> {
        let path = self.path();
        self.with_node(|node| {
            if node.spec.max_extent != MaxExtent::Unlimited {
                return Err(ContainerError::NotExtendable { path }.into());
            }
            let bytes = new_len
                .checked_mul(node.spec.row_bytes())
                .and_then(|b| usize::try_from(b).ok())
                .ok_or_else(|| ContainerError::InvalidLayout {
                    path: path.clone(),
                    reason: format!("extent {new_len} is too large"),
                })?;
            node.data.resize(bytes, 0);
            node.spec.shape[0] = new_len;
            Ok(())
        })?;
        self.container.mark_dirty();
        Ok(())
    }

    /// Appends rows `start..start + count` to `buf`.
    ///
    /// Reserve capacity in `buf` beforehand to avoid reallocation.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::OutOfBounds`] if the range passes the end.
    pub fn read_rows_into(&self, start: u64, count: u64, buf: &mut Vec<u8>) -> Result<()> {
        let path = self.path();
        self.with_node(|node| {
            let range = row_range(node, &path, start, count)?;
            buf.extend_from_slice(&node.data[range]);
            Ok(())
        })
    }

    /// Reads rows `start..start + count` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::OutOfBounds`] if the range passes the end.
    pub fn read_rows(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_rows_into(start, count, &mut buf)?;
        Ok(buf)
    }

    /// Overwrites rows starting at `start` with `bytes`.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::BufferSize`] if `bytes` is not a whole number of rows
    /// - [`ContainerError::OutOfBounds`] if the rows pass the end
    pub fn write_rows(&self, start: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path();
        self.with_node(|node| {
            let row_bytes = node.spec.row_bytes();
            let len = bytes.len() as u64;
            if row_bytes == 0 || len % row_bytes != 0 {
                return Err(ContainerError::BufferSize {
                    path,
                    expected: row_bytes,
                    actual: len,
                }
                .into());
            }
            let range = row_range(node, &path, start, len / row_bytes)?;
            node.data[range].copy_from_slice(bytes);
            Ok(())
        })?;
        self.container.mark_dirty();
        Ok(())
    }

    /// Returns every element byte of the dataset in row-major order.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::NoSuchDataset`] if the dataset was deleted.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.with_node(|node| Ok(node.data.clone()))
    }

    /// Replaces every element byte of the dataset.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::BufferSize`] unless `bytes` matches the
    /// dataset size exactly.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let path = self.path();
        self.with_node(|node| {
            if bytes.len() != node.data.len() {
                return Err(ContainerError::BufferSize {
                    path,
                    expected: node.data.len() as u64,
                    actual: bytes.len() as u64,
                }
                .into());
            }
            node.data.copy_from_slice(bytes);
            Ok(())
        })?;
        self.container.mark_dirty();
        Ok(())
    }
}

/// Converts a row range into a checked byte range.
fn row_range(
    node: &DatasetNode,
    path: &str,
    start: u64,
    count: u64,
) -> Result<std::ops::Range<usize>> {
    let len = node.spec.shape[0];
    let out_of_bounds = || ContainerError::OutOfBounds {
        path: path.to_string(),
        start,
        end: start.saturating_add(count),
        len,
    };
    let end = start.checked_add(count).ok_or_else(out_of_bounds)?;
    if end > len {
        return Err(out_of_bounds().into());
    }
    let row_bytes = node.spec.row_bytes();
    // Rows within the extent always fit in the in-memory buffer.
    let to_byte = |row: u64| usize::try_from(row * row_bytes).unwrap_or(usize::MAX);
    Ok(to_byte(start)..to_byte(end))
}

impl AttributeTarget for DatasetHandle<'_> {
    fn object_path(&self) -> String {
        self.path()
    }

    fn set_attribute(&self, name: &str, value: AttributeValue) -> Result<()> {
        self.with_node(|node| {
            node.attributes.insert(name.to_string(), value);
            Ok(())
        })?;
        self.container.mark_dirty();
        Ok(())
    }

    fn attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        self.with_node(|node| Ok(node.attributes.get(name).cloned()))
    }

    fn delete_attribute(&self, name: &str) -> Result<bool> {
        let existed = self.with_node(|node| Ok(node.attributes.remove(name).is_some()))?;
        if existed {
            self.container.mark_dirty();
        }
        Ok(existed)
    }
}

impl Drop for DatasetHandle<'_> {
    fn drop(&mut self) {
        self.container.release();
    }
}
