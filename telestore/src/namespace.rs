//! Namespace paths and their lazy creation.
//!
//! A namespace is a slash-delimited path such as `text_logs/errors`. Paths
//! are normalized before they reach the container: empty segments are
//! dropped, a leading slash is implied, and a path made only of slashes
//! names the root.

use std::fmt;

use tracing::debug;

use crate::container::{Container, GroupHandle, join, split_parent};
use crate::error::{ArgumentError, ContainerError, Result, TelestoreError};

/// A normalized, absolute namespace or object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacePath(String);

impl NamespacePath {
    /// Normalizes `path`.
    ///
    /// # Errors
    ///
    /// - [`ArgumentError::EmptyPath`] if `path` is empty
    /// - [`ArgumentError::InvalidName`] if a segment is `.` or `..` or
    ///   contains a NUL byte
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(ArgumentError::EmptyPath.into());
        }

        let mut canonical = String::with_capacity(path.len() + 1);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            validate_segment(segment)?;
            canonical.push('/');
            canonical.push_str(segment);
        }

        if canonical.is_empty() {
            canonical.push('/');
        }
        Ok(Self(canonical))
    }

    /// The root namespace.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Returns the canonical form, always starting with `/`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the root namespace.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Returns the path of the child object `name`.
    pub fn child(&self, name: &str) -> String {
        join(&self.0, name)
    }

    /// Splits the path into its parent namespace and final segment.
    ///
    /// Returns `None` for the root.
    pub fn parent_and_name(&self) -> Option<(Self, &str)> {
        split_parent(&self.0).map(|(parent, name)| (Self(parent.to_string()), name))
    }
}

impl fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let reason = if segment == "." || segment == ".." {
        "relative segments are not allowed"
    } else if segment.contains('\0') {
        "names must not contain NUL bytes"
    } else {
        return Ok(());
    };
    Err(ArgumentError::InvalidName {
        name: segment.to_string(),
        reason,
    }
    .into())
}

/// Validates a dataset or attribute name.
///
/// # Errors
///
/// Returns [`ArgumentError::InvalidName`] if `name` is empty or contains a
/// `/` or NUL byte.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "names must not be empty"
    } else if name.contains('/') {
        "names must not contain '/'"
    } else if name.contains('\0') {
        "names must not contain NUL bytes"
    } else {
        return Ok(());
    };
    Err(ArgumentError::InvalidName {
        name: name.to_string(),
        reason,
    }
    .into())
}

/// Opens the namespace at `path`, creating it and any missing parents.
///
/// Calling this repeatedly for the same path is harmless: an existing
/// namespace is simply opened.
///
/// # Errors
///
/// Returns a container error if a dataset occupies `path` or one of its
/// parents.
pub fn ensure<'c>(container: &'c Container, path: &NamespacePath) -> Result<GroupHandle<'c>> {
    if path.is_root() {
        return Ok(container.root());
    }
    if container.group_exists(path.as_str()) {
        return container.open_group(path.as_str());
    }

    match container.create_group(path.as_str()) {
        Ok(group) => {
            debug!(namespace = %path, "created namespace");
            Ok(group)
        }
        // Lost a race with another creator of the same path.
        Err(TelestoreError::Container(ContainerError::AlreadyExists { path: existing }))
            if existing == path.as_str() =>
        {
            container.open_group(path.as_str())
        }
        Err(e) => Err(e),
    }
}
