//! Metadata attributes on namespaces and datasets.

use crate::container::{AttributeTarget, AttributeValue, Container, ObjectKind};
use crate::error::{Result, TelestoreError};
use crate::namespace::{NamespacePath, validate_name};

/// Sets the attribute `name` on the namespace or dataset at `path`.
///
/// An existing attribute of the same name is removed first, so the stored
/// value always takes the type and size of `value`. Nothing is created: the
/// target must already exist.
///
/// # Errors
///
/// - [`ArgumentError::InvalidName`](crate::error::ArgumentError::InvalidName)
///   for an unusable attribute name
/// - [`TelestoreError::NotFound`] if nothing lives at `path`
pub fn set_attribute(
    container: &Container,
    path: &NamespacePath,
    name: &str,
    value: AttributeValue,
) -> Result<()> {
    validate_name(name)?;
    with_target(container, path, |target| replace(target, name, value))
}

/// Reads the attribute `name` from the namespace or dataset at `path`.
///
/// # Errors
///
/// Returns [`TelestoreError::NotFound`] if nothing lives at `path`.
pub fn get_attribute(
    container: &Container,
    path: &NamespacePath,
    name: &str,
) -> Result<Option<AttributeValue>> {
    with_target(container, path, |target| target.attribute(name))
}

/// Replaces the attribute `name` on an already open object.
pub(crate) fn replace(target: &dyn AttributeTarget, name: &str, value: AttributeValue) -> Result<()> {
    if target.attribute_exists(name)? {
        target.delete_attribute(name)?;
    }
    target.set_attribute(name, value)
}

/// Opens the object at `path` and runs `f` on it.
///
/// Handles opened here are released before returning, on every path.
fn with_target<R>(
    container: &Container,
    path: &NamespacePath,
    f: impl FnOnce(&dyn AttributeTarget) -> Result<R>,
) -> Result<R> {
    let not_found = || TelestoreError::NotFound {
        path: path.to_string(),
    };

    match container.object_kind(path.as_str()) {
        Some(ObjectKind::Group) => {
            let group = container.open_group(path.as_str())?;
            f(&group)
        }
        Some(ObjectKind::Dataset) => {
            let (parent, name) = path.parent_and_name().ok_or_else(not_found)?;
            let group = container.open_group(parent.as_str())?;
            let dataset = group.open_dataset(name)?;
            f(&dataset)
        }
        None => Err(not_found()),
    }
}
