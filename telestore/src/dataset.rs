//! Typed numeric arrays and images.
//!
//! Arrays and images are written whole: a write with an existing name deletes
//! the old dataset and creates a new one with the new shape. Small arrays are
//! stored contiguously; larger arrays and all images are chunked and
//! compressed.

use tracing::debug;

use crate::container::{
    AttributeTarget, Container, DatasetHandle, DatasetSpec, ElementType, GroupHandle, Layout,
    MaxExtent,
};
use crate::error::{ArgumentError, ContainerError, Result};
use crate::namespace::{self, NamespacePath, validate_name};
use crate::retention::LOG_DATASET;

/// Arrays with more elements than this are chunked and compressed.
pub const ARRAY_CHUNK_THRESHOLD: u64 = 100;

/// Largest chunk extent along any array axis.
pub const ARRAY_CHUNK_EXTENT: u64 = 20;

/// Deflate level for chunked arrays.
pub const ARRAY_COMPRESSION_LEVEL: u32 = 6;

/// Largest chunk extent along the height and width axes of an image.
pub const IMAGE_CHUNK_EXTENT: u64 = 128;

/// Deflate level for images.
pub const IMAGE_COMPRESSION_LEVEL: u32 = 7;

/// Highest supported array rank.
pub const MAX_ARRAY_RANK: usize = 3;

/// Highest supported image channel count.
pub const MAX_CHANNELS: u64 = 4;

/// Attribute holding the write time of an array or image.
pub const TIMESTAMP_ATTR: &str = "timestamp";

mod sealed {
    pub trait Sealed {}
}

/// Element types that can be stored in a dataset.
///
/// Sealed: implemented for `f32`, `f64` and `u8` only.
pub trait Element: sealed::Sealed + Copy + std::fmt::Debug {
    /// Stored type tag.
    const ELEMENT_TYPE: ElementType;

    /// Encodes `values` as little-endian bytes.
    fn encode_slice(values: &[Self]) -> Vec<u8>;

    /// Decodes little-endian bytes. Trailing partial elements are ignored.
    fn decode_slice(bytes: &[u8]) -> Vec<Self>;
}

/// Element types accepted by numeric array writes.
pub trait ArrayElement: Element {}

macro_rules! impl_element {
    ($ty:ty, $tag:ident) => {
        impl sealed::Sealed for $ty {}

        impl Element for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$tag;

            fn encode_slice(values: &[Self]) -> Vec<u8> {
                values.iter().flat_map(|v| v.to_le_bytes()).collect()
            }

            fn decode_slice(bytes: &[u8]) -> Vec<Self> {
                bytes
                    .chunks_exact(size_of::<$ty>())
                    .map(|chunk| {
                        let mut raw = [0u8; size_of::<$ty>()];
                        raw.copy_from_slice(chunk);
                        <$ty>::from_le_bytes(raw)
                    })
                    .collect()
            }
        }
    };
}

impl_element!(f32, F32);
impl_element!(f64, F64);
impl_element!(u8, U8);

impl ArrayElement for f32 {}
impl ArrayElement for f64 {}

/// A numeric array read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData<T> {
    /// Extent per axis.
    pub shape: Vec<u64>,
    /// Elements in row-major order.
    pub values: Vec<T>,
}

/// An image read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Width in pixels.
    pub width: u64,
    /// Height in pixels.
    pub height: u64,
    /// Channels per pixel.
    pub channels: u64,
    /// Pixels in row-major `(height, width, channels)` order.
    pub pixels: Vec<u8>,
}

/// Returns the layout used for an array of `shape`.
pub fn array_layout(shape: &[u64]) -> Layout {
    let elements = shape.iter().fold(1u64, |acc, d| acc.saturating_mul(*d));
    if elements > ARRAY_CHUNK_THRESHOLD {
        Layout::Chunked {
            chunk: shape.iter().map(|d| (*d).min(ARRAY_CHUNK_EXTENT)).collect(),
            compression: Some(ARRAY_COMPRESSION_LEVEL),
        }
    } else {
        Layout::Contiguous
    }
}

/// Returns the layout used for an image of `shape`.
///
/// `shape` is `(height, width)` or `(height, width, channels)`; the channel
/// axis is never split.
pub fn image_layout(shape: &[u64]) -> Layout {
    let chunk = shape
        .iter()
        .enumerate()
        .map(|(axis, d)| if axis < 2 { (*d).min(IMAGE_CHUNK_EXTENT) } else { *d })
        .collect();
    Layout::Chunked {
        chunk,
        compression: Some(IMAGE_COMPRESSION_LEVEL),
    }
}

/// Writes `data` as the array `name` in `namespace`, replacing any dataset of
/// that name, and stamps it with `now`.
///
/// Arguments are checked before anything is written.
///
/// # Errors
///
/// - [`ArgumentError::InvalidRank`] unless `shape` has 1 to 3 axes
/// - [`ArgumentError::ZeroDimension`] if an axis is zero
/// - [`ArgumentError::DataLengthMismatch`] if `data` does not fill `shape`
/// - [`ArgumentError::InvalidName`] for an unusable dataset name, including
///   the log stream name
/// - a container error if the namespace or dataset cannot be written
pub fn write_array<T: ArrayElement>(
    container: &Container,
    namespace: &NamespacePath,
    name: &str,
    data: &[T],
    shape: &[u64],
    now: f64,
) -> Result<()> {
    validate_dataset_name(name)?;
    if shape.is_empty() || shape.len() > MAX_ARRAY_RANK {
        return Err(ArgumentError::InvalidRank { rank: shape.len() }.into());
    }
    if shape.contains(&0) {
        return Err(ArgumentError::ZeroDimension {
            shape: shape.to_vec(),
        }
        .into());
    }
    check_len(shape.iter().try_fold(1u64, |acc, d| acc.checked_mul(*d)), data.len())?;

    let spec = DatasetSpec {
        element_type: T::ELEMENT_TYPE,
        shape: shape.to_vec(),
        max_extent: MaxExtent::Fixed,
        layout: array_layout(shape),
    };

    let group = namespace::ensure(container, namespace)?;
    let dataset = replace_dataset(&group, name, spec)?;
    dataset.write_all(&T::encode_slice(data))?;
    dataset.set_attribute(TIMESTAMP_ATTR, now.into())
}

/// Writes `pixels` as the image `name` in `namespace`, replacing any dataset
/// of that name.
///
/// The dataset has shape `(height, width)` for one channel and
/// `(height, width, channels)` otherwise. Its `width`, `height` and
/// `channels` attributes are unsigned integers; `timestamp` is `now`.
///
/// # Errors
///
/// - [`ArgumentError::InvalidChannels`] unless `channels` is 1 to 4
/// - [`ArgumentError::EmptyImage`] if `width` or `height` is zero
/// - [`ArgumentError::DataLengthMismatch`] if `pixels` has the wrong length
/// - [`ArgumentError::InvalidName`] for an unusable dataset name, including
///   the log stream name
/// - a container error if the namespace or dataset cannot be written
#[allow(clippy::too_many_arguments)]
pub fn write_image(
    container: &Container,
    namespace: &NamespacePath,
    name: &str,
    pixels: &[u8],
    width: u64,
    height: u64,
    channels: u64,
    now: f64,
) -> Result<()> {
    validate_dataset_name(name)?;
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(ArgumentError::InvalidChannels { channels }.into());
    }
    if width == 0 || height == 0 {
        return Err(ArgumentError::EmptyImage { width, height }.into());
    }
    check_len(
        height
            .checked_mul(width)
            .and_then(|n| n.checked_mul(channels)),
        pixels.len(),
    )?;

    let shape = if channels == 1 {
        vec![height, width]
    } else {
        vec![height, width, channels]
    };
    let spec = DatasetSpec {
        element_type: ElementType::U8,
        layout: image_layout(&shape),
        shape,
        max_extent: MaxExtent::Fixed,
    };

    let group = namespace::ensure(container, namespace)?;
    let dataset = replace_dataset(&group, name, spec)?;
    dataset.write_all(pixels)?;
    dataset.set_attribute("width", width.into())?;
    dataset.set_attribute("height", height.into())?;
    dataset.set_attribute("channels", channels.into())?;
    dataset.set_attribute(TIMESTAMP_ATTR, now.into())
}

/// Reads the array `name` from `namespace`.
///
/// # Errors
///
/// - a container error if the namespace or dataset does not exist
/// - [`ContainerError::TypeMismatch`] if the dataset stores another type
pub fn read_array<T: ArrayElement>(
    container: &Container,
    namespace: &NamespacePath,
    name: &str,
) -> Result<ArrayData<T>> {
    let group = container.open_group(namespace.as_str())?;
    let dataset = group.open_dataset(name)?;
    let spec = typed_spec(&dataset, T::ELEMENT_TYPE)?;
    Ok(ArrayData {
        shape: spec.shape,
        values: T::decode_slice(&dataset.read_all()?),
    })
}

/// Reads the image `name` from `namespace`.
///
/// # Errors
///
/// - a container error if the namespace or dataset does not exist
/// - [`ContainerError::TypeMismatch`] or [`ContainerError::InvalidLayout`]
///   if the dataset is not an image
pub fn read_image(container: &Container, namespace: &NamespacePath, name: &str) -> Result<Image> {
    let group = container.open_group(namespace.as_str())?;
    let dataset = group.open_dataset(name)?;
    let spec = typed_spec(&dataset, ElementType::U8)?;

    let (height, width, channels) = match spec.shape[..] {
        [height, width] => (height, width, 1),
        [height, width, channels] => (height, width, channels),
        _ => {
            return Err(ContainerError::InvalidLayout {
                path: dataset.path(),
                reason: format!("shape {:?} is not an image", spec.shape),
            }
            .into());
        }
    };

    Ok(Image {
        width,
        height,
        channels,
        pixels: dataset.read_all()?,
    })
}

/// Returns the type, shape and layout of the dataset `name` in `namespace`.
///
/// # Errors
///
/// Returns a container error if the namespace or dataset does not exist.
pub fn dataset_spec(
    container: &Container,
    namespace: &NamespacePath,
    name: &str,
) -> Result<DatasetSpec> {
    let group = container.open_group(namespace.as_str())?;
    group.open_dataset(name)?.spec()
}

fn check_len(expected: Option<u64>, actual: usize) -> Result<()> {
    let actual = actual as u64;
    match expected {
        Some(expected) if expected == actual => Ok(()),
        expected => Err(ArgumentError::DataLengthMismatch {
            expected: expected.unwrap_or(u64::MAX),
            actual,
        }
        .into()),
    }
}

/// Deletes the dataset `name` if present and creates it again from `spec`.
fn replace_dataset<'c>(
    group: &GroupHandle<'c>,
    name: &str,
    spec: DatasetSpec,
) -> Result<DatasetHandle<'c>> {
    if group.dataset_exists(name) {
        group.delete_dataset(name)?;
    }
    debug!(
        namespace = group.path(),
        dataset = name,
        shape = ?spec.shape,
        layout = ?spec.layout,
        "writing dataset"
    );
    group.create_dataset(name, spec)
}

/// Rejects names array and image writes may not use.
///
/// Every namespace reserves [`LOG_DATASET`] for its log stream.
fn validate_dataset_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name == LOG_DATASET {
        return Err(ArgumentError::InvalidName {
            name: name.to_string(),
            reason: "reserved for the log stream",
        }
        .into());
    }
    Ok(())
}

pub(crate) fn typed_spec(dataset: &DatasetHandle<'_>, expected: ElementType) -> Result<DatasetSpec> {
    let spec = dataset.spec()?;
    if spec.element_type != expected {
        return Err(ContainerError::TypeMismatch {
            path: dataset.path(),
            expected: expected.name(),
            found: spec.element_type.name(),
        }
        .into());
    }
    Ok(spec)
}
