//! Chunk splitting and deflate compression for persisted datasets.
//!
//! A chunked dataset is cut into a grid of blocks of the chunk shape. Blocks
//! are visited in row-major grid order; each block holds only the elements
//! inside the dataset bounds, so edge blocks are smaller than the chunk
//! shape. Within a block, elements keep row-major order.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::container::{DatasetSpec, Layout};
use crate::error::{ContainerError, Result};

/// Upper bound on how much deflate can expand its input.
const MAX_INFLATE_RATIO: usize = 1032;

/// One persisted block, compressed if the layout asks for it.
#[derive(Debug)]
pub(crate) struct EncodedBlock {
    pub(crate) payload: Vec<u8>,
}

/// Iterates the chunk grid of a dataset.
#[derive(Debug)]
struct ChunkGrid<'a> {
    shape: &'a [u64],
    chunk: &'a [u64],
    element_size: usize,
}

impl ChunkGrid<'_> {
    /// Number of chunks in the grid, or `None` on overflow.
    fn count(&self) -> Option<usize> {
        if self.shape.contains(&0) {
            return Some(0);
        }
        let count = self
            .shape
            .iter()
            .zip(self.chunk)
            .try_fold(1u64, |acc, (dim, chunk)| acc.checked_mul(dim.div_ceil(*chunk)))?;
        usize::try_from(count).ok()
    }

    /// Returns the origin of every chunk in row-major order.
    fn origins(&self) -> Vec<Vec<u64>> {
        if self.shape.contains(&0) {
            return Vec::new();
        }
        let counts: Vec<u64> = self
            .shape
            .iter()
            .zip(self.chunk)
            .map(|(dim, chunk)| dim.div_ceil(*chunk))
            .collect();

        let mut origins = Vec::new();
        let mut index = vec![0u64; counts.len()];
        loop {
            origins.push(index.iter().zip(self.chunk).map(|(i, c)| i * c).collect());
            if !advance(&mut index, &counts) {
                break;
            }
        }
        origins
    }

    /// Returns the contiguous byte runs of the chunk at `origin`.
    ///
    /// Each run is one stretch along the last axis: `(offset, len)` in bytes
    /// relative to the start of the dataset buffer.
    fn runs(&self, origin: &[u64]) -> Vec<(usize, usize)> {
        let rank = self.shape.len();
        let extents: Vec<u64> = (0..rank)
            .map(|axis| self.chunk[axis].min(self.shape[axis] - origin[axis]))
            .collect();

        let mut strides = vec![1u64; rank];
        for axis in (0..rank - 1).rev() {
            strides[axis] = strides[axis + 1] * self.shape[axis + 1];
        }

        let element_size = self.element_size as u64;
        let run_len = to_usize(extents[rank - 1] * element_size);
        let outer = &extents[..rank - 1];

        let mut runs = Vec::new();
        let mut index = vec![0u64; outer.len()];
        loop {
            let element_offset: u64 = origin
                .iter()
                .enumerate()
                .map(|(axis, o)| {
                    let k = if axis < outer.len() { index[axis] } else { 0 };
                    (o + k) * strides[axis]
                })
                .sum();
            runs.push((to_usize(element_offset * element_size), run_len));
            if !advance(&mut index, outer) {
                break;
            }
        }
        runs
    }
}

/// Odometer increment of `index` within `limits`; false once it wraps.
fn advance(index: &mut [u64], limits: &[u64]) -> bool {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < limits[axis] {
            return true;
        }
        index[axis] = 0;
    }
    false
}

#[allow(clippy::cast_possible_truncation)] // offsets are bounded by the in-memory buffer
fn to_usize(value: u64) -> usize {
    value as usize
}

/// Splits a dataset buffer into persisted blocks according to its layout.
///
/// Contiguous datasets become a single raw block.
///
/// # Errors
///
/// Returns [`ContainerError::Compression`] if the encoder fails.
pub(crate) fn encode(spec: &DatasetSpec, data: &[u8], dataset: &str) -> Result<Vec<EncodedBlock>> {
    let Layout::Chunked { chunk, compression } = &spec.layout else {
        return Ok(vec![EncodedBlock {
            payload: data.to_vec(),
        }]);
    };

    let grid = ChunkGrid {
        shape: &spec.shape,
        chunk,
        element_size: spec.element_type.size(),
    };

    let mut blocks = Vec::new();
    for origin in grid.origins() {
        let mut raw = Vec::new();
        for (offset, len) in grid.runs(&origin) {
            raw.extend_from_slice(&data[offset..offset + len]);
        }
        let payload = match compression {
            Some(level) => deflate(&raw, *level).map_err(|source| ContainerError::Compression {
                dataset: dataset.to_string(),
                source,
            })?,
            None => raw,
        };
        blocks.push(EncodedBlock { payload });
    }
    Ok(blocks)
}

/// Number of blocks [`encode`] produces for `spec`.
pub(crate) fn block_count(spec: &DatasetSpec) -> usize {
    match &spec.layout {
        Layout::Contiguous => 1,
        Layout::Chunked { chunk, .. } => ChunkGrid {
            shape: &spec.shape,
            chunk,
            element_size: spec.element_type.size(),
        }
        .count()
        .unwrap_or(0),
    }
}

/// Reassembles a dataset buffer from its persisted blocks.
///
/// # Errors
///
/// - [`ContainerError::Decompression`] if a block fails to inflate
/// - [`ContainerError::CorruptedContainer`] if block counts or sizes disagree
///   with the dataset shape
///
/// Block counts and stored sizes are checked against the shape before the
/// dataset buffer is allocated.
pub(crate) fn decode(
    spec: &DatasetSpec,
    blocks: &[&[u8]],
    dataset: &str,
    container: &str,
) -> Result<Vec<u8>> {
    let corrupted = |reason: String| -> crate::error::TelestoreError {
        ContainerError::CorruptedContainer {
            path: container.to_string(),
            reason: format!("dataset '{dataset}': {reason}"),
        }
        .into()
    };

    let byte_len = spec
        .byte_len()
        .ok_or_else(|| corrupted(format!("shape {:?} is too large", spec.shape)))?;

    let Layout::Chunked { chunk, compression } = &spec.layout else {
        return match blocks {
            [block] if block.len() == byte_len => Ok(block.to_vec()),
            _ => Err(corrupted("contiguous data does not match its shape".to_string())),
        };
    };

    let grid = ChunkGrid {
        shape: &spec.shape,
        chunk,
        element_size: spec.element_type.size(),
    };
    let chunks = grid
        .count()
        .ok_or_else(|| corrupted(format!("shape {:?} has too many chunks", spec.shape)))?;
    if chunks != blocks.len() {
        return Err(corrupted(format!(
            "expected {chunks} chunks, found {}",
            blocks.len()
        )));
    }

    let stored = blocks
        .iter()
        .fold(0usize, |acc, block| acc.saturating_add(block.len()));
    let plausible = match compression {
        Some(_) => stored.saturating_mul(MAX_INFLATE_RATIO) >= byte_len,
        None => stored == byte_len,
    };
    if !plausible {
        return Err(corrupted(format!(
            "{stored} stored bytes cannot hold {byte_len} bytes of data"
        )));
    }

    let mut data = vec![0u8; byte_len];
    for (origin, block) in grid.origins().iter().zip(blocks) {
        let runs = grid.runs(origin);
        let expected: usize = runs.iter().map(|(_, len)| len).sum();

        let raw = match compression {
            Some(_) => inflate(block, expected).map_err(|source| ContainerError::Decompression {
                dataset: dataset.to_string(),
                source,
            })?,
            None => block.to_vec(),
        };

        if raw.len() != expected {
            return Err(corrupted(format!(
                "chunk at {origin:?} holds {} bytes, expected {expected}",
                raw.len()
            )));
        }

        let mut cursor = 0;
        for (offset, len) in runs {
            data[offset..offset + len].copy_from_slice(&raw[cursor..cursor + len]);
            cursor += len;
        }
    }
    Ok(data)
}

fn deflate(raw: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(raw)?;
    encoder.finish()
}

/// Inflates `payload`, reading at most one byte past `expected` so an
/// oversized block is detected without decoding all of it.
fn inflate(payload: &[u8], expected: usize) -> std::io::Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(expected);
    ZlibDecoder::new(payload)
        .take(expected as u64 + 1)
        .read_to_end(&mut decoded)?;
    Ok(decoded)
}
