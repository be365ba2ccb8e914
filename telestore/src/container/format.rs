//! On-disk encoding of a container file.
//!
//! See the module documentation of [`crate::container`] for the layout.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::container::chunk;
use crate::container::{
    AttributeValue, DatasetNode, DatasetSpec, GroupNode, Tree, is_canonical, join, split_parent,
};
use crate::error::{ContainerError, Result};

/// Magic bytes identifying a container file.
const MAGIC: [u8; 4] = *b"TLMC";

/// Current container format version.
const FORMAT_VERSION: u32 = 1;

/// Size of the fixed header in bytes.
const HEADER_SIZE: usize = 16;

/// JSON index stored after the header.
#[derive(Debug, Serialize, Deserialize)]
struct Index {
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupEntry {
    path: String,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetEntry {
    name: String,
    spec: DatasetSpec,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    blobs: Vec<BlobRef>,
}

/// Location of one block in the blob region.
#[derive(Debug, Serialize, Deserialize)]
struct BlobRef {
    offset: u64,
    len: u64,
}

/// Returns true if `path` is a readable file starting with the magic bytes.
pub(crate) fn has_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .is_ok_and(|()| magic == MAGIC)
}

/// Loads the full tree from the container at `path`.
///
/// # Errors
///
/// - [`ContainerError::Access`] / [`ContainerError::MemoryMap`] on I/O failure
/// - [`ContainerError::CorruptedContainer`] if the header, index or blobs are invalid
pub(crate) fn load(path: &Path) -> Result<Tree> {
    let path_str = path.display().to_string();
    let corrupted = |reason: String| -> crate::error::TelestoreError {
        ContainerError::CorruptedContainer {
            path: path_str.clone(),
            reason,
        }
        .into()
    };

    let file = File::open(path).map_err(|source| ContainerError::Access {
        path: path_str.clone(),
        source,
    })?;

    // SAFETY: the file is mapped read-only and the mapping is dropped before
    // this function returns. The store is single-process by contract, so no
    // other writer truncates the file while it is mapped.
    let mmap = unsafe {
        Mmap::map(&file).map_err(|source| ContainerError::MemoryMap {
            path: path_str.clone(),
            source,
        })?
    };

    if mmap.len() < HEADER_SIZE {
        return Err(corrupted(format!(
            "file too small: {} bytes, expected at least {HEADER_SIZE}",
            mmap.len()
        )));
    }

    let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupted(format!(
            "unsupported version: expected {FORMAT_VERSION}, found {version}"
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&mmap[8..16]);
    let index_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .ok()
        .filter(|len| len.checked_add(HEADER_SIZE).is_some_and(|end| end <= mmap.len()))
        .ok_or_else(|| corrupted("index length exceeds file size".to_string()))?;

    let index: Index = serde_json::from_slice(&mmap[HEADER_SIZE..HEADER_SIZE + index_len])
        .map_err(ContainerError::IndexSerialize)?;
    let blob_region = &mmap[HEADER_SIZE + index_len..];

    let mut tree = Tree::new();
    for entry in index.groups {
        if !is_canonical(&entry.path) {
            return Err(corrupted(format!("invalid group path '{}'", entry.path)));
        }

        let mut group = GroupNode {
            attributes: entry.attributes,
            datasets: BTreeMap::new(),
        };

        for dataset in entry.datasets {
            let dataset_path = join(&entry.path, &dataset.name);
            dataset.spec.validate(&dataset_path)?;

            let blocks = dataset
                .blobs
                .iter()
                .map(|blob| {
                    let start = usize::try_from(blob.offset).ok()?;
                    let end = start.checked_add(usize::try_from(blob.len).ok()?)?;
                    blob_region.get(start..end)
                })
                .collect::<Option<Vec<&[u8]>>>()
                .ok_or_else(|| corrupted(format!("blob of '{dataset_path}' is out of bounds")))?;

            let data = chunk::decode(&dataset.spec, &blocks, &dataset_path, &path_str)?;
            group.datasets.insert(
                dataset.name,
                DatasetNode {
                    spec: dataset.spec,
                    data,
                    attributes: dataset.attributes,
                },
            );
        }

        tree.groups.insert(entry.path, group);
    }

    // Every group's parent must be present.
    for path in tree.groups.keys() {
        if let Some((parent, _)) = split_parent(path)
            && !tree.groups.contains_key(parent)
        {
            return Err(corrupted(format!("group '{path}' has no parent")));
        }
    }

    Ok(tree)
}

/// Writes `tree` to `path` through a temporary file and an atomic rename.
///
/// # Errors
///
/// Returns [`ContainerError::WriteFailed`] on I/O failure or a compression
/// error if a chunk cannot be encoded.
pub(crate) fn save(tree: &Tree, path: &Path, sync: bool) -> Result<()> {
    let mut blobs = Vec::new();
    let mut index = Index {
        groups: Vec::with_capacity(tree.groups.len()),
    };

    for (group_path, group) in &tree.groups {
        let mut datasets = Vec::with_capacity(group.datasets.len());
        for (name, node) in &group.datasets {
            let dataset_path = join(group_path, name);
            let mut refs = Vec::with_capacity(chunk::block_count(&node.spec));
            for block in chunk::encode(&node.spec, &node.data, &dataset_path)? {
                refs.push(BlobRef {
                    offset: blobs.len() as u64,
                    len: block.payload.len() as u64,
                });
                blobs.extend_from_slice(&block.payload);
            }
            datasets.push(DatasetEntry {
                name: name.clone(),
                spec: node.spec.clone(),
                attributes: node.attributes.clone(),
                blobs: refs,
            });
        }
        index.groups.push(GroupEntry {
            path: group_path.clone(),
            attributes: group.attributes.clone(),
            datasets,
        });
    }

    let index_json = serde_json::to_vec(&index).map_err(ContainerError::IndexSerialize)?;

    let mut out = Vec::with_capacity(HEADER_SIZE + index_json.len() + blobs.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(index_json.len() as u64).to_le_bytes());
    out.extend_from_slice(&index_json);
    out.extend_from_slice(&blobs);

    let tmp_path = temp_path(path);
    let write_failed = |source: std::io::Error| ContainerError::WriteFailed {
        path: tmp_path.display().to_string(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .map_err(write_failed)?;
    file.write_all(&out).map_err(write_failed)?;
    if sync {
        file.sync_all().map_err(write_failed)?;
    }
    drop(file);

    fs::rename(&tmp_path, path).map_err(|source| ContainerError::WriteFailed {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

/// Returns `<path>.tmp`.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ElementType, Layout, MaxExtent};
    use tempfile::tempdir;

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        let mut group = GroupNode::default();
        group
            .attributes
            .insert("max_entries".to_string(), AttributeValue::UInt(5));
        group.datasets.insert(
            "values".to_string(),
            DatasetNode {
                spec: DatasetSpec {
                    element_type: ElementType::U8,
                    shape: vec![30, 30],
                    max_extent: MaxExtent::Fixed,
                    layout: Layout::Chunked {
                        chunk: vec![20, 20],
                        compression: Some(6),
                    },
                },
                data: (0..900u32).map(|v| (v % 251) as u8).collect(),
                attributes: BTreeMap::from([("timestamp".to_string(), AttributeValue::Float(1.0))]),
            },
        );
        tree.groups.insert("/numeric".to_string(), group);
        tree
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.tlm");
        let tree = sample_tree();

        save(&tree, &path, true).unwrap();
        assert!(has_magic(&path));
        assert!(!temp_path(&path).exists());

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.groups.len(), 2);
        let group = &loaded.groups["/numeric"];
        assert_eq!(group.attributes["max_entries"], AttributeValue::UInt(5));
        let node = &group.datasets["values"];
        assert_eq!(node.data, tree.groups["/numeric"].datasets["values"].data);
        assert_eq!(node.attributes["timestamp"], AttributeValue::Float(1.0));
    }

    #[test]
    fn test_has_magic_rejects_other_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        assert!(!has_magic(&path));
        fs::write(&path, b"hello world").unwrap();
        assert!(!has_magic(&path));
        fs::write(&path, b"").unwrap();
        assert!(!has_magic(&path));
    }

    #[test]
    fn test_corrupted_index_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.tlm");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&9u64.to_le_bytes());
        bytes.extend_from_slice(b"{ invalid");
        fs::write(&path, &bytes).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(
            err,
            crate::error::TelestoreError::Container(ContainerError::IndexSerialize(_))
        ));
    }

    #[test]
    fn test_bad_version_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.tlm");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    fn write_raw(path: &Path, index: &Index, blobs: &[u8]) {
        let json = serde_json::to_vec(index).unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(json.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&json);
        bytes.extend_from_slice(blobs);
        fs::write(path, &bytes).unwrap();
    }

    #[test]
    fn test_oversized_shape_rejected_before_allocation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.tlm");

        for chunk in [1u64, 1_000_000_000_000] {
            let index = Index {
                groups: vec![GroupEntry {
                    path: "/numeric".to_string(),
                    attributes: BTreeMap::new(),
                    datasets: vec![DatasetEntry {
                        name: "huge".to_string(),
                        spec: DatasetSpec {
                            element_type: ElementType::U8,
                            shape: vec![1_000_000_000_000],
                            max_extent: MaxExtent::Fixed,
                            layout: Layout::Chunked {
                                chunk: vec![chunk],
                                compression: Some(6),
                            },
                        },
                        attributes: BTreeMap::new(),
                        blobs: vec![BlobRef { offset: 0, len: 8 }],
                    }],
                }],
            };
            write_raw(&path, &index, &[0u8; 8]);

            let err = load(&path).unwrap_err();
            assert!(
                matches!(
                    err,
                    crate::error::TelestoreError::Container(
                        ContainerError::CorruptedContainer { .. }
                    )
                ),
                "chunk {chunk}: {err}"
            );
        }
    }

    #[test]
    fn test_truncated_blob_region_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.tlm");
        save(&sample_tree(), &path, false).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        assert!(load(&path).is_err());
    }
}
