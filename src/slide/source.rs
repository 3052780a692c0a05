//! Storage resolution: mapping slide identifiers to file locations.
//!
//! The cache never decides where a slide's bytes live. It asks a
//! [`StorageResolver`], which in production is usually a remote mapping
//! service. [`LocalMapper`] is the local-mode resolver that derives
//! identifiers from a directory tree.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ResolveError;
use crate::plugin::FormatPluginRegistry;

/// Number of hash bytes used for local slide and case identifiers.
const LOCAL_ID_BYTES: usize = 16;

/// Location of a slide's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageAddress {
    /// File or directory the backend opens
    pub main_address: PathBuf,

    /// Companion files of multi-file formats
    pub secondary_addresses: Vec<PathBuf>,
}

impl StorageAddress {
    /// Address of a single-file slide.
    pub fn single(main_address: impl Into<PathBuf>) -> Self {
        Self {
            main_address: main_address.into(),
            secondary_addresses: Vec::new(),
        }
    }
}

/// Resolves slide identifiers to storage addresses.
#[async_trait]
pub trait StorageResolver: Send + Sync {
    /// Look up where the slide's bytes live.
    async fn resolve(&self, slide_id: &str) -> Result<StorageAddress, ResolveError>;
}

// =============================================================================
// Local Mapper
// =============================================================================

/// A slide discovered by the local mapper.
#[derive(Debug, Clone, Serialize)]
pub struct LocalSlide {
    pub slide_id: String,
    pub case_id: String,
    /// File name without extension
    pub local_id: String,
    pub storage: StorageAddress,
}

/// A case directory discovered by the local mapper.
#[derive(Debug, Clone, Serialize)]
pub struct LocalCase {
    pub case_id: String,
    /// Directory name
    pub local_id: String,
    pub slide_ids: Vec<String>,
}

/// Resolver for a data directory laid out as `<data_dir>/<case>/<slide>`.
///
/// Every sub-directory of the data directory is a case; every entry in a
/// case directory that some registered plugin supports is a slide.
/// Identifiers are stable hashes of the case-relative path, so they survive
/// restarts as long as files are not renamed.
#[derive(Debug, Clone, Default)]
pub struct LocalMapper {
    cases: BTreeMap<String, LocalCase>,
    slides: BTreeMap<String, LocalSlide>,
}

impl LocalMapper {
    /// Scan `data_dir`, keeping entries any plugin in `registry` supports.
    pub fn scan(
        data_dir: impl AsRef<Path>,
        registry: &FormatPluginRegistry,
    ) -> Result<Self, ResolveError> {
        let data_dir = data_dir.as_ref();
        let mut mapper = Self::default();

        for case_dir in sorted_entries(data_dir)? {
            if !case_dir.is_dir() {
                continue;
            }
            let case_name = file_name(&case_dir);
            let case_id = local_id(&case_name);
            let mut case = LocalCase {
                case_id: case_id.clone(),
                local_id: case_name.clone(),
                slide_ids: Vec::new(),
            };

            for entry in sorted_entries(&case_dir)? {
                if !registry.is_supported(&entry) {
                    continue;
                }
                let entry_name = file_name(&entry);
                let slide_id = local_id(&format!("{}/{}", case_name, entry_name));
                if mapper.slides.contains_key(&slide_id) {
                    warn!("Ignoring slide {:?}: identifier collision", entry);
                    continue;
                }

                let local_id = entry
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(entry_name);
                let storage = storage_address_for(&entry)?;
                debug!("Mapped slide {} -> {:?}", slide_id, storage.main_address);

                case.slide_ids.push(slide_id.clone());
                mapper.slides.insert(
                    slide_id.clone(),
                    LocalSlide {
                        slide_id,
                        case_id: case_id.clone(),
                        local_id,
                        storage,
                    },
                );
            }

            mapper.cases.insert(case_id, case);
        }

        Ok(mapper)
    }

    /// All cases, ordered by identifier.
    pub fn cases(&self) -> impl Iterator<Item = &LocalCase> {
        self.cases.values()
    }

    /// All slides, ordered by identifier.
    pub fn slides(&self) -> impl Iterator<Item = &LocalSlide> {
        self.slides.values()
    }

    /// Look up a slide without going through the async resolver.
    pub fn slide(&self, slide_id: &str) -> Option<&LocalSlide> {
        self.slides.get(slide_id)
    }
}

#[async_trait]
impl StorageResolver for LocalMapper {
    async fn resolve(&self, slide_id: &str) -> Result<StorageAddress, ResolveError> {
        self.slides
            .get(slide_id)
            .map(|s| s.storage.clone())
            .ok_or_else(|| ResolveError::NotFound(slide_id.to_string()))
    }
}

/// Stable identifier for a local path component.
fn local_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..LOCAL_ID_BYTES])
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ResolveError> {
    let read_dir = fs::read_dir(dir)
        .map_err(|e| ResolveError::Unavailable(format!("cannot read {:?}: {}", dir, e)))?;
    let mut entries = read_dir
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ResolveError::Unavailable(format!("cannot read {:?}: {}", dir, e)))?;
    entries.sort();
    Ok(entries)
}

/// Collect companion files for multi-file formats.
///
/// A directory slide (e.g. a DICOM series) lists its files as secondary
/// addresses. A MIRAX `.mrxs` file lists the contents of the sibling
/// directory with the same stem.
fn storage_address_for(entry: &Path) -> Result<StorageAddress, ResolveError> {
    let mut address = StorageAddress::single(entry);

    if entry.is_dir() {
        address.secondary_addresses = sorted_entries(entry)?
            .into_iter()
            .filter(|p| p.is_file())
            .collect();
    } else if entry
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mrxs"))
    {
        let companion = entry.with_extension("");
        if companion.is_dir() {
            address.secondary_addresses = sorted_entries(&companion)?;
        }
    }

    Ok(address)
}
