//! The contract every format backend registers with.

use std::path::Path;

use async_trait::async_trait;

use crate::error::SlideError;
use crate::slide::SlideHandle;

/// A format backend able to open some slide files.
///
/// Backends are registered explicitly with a
/// [`FormatPluginRegistry`](super::FormatPluginRegistry); there is no
/// runtime discovery.
#[async_trait]
pub trait SlideBackend: Send + Sync {
    /// Unique plugin name, used for explicit selection and priority overrides.
    fn name(&self) -> &str;

    /// Whether this backend can attempt to open `path`.
    ///
    /// Implementations check the suffix or sniff content; they must not keep
    /// the file open.
    fn supports(&self, path: &Path) -> bool;

    /// Resolution priority; higher values are tried first.
    fn priority(&self) -> i32 {
        0
    }

    /// File extensions this backend declares, for diagnostics.
    fn supported_extensions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Open `path`, producing a live handle.
    async fn open(&self, path: &Path) -> Result<Box<dyn SlideHandle>, SlideError>;
}

/// Check whether the file name of `path` ends with one of `extensions`
/// (case-insensitive, without leading dot). Multi-part extensions such as
/// `ome.tif` are matched against the whole file name.
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_ascii_lowercase()) else {
        return false;
    };
    extensions.iter().any(|ext| {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        name.len() > ext.len() + 1 && name.ends_with(&format!(".{}", ext))
    })
}
