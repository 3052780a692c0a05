//! Format plugin resolution.
//!
//! The registry decides which backend opens a file:
//!
//! 1. An explicitly requested plugin (or the configured default for the
//!    file's extension) is the only candidate. It must support the path.
//! 2. Otherwise every backend whose `supports(path)` is true is a candidate,
//!    ordered by descending priority. Ties keep registration order.
//! 3. Candidates are opened in order. The first success wins; failures are
//!    collected and reported together if nothing succeeds.
//!
//! # Priorities
//!
//! A backend's own [`SlideBackend::priority`] can be overridden per name,
//! either on the builder or through `PLUGIN_PRIORITY_<NAME>` environment
//! variables (name upper-cased, `-` replaced by `_`).
//!
//! # Example
//!
//! ```ignore
//! use wsi_service::plugin::{FormatPluginRegistry, RasterBackend};
//!
//! let registry = FormatPluginRegistry::builder()
//!     .register(RasterBackend::new())
//!     .priority_overrides_from_env()
//!     .build();
//!
//! let slide = registry.resolve_and_open(Path::new("/data/case/slide.png"), None).await?;
//! println!("opened by {}", slide.plugin());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PluginAttempt, PluginError, SlideError};
use crate::slide::SlideHandle;

use super::backend::SlideBackend;

/// Environment variable prefix for priority overrides.
pub const PLUGIN_PRIORITY_PREFIX: &str = "PLUGIN_PRIORITY_";

// =============================================================================
// OpenedSlide
// =============================================================================

/// A freshly opened handle, tagged with the plugin that produced it.
pub struct OpenedSlide {
    plugin: String,
    handle: Box<dyn SlideHandle>,
}

impl OpenedSlide {
    /// Name of the backend that opened the slide.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn handle(&self) -> &dyn SlideHandle {
        self.handle.as_ref()
    }

    pub fn into_parts(self) -> (String, Box<dyn SlideHandle>) {
        (self.plugin, self.handle)
    }
}

impl fmt::Debug for OpenedSlide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedSlide")
            .field("plugin", &self.plugin)
            .field("slide", &self.handle.get_info().id)
            .finish()
    }
}

/// Summary of a registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    /// Effective priority after overrides
    pub priority: i32,
    pub supported_file_extensions: Vec<String>,
}

// =============================================================================
// Registry
// =============================================================================

struct RegisteredPlugin {
    backend: Arc<dyn SlideBackend>,
    priority: i32,
}

/// Chooses and runs format backends for slide files.
pub struct FormatPluginRegistry {
    /// Registration order
    plugins: Vec<RegisteredPlugin>,

    /// Lower-cased extension to default plugin name
    extension_defaults: HashMap<String, String>,
}

impl FormatPluginRegistry {
    /// Start building a registry.
    pub fn builder() -> FormatPluginRegistryBuilder {
        FormatPluginRegistryBuilder::default()
    }

    /// Whether any registered backend supports `path`.
    pub fn is_supported(&self, path: &Path) -> bool {
        self.plugins.iter().any(|p| p.backend.supports(path))
    }

    /// Names of the backends that would be tried for `path`, in order.
    pub fn candidates(&self, path: &Path) -> Vec<&str> {
        self.ordered_candidates(path)
            .into_iter()
            .map(|p| p.backend.name())
            .collect()
    }

    /// Overview of every registered backend.
    pub fn plugins_overview(&self) -> Vec<PluginInfo> {
        self.plugins
            .iter()
            .map(|p| {
                let mut extensions = p.backend.supported_extensions();
                extensions.sort();
                PluginInfo {
                    name: p.backend.name().to_string(),
                    priority: p.priority,
                    supported_file_extensions: extensions,
                }
            })
            .collect()
    }

    /// Open `path` with the requested plugin, or with the best available one.
    pub async fn resolve_and_open(
        &self,
        path: &Path,
        explicit_plugin: Option<&str>,
    ) -> Result<OpenedSlide, PluginError> {
        let path_str = path.display().to_string();
        let explicit_plugin = explicit_plugin.or_else(|| self.default_plugin_for(path));

        let candidates = match explicit_plugin {
            Some(name) => {
                let plugin = self
                    .plugins
                    .iter()
                    .find(|p| p.backend.name() == name)
                    .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
                if !plugin.backend.supports(path) {
                    return Err(PluginError::UnsupportedFormat {
                        plugin: name.to_string(),
                        path: path_str,
                    });
                }
                vec![plugin]
            }
            None => {
                let candidates = self.ordered_candidates(path);
                if candidates.is_empty() {
                    return Err(PluginError::NoPluginAvailable { path: path_str });
                }
                candidates
            }
        };

        let mut attempts = Vec::with_capacity(candidates.len());
        for plugin in candidates {
            let name = plugin.backend.name();
            debug!("Trying plugin {} for {}", name, path_str);

            match open_validated(plugin.backend.as_ref(), path).await {
                Ok(handle) => {
                    info!("Opened {} with plugin {}", path_str, name);
                    return Ok(OpenedSlide {
                        plugin: name.to_string(),
                        handle,
                    });
                }
                Err(error) => {
                    warn!("Plugin {} unable to open {}: {}", name, path_str, error);
                    attempts.push(PluginAttempt {
                        plugin: name.to_string(),
                        error,
                    });
                }
            }
        }

        Err(PluginError::AllPluginsFailed {
            path: path_str,
            attempts,
        })
    }

    fn ordered_candidates(&self, path: &Path) -> Vec<&RegisteredPlugin> {
        let mut candidates: Vec<_> = self
            .plugins
            .iter()
            .filter(|p| p.backend.supports(path))
            .collect();
        // Stable sort keeps registration order for equal priorities
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }

    fn default_plugin_for(&self, path: &Path) -> Option<&str> {
        let extension = path.extension()?.to_string_lossy().to_ascii_lowercase();
        self.extension_defaults.get(&extension).map(String::as_str)
    }
}

/// Open with one backend and reject handles whose metadata is inconsistent.
async fn open_validated(
    backend: &dyn SlideBackend,
    path: &Path,
) -> Result<Box<dyn SlideHandle>, SlideError> {
    let handle = backend.open(path).await?;
    if let Err(err) = handle.get_info().validate() {
        handle.close().await;
        return Err(err);
    }
    Ok(handle)
}

fn priority_key(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`FormatPluginRegistry`].
#[derive(Default)]
pub struct FormatPluginRegistryBuilder {
    backends: Vec<Arc<dyn SlideBackend>>,
    /// Keyed by normalized plugin name
    priority_overrides: HashMap<String, i32>,
    extension_defaults: HashMap<String, String>,
}

impl FormatPluginRegistryBuilder {
    /// Register a backend. Registration order breaks priority ties.
    pub fn register(self, backend: impl SlideBackend + 'static) -> Self {
        self.register_shared(Arc::new(backend))
    }

    /// Register a backend that is shared with other owners.
    pub fn register_shared(mut self, backend: Arc<dyn SlideBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Override the priority of the backend named `name`.
    pub fn priority_override(mut self, name: &str, priority: i32) -> Self {
        self.priority_overrides.insert(priority_key(name), priority);
        self
    }

    /// Read `PLUGIN_PRIORITY_<NAME>` overrides from the process environment.
    pub fn priority_overrides_from_env(self) -> Self {
        self.priority_overrides_from_vars(std::env::vars())
    }

    /// Read `PLUGIN_PRIORITY_<NAME>` overrides from key/value pairs.
    ///
    /// Values that do not parse as integers are ignored.
    pub fn priority_overrides_from_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(PLUGIN_PRIORITY_PREFIX) else {
                continue;
            };
            match value.as_ref().trim().parse::<i32>() {
                Ok(priority) => {
                    self.priority_overrides.insert(priority_key(name), priority);
                }
                Err(_) => warn!(
                    "Ignoring {}: '{}' is not an integer",
                    key.as_ref(),
                    value.as_ref()
                ),
            }
        }
        self
    }

    /// Use `plugin` for files with `extension` unless a plugin is requested.
    pub fn default_plugin_for_extension(mut self, extension: &str, plugin: &str) -> Self {
        self.extension_defaults.insert(
            extension.trim_start_matches('.').to_ascii_lowercase(),
            plugin.to_string(),
        );
        self
    }

    pub fn build(self) -> FormatPluginRegistry {
        let plugins = self
            .backends
            .into_iter()
            .map(|backend| {
                let priority = self
                    .priority_overrides
                    .get(&priority_key(backend.name()))
                    .copied()
                    .unwrap_or_else(|| backend.priority());
                RegisteredPlugin { backend, priority }
            })
            .collect();

        FormatPluginRegistry {
            plugins,
            extension_defaults: self.extension_defaults,
        }
    }
}
