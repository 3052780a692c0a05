//! Format plugins.
//!
//! A plugin is a [`SlideBackend`] that knows how to open some kind of slide
//! file into a [`SlideHandle`](crate::slide::SlideHandle). Plugins are
//! registered explicitly on a [`FormatPluginRegistry`], which picks the
//! backend for a file:
//!
//! 1. An explicitly requested plugin, or the configured default for the
//!    file's extension, is used alone.
//! 2. Otherwise every plugin whose `supports` accepts the file is tried in
//!    descending priority order until one opens it.
//!
//! Priorities can be overridden from the environment with
//! `PLUGIN_PRIORITY_<NAME>` variables.

mod backend;
mod raster;
mod registry;

pub use backend::{has_extension, SlideBackend};
pub use raster::{RasterBackend, RasterSlide, RASTER_PLUGIN_NAME, RASTER_TILE_SIZE};
pub use registry::{
    FormatPluginRegistry, FormatPluginRegistryBuilder, OpenedSlide, PluginInfo,
    PLUGIN_PRIORITY_PREFIX,
};
