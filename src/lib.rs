//! # WSI Service
//!
//! Region and tile access to Whole Slide Images in several native formats.
//!
//! Opening a slide decoder is expensive, so decoders are cached and shared
//! between requests, and closed again once they have been idle for a while.
//! Requests may reach past the edges of the image; they are padded with a
//! background colour so that every result has exactly the requested size.
//!
//! ## Features
//!
//! - **Pluggable formats**: backends register with a [`FormatPluginRegistry`]
//!   and are picked by extension, priority or explicit choice
//! - **Expiring slide cache**: lazy opens, singleflight, idle timeout and
//!   capacity bound, with closes deferred until in-flight reads finish
//! - **Region normalization**: exactly one backend read per request with any
//!   overlap, none without
//! - **Channel projection**: multi-channel, high bit depth buffers to 8-bit
//!   grayscale or RGB
//!
//! ## Architecture
//!
//! - [`slide`] - Slide metadata, pixel buffers, handle contract, cache and
//!   storage resolution
//! - [`plugin`] - Format backends and the plugin registry
//! - [`region`] - Geometry engine and channel projector
//! - [`config`] - CLI and configuration types
//! - [`error`] - Error types for every phase
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wsi_service::{
//!     Background, CacheConfig, ChannelProjector, ExpiringSlideCache, FormatPluginRegistry,
//!     LocalMapper, RasterBackend, RegionGeometryEngine, SlideReader,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(FormatPluginRegistry::builder().register(RasterBackend::new()).build());
//!     let mapper = Arc::new(LocalMapper::scan("/data", &registry)?);
//!     let cache = ExpiringSlideCache::new(registry, mapper, CacheConfig::default());
//!
//!     let slide = cache.get("2d1c7a6e54b0f4c1b7f4d5e0a1f2c3d4").await?;
//!     let engine = RegionGeometryEngine::new();
//!     let buffer = engine
//!         .get_tile(&slide, slide.get_info(), 0, 3, 3, &Background::white())
//!         .await?;
//!     let image = ChannelProjector::new().project(&buffer, None)?;
//!     image.into_dynamic().save("tile.png")?;
//!
//!     cache.close_all().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod plugin;
pub mod region;
pub mod slide;

// Re-export commonly used types
pub use config::{Cli, Command, ServiceConfig};
pub use error::{
    CacheError, ErrorClass, ErrorPhase, PluginAttempt, PluginError, ProjectionError, RegionError,
    ResolveError, ServiceError, SlideError,
};
pub use plugin::{
    has_extension, FormatPluginRegistry, FormatPluginRegistryBuilder, OpenedSlide, PluginInfo,
    RasterBackend, RasterSlide, SlideBackend, PLUGIN_PRIORITY_PREFIX, RASTER_PLUGIN_NAME,
    RASTER_TILE_SIZE,
};
pub use region::{
    default_upper, select_channels, ChannelProjector, DisplayImage, IntensityRange, Overlap,
    RegionGeometryEngine, DEFAULT_MAX_REGION_PIXELS,
};
pub use slide::{
    Background, CacheConfig, CachedSlide, Channel, ChannelColor, ExpiringSlideCache, Extent,
    Level, LocalCase, LocalMapper, LocalSlide, PixelBuffer, PixelData, PixelLayout, PixelSizeNm,
    SlideHandle, SlideInfo, SlideLease, SlideReader, StorageAddress, StorageResolver,
    DEFAULT_INACTIVE_TIMEOUT, DEFAULT_MAX_OPEN_SLIDES,
};
