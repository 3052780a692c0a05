//! Slide abstraction layer.
//!
//! This module provides a unified interface for working with Whole Slide Images
//! regardless of their underlying format, and the cache that keeps opened
//! slides alive between requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Region / tile requests           │
//! └────────────────────┬────────────────────┘
//!                      │ slide id
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │          ExpiringSlideCache             │
//! │  (opens lazily, closes when idle)       │
//! └──────────┬─────────────────┬────────────┘
//!            │ resolve         │ open
//!            ▼                 ▼
//! ┌──────────────────┐ ┌────────────────────┐
//! │ StorageResolver  │ │FormatPluginRegistry│
//! │  (LocalMapper)   │ │ (SlideBackend...)  │
//! └──────────────────┘ └─────────┬──────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────┐
//! │      SlideHandle / SlideReader          │
//! │  (format-agnostic slide interface)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Reads produce [`PixelBuffer`]s: channel-major sample planes at the
//! slide's native bit depth.

mod buffer;
mod cache;
mod info;
mod reader;
mod source;

pub use buffer::{Background, PixelBuffer, PixelData, PixelLayout};
pub use cache::{
    CacheConfig, CachedSlide, ExpiringSlideCache, SlideLease, DEFAULT_INACTIVE_TIMEOUT,
    DEFAULT_MAX_OPEN_SLIDES,
};
pub use info::{
    rgb_channels, Channel, ChannelColor, Extent, Level, PixelSizeNm, SlideInfo,
    LEVEL_EXTENT_TOLERANCE,
};
pub use reader::{SlideHandle, SlideReader};
pub use source::{LocalCase, LocalMapper, LocalSlide, StorageAddress, StorageResolver};
