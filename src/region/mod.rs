//! Region normalization and display projection.
//!
//! [`RegionGeometryEngine`] turns region and tile requests, which may extend
//! past the slide, into buffers of exactly the requested size.
//! [`ChannelProjector`] reduces those buffers to 8-bit grayscale or RGB.

mod geometry;
mod projector;

pub use geometry::{Overlap, RegionGeometryEngine, DEFAULT_MAX_REGION_PIXELS};
pub use projector::{
    default_upper, select_channels, ChannelProjector, DisplayImage, IntensityRange,
};
