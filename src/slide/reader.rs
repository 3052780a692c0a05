//! Format-agnostic slide access.
//!
//! Every format backend opens files into a [`SlideHandle`]. The read side of
//! the contract is split out as [`SlideReader`] so that cache leases can hand
//! out read access without exposing `close`, which belongs to the cache.
//!
//! The geometry engine only asks backends for rectangles that lie completely
//! inside a level. Backends may still reject such reads with any
//! [`SlideError`]; those errors are propagated, never retried.

use async_trait::async_trait;

use crate::error::SlideError;

use super::buffer::PixelBuffer;
use super::info::SlideInfo;

/// Read access to an opened slide.
///
/// All reads are async and can be abandoned by dropping the future. Callers
/// that need a read to complete regardless (e.g. non-reentrant backends
/// that would otherwise be left mid-decode) run it in a spawned task.
#[async_trait]
pub trait SlideReader: Send + Sync {
    /// Metadata computed when the slide was opened.
    fn get_info(&self) -> &SlideInfo;

    /// Read a rectangle of `width x height` pixels at `(x, y)` on `level`.
    async fn get_region(
        &self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<PixelBuffer, SlideError>;

    /// Read tile `(tile_x, tile_y)` of `level`.
    ///
    /// Edge tiles may be smaller than the declared tile extent.
    async fn get_tile(
        &self,
        level: usize,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<PixelBuffer, SlideError>;

    /// Downscaled overview fitting within `max_width x max_height`.
    async fn get_thumbnail(&self, max_width: u32, max_height: u32)
        -> Result<PixelBuffer, SlideError>;

    /// The slide label image, or `SlideError::NotFound`.
    async fn get_label(&self) -> Result<PixelBuffer, SlideError>;

    /// The macro (overview) image, or `SlideError::NotFound`.
    async fn get_macro(&self) -> Result<PixelBuffer, SlideError>;

    /// Whether the backend tolerates concurrent calls on one handle.
    ///
    /// When `false`, the cache serializes every call on the handle.
    fn is_reentrant(&self) -> bool {
        true
    }
}

/// An opened slide owning native decoder state.
#[async_trait]
pub trait SlideHandle: SlideReader {
    /// Release the decoder state. Reads after `close` fail with
    /// `SlideError::Closed`.
    async fn close(&self);
}
