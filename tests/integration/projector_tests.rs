//! Channel projection integration tests.
//!
//! Tests verify projection of buffers produced by the geometry engine,
//! including padded regions and high bit depth multi-channel slides.

use std::sync::Arc;

use wsi_service::{
    default_upper, Background, ChannelProjector, DisplayImage, IntensityRange, ProjectionError,
    RegionGeometryEngine, SlideReader,
};

use super::test_utils::{pattern, CallLog, MockSlide, MockSlideSpec};

fn fluorescence_slide() -> MockSlide {
    let spec = MockSlideSpec {
        channels: 5,
        bit_depth: 16,
        ..Default::default()
    };
    MockSlide::new(spec, "/data/fluo.tif", Arc::new(CallLog::default()))
}

fn expected_16bit(value: u64) -> u8 {
    (value as f64 / default_upper(16) * 255.0).round().clamp(0.0, 255.0) as u8
}

#[tokio::test]
async fn test_rgb_region_passes_through() {
    let slide = MockSlide::new(
        MockSlideSpec::default(),
        "/data/rgb.tif",
        Arc::new(CallLog::default()),
    );
    let engine = RegionGeometryEngine::new();
    let buffer = engine
        .get_region(&slide, slide.get_info(), 0, 10, 20, 8, 8, &Background::white())
        .await
        .unwrap();

    let DisplayImage::Rgb(image) = ChannelProjector::new().project(&buffer, None).unwrap() else {
        panic!("expected RGB output");
    };
    let pixel = image.get_pixel(3, 5);
    for c in 0..3 {
        assert_eq!(pixel[c] as u64, pattern(0, c, 13, 25));
    }
}

#[tokio::test]
async fn test_fluorescence_selection_and_rescale() {
    let slide = fluorescence_slide();
    let engine = RegionGeometryEngine::new();
    let buffer = engine
        .get_region(&slide, slide.get_info(), 0, 0, 0, 16, 16, &Background::Scalar(0))
        .await
        .unwrap();

    let image = ChannelProjector::new()
        .project(&buffer, Some(&[4, 0]))
        .unwrap();
    let DisplayImage::Rgb(image) = image else {
        panic!("expected RGB output");
    };

    for (x, y) in [(0, 0), (7, 3), (15, 15)] {
        let pixel = image.get_pixel(x, y);
        assert_eq!(pixel[0], expected_16bit(pattern(0, 4, x, y) * 100));
        assert_eq!(pixel[1], expected_16bit(pattern(0, 0, x, y) * 100));
        assert_eq!(pixel[2], 0);
    }
}

#[tokio::test]
async fn test_all_channels_truncated_to_three() {
    let slide = fluorescence_slide();
    let engine = RegionGeometryEngine::new();
    let buffer = engine
        .get_region(&slide, slide.get_info(), 1, 0, 0, 4, 4, &Background::Scalar(0))
        .await
        .unwrap();

    let all = ChannelProjector::new().project(&buffer, None).unwrap();
    let first_three = ChannelProjector::new()
        .project(&buffer, Some(&[0, 1, 2]))
        .unwrap();
    let empty = ChannelProjector::new().project(&buffer, Some(&[])).unwrap();
    assert_eq!(all.channel_count(), 3);
    assert_eq!(all, first_three);
    assert_eq!(all, empty);
}

#[tokio::test]
async fn test_single_channel_is_grayscale() {
    let slide = fluorescence_slide();
    let engine = RegionGeometryEngine::new();
    // Right half is padding in white, which saturates
    let buffer = engine
        .get_region(&slide, slide.get_info(), 0, 996, 0, 8, 2, &Background::white())
        .await
        .unwrap();

    let DisplayImage::Gray(image) = ChannelProjector::new()
        .project(&buffer, Some(&[3]))
        .unwrap()
    else {
        panic!("expected grayscale output");
    };
    assert_eq!((image.width(), image.height()), (8, 2));
    assert_eq!(image.get_pixel(0, 0)[0], expected_16bit(pattern(0, 3, 996, 0) * 100));
    assert_eq!(image.get_pixel(7, 1)[0], 255);
}

#[tokio::test]
async fn test_auto_range_spans_full_output() {
    let slide = fluorescence_slide();
    let engine = RegionGeometryEngine::new();
    let buffer = engine
        .get_region(&slide, slide.get_info(), 0, 0, 0, 32, 32, &Background::Scalar(0))
        .await
        .unwrap();

    let DisplayImage::Gray(image) = ChannelProjector::with_range(IntensityRange::Auto)
        .project(&buffer, Some(&[1]))
        .unwrap()
    else {
        panic!("expected grayscale output");
    };
    let min = image.pixels().map(|p| p[0]).min();
    let max = image.pixels().map(|p| p[0]).max();
    assert_eq!((min, max), (Some(0), Some(255)));
}

#[tokio::test]
async fn test_projection_errors() {
    let slide = fluorescence_slide();
    let engine = RegionGeometryEngine::new();
    let buffer = engine
        .get_region(&slide, slide.get_info(), 0, 0, 0, 4, 4, &Background::Scalar(0))
        .await
        .unwrap();
    let projector = ChannelProjector::new();

    assert!(matches!(
        projector.project(&buffer, Some(&[0, 5])),
        Err(ProjectionError::ChannelOutOfBounds {
            channel: 5,
            channels: 5
        })
    ));
    assert!(matches!(
        projector.project(&buffer, Some(&[2, 2])),
        Err(ProjectionError::DuplicateChannel(2))
    ));

    let invalid = ChannelProjector::with_range(IntensityRange::Explicit {
        lower: 100.0,
        upper: 70_000.0,
    });
    assert!(matches!(
        invalid.project(&buffer, Some(&[0])),
        Err(ProjectionError::InvalidIntensityRange { bit_depth: 16, .. })
    ));
}
