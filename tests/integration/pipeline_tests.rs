//! End-to-end tests over a real data directory.
//!
//! A temporary `<data_dir>/<case>/<slide>.png` layout is scanned by the
//! local mapper, opened through the registry and cache, normalized by the
//! geometry engine and projected to an image.

use std::path::Path;
use std::sync::Arc;

use image::{Rgb, RgbImage};

use wsi_service::{
    Background, CacheConfig, ChannelProjector, DisplayImage, ErrorClass, ErrorPhase,
    ExpiringSlideCache, FormatPluginRegistry, LocalMapper, RasterBackend, RegionGeometryEngine,
    ServiceError, SlideReader, RASTER_PLUGIN_NAME,
};

fn write_slide(path: &Path) {
    RgbImage::from_fn(600, 300, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 42]))
        .save(path)
        .unwrap();
}

fn data_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let case = dir.path().join("case-1");
    std::fs::create_dir(&case).unwrap();
    write_slide(&case.join("slide.png"));
    std::fs::write(case.join("notes.txt"), "not a slide").unwrap();
    // Files directly in the data directory do not belong to a case
    write_slide(&dir.path().join("loose.png"));
    dir
}

fn registry() -> Arc<FormatPluginRegistry> {
    Arc::new(
        FormatPluginRegistry::builder()
            .register(RasterBackend::new())
            .build(),
    )
}

#[tokio::test]
async fn test_local_mapper_layout() {
    let dir = data_dir();
    let registry = registry();

    let mapper = LocalMapper::scan(dir.path(), &registry).unwrap();
    let cases: Vec<_> = mapper.cases().collect();
    let slides: Vec<_> = mapper.slides().collect();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].local_id, "case-1");
    assert_eq!(slides.len(), 1);
    assert_eq!(slides[0].local_id, "slide");
    assert_eq!(slides[0].case_id, cases[0].case_id);
    assert_eq!(cases[0].slide_ids, vec![slides[0].slide_id.clone()]);

    // Identifiers are stable across scans
    let again = LocalMapper::scan(dir.path(), &registry).unwrap();
    assert!(again.slide(&slides[0].slide_id).is_some());
}

#[tokio::test]
async fn test_tile_pipeline() {
    let dir = data_dir();
    let registry = registry();
    let mapper = Arc::new(LocalMapper::scan(dir.path(), &registry).unwrap());
    let slide_id = mapper.slides().next().unwrap().slide_id.clone();
    let cache = ExpiringSlideCache::new(registry, mapper, CacheConfig::default());
    let engine = RegionGeometryEngine::new();

    let slide = cache.get(&slide_id).await.unwrap();
    assert_eq!(slide.plugin(), RASTER_PLUGIN_NAME);
    let info = slide.get_info();
    assert_eq!((info.extent.x, info.extent.y), (600, 300));

    // Tile (2, 1) covers x 512..768, y 256..512 of a 600x300 level
    let tile = engine
        .get_tile(&slide, info, 0, 2, 1, &Background::white())
        .await
        .unwrap();
    assert_eq!((tile.width(), tile.height()), (256, 256));

    let DisplayImage::Rgb(rgb) = ChannelProjector::new().project(&tile, None).unwrap() else {
        panic!("expected RGB output");
    };
    assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 42]);
    assert_eq!(rgb.get_pixel(87, 43).0, [87, 43, 42]);
    assert_eq!(rgb.get_pixel(88, 0).0, [255, 255, 255]);
    assert_eq!(rgb.get_pixel(0, 44).0, [255, 255, 255]);

    let output = dir.path().join("tile.png");
    DisplayImage::Rgb(rgb)
        .into_dynamic()
        .save_with_format(&output, image::ImageFormat::Png)
        .unwrap();
    let decoded = image::open(&output).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (256, 256));

    drop(slide);
    cache.close_all().await;
}

#[tokio::test]
async fn test_region_on_generated_level() {
    let dir = data_dir();
    let registry = registry();
    let mapper = Arc::new(LocalMapper::scan(dir.path(), &registry).unwrap());
    let slide_id = mapper.slides().next().unwrap().slide_id.clone();
    let cache = ExpiringSlideCache::new(registry, mapper, CacheConfig::default());

    let slide = cache.get(&slide_id).await.unwrap();
    let info = slide.get_info();
    assert!(info.levels[1].generated);

    let region = RegionGeometryEngine::new()
        .get_region(&slide, info, 1, 250, 100, 100, 100, &Background::Scalar(0))
        .await
        .unwrap();
    assert_eq!((region.width(), region.height()), (100, 100));
    // Level 1 is 300x150; the lower right corner is padding
    assert_eq!(region.sample(2, 10, 10), Some(42));
    assert_eq!(region.sample(2, 99, 99), Some(0));

    drop(slide);
    cache.close_all().await;
}

#[tokio::test]
async fn test_pipeline_error_phases() {
    let dir = data_dir();
    let registry = registry();
    let mapper = Arc::new(LocalMapper::scan(dir.path(), &registry).unwrap());
    let slide_id = mapper.slides().next().unwrap().slide_id.clone();
    let cache = ExpiringSlideCache::new(registry, mapper, CacheConfig::default());

    let err = ServiceError::from(cache.get("does-not-exist").await.unwrap_err());
    assert_eq!(err.phase(), ErrorPhase::Resolve);
    assert_eq!(err.class(), ErrorClass::Unavailable);

    let slide = cache.get(&slide_id).await.unwrap();
    let err = RegionGeometryEngine::new()
        .get_region(&slide, slide.get_info(), 9, 0, 0, 10, 10, &Background::white())
        .await
        .map_err(ServiceError::from)
        .unwrap_err();
    assert_eq!(err.phase(), ErrorPhase::Normalize);
    assert_eq!(err.class(), ErrorClass::Client);

    let err = ChannelProjector::new()
        .project(&slide.get_thumbnail(32, 32).await.unwrap(), Some(&[3]))
        .map_err(ServiceError::from)
        .unwrap_err();
    assert_eq!(err.phase(), ErrorPhase::Normalize);

    drop(slide);
    cache.close_all().await;
}
