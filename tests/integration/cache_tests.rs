//! Slide cache integration tests.
//!
//! Tests verify:
//! - Handles are reused until they have been idle for the timeout
//! - Failed opens are not cached
//! - Closing waits for reads that are still running
//! - Shutdown closes everything

use std::sync::Arc;
use std::time::Duration;

use wsi_service::{
    CacheConfig, CacheError, ErrorClass, ErrorPhase, ExpiringSlideCache, FormatPluginRegistry,
    PluginError, ServiceError, SlideError, SlideReader,
};

use super::test_utils::{CallLog, MockBackend, MockResolver};

const TIMEOUT: Duration = Duration::from_secs(600);

fn cache_with(backend: MockBackend, resolver: MockResolver) -> (ExpiringSlideCache, Arc<CallLog>) {
    let log = backend.log();
    let registry = FormatPluginRegistry::builder().register(backend).build();
    let cache = ExpiringSlideCache::new(
        Arc::new(registry),
        Arc::new(resolver),
        CacheConfig {
            inactive_timeout: TIMEOUT,
            max_open_slides: 8,
        },
    );
    (cache, log)
}

fn resolver() -> MockResolver {
    MockResolver::new()
        .with_slide("slide-a", "/data/case/a.tif")
        .with_slide("slide-b", "/data/case/b.tif")
        .with_slide("slide-c", "/data/case/c.svs")
}

#[tokio::test(start_paused = true)]
async fn test_handle_reused_until_idle_timeout() {
    let (cache, log) = cache_with(MockBackend::new("mock", &["tif"]), resolver());

    let first = cache.get("slide-a").await.unwrap();
    assert_eq!(first.get_info().id, "/data/case/a.tif");
    drop(first);

    tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
    let second = cache.get("slide-a").await.unwrap();
    drop(second);
    assert_eq!(log.opens(), 1);

    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    assert_eq!(log.closes(), 1);

    cache.get("slide-a").await.unwrap();
    assert_eq!(log.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slides_expire_independently() {
    let (cache, log) = cache_with(MockBackend::new("mock", &["tif"]), resolver());

    drop(cache.get("slide-a").await.unwrap());
    tokio::time::sleep(Duration::from_secs(300)).await;
    drop(cache.get("slide-b").await.unwrap());
    tokio::time::sleep(Duration::from_secs(301)).await;

    assert!(!cache.contains("slide-a").await);
    assert!(cache.contains("slide-b").await);
    assert_eq!(log.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_slide_is_unavailable() {
    let (cache, log) = cache_with(MockBackend::new("mock", &["tif"]), resolver());

    let err = cache.get("nope").await.unwrap_err();
    assert!(matches!(err, CacheError::SlideUnavailable { ref slide_id, .. } if slide_id == "nope"));

    let err = ServiceError::from(err);
    assert_eq!(err.phase(), ErrorPhase::Resolve);
    assert_eq!(err.class(), ErrorClass::Unavailable);
    assert!(err.is_retryable());
    assert_eq!(log.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resolver_outage_is_retried() {
    let backend = MockBackend::new("mock", &["tif"]);
    let resolver = Arc::new(MockResolver::new().unavailable());
    let registry = FormatPluginRegistry::builder().register(backend).build();
    let cache = ExpiringSlideCache::new(
        Arc::new(registry),
        resolver.clone(),
        CacheConfig::default(),
    );

    assert!(cache.get("slide-a").await.is_err());
    assert!(cache.get("slide-a").await.is_err());
    assert_eq!(resolver.lookups(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_is_not_cached() {
    let backend =
        MockBackend::new("mock", &["tif"]).failing(SlideError::Decode("corrupt".to_string()));
    let (cache, log) = cache_with(backend, resolver());

    for _ in 0..3 {
        let err = cache.get("slide-a").await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Open(PluginError::AllPluginsFailed { .. })
        ));
        assert_eq!(ServiceError::from(err).phase(), ErrorPhase::Open);
    }
    assert_eq!(log.opens(), 3);
    assert_eq!(cache.cached_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_file_fails_open() {
    let (cache, log) = cache_with(MockBackend::new("mock", &["tif"]), resolver());

    let err = cache.get("slide-c").await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::Open(PluginError::NoPluginAvailable { .. })
    ));
    assert_eq!(log.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_open_once() {
    let (cache, log) = cache_with(MockBackend::new("mock", &["tif"]), resolver());

    let gets = (0..8).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("slide-a").await })
    });
    let mut leases = Vec::new();
    for get in gets {
        leases.push(get.await.unwrap().unwrap());
    }

    assert_eq!(log.opens(), 1);
    assert!(leases.windows(2).all(|w| w[0].same_handle(&w[1])));
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_in_flight_read() {
    let backend = MockBackend::new("mock", &["tif"]).with_read_delay(Duration::from_secs(900));
    let (cache, log) = cache_with(backend, resolver());

    let lease = cache.get("slide-a").await.unwrap();
    let read = tokio::spawn(async move { lease.get_region(0, 0, 0, 4, 4).await });

    // Expiry removes the entry while the read is still running
    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    assert!(!cache.contains("slide-a").await);
    assert_eq!(log.closes(), 0);

    let buffer = read.await.unwrap().unwrap();
    assert_eq!((buffer.width(), buffer.height()), (4, 4));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(log.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_all_closes_every_slide() {
    let (cache, log) = cache_with(MockBackend::new("mock", &["tif"]), resolver());

    drop(cache.get("slide-a").await.unwrap());
    drop(cache.get("slide-b").await.unwrap());
    assert_eq!(cache.cached_count().await, 2);

    cache.close_all().await;
    assert_eq!(log.closes(), 2);
    assert_eq!(cache.cached_count().await, 0);
    assert!(matches!(
        cache.get("slide-a").await,
        Err(CacheError::ShutDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_capacity_bound() {
    let backend = MockBackend::new("mock", &["tif"]);
    let log = backend.log();
    let registry = FormatPluginRegistry::builder().register(backend).build();
    let cache = ExpiringSlideCache::new(
        Arc::new(registry),
        Arc::new(resolver()),
        CacheConfig {
            inactive_timeout: TIMEOUT,
            max_open_slides: 1,
        },
    );

    drop(cache.get("slide-a").await.unwrap());
    drop(cache.get("slide-b").await.unwrap());
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(cache.cached_count().await, 1);
    assert!(cache.contains("slide-b").await);
    assert_eq!(log.closes(), 1);
}
