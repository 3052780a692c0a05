//! Expiring cache of opened slide handles.
//!
//! Opening a slide is expensive, so handles are opened lazily on first access
//! and shared by every request for the same identifier. A handle is closed
//! once it has not been requested for `inactive_timeout`, when the cache
//! grows beyond `max_open_slides`, or at shutdown.
//!
//! ```text
//!   get(id) ──► entry present? ──yes──► renew deadline ──► SlideLease
//!                    │
//!                    no
//!                    ▼
//!              open in flight? ──yes──► wait for its result
//!                    │
//!                    no
//!                    ▼
//!        spawn: resolve ─► registry.resolve_and_open ─► insert entry
//! ```
//!
//! # Deferred close
//!
//! Each cached slide carries a close gate (a `RwLock<()>`). A [`SlideLease`]
//! holds a read guard on the gate for as long as it is alive, and reads made
//! through the lease keep it until they finish. Eviction first moves the
//! entry from the map to the closing set under the map lock, then takes the
//! write side of the gate before calling `close`.
//!
//! Shutdown does not wait for leases. [`ExpiringSlideCache::close_all`]
//! force-closes every open and closing slide once the backend calls already
//! running on it have returned; later reads through old leases fail with
//! [`SlideError::Closed`]. A handle is never closed under an in-flight read.
//!
//! # Expiry
//!
//! Every entry has one expiry task. Renewing an entry only moves its
//! deadline; when the task wakes it re-checks the deadline and the entry's
//! epoch under the map lock and goes back to sleep if the entry was renewed
//! or replaced in the meantime.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{watch, Mutex, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CacheError, SlideError};
use crate::plugin::FormatPluginRegistry;

use super::buffer::PixelBuffer;
use super::info::SlideInfo;
use super::reader::{SlideHandle, SlideReader};
use super::source::StorageResolver;

// =============================================================================
// Configuration
// =============================================================================

/// Default idle time before a handle is closed.
pub const DEFAULT_INACTIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default maximum number of simultaneously open handles.
pub const DEFAULT_MAX_OPEN_SLIDES: usize = 100;

/// Cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Idle time after which an unused handle is closed
    pub inactive_timeout: Duration,

    /// Capacity; the least recently used handle is closed beyond it
    pub max_open_slides: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            inactive_timeout: DEFAULT_INACTIVE_TIMEOUT,
            max_open_slides: DEFAULT_MAX_OPEN_SLIDES,
        }
    }
}

// =============================================================================
// CachedSlide
// =============================================================================

/// An opened slide owned by the cache.
pub struct CachedSlide {
    slide_id: String,

    /// Name of the plugin that opened the slide
    plugin: String,

    handle: Box<dyn SlideHandle>,

    /// Readers are leases and in-flight reads; the writer is deferred close
    gate: Arc<RwLock<()>>,

    /// Readers are backend calls in progress; the writer is the final close
    ops: RwLock<()>,

    /// Present when the backend is not reentrant
    call_lock: Option<Mutex<()>>,

    /// Set once a close has started; no new leases or reads after that
    closing: AtomicBool,

    closed: AtomicBool,
}

impl CachedSlide {
    fn new(slide_id: String, plugin: String, handle: Box<dyn SlideHandle>) -> Self {
        let call_lock = if handle.is_reentrant() {
            None
        } else {
            Some(Mutex::new(()))
        };
        Self {
            slide_id,
            plugin,
            handle,
            gate: Arc::new(RwLock::new(())),
            ops: RwLock::new(()),
            call_lock,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier the slide was requested with.
    pub fn slide_id(&self) -> &str {
        &self.slide_id
    }

    /// Name of the plugin that opened the slide.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Take a lease, unless the slide is closing or closed.
    fn lease(self: &Arc<Self>) -> Option<SlideLease> {
        if self.is_closing() {
            return None;
        }
        let guard = self.gate.clone().try_read_owned().ok()?;
        if self.is_closing() {
            return None;
        }
        Some(SlideLease {
            slide: self.clone(),
            guard: Arc::new(guard),
        })
    }

    /// Close the handle once every lease and in-flight read is gone.
    async fn close(&self) {
        let _gate = self.gate.write().await;
        self.finish_close().await;
    }

    /// Close the handle without waiting for leases.
    ///
    /// Backend calls already running finish first. Returns once the handle
    /// is closed, whoever closed it.
    async fn force_close(&self) {
        self.finish_close().await;
    }

    async fn finish_close(&self) {
        self.closing.store(true, Ordering::Release);
        // Held across `handle.close` so a concurrent close returns after it
        let _ops = self.ops.write().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handle.close().await;
        debug!("Closed slide {} ({})", self.slide_id, self.plugin);
    }

    async fn read(&self, op: ReadOp) -> Result<PixelBuffer, SlideError> {
        let _op = self.ops.read().await;
        if self.is_closing() {
            return Err(SlideError::Closed);
        }
        let _serial = match &self.call_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if self.is_closing() {
            return Err(SlideError::Closed);
        }
        match op {
            ReadOp::Region {
                level,
                x,
                y,
                width,
                height,
            } => self.handle.get_region(level, x, y, width, height).await,
            ReadOp::Tile {
                level,
                tile_x,
                tile_y,
            } => self.handle.get_tile(level, tile_x, tile_y).await,
            ReadOp::Thumbnail {
                max_width,
                max_height,
            } => self.handle.get_thumbnail(max_width, max_height).await,
            ReadOp::Label => self.handle.get_label().await,
            ReadOp::Macro => self.handle.get_macro().await,
        }
    }
}

/// A read forwarded to the cached handle.
#[derive(Debug, Clone, Copy)]
enum ReadOp {
    Region {
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Tile {
        level: usize,
        tile_x: u32,
        tile_y: u32,
    },
    Thumbnail {
        max_width: u32,
        max_height: u32,
    },
    Label,
    Macro,
}

// =============================================================================
// SlideLease
// =============================================================================

/// Shared access to a cached slide that keeps it from being closed.
///
/// Reads run in their own task: dropping a read future does not cancel the
/// backend call, it only discards the result. Calls on non-reentrant
/// backends are serialized per handle.
#[derive(Clone)]
pub struct SlideLease {
    slide: Arc<CachedSlide>,
    guard: Arc<OwnedRwLockReadGuard<()>>,
}

impl SlideLease {
    /// Identifier the slide was requested with.
    pub fn slide_id(&self) -> &str {
        self.slide.slide_id()
    }

    /// Name of the plugin that opened the slide.
    pub fn plugin(&self) -> &str {
        self.slide.plugin()
    }

    /// Whether two leases refer to the same opened handle.
    pub fn same_handle(&self, other: &SlideLease) -> bool {
        Arc::ptr_eq(&self.slide, &other.slide)
    }

    async fn detached(&self, op: ReadOp) -> Result<PixelBuffer, SlideError> {
        let slide = self.slide.clone();
        let guard = self.guard.clone();
        tokio::spawn(async move {
            let _guard = guard;
            slide.read(op).await
        })
        .await
        .map_err(|e| SlideError::Io(format!("read task failed: {}", e)))?
    }
}

impl std::fmt::Debug for SlideLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideLease")
            .field("slide_id", &self.slide.slide_id)
            .field("plugin", &self.slide.plugin)
            .finish()
    }
}

#[async_trait]
impl SlideReader for SlideLease {
    fn get_info(&self) -> &SlideInfo {
        self.slide.handle.get_info()
    }

    async fn get_region(
        &self,
        level: usize,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<PixelBuffer, SlideError> {
        self.detached(ReadOp::Region {
            level,
            x,
            y,
            width,
            height,
        })
        .await
    }

    async fn get_tile(
        &self,
        level: usize,
        tile_x: u32,
        tile_y: u32,
    ) -> Result<PixelBuffer, SlideError> {
        self.detached(ReadOp::Tile {
            level,
            tile_x,
            tile_y,
        })
        .await
    }

    async fn get_thumbnail(
        &self,
        max_width: u32,
        max_height: u32,
    ) -> Result<PixelBuffer, SlideError> {
        self.detached(ReadOp::Thumbnail {
            max_width,
            max_height,
        })
        .await
    }

    async fn get_label(&self) -> Result<PixelBuffer, SlideError> {
        self.detached(ReadOp::Label).await
    }

    async fn get_macro(&self) -> Result<PixelBuffer, SlideError> {
        self.detached(ReadOp::Macro).await
    }
}

// =============================================================================
// ExpiringSlideCache
// =============================================================================

type OpenResult = Result<Arc<CachedSlide>, CacheError>;

struct CacheEntry {
    slide: Arc<CachedSlide>,
    expires_at: Instant,

    /// Distinguishes this entry from later entries for the same identifier
    epoch: u64,

    expiry: JoinHandle<()>,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,

    /// Entries removed from the map whose close has not finished, by epoch
    closing: HashMap<u64, Arc<CachedSlide>>,

    next_epoch: u64,
    shut_down: bool,
}

impl CacheState {
    /// Move an entry removed from the map to the closing set.
    ///
    /// The entry's expiry task is left alone; it may be the caller.
    fn retiring(&mut self, entry: CacheEntry) -> (u64, Arc<CachedSlide>) {
        self.closing.insert(entry.epoch, entry.slide.clone());
        (entry.epoch, entry.slide)
    }
}

/// Outcome of looking for an open in progress.
enum Joined {
    /// The slide was inserted since the fast path missed it
    Cached(SlideLease),
    Waiting(watch::Receiver<Option<OpenResult>>),
}

struct CacheInner {
    registry: Arc<FormatPluginRegistry>,
    resolver: Arc<dyn StorageResolver>,
    config: CacheConfig,

    /// Identifier -> entry; never held across a backend call
    state: Mutex<CacheState>,

    /// Opens in progress, for singleflight
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<OpenResult>>>>,
}

/// Lazily opens slides and closes them after a period of inactivity.
#[derive(Clone)]
pub struct ExpiringSlideCache {
    inner: Arc<CacheInner>,
}

impl ExpiringSlideCache {
    /// Create a cache opening slides through `registry` and locating them
    /// through `resolver`.
    pub fn new(
        registry: Arc<FormatPluginRegistry>,
        resolver: Arc<dyn StorageResolver>,
        config: CacheConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_open_slides).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CacheInner {
                registry,
                resolver,
                config,
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    closing: HashMap::new(),
                    next_epoch: 0,
                    shut_down: false,
                }),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The configuration the cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get a live handle for `slide_id`, opening it on first access.
    ///
    /// Every successful call renews the slide's inactivity deadline. Failed
    /// opens are not remembered; the next call starts from scratch.
    pub async fn get(&self, slide_id: &str) -> Result<SlideLease, CacheError> {
        loop {
            // Fast path: already open
            if let Some(lease) = self.inner.lease_cached(slide_id).await? {
                return Ok(lease);
            }

            // Slow path: join the open in flight or start one
            let mut receiver = match self.join_or_open(slide_id).await? {
                Joined::Cached(lease) => return Ok(lease),
                Joined::Waiting(receiver) => receiver,
            };

            let outcome = match receiver.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                // The opening task went away without a result
                Err(_) => continue,
            };
            match outcome {
                Some(Ok(slide)) => {
                    if let Some(lease) = slide.lease() {
                        return Ok(lease);
                    }
                    // Evicted before we got to it; go around again
                }
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
    }

    /// Join the open in flight for `slide_id`, or start one.
    ///
    /// An open inserts its entry before it leaves `in_flight`, so the map is
    /// checked again under the `in_flight` lock before a new open starts.
    async fn join_or_open(&self, slide_id: &str) -> Result<Joined, CacheError> {
        let mut in_flight = self.inner.in_flight.lock().await;
        if let Some(receiver) = in_flight.get(slide_id) {
            return Ok(Joined::Waiting(receiver.clone()));
        }
        if let Some(lease) = self.inner.lease_cached(slide_id).await? {
            return Ok(Joined::Cached(lease));
        }

        let (sender, receiver) = watch::channel(None);
        in_flight.insert(slide_id.to_string(), receiver.clone());
        drop(in_flight);
        self.spawn_open(slide_id.to_string(), sender);
        Ok(Joined::Waiting(receiver))
    }

    fn spawn_open(&self, slide_id: String, sender: watch::Sender<Option<OpenResult>>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.open_and_insert(&slide_id).await;
            if let Err(ref e) = result {
                warn!("Failed to open slide {}: {}", slide_id, e);
            }
            inner.in_flight.lock().await.remove(&slide_id);
            sender.send_replace(Some(result));
        });
    }

    /// Close `slide_id` now, waiting for its outstanding leases to be dropped.
    ///
    /// Returns whether the slide was open.
    pub async fn invalidate(&self, slide_id: &str) -> bool {
        let retired = {
            let mut state = self.inner.state.lock().await;
            state.entries.pop(slide_id).map(|entry| {
                entry.expiry.abort();
                state.retiring(entry)
            })
        };
        match retired {
            Some((epoch, slide)) => {
                self.inner.retire(epoch, slide).await;
                true
            }
            None => false,
        }
    }

    /// Close every open or closing slide and refuse further requests.
    ///
    /// Pending expiry timers are cancelled. Outstanding leases are not waited
    /// for; each close only waits for the backend calls already running on
    /// the slide. Every handle is closed when this returns.
    pub async fn close_all(&self) {
        let (open, closing) = {
            let mut state = self.inner.state.lock().await;
            state.shut_down = true;
            let mut open = Vec::with_capacity(state.entries.len());
            while let Some((_, entry)) = state.entries.pop_lru() {
                entry.expiry.abort();
                open.push(entry.slide);
            }
            let closing: Vec<_> = state.closing.drain().map(|(_, slide)| slide).collect();
            (open, closing)
        };

        info!(
            "Closing {} open and {} closing slides",
            open.len(),
            closing.len()
        );
        for slide in open.into_iter().chain(closing) {
            slide.force_close().await;
        }
    }

    /// Number of currently open slides.
    pub async fn cached_count(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Whether `slide_id` is currently open. Does not renew it.
    pub async fn contains(&self, slide_id: &str) -> bool {
        self.inner.state.lock().await.entries.contains(slide_id)
    }
}

impl CacheInner {
    async fn lease_cached(&self, slide_id: &str) -> Result<Option<SlideLease>, CacheError> {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(CacheError::ShutDown);
        }
        let Some(entry) = state.entries.get_mut(slide_id) else {
            return Ok(None);
        };
        let Some(lease) = entry.slide.lease() else {
            return Ok(None);
        };
        entry.expires_at = Instant::now() + self.config.inactive_timeout;
        Ok(Some(lease))
    }

    async fn open_and_insert(self: &Arc<Self>, slide_id: &str) -> OpenResult {
        let address = self.resolver.resolve(slide_id).await.map_err(|e| {
            CacheError::SlideUnavailable {
                slide_id: slide_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        let opened = self
            .registry
            .resolve_and_open(&address.main_address, None)
            .await?;
        let (plugin, handle) = opened.into_parts();
        info!("Opened slide {} with plugin {}", slide_id, plugin);

        let slide = Arc::new(CachedSlide::new(slide_id.to_string(), plugin, handle));
        self.insert(slide.clone()).await?;
        Ok(slide)
    }

    /// Close a slide moved to the closing set, then drop it from the set.
    async fn retire(&self, epoch: u64, slide: Arc<CachedSlide>) {
        slide.close().await;
        self.state.lock().await.closing.remove(&epoch);
    }

    async fn insert(self: &Arc<Self>, slide: Arc<CachedSlide>) -> Result<(), CacheError> {
        let (replaced, evicted) = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                drop(state);
                slide.force_close().await;
                return Err(CacheError::ShutDown);
            }

            // Leaves `push` to displace only the least recently used entry
            let replaced = state.entries.pop(&slide.slide_id).map(|entry| {
                entry.expiry.abort();
                state.retiring(entry)
            });

            let epoch = state.next_epoch;
            state.next_epoch += 1;
            let expires_at = Instant::now() + self.config.inactive_timeout;
            let expiry = tokio::spawn(expire(
                Arc::downgrade(self),
                slide.slide_id.clone(),
                epoch,
                expires_at,
            ));

            let evicted = state
                .entries
                .push(
                    slide.slide_id.clone(),
                    CacheEntry {
                        slide,
                        expires_at,
                        epoch,
                        expiry,
                    },
                )
                .map(|(slide_id, entry)| {
                    entry.expiry.abort();
                    (slide_id, state.retiring(entry))
                });
            (replaced, evicted)
        };

        if let Some((epoch, old)) = replaced {
            warn!("Replacing open slide {}", old.slide_id);
            self.spawn_retire(epoch, old);
        }
        if let Some((slide_id, (epoch, old))) = evicted {
            info!("Evicting slide {}: cache full", slide_id);
            self.spawn_retire(epoch, old);
        }
        Ok(())
    }

    /// Retire without holding up the caller on outstanding leases.
    fn spawn_retire(self: &Arc<Self>, epoch: u64, slide: Arc<CachedSlide>) {
        let inner = self.clone();
        tokio::spawn(async move { inner.retire(epoch, slide).await });
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        for (_, entry) in self.state.get_mut().entries.iter() {
            entry.expiry.abort();
        }
    }
}

/// Expiry task of one cache entry.
async fn expire(inner: Weak<CacheInner>, slide_id: String, epoch: u64, mut deadline: Instant) {
    loop {
        tokio::time::sleep_until(deadline).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let slide = {
            let mut state = inner.state.lock().await;
            match state.entries.peek(&slide_id) {
                Some(entry) if entry.epoch == epoch => {
                    if entry.expires_at > Instant::now() {
                        // Renewed while we slept
                        deadline = entry.expires_at;
                        continue;
                    }
                }
                _ => return,
            }
            state
                .entries
                .pop(&slide_id)
                .map(|entry| state.retiring(entry))
        };

        if let Some((epoch, slide)) = slide {
            info!("Closing slide {}: inactive", slide_id);
            inner.retire(epoch, slide).await;
        }
        return;
    }
}
