//! Cacheable GPU objects
//!
//! A [`CacheableObject`] is the consumer-side handle for a GPU resource that
//! participates in residency accounting. Consumers create it on first use,
//! touch it through a [`ResidencyCache`](crate::ResidencyCache) while they
//! need it and release it afterwards. Device memory is only ever freed by the
//! cache's eviction pass.
//!
//! The cache owns a strong reference to every object it tracks; the object
//! keeps only a weak back-reference to the cache so that `mark_live()` can
//! refresh its recency position.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::residency::SharedState;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
static TOUCH_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a cacheable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate a fresh, process-unique object id
    pub fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id value (for tests and device-side bookkeeping)
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of GPU resource behind a cacheable object
///
/// The kind decides eviction granularity: sparse textures are paged in and
/// out page by page, everything else is resident as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Image,
    SparseTexture,
}

impl ResourceKind {
    /// Returns true if residency for this kind is tracked per page
    pub fn is_paged(self) -> bool {
        matches!(self, ResourceKind::SparseTexture)
    }
}

struct ObjectInner {
    id: ObjectId,
    kind: ResourceKind,
    label: String,
    footprint: usize,
    live: AtomicBool,
    pending_deletion: AtomicBool,
    resident: AtomicBool,
    destroyed: AtomicBool,
    last_touch: AtomicU64,
    /// Bumped every time a cache commits memory for the object
    generation: AtomicU64,
    tracker: Mutex<Option<Weak<SharedState>>>,
}

/// Handle to a GPU resource that participates in LRU residency accounting
///
/// Cloning the handle is cheap; all clones refer to the same object.
///
/// An object belongs to at most one residency cache at a time. Touching it
/// through a second cache fails with `TrackedByOtherCache` until the first
/// cache evicts it.
///
/// # Example
///
/// ```
/// use lumen_cache::{CacheableObject, ResourceKind};
///
/// let vertices = CacheableObject::new("terrain vertices", ResourceKind::Buffer, 4096);
/// assert!(!vertices.is_live());
///
/// vertices.mark_live();
/// assert!(vertices.is_live());
///
/// // Deletion is deferred to the next eviction pass after release.
/// vertices.mark_for_deletion();
/// assert!(vertices.is_marked_for_deletion());
/// ```
#[derive(Clone)]
pub struct CacheableObject {
    inner: Arc<ObjectInner>,
}

impl CacheableObject {
    /// Create a new object
    ///
    /// # Arguments
    ///
    /// * `label` - Human readable name used in diagnostics
    /// * `kind` - Resource kind, which decides eviction granularity
    /// * `footprint` - Resident memory footprint in bytes (for sparse textures,
    ///   the footprint of the fully resident texture)
    pub fn new(label: impl Into<String>, kind: ResourceKind, footprint: usize) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                id: ObjectId::next(),
                kind,
                label: label.into(),
                footprint,
                live: AtomicBool::new(false),
                pending_deletion: AtomicBool::new(false),
                resident: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                last_touch: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                tracker: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Declared resident footprint in bytes
    pub fn footprint(&self) -> usize {
        self.inner.footprint
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.inner.pending_deletion.load(Ordering::Acquire)
    }

    /// Returns true while a residency cache holds device memory for this object
    pub fn is_resident(&self) -> bool {
        self.inner.resident.load(Ordering::Acquire)
    }

    /// Returns true once the object was evicted after being marked for deletion
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Sequence number of the last touch (monotonic across the process)
    pub fn last_touch(&self) -> u64 {
        self.inner.last_touch.load(Ordering::Acquire)
    }

    /// Mark the object live and refresh its last-touch sequence number
    ///
    /// If a residency cache tracks this object, the object also moves to the
    /// most-recent position of that cache's recency list.
    pub fn mark_live(&self) {
        match self.tracker() {
            Some(shared) => shared.lock().promote(self),
            None => self.set_live_and_stamp(),
        }
    }

    /// Request deletion of the object
    ///
    /// Does not free anything. The object is evicted at the first eviction
    /// pass that finds it not live.
    pub fn mark_for_deletion(&self) {
        self.inner.pending_deletion.store(true, Ordering::Release);
    }

    pub(crate) fn set_live_and_stamp(&self) {
        self.inner.live.store(true, Ordering::Release);
        self.inner
            .last_touch
            .store(TOUCH_SEQUENCE.fetch_add(1, Ordering::Relaxed), Ordering::Release);
    }

    pub(crate) fn set_not_live(&self) {
        self.inner.live.store(false, Ordering::Release);
    }

    pub(crate) fn attach(&self, shared: Weak<SharedState>) {
        *self.inner.tracker.lock() = Some(shared);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.resident.store(true, Ordering::Release);
    }

    /// Number of times the object was made resident. A value observed while
    /// resident stays current until the object is evicted.
    pub(crate) fn residency_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Returns true if a cache other than `shared` currently tracks the object
    pub(crate) fn tracked_elsewhere(&self, shared: &Arc<SharedState>) -> bool {
        self.tracker().is_some_and(|tracker| !Arc::ptr_eq(&tracker, shared))
    }

    pub(crate) fn detach(&self) {
        *self.inner.tracker.lock() = None;
        self.inner.resident.store(false, Ordering::Release);
        if self.is_marked_for_deletion() {
            self.inner.destroyed.store(true, Ordering::Release);
        }
    }

    fn tracker(&self) -> Option<Arc<SharedState>> {
        // Clone the weak pointer out so the tracker lock is not held while
        // the cache lock is taken.
        let weak = self.inner.tracker.lock().clone();
        weak.and_then(|w| w.upgrade())
    }
}

impl PartialEq for CacheableObject {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for CacheableObject {}

impl fmt::Debug for CacheableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheableObject")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .field("footprint", &self.inner.footprint)
            .field("live", &self.is_live())
            .field("resident", &self.is_resident())
            .finish()
    }
}
