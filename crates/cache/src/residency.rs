//! LRU residency cache with a device memory budget
//!
//! Tracks which cacheable objects hold device memory, in least-recently-used
//! order, and evicts non-live objects (or individual pages of sparse textures)
//! when the resident footprint exceeds the configured budget.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ResidencyConfig;
use crate::device::{DeviceContext, ResidencyUnit};
use crate::diagnostics::{DiagnosticsSink, FrameDiagnostic, SoftOverBudget, TracingDiagnostics};
use crate::error::ResidencyError;
use crate::lru::RecencyList;
use crate::memory_budget::{self, MemoryPressure, PressureThresholds};
use crate::object::{CacheableObject, ObjectId};
use crate::signal::{ResidencySignal, SignalSet};
use crate::sparse::PageCoord;

/// Default sparse page size (64 KiB)
pub const DEFAULT_PAGE_BYTES: usize = 64 * 1024;

/// Statistics about residency cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResidencyStats {
    /// Number of objects currently cached
    pub object_count: usize,

    /// Resident footprint in bytes
    pub footprint: usize,

    /// Budget in bytes
    pub budget: usize,

    /// Touches that found the object already cached
    pub hits: u64,

    /// Touches that had to make the object resident
    pub misses: u64,

    /// Whole objects evicted
    pub evictions: u64,

    /// Individual sparse pages evicted
    pub page_evictions: u64,

    /// Eviction passes that ended over budget
    pub soft_over_budget: u64,
}

impl ResidencyStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate budget utilization (can exceed 1.0 while over budget)
    pub fn utilization(&self) -> f64 {
        memory_budget::utilization(self.footprint, self.budget)
    }
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    /// Objects removed from the cache entirely, in eviction order
    pub evicted: Vec<ObjectId>,
    /// Sparse pages released, including pages of wholly evicted textures
    pub pages_evicted: usize,
    /// Bytes returned to the device
    pub bytes_freed: usize,
    /// Footprint before the pass
    pub footprint_before: usize,
    /// Footprint after the pass
    pub footprint_after: usize,
    /// Set when every remaining object was live and the budget could not be met
    pub over_budget: Option<SoftOverBudget>,
}

impl EvictionReport {
    fn starting_at(footprint: usize) -> Self {
        Self {
            footprint_before: footprint,
            footprint_after: footprint,
            ..Default::default()
        }
    }

    pub fn is_over_budget(&self) -> bool {
        self.over_budget.is_some()
    }
}

pub(crate) type SharedState = Mutex<CacheState>;

/// Per-page residency of a sparse texture, in page recency order
struct PageTable {
    recency: RecencyList<PageCoord>,
    signals: HashMap<PageCoord, ResidencySignal>,
}

impl PageTable {
    fn new() -> Self {
        Self {
            recency: RecencyList::new(),
            signals: HashMap::new(),
        }
    }
}

struct CacheEntry {
    object: CacheableObject,
    /// Recency stamp of the last touch; objects touched together share one
    stamp: u64,
    footprint: usize,
    signal: ResidencySignal,
    pages: Option<PageTable>,
}

/// Internal cache state
pub(crate) struct CacheState {
    entries: HashMap<ObjectId, CacheEntry>,
    recency: RecencyList<ObjectId>,
    footprint: usize,
    budget: usize,
    frame: u64,
    clock: u64,
    page_bytes: usize,
    thresholds: PressureThresholds,
    stats: ResidencyStats,
}

impl CacheState {
    fn new(budget: usize, page_bytes: usize, thresholds: PressureThresholds) -> Self {
        Self {
            entries: HashMap::new(),
            recency: RecencyList::new(),
            footprint: 0,
            budget,
            frame: 0,
            clock: 0,
            page_bytes,
            thresholds,
            stats: ResidencyStats {
                budget,
                ..Default::default()
            },
        }
    }

    /// Next recency stamp
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Mark a tracked object live and move it to the most recent position
    pub(crate) fn promote(&mut self, object: &CacheableObject) {
        object.set_live_and_stamp();
        let id = object.id();
        let stamp = self.tick();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.stamp = stamp;
            self.recency.touch(id);
        }
    }

    /// Insert or refresh an object, marking it live and most recent
    fn admit(
        &mut self,
        object: &CacheableObject,
        footprint: usize,
        stamp: u64,
        shared: &Arc<SharedState>,
        device: &dyn DeviceContext,
    ) -> ResidencySignal {
        let id = object.id();
        object.set_live_and_stamp();

        let signal = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.stamp = stamp;
                self.stats.hits += 1;
                entry.signal.clone()
            }
            None => {
                let signal = if footprint > 0 {
                    device.commit(&ResidencyUnit::Object {
                        id,
                        bytes: footprint,
                    })
                } else {
                    ResidencySignal::completed()
                };
                let pages = object.kind().is_paged().then(PageTable::new);
                self.entries.insert(
                    id,
                    CacheEntry {
                        object: object.clone(),
                        stamp,
                        footprint,
                        signal: signal.clone(),
                        pages,
                    },
                );
                self.footprint += footprint;
                self.stats.misses += 1;
                object.attach(Arc::downgrade(shared));
                tracing::trace!(object = %id, label = object.label(), footprint, "made resident");
                signal
            }
        };

        self.recency.touch(id);
        signal
    }

    /// Page in a set of pages of a sparse object, refreshing pages that are
    /// already resident
    fn page_in(
        &mut self,
        object: &CacheableObject,
        pages: &BTreeSet<PageCoord>,
        shared: &Arc<SharedState>,
        device: &dyn DeviceContext,
    ) -> Result<SignalSet, ResidencyError> {
        let id = object.id();
        let page_bytes = self.page_bytes;

        let (current, missing) = match self.entries.get(&id).and_then(|e| e.pages.as_ref()) {
            Some(table) => (
                self.entries.get(&id).map_or(0, |e| e.footprint),
                pages.iter().filter(|p| !table.recency.contains(p)).count(),
            ),
            None => (0, pages.len()),
        };
        let required = current + missing * page_bytes;
        if required > self.budget {
            return Err(ResidencyError::CapacityExceeded {
                object: id,
                footprint: required,
                budget: self.budget,
            });
        }

        let stamp = self.tick();
        self.admit(object, 0, stamp, shared, device);

        let mut signals = SignalSet::new();
        let mut added = 0;
        if let Some(entry) = self.entries.get_mut(&id) {
            let table = entry.pages.get_or_insert_with(PageTable::new);
            for &page in pages {
                if table.recency.touch(page) {
                    let signal = device.commit(&ResidencyUnit::Page {
                        id,
                        page,
                        bytes: page_bytes,
                    });
                    table.signals.insert(page, signal.clone());
                    signals.push(signal);
                    added += page_bytes;
                } else if let Some(signal) = table.signals.get(&page) {
                    signals.push(signal.clone());
                }
            }
            entry.footprint += added;
        }
        self.footprint += added;

        if added > 0 {
            tracing::debug!(object = %id, pages = added / page_bytes, "paged in");
        }
        Ok(signals)
    }

    /// Release specific pages of a sparse object. Returns how many were resident.
    fn page_out(&mut self, id: ObjectId, pages: &BTreeSet<PageCoord>, device: &dyn DeviceContext) -> usize {
        let page_bytes = self.page_bytes;
        let Some(entry) = self.entries.get_mut(&id) else {
            return 0;
        };
        let Some(table) = entry.pages.as_mut() else {
            return 0;
        };

        let mut released = 0;
        for page in pages {
            if table.recency.remove(page) {
                table.signals.remove(page);
                device.release(&ResidencyUnit::Page {
                    id,
                    page: *page,
                    bytes: page_bytes,
                });
                released += 1;
            }
        }

        let freed = released * page_bytes;
        entry.footprint = entry.footprint.saturating_sub(freed);
        self.footprint = self.footprint.saturating_sub(freed);
        self.stats.page_evictions += released as u64;
        released
    }

    /// Evict marked objects, then least recently used ones until under budget
    fn evict_to_budget(&mut self, device: &dyn DeviceContext) -> EvictionReport {
        let mut report = EvictionReport::starting_at(self.footprint);

        let doomed: Vec<ObjectId> = self
            .recency
            .iter_lru()
            .filter(|id| {
                self.entries.get(id).is_some_and(|e| {
                    !e.object.is_live() && e.object.is_marked_for_deletion()
                })
            })
            .collect();
        for id in doomed {
            self.evict_whole(id, device, &mut report);
        }

        while self.footprint > self.budget {
            match self.select_victim() {
                Some(id) => self.evict_unit(id, device, &mut report),
                None => {
                    let live_objects = self
                        .entries
                        .values()
                        .filter(|e| e.object.is_live())
                        .count();
                    report.over_budget = Some(SoftOverBudget {
                        footprint: self.footprint,
                        budget: self.budget,
                        live_objects,
                    });
                    self.stats.soft_over_budget += 1;
                    break;
                }
            }
        }

        report.footprint_after = self.footprint;
        report
    }

    /// Pick the next eviction candidate
    ///
    /// Walks from the least recently used end, skipping live objects. The
    /// oldest non-live entry wins unless other entries share its recency
    /// stamp (touched by one `touch_all` call): among those the largest
    /// footprint wins, equal footprints go to the older one.
    fn select_victim(&self) -> Option<ObjectId> {
        let mut best: Option<(ObjectId, u64, usize)> = None;

        for id in self.recency.iter_lru() {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if let Some((_, stamp, _)) = best {
                if entry.stamp != stamp {
                    break;
                }
            }
            if entry.object.is_live() {
                continue;
            }
            match best {
                Some((_, _, footprint)) if entry.footprint <= footprint => {}
                _ => best = Some((id, entry.stamp, entry.footprint)),
            }
        }

        best.map(|(id, _, _)| id)
    }

    /// Evict one unit of an object: its least recently touched page for
    /// sparse textures with resident pages, the whole object otherwise
    fn evict_unit(&mut self, id: ObjectId, device: &dyn DeviceContext, report: &mut EvictionReport) {
        let page_bytes = self.page_bytes;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        if let Some(table) = entry.pages.as_mut() {
            if let Some(page) = table.recency.pop_back() {
                table.signals.remove(&page);
                device.release(&ResidencyUnit::Page {
                    id,
                    page,
                    bytes: page_bytes,
                });
                entry.footprint = entry.footprint.saturating_sub(page_bytes);
                self.footprint = self.footprint.saturating_sub(page_bytes);
                self.stats.page_evictions += 1;
                report.pages_evicted += 1;
                report.bytes_freed += page_bytes;
                tracing::trace!(object = %id, ?page, "evicted page");

                if !table.recency.is_empty() {
                    return;
                }
            }
        }

        self.evict_whole(id, device, report);
    }

    /// Remove an object from the cache and release all of its memory
    fn evict_whole(&mut self, id: ObjectId, device: &dyn DeviceContext, report: &mut EvictionReport) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.recency.remove(&id);
        self.footprint = self.footprint.saturating_sub(entry.footprint);

        match &entry.pages {
            Some(table) => {
                for page in table.recency.iter() {
                    device.release(&ResidencyUnit::Page {
                        id,
                        page,
                        bytes: self.page_bytes,
                    });
                    report.pages_evicted += 1;
                    self.stats.page_evictions += 1;
                }
            }
            None if entry.footprint > 0 => device.release(&ResidencyUnit::Object {
                id,
                bytes: entry.footprint,
            }),
            None => {}
        }

        report.bytes_freed += entry.footprint;
        report.evicted.push(id);
        self.stats.evictions += 1;
        entry.object.detach();

        tracing::debug!(
            object = %id,
            label = entry.object.label(),
            bytes = entry.footprint,
            deleted = entry.object.is_marked_for_deletion(),
            "evicted"
        );
    }

    fn stats(&self) -> ResidencyStats {
        ResidencyStats {
            object_count: self.entries.len(),
            footprint: self.footprint,
            budget: self.budget,
            ..self.stats
        }
    }
}

/// LRU residency cache
///
/// Thread-safe: `touch`, `release` and the eviction pass are serialized
/// behind a single lock, so producers building different parts of a frame can
/// request residency concurrently. The cache is an explicitly owned object;
/// share it with `Arc` between the subsystems that need residency.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lumen_cache::{CacheableObject, HeadlessDevice, ResidencyCache, ResourceKind};
///
/// let cache = ResidencyCache::new(100, Arc::new(HeadlessDevice::default()));
///
/// let a = CacheableObject::new("a", ResourceKind::Texture, 60);
/// let b = CacheableObject::new("b", ResourceKind::Texture, 50);
///
/// cache.touch(&a).unwrap();
/// cache.release(&a);
/// cache.touch(&b).unwrap(); // over budget: `a` is evicted
///
/// assert!(!cache.contains(a.id()));
/// assert_eq!(cache.footprint(), 50);
/// ```
pub struct ResidencyCache {
    shared: Arc<SharedState>,
    device: Arc<dyn DeviceContext>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl ResidencyCache {
    /// Create a cache with a budget in bytes
    pub fn new(budget: usize, device: Arc<dyn DeviceContext>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(CacheState::new(
                budget,
                DEFAULT_PAGE_BYTES,
                PressureThresholds::default(),
            ))),
            device,
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Create a cache from configuration, capping the budget by device memory
    /// when the configuration asks for it
    pub fn from_config(config: &ResidencyConfig, device: Arc<dyn DeviceContext>) -> Self {
        let budget = config.effective_budget(&device.memory_info());
        tracing::info!(
            device = device.name(),
            budget,
            page_bytes = config.sparse_page_bytes(),
            "residency cache created"
        );
        Self {
            shared: Arc::new(Mutex::new(CacheState::new(
                budget,
                config.sparse_page_bytes(),
                config.pressure.normalized(),
            ))),
            device,
            diagnostics: Arc::new(TracingDiagnostics),
        }
    }

    /// Route frame diagnostics to a different sink
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn device(&self) -> &Arc<dyn DeviceContext> {
        &self.device
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticsSink> {
        &self.diagnostics
    }

    /// Mark an object live and most recently used, making it resident if needed
    ///
    /// If this pushes the footprint over budget, an eviction pass runs before
    /// returning. The returned signal completes once the device has finished
    /// committing memory for the object.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` if the object alone is larger than the whole budget,
    /// `TrackedByOtherCache` if another cache holds the object. The cache is
    /// left untouched in both cases.
    pub fn touch(&self, object: &CacheableObject) -> Result<ResidencySignal, ResidencyError> {
        self.touch_tracked(object).map(|(signal, _)| signal)
    }

    /// `touch`, also returning the residency generation the signal belongs to
    pub(crate) fn touch_tracked(&self, object: &CacheableObject) -> Result<(ResidencySignal, u64), ResidencyError> {
        let mut state = self.shared.lock();
        let footprint = self.admissible(&state, object)?;

        let stamp = state.tick();
        let signal = state.admit(object, footprint, stamp, &self.shared, self.device.as_ref());
        let report = (state.footprint > state.budget).then(|| state.evict_to_budget(self.device.as_ref()));
        let generation = object.residency_generation();
        drop(state);

        if let Some(report) = report {
            self.publish(&report);
        }
        Ok((signal, generation))
    }

    /// Touch several objects as one operation
    ///
    /// All objects get the same recency, so the eviction tie-break (largest
    /// footprint first) applies between them. Every object is checked before
    /// any is admitted; the eviction pass runs once at the end.
    ///
    /// # Errors
    ///
    /// The first object that `touch` would reject. Nothing is admitted then.
    pub fn touch_all(&self, objects: &[CacheableObject]) -> Result<SignalSet, ResidencyError> {
        let mut state = self.shared.lock();
        let footprints = objects
            .iter()
            .map(|object| self.admissible(&state, object))
            .collect::<Result<Vec<_>, _>>()?;

        let stamp = state.tick();
        let signals = objects
            .iter()
            .zip(footprints)
            .map(|(object, footprint)| state.admit(object, footprint, stamp, &self.shared, self.device.as_ref()))
            .collect();
        let report = (state.footprint > state.budget).then(|| state.evict_to_budget(self.device.as_ref()));
        drop(state);

        if let Some(report) = report {
            self.publish(&report);
        }
        Ok(signals)
    }

    /// Budgeted footprint of an object, or why it cannot be admitted
    fn admissible(&self, state: &CacheState, object: &CacheableObject) -> Result<usize, ResidencyError> {
        if object.tracked_elsewhere(&self.shared) {
            return Err(ResidencyError::TrackedByOtherCache { object: object.id() });
        }
        let footprint = if object.kind().is_paged() {
            0
        } else {
            object.footprint()
        };
        if footprint > state.budget {
            return Err(ResidencyError::CapacityExceeded {
                object: object.id(),
                footprint,
                budget: state.budget,
            });
        }
        Ok(footprint)
    }

    /// Mark an object not live
    ///
    /// The object stays cached, and keeps consuming budget, until an eviction
    /// pass removes it.
    pub fn release(&self, object: &CacheableObject) {
        let _state = self.shared.lock();
        object.set_not_live();
    }

    /// Run an eviction pass
    ///
    /// Objects marked for deletion are evicted first if they are not live.
    /// Then least recently used non-live objects are evicted until the
    /// footprint fits the budget. If only live objects remain, the pass stops
    /// and reports a soft over-budget condition.
    pub fn evict_to_budget(&self) -> EvictionReport {
        let report = self.shared.lock().evict_to_budget(self.device.as_ref());
        self.publish(&report);
        report
    }

    /// Explicitly evict a whole object that is not live
    ///
    /// Returns `Ok(false)` if the object was not cached.
    pub fn evict(&self, object: &CacheableObject) -> Result<bool, ResidencyError> {
        let mut state = self.shared.lock();
        if object.is_live() {
            return Err(ResidencyError::ObjectLive { object: object.id() });
        }
        if !state.entries.contains_key(&object.id()) {
            return Ok(false);
        }
        let mut report = EvictionReport::starting_at(state.footprint);
        state.evict_whole(object.id(), self.device.as_ref(), &mut report);
        Ok(true)
    }

    /// Start a new frame and return its number
    pub fn begin_frame(&self) -> u64 {
        let mut state = self.shared.lock();
        state.frame += 1;
        state.frame
    }

    pub fn current_frame(&self) -> u64 {
        self.shared.lock().frame
    }

    /// Cached object ids, most recently used first
    pub fn recency_order(&self) -> Vec<ObjectId> {
        self.shared.lock().recency.iter().collect()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.shared.lock().entries.contains_key(&id)
    }

    /// Returns true if the object is cached and its commit has completed
    pub fn is_resident(&self, id: ObjectId) -> bool {
        self.shared
            .lock()
            .entries
            .get(&id)
            .is_some_and(|e| e.signal.is_complete())
    }

    /// Footprint of a single cached object in bytes
    pub fn object_footprint(&self, id: ObjectId) -> Option<usize> {
        self.shared.lock().entries.get(&id).map(|e| e.footprint)
    }

    pub fn footprint(&self) -> usize {
        self.shared.lock().footprint
    }

    pub fn budget(&self) -> usize {
        self.shared.lock().budget
    }

    /// Sparse page size in bytes
    pub fn page_bytes(&self) -> usize {
        self.shared.lock().page_bytes
    }

    /// Update the budget
    ///
    /// Runs an eviction pass, so a budget below the current footprint
    /// evicts immediately.
    pub fn set_budget(&self, budget: usize) -> EvictionReport {
        let report = {
            let mut state = self.shared.lock();
            state.budget = budget;
            state.stats.budget = budget;
            state.evict_to_budget(self.device.as_ref())
        };
        self.publish(&report);
        report
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }

    pub fn stats(&self) -> ResidencyStats {
        self.shared.lock().stats()
    }

    pub fn pressure(&self) -> MemoryPressure {
        let state = self.shared.lock();
        MemoryPressure::from_utilization(
            memory_budget::utilization(state.footprint, state.budget),
            &state.thresholds,
        )
    }

    pub(crate) fn touch_pages(
        &self,
        object: &CacheableObject,
        pages: &BTreeSet<PageCoord>,
    ) -> Result<SignalSet, ResidencyError> {
        if object.tracked_elsewhere(&self.shared) {
            return Err(ResidencyError::TrackedByOtherCache { object: object.id() });
        }
        let mut state = self.shared.lock();
        let signals = state.page_in(object, pages, &self.shared, self.device.as_ref())?;
        let report = (state.footprint > state.budget).then(|| state.evict_to_budget(self.device.as_ref()));
        drop(state);

        if let Some(report) = report {
            self.publish(&report);
        }
        Ok(signals)
    }

    pub(crate) fn release_pages(&self, id: ObjectId, pages: &BTreeSet<PageCoord>) -> usize {
        self.shared.lock().page_out(id, pages, self.device.as_ref())
    }

    pub(crate) fn resident_pages(&self, id: ObjectId) -> BTreeSet<PageCoord> {
        let state = self.shared.lock();
        state
            .entries
            .get(&id)
            .and_then(|e| e.pages.as_ref())
            .map(|table| table.recency.iter().collect())
            .unwrap_or_default()
    }

    /// Signals for the requested pages that are resident, or `None` if any
    /// requested page is not resident
    pub(crate) fn page_signals(&self, id: ObjectId, pages: &BTreeSet<PageCoord>) -> Option<SignalSet> {
        let state = self.shared.lock();
        let table = state.entries.get(&id)?.pages.as_ref()?;
        pages
            .iter()
            .map(|page| table.signals.get(page).cloned())
            .collect::<Option<Vec<_>>>()
            .map(SignalSet::from_iter)
    }

    fn publish(&self, report: &EvictionReport) {
        if !report.evicted.is_empty() || report.pages_evicted > 0 {
            tracing::debug!(
                objects = report.evicted.len(),
                pages = report.pages_evicted,
                bytes = report.bytes_freed,
                footprint = report.footprint_after,
                "eviction pass"
            );
        }
        if let Some(over) = report.over_budget {
            self.diagnostics.report(FrameDiagnostic::SoftOverBudget(over));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::diagnostics::RecordingDiagnostics;
    use crate::object::ResourceKind;
    use rand::{Rng, SeedableRng};

    fn cache_with(budget: usize) -> (ResidencyCache, Arc<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::default());
        (ResidencyCache::new(budget, device.clone()), device)
    }

    fn texture(label: &str, footprint: usize) -> CacheableObject {
        CacheableObject::new(label, ResourceKind::Texture, footprint)
    }

    #[test]
    fn test_touch_makes_resident_and_live() {
        let (cache, device) = cache_with(100);
        let a = texture("a", 40);

        let signal = cache.touch(&a).unwrap();
        assert!(signal.is_complete());
        assert!(a.is_live());
        assert!(a.is_resident());
        assert!(cache.is_resident(a.id()));
        assert_eq!(cache.footprint(), 40);
        assert_eq!(device.committed_bytes(), 40);
    }

    #[test]
    fn test_scenario_touch_b_evicts_released_a() {
        let (cache, device) = cache_with(100);
        let a = texture("A", 60);
        let b = texture("B", 50);

        cache.touch(&a).unwrap();
        cache.release(&a);
        cache.touch(&b).unwrap();

        assert_eq!(cache.recency_order(), vec![b.id()]);
        assert_eq!(cache.footprint(), 50);
        assert!(!a.is_resident());
        assert_eq!(
            device.released_units(),
            vec![ResidencyUnit::Object { id: a.id(), bytes: 60 }]
        );
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_release_keeps_object_cached() {
        let (cache, _) = cache_with(100);
        let a = texture("a", 10);
        cache.touch(&a).unwrap();
        cache.release(&a);

        assert!(!a.is_live());
        assert!(cache.contains(a.id()));
        assert_eq!(cache.footprint(), 10);
    }

    #[test]
    fn test_capacity_exceeded_leaves_cache_untouched() {
        let (cache, _) = cache_with(100);
        let huge = texture("huge", 101);

        let err = cache.touch(&huge).unwrap_err();
        assert_eq!(
            err,
            ResidencyError::CapacityExceeded {
                object: huge.id(),
                footprint: 101,
                budget: 100,
            }
        );
        assert!(cache.is_empty());
        assert!(!huge.is_live());
    }

    #[test]
    fn test_live_objects_are_never_evicted() {
        let sink = Arc::new(RecordingDiagnostics::new());
        let (cache, _) = cache_with(100);
        let cache = cache.with_diagnostics(sink.clone());

        let a = texture("a", 60);
        let b = texture("b", 60);
        cache.touch(&a).unwrap();
        cache.touch(&b).unwrap();

        // Both live: footprint stays above budget
        assert!(cache.contains(a.id()));
        assert!(cache.contains(b.id()));
        assert_eq!(cache.footprint(), 120);

        let events = sink.drain();
        assert_eq!(
            events,
            vec![FrameDiagnostic::SoftOverBudget(SoftOverBudget {
                footprint: 120,
                budget: 100,
                live_objects: 2,
            })]
        );
    }

    #[test]
    fn test_soft_over_budget_pass_leaves_footprint_unchanged() {
        let (cache, _) = cache_with(100);
        let a = texture("a", 70);
        let b = texture("b", 70);
        cache.touch(&a).unwrap();
        cache.touch(&b).unwrap();

        let before = cache.footprint();
        let report = cache.evict_to_budget();
        assert!(report.is_over_budget());
        assert!(report.evicted.is_empty());
        assert_eq!(report.footprint_before, before);
        assert_eq!(report.footprint_after, before);
        assert_eq!(cache.stats().soft_over_budget, 2);
    }

    #[test]
    fn test_eviction_follows_lru_order() {
        let (cache, _) = cache_with(300);
        let objects: Vec<_> = (0..3).map(|i| texture(&format!("t{i}"), 100)).collect();
        for obj in &objects {
            cache.begin_frame();
            cache.touch(obj).unwrap();
            cache.release(obj);
        }

        // Re-touch the oldest so the middle one becomes least recent
        cache.begin_frame();
        cache.touch(&objects[0]).unwrap();
        cache.release(&objects[0]);

        cache.set_budget(200);
        assert!(!cache.contains(objects[1].id()));
        assert!(cache.contains(objects[0].id()));
        assert!(cache.contains(objects[2].id()));
    }

    #[test]
    fn test_least_recent_evicted_before_larger_recent_object() {
        let (cache, _) = cache_with(100);
        let old = texture("old", 10);
        let recent = texture("recent", 50);
        let c = texture("c", 45);

        cache.touch(&old).unwrap();
        cache.release(&old);
        cache.touch(&recent).unwrap();
        cache.release(&recent);
        cache.touch(&c).unwrap();

        assert!(!cache.contains(old.id()));
        assert!(cache.contains(recent.id()));
        assert_eq!(cache.footprint(), 95);
    }

    #[test]
    fn test_same_frame_touches_keep_lru_order() {
        let (cache, _) = cache_with(1000);
        cache.begin_frame();
        let small = texture("small", 100);
        let large = texture("large", 400);
        for obj in [&small, &large] {
            cache.touch(obj).unwrap();
            cache.release(obj);
        }

        let report = cache.set_budget(450);
        assert_eq!(report.evicted, vec![small.id()]);
    }

    #[test]
    fn test_tie_break_prefers_larger_footprint_among_equal_recency() {
        let (cache, _) = cache_with(1000);
        let small = texture("small", 100);
        let large = texture("large", 400);
        let medium = texture("medium", 200);
        let batch = [small.clone(), large.clone(), medium.clone()];
        assert_eq!(cache.touch_all(&batch).unwrap().len(), 3);
        for obj in &batch {
            cache.release(obj);
        }

        // Needs 300 bytes freed: evicting `large` alone is enough
        let report = cache.set_budget(400);
        assert_eq!(report.evicted, vec![large.id()]);
        assert_eq!(cache.footprint(), 300);
    }

    #[test]
    fn test_older_touch_evicted_before_larger_batch() {
        let (cache, _) = cache_with(1000);
        let old_small = texture("old", 100);
        let new_large = texture("new", 500);
        let new_medium = texture("newer", 300);

        cache.touch(&old_small).unwrap();
        cache.release(&old_small);
        cache.touch_all(&[new_large.clone(), new_medium.clone()]).unwrap();
        cache.release(&new_large);
        cache.release(&new_medium);

        let report = cache.set_budget(800);
        assert_eq!(report.evicted, vec![old_small.id()]);
    }

    #[test]
    fn test_touch_all_checks_every_object_first() {
        let (cache, _) = cache_with(100);
        let fits = texture("fits", 50);
        let huge = texture("huge", 500);

        let err = cache.touch_all(&[fits.clone(), huge.clone()]).unwrap_err();
        assert!(matches!(err, ResidencyError::CapacityExceeded { object, .. } if object == huge.id()));
        assert!(cache.is_empty());
        assert!(!fits.is_live());
    }

    #[test]
    fn test_object_belongs_to_one_cache() {
        let (first, _) = cache_with(1000);
        let (second, _) = cache_with(1000);
        let a = texture("a", 10);

        first.touch(&a).unwrap();
        assert_eq!(
            second.touch(&a).unwrap_err(),
            ResidencyError::TrackedByOtherCache { object: a.id() }
        );
        assert!(second.is_empty());

        // Once evicted from the first cache the object is free to move
        first.release(&a);
        assert_eq!(first.evict(&a), Ok(true));
        second.touch(&a).unwrap();
        assert!(a.is_resident());
        assert!(second.contains(a.id()));
    }

    #[test]
    fn test_marked_for_deletion_evicted_once_not_live() {
        let (cache, _) = cache_with(1000);
        let a = texture("a", 10);
        cache.touch(&a).unwrap();
        a.mark_for_deletion();

        // Still live: the pass does not evict it even though under budget
        let report = cache.evict_to_budget();
        assert!(report.evicted.is_empty());
        assert!(cache.contains(a.id()));
        assert!(!a.is_destroyed());

        cache.release(&a);
        let report = cache.evict_to_budget();
        assert_eq!(report.evicted, vec![a.id()]);
        assert!(a.is_destroyed());
        assert!(!cache.contains(a.id()));
    }

    #[test]
    fn test_mark_live_promotes_tracked_object() {
        let (cache, _) = cache_with(1000);
        let a = texture("a", 10);
        let b = texture("b", 10);
        cache.touch(&a).unwrap();
        cache.touch(&b).unwrap();
        assert_eq!(cache.recency_order(), vec![b.id(), a.id()]);

        cache.release(&a);
        a.mark_live();
        assert!(a.is_live());
        assert_eq!(cache.recency_order(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_explicit_evict_rejects_live_object() {
        let (cache, _) = cache_with(1000);
        let a = texture("a", 10);
        cache.touch(&a).unwrap();

        assert_eq!(
            cache.evict(&a),
            Err(ResidencyError::ObjectLive { object: a.id() })
        );
        cache.release(&a);
        assert_eq!(cache.evict(&a), Ok(true));
        assert_eq!(cache.evict(&a), Ok(false));
        assert_eq!(cache.footprint(), 0);
    }

    #[test]
    fn test_pending_commit_is_not_resident() {
        let (cache, device) = cache_with(1000);
        device.set_deferred(true);
        let a = texture("a", 10);

        let signal = cache.touch(&a).unwrap();
        assert!(cache.contains(a.id()));
        assert!(!cache.is_resident(a.id()));

        device.complete_pending();
        assert!(signal.is_complete());
        assert!(cache.is_resident(a.id()));
    }

    #[test]
    fn test_stats_and_pressure() {
        let (cache, _) = cache_with(100);
        let a = texture("a", 80);
        cache.touch(&a).unwrap();
        cache.touch(&a).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.object_count, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert!((stats.utilization() - 0.8).abs() < 1e-9);
        assert_eq!(cache.pressure(), MemoryPressure::High);
    }

    #[test]
    fn test_zero_budget_with_live_objects_is_critical() {
        let (cache, _) = cache_with(100);
        assert_eq!(cache.set_budget(0).footprint_after, 0);
        assert_eq!(cache.pressure(), MemoryPressure::Low);

        cache.set_budget(100);
        let a = texture("a", 40);
        cache.touch(&a).unwrap();
        let report = cache.set_budget(0);
        assert_eq!(report.over_budget.map(|over| over.footprint), Some(40));
        assert_eq!(cache.stats().utilization(), f64::INFINITY);
        assert_eq!(cache.pressure(), MemoryPressure::Critical);
    }

    #[test]
    fn test_from_config_caps_budget_by_device_memory() {
        let device = Arc::new(HeadlessDevice::new(64 * 1024 * 1024));
        let config = ResidencyConfig::default()
            .with_budget_mb(512)
            .with_device_fraction(0.5);
        let cache = ResidencyCache::from_config(&config, device);
        assert_eq!(cache.budget(), 32 * 1024 * 1024);
    }

    #[test]
    fn test_recency_matches_touch_order_under_random_sequences() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let (cache, _) = cache_with(usize::MAX);
        let objects: Vec<_> = (0..16).map(|i| texture(&format!("o{i}"), 1)).collect();
        let mut expected: Vec<ObjectId> = Vec::new();

        for _ in 0..500 {
            let obj = &objects[rng.gen_range(0..objects.len())];
            if rng.gen_bool(0.6) {
                cache.touch(obj).unwrap();
                expected.retain(|&id| id != obj.id());
                expected.insert(0, obj.id());
            } else {
                cache.release(obj);
            }
            assert_eq!(cache.recency_order(), expected);
        }
    }

    #[test]
    fn test_footprint_within_budget_after_every_pass() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let (cache, device) = cache_with(1000);
        let objects: Vec<_> = (0..24)
            .map(|i| texture(&format!("o{i}"), rng.gen_range(10..300)))
            .collect();

        for frame in 0..50 {
            cache.begin_frame();
            for obj in &objects {
                if rng.gen_bool(0.3) {
                    cache.touch(obj).unwrap();
                }
            }
            for obj in &objects {
                if rng.gen_bool(0.8) {
                    cache.release(obj);
                }
            }

            let report = cache.evict_to_budget();
            if report.is_over_budget() {
                assert!(objects
                    .iter()
                    .filter(|o| cache.contains(o.id()))
                    .all(|o| o.is_live()));
            } else {
                assert!(cache.footprint() <= 1000, "frame {frame} over budget");
            }
            assert_eq!(device.committed_bytes(), cache.footprint());
        }
    }

    #[test]
    fn test_concurrent_touch_and_release() {
        let (cache, _) = cache_with(10_000);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let objects: Vec<_> = (0..50)
                        .map(|i| texture(&format!("t{t}-{i}"), 100))
                        .collect();
                    for obj in &objects {
                        cache.touch(obj).unwrap();
                        cache.release(obj);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        cache.evict_to_budget();
        assert!(cache.footprint() <= 10_000);
        assert_eq!(cache.recency_order().len(), cache.len());
    }
}
