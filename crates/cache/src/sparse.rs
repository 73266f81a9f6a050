//! Sparse and bindless texture management
//!
//! Sparse textures are resident page by page. The manager translates texel
//! regions into page coordinates, enforces the device's addressable ceiling
//! and forwards paging to the [`ResidencyCache`], which may later evict the
//! least recently touched pages of a texture under budget pressure.
//!
//! Bindless handles are toggled through the same manager so that handle
//! residency is tied to the residency of the object behind it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::bindless::BindlessHandle;
use crate::error::ResidencyError;
use crate::object::{CacheableObject, ObjectId, ResourceKind};
use crate::residency::ResidencyCache;
use crate::signal::SignalSet;

/// Dimensionality of a sparse texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparseDimension {
    D2,
    D3,
}

/// Texel extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent3 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3 {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// A 2D extent (depth 1)
    pub fn d2(width: u32, height: u32) -> Self {
        Self::new(width, height, 1)
    }

    fn axes(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    /// Extent of a mip level, at least one texel per axis
    fn mip(&self, level: u32) -> Self {
        let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
        Self::new(shrink(self.width), shrink(self.height), shrink(self.depth))
    }
}

/// Coordinate of one page: mip level plus page index on each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCoord {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl PageCoord {
    pub fn new(level: u32, x: u32, y: u32, z: u32) -> Self {
        Self { level, x, y, z }
    }
}

impl fmt::Display for PageCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}({},{},{})", self.level, self.x, self.y, self.z)
    }
}

/// Texel region of one mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRegion {
    pub level: u32,
    pub offset: [u32; 3],
    pub extent: Extent3,
}

impl PageRegion {
    pub fn new(level: u32, offset: [u32; 3], extent: Extent3) -> Self {
        Self {
            level,
            offset,
            extent,
        }
    }

    /// A whole mip level of a texture
    pub fn level(texture: &SparseTexture, level: u32) -> Self {
        Self::new(level, [0, 0, 0], texture.level_extent(level))
    }
}

/// A partially resident texture
///
/// The extent and the addressable ceiling are fixed at creation. Cloning is
/// cheap and shares the underlying cacheable object.
#[derive(Debug, Clone)]
pub struct SparseTexture {
    object: CacheableObject,
    dimension: SparseDimension,
    extent: Extent3,
    levels: u32,
    page_extent: [u32; 3],
    max_size: u32,
}

impl SparseTexture {
    pub fn object(&self) -> &CacheableObject {
        &self.object
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn dimension(&self) -> SparseDimension {
        self.dimension
    }

    pub fn extent(&self) -> Extent3 {
        self.extent
    }

    /// Number of mip levels
    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Page shape in texels
    pub fn page_extent(&self) -> [u32; 3] {
        self.page_extent
    }

    /// Addressable ceiling per axis, fixed at creation
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn level_extent(&self, level: u32) -> Extent3 {
        self.extent.mip(level)
    }

    /// Every page of a mip level
    pub fn pages_in_level(&self, level: u32) -> BTreeSet<PageCoord> {
        pages_covering(&PageRegion::level(self, level), self.page_extent)
    }

    /// Total number of pages across all levels
    pub fn page_count(&self) -> usize {
        page_count(self.extent, self.levels, self.page_extent)
    }

    /// Validate a region against the ceiling and the level extent
    fn check_region(&self, region: &PageRegion) -> Result<(), ResidencyError> {
        if region.level >= self.levels {
            return Err(ResidencyError::LevelOutOfRange {
                level: region.level,
                levels: self.levels,
            });
        }

        let level_extent = self.level_extent(region.level).axes();
        for (axis, &size) in region.extent.axes().iter().enumerate() {
            let end = u64::from(region.offset[axis]) + u64::from(size);
            let requested = u32::try_from(end).unwrap_or(u32::MAX);
            if end > u64::from(self.max_size) {
                return Err(ResidencyError::OutOfRange {
                    requested,
                    limit: self.max_size,
                });
            }
            if end > u64::from(level_extent[axis]) {
                return Err(ResidencyError::OutOfRange {
                    requested,
                    limit: level_extent[axis],
                });
            }
        }
        Ok(())
    }
}

fn page_count(extent: Extent3, levels: u32, page_extent: [u32; 3]) -> usize {
    (0..levels)
        .map(|level| {
            let mip = extent.mip(level).axes();
            (0..3)
                .map(|axis| mip[axis].div_ceil(page_extent[axis].max(1)) as usize)
                .product::<usize>()
        })
        .sum()
}

/// Pages touched by a region (the region must be non-empty and in range)
fn pages_covering(region: &PageRegion, page_extent: [u32; 3]) -> BTreeSet<PageCoord> {
    if region.extent.is_empty() {
        return BTreeSet::new();
    }

    let extent = region.extent.axes();
    let span = |axis: usize| {
        let page = page_extent[axis].max(1);
        let first = region.offset[axis] / page;
        let last = (region.offset[axis] + extent[axis] - 1) / page;
        first..=last
    };

    let mut pages = BTreeSet::new();
    for z in span(2) {
        for y in span(1) {
            for x in span(0) {
                pages.insert(PageCoord::new(region.level, x, y, z));
            }
        }
    }
    pages
}

/// Manager for sparse textures and bindless handles
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lumen_cache::{
///     Extent3, HeadlessDevice, PageRegion, ResidencyCache, SparseDimension,
///     SparseTextureManager,
/// };
///
/// let cache = Arc::new(ResidencyCache::new(64 * 1024 * 1024, Arc::new(HeadlessDevice::default())));
/// let manager = SparseTextureManager::new(cache);
///
/// let terrain = manager
///     .create_texture("terrain", SparseDimension::D2, Extent3::d2(1024, 1024), 1)
///     .unwrap();
///
/// let region = PageRegion::new(0, [0, 0, 0], Extent3::d2(256, 128));
/// let signals = manager.make_resident(&terrain, &region).unwrap();
/// assert!(signals.is_complete());
/// assert_eq!(manager.resident_pages(&terrain).len(), 2);
/// ```
pub struct SparseTextureManager {
    cache: Arc<ResidencyCache>,
}

impl SparseTextureManager {
    pub fn new(cache: Arc<ResidencyCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        &self.cache
    }

    /// Hardware ceiling for a sparse texture of the given dimensionality
    pub fn max_size(&self, dimension: SparseDimension) -> u32 {
        let limits = self.cache.device().limits();
        match dimension {
            SparseDimension::D2 => limits.max_sparse_texture_2d,
            SparseDimension::D3 => limits.max_sparse_texture_3d,
        }
    }

    /// Create a sparse texture with no resident pages
    ///
    /// # Errors
    ///
    /// `OutOfRange` if the extent exceeds the ceiling, `LevelOutOfRange` if
    /// `levels` is zero or more than the extent's mip chain.
    pub fn create_texture(
        &self,
        label: impl Into<String>,
        dimension: SparseDimension,
        extent: Extent3,
        levels: u32,
    ) -> Result<SparseTexture, ResidencyError> {
        let limits = self.cache.device().limits();
        let max_size = self.max_size(dimension);
        let (extent, page_extent) = match dimension {
            SparseDimension::D2 => (Extent3::d2(extent.width, extent.height), limits.sparse_page_2d),
            SparseDimension::D3 => (extent, limits.sparse_page_3d),
        };

        if let Some(&requested) = extent.axes().iter().find(|&&v| v > max_size) {
            return Err(ResidencyError::OutOfRange {
                requested,
                limit: max_size,
            });
        }

        let largest = extent.axes().into_iter().max().unwrap_or(1).max(1);
        let mip_chain = u32::BITS - largest.leading_zeros();
        if levels == 0 || levels > mip_chain {
            return Err(ResidencyError::LevelOutOfRange {
                level: levels,
                levels: mip_chain,
            });
        }

        let footprint = page_count(extent, levels, page_extent) * self.cache.page_bytes();
        let texture = SparseTexture {
            object: CacheableObject::new(label, ResourceKind::SparseTexture, footprint),
            dimension,
            extent,
            levels,
            page_extent,
            max_size,
        };

        tracing::debug!(
            texture = %texture.id(),
            label = texture.object.label(),
            ?extent,
            levels,
            "sparse texture created"
        );
        Ok(texture)
    }

    /// Page in every page covering a region
    ///
    /// Idempotent: pages that are already resident are refreshed in recency
    /// and their existing completion signals returned.
    ///
    /// # Errors
    ///
    /// `OutOfRange` if the region reaches past the ceiling or the level extent,
    /// `LevelOutOfRange` for a missing level, `CapacityExceeded` if the
    /// texture's resident pages would exceed the whole budget. The resident
    /// page set is unchanged on error.
    pub fn make_resident(&self, texture: &SparseTexture, region: &PageRegion) -> Result<SignalSet, ResidencyError> {
        texture.check_region(region)?;
        let pages = pages_covering(region, texture.page_extent);
        if pages.is_empty() {
            return Ok(SignalSet::new());
        }
        self.cache.touch_pages(&texture.object, &pages)
    }

    /// Page out every page covering a region
    ///
    /// Idempotent. Returns how many pages were released.
    pub fn make_nonresident(&self, texture: &SparseTexture, region: &PageRegion) -> Result<usize, ResidencyError> {
        texture.check_region(region)?;
        let pages = pages_covering(region, texture.page_extent);
        let released = self.cache.release_pages(texture.id(), &pages);
        if released > 0 {
            tracing::debug!(texture = %texture.id(), pages = released, "paged out");
        }
        Ok(released)
    }

    /// Page out the whole texture. Returns how many pages were released.
    pub fn make_texture_nonresident(&self, texture: &SparseTexture) -> usize {
        let pages = self.cache.resident_pages(texture.id());
        self.cache.release_pages(texture.id(), &pages)
    }

    /// Returns true if every page of the region is resident and committed
    pub fn is_region_resident(&self, texture: &SparseTexture, region: &PageRegion) -> Result<bool, ResidencyError> {
        texture.check_region(region)?;
        let pages = pages_covering(region, texture.page_extent);
        Ok(self
            .cache
            .page_signals(texture.id(), &pages)
            .is_some_and(|signals| signals.is_complete()))
    }

    pub fn resident_pages(&self, texture: &SparseTexture) -> BTreeSet<PageCoord> {
        self.cache.resident_pages(texture.id())
    }

    /// Per-level residency flag: true when every page of the level is resident
    pub fn layer_residency(&self, texture: &SparseTexture) -> Vec<bool> {
        let resident = self.resident_pages(texture);
        (0..texture.levels)
            .map(|level| texture.pages_in_level(level).is_subset(&resident))
            .collect()
    }

    /// Allocate a bindless handle for an object
    ///
    /// The handle starts non-resident.
    pub fn create_handle(&self, object: &CacheableObject) -> BindlessHandle {
        let value = self.cache.device().create_handle(object.id());
        BindlessHandle::new(value, object.clone())
    }

    /// Make a handle resident
    ///
    /// Touches the object through the cache and registers the handle with the
    /// device. The handle reports resident only once both have completed.
    /// Idempotent while the object stays cached: a second call refreshes the
    /// object and returns the outstanding signals. If the object was evicted
    /// in between, the handle is registered again against the new commit.
    pub fn make_handle_resident(&self, handle: &BindlessHandle) -> Result<SignalSet, ResidencyError> {
        let (commit, generation) = self.cache.touch_tracked(handle.object())?;
        let device = self.cache.device();
        let signals = handle.request_residency(generation, |stale| {
            if stale {
                device.unregister_handle(handle.value());
            }
            let mut signals = SignalSet::from(commit);
            signals.push(device.register_handle(handle.value()));
            tracing::trace!(handle = %handle.value(), object = %handle.object().id(), stale, "handle made resident");
            signals
        });
        Ok(signals)
    }

    /// Make a handle non-resident and release its object
    ///
    /// Returns false if the handle was not resident.
    ///
    /// # Errors
    ///
    /// `HandleInUse` while any in-flight task references the handle.
    pub fn make_handle_nonresident(&self, handle: &BindlessHandle) -> Result<bool, ResidencyError> {
        if !handle.clear_residency()? {
            return Ok(false);
        }
        self.cache.device().unregister_handle(handle.value());
        self.cache.release(handle.object());
        tracing::trace!(handle = %handle.value(), "handle made non-resident");
        Ok(true)
    }
}
