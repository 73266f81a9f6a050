//! Residency resolution for scheduled tasks
//!
//! Before a task is emitted, every resource its action references is made
//! resident through the residency cache (whole objects and bindless handles)
//! or the sparse texture manager (page regions). A resource whose completion
//! signal is still pending counts as not resident for this frame.

use std::collections::HashMap;
use std::sync::Arc;

use lumen_cache::{
    CacheableObject, InFlightGuard, ObjectId, ResidencyCache, ResidencyError, SignalSet, SparseTextureManager,
};

use crate::task::{GpuTask, ResourceRef};

/// Objects and bindless handles a frame holds until it retires
///
/// Every object touched while resolving the frame stays live until the lease
/// is released; bindless handles of submitted tasks stay in flight.
#[derive(Default)]
pub struct FrameLeases {
    /// Touched objects with the touch sequence observed at lease time
    objects: HashMap<ObjectId, (CacheableObject, u64)>,
    guards: Vec<InFlightGuard>,
}

impl FrameLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn guard_count(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.guards.is_empty()
    }

    fn hold(&mut self, object: &CacheableObject) {
        self.objects
            .insert(object.id(), (object.clone(), object.last_touch()));
    }

    /// Release every leased object and drop the in-flight guards
    ///
    /// An object touched again after it was leased (by a later frame) is left
    /// live.
    pub fn release(self, cache: &ResidencyCache) {
        drop(self.guards);
        for (object, stamp) in self.objects.into_values() {
            if object.last_touch() == stamp {
                cache.release(&object);
            }
        }
    }
}

/// Resolves task resources against the residency cache
pub struct ResidencyResolver {
    textures: Arc<SparseTextureManager>,
}

impl ResidencyResolver {
    pub fn new(textures: Arc<SparseTextureManager>) -> Self {
        Self { textures }
    }

    /// Resolver with its own sparse texture manager over `cache`
    pub fn for_cache(cache: Arc<ResidencyCache>) -> Self {
        Self::new(Arc::new(SparseTextureManager::new(cache)))
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        self.textures.cache()
    }

    pub fn textures(&self) -> &Arc<SparseTextureManager> {
        &self.textures
    }

    /// Make every resource of a task resident
    ///
    /// Objects touched along the way are recorded in `leases` even when a
    /// later resource fails, so they are released with the frame. Bindless
    /// guards are only kept when the whole task resolves.
    ///
    /// # Errors
    ///
    /// The first resource that cannot be made resident: any residency error,
    /// or `NotYetResident` while a device request is still pending.
    pub fn resolve(&self, task: &GpuTask, leases: &mut FrameLeases) -> Result<(), ResidencyError> {
        let mut guards = Vec::new();

        for resource in task.resources() {
            match resource {
                ResourceRef::Object(object) => {
                    let signal = self.cache().touch(&object)?;
                    leases.hold(&object);
                    ensure_complete(&object, &SignalSet::from(signal))?;
                }
                ResourceRef::Pages { texture, region } => {
                    let signals = self.textures.make_resident(&texture, &region)?;
                    leases.hold(texture.object());
                    ensure_complete(texture.object(), &signals)?;
                }
                ResourceRef::Bindless(handle) => {
                    let signals = self.textures.make_handle_resident(&handle)?;
                    leases.hold(handle.object());
                    ensure_complete(handle.object(), &signals)?;
                    guards.push(handle.begin_use()?);
                }
            }
        }

        leases.guards.extend(guards);
        Ok(())
    }
}

fn ensure_complete(object: &CacheableObject, signals: &SignalSet) -> Result<(), ResidencyError> {
    if signals.is_complete() {
        Ok(())
    } else {
        Err(ResidencyError::NotYetResident { object: object.id() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::GpuTaskFactory;
    use crate::task::from_fn;
    use lumen_cache::{Extent3, HeadlessDevice, PageRegion, ResourceKind, SparseDimension};

    fn setup(budget: usize) -> (ResidencyResolver, Arc<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::default());
        let cache = Arc::new(ResidencyCache::new(budget, device.clone()));
        (ResidencyResolver::for_cache(cache), device)
    }

    #[test]
    fn test_resolve_touches_objects() {
        let (resolver, _) = setup(1 << 20);
        let factory = GpuTaskFactory::new();
        let object = CacheableObject::new("gbuffer", ResourceKind::Image, 1024);
        let task = factory.make_gpu_task(from_fn(|_| {}).with_resources(vec![ResourceRef::Object(object.clone())]));

        let mut leases = FrameLeases::new();
        resolver.resolve(&task, &mut leases).unwrap();
        assert!(object.is_live());
        assert_eq!(leases.object_count(), 1);

        leases.release(resolver.cache());
        assert!(!object.is_live());
        assert!(resolver.cache().contains(object.id()));
    }

    #[test]
    fn test_pending_commit_is_not_yet_resident() {
        let (resolver, device) = setup(1 << 20);
        device.set_deferred(true);
        let factory = GpuTaskFactory::new();
        let object = CacheableObject::new("shadow map", ResourceKind::Texture, 1024);
        let task = factory.make_gpu_task(from_fn(|_| {}).with_resources(vec![ResourceRef::Object(object.clone())]));

        let mut leases = FrameLeases::new();
        assert_eq!(
            resolver.resolve(&task, &mut leases),
            Err(ResidencyError::NotYetResident { object: object.id() })
        );
        assert_eq!(leases.object_count(), 1);

        device.complete_pending();
        assert!(resolver.resolve(&task, &mut leases).is_ok());
    }

    #[test]
    fn test_sparse_region_out_of_range() {
        let (resolver, _) = setup(1 << 24);
        let factory = GpuTaskFactory::new();
        let texture = resolver
            .textures()
            .create_texture("clipmap", SparseDimension::D2, Extent3::d2(1024, 1024), 1)
            .unwrap();
        let region = PageRegion::new(0, [512, 0, 0], Extent3::d2(1024, 128));
        let task = factory.make_gpu_task(
            from_fn(|_| {}).with_resources(vec![ResourceRef::Pages { texture: texture.clone(), region }]),
        );

        let mut leases = FrameLeases::new();
        let err = resolver.resolve(&task, &mut leases).unwrap_err();
        assert_eq!(
            err,
            ResidencyError::OutOfRange {
                requested: 1536,
                limit: 1024,
            }
        );
        assert!(resolver.textures().resident_pages(&texture).is_empty());
    }

    #[test]
    fn test_bindless_guard_held_until_release() {
        let (resolver, _) = setup(1 << 20);
        let factory = GpuTaskFactory::new();
        let object = CacheableObject::new("atlas", ResourceKind::Texture, 4096);
        let handle = resolver.textures().create_handle(&object);
        let task = factory.make_gpu_task(from_fn(|_| {}).with_resources(vec![ResourceRef::Bindless(handle.clone())]));

        let mut leases = FrameLeases::new();
        resolver.resolve(&task, &mut leases).unwrap();
        assert!(handle.is_resident());
        assert_eq!(handle.in_flight(), 1);
        assert!(matches!(
            resolver.textures().make_handle_nonresident(&handle),
            Err(ResidencyError::HandleInUse { .. })
        ));

        leases.release(resolver.cache());
        assert_eq!(handle.in_flight(), 0);
        assert_eq!(resolver.textures().make_handle_nonresident(&handle), Ok(true));
    }

    #[test]
    fn test_release_skips_objects_touched_again() {
        let (resolver, _) = setup(1 << 20);
        let object = CacheableObject::new("noise", ResourceKind::Texture, 64);
        let task = GpuTaskFactory::new()
            .make_gpu_task(from_fn(|_| {}).with_resources(vec![ResourceRef::Object(object.clone())]));

        let mut earlier = FrameLeases::new();
        resolver.resolve(&task, &mut earlier).unwrap();
        let mut later = FrameLeases::new();
        resolver.resolve(&task, &mut later).unwrap();

        earlier.release(resolver.cache());
        assert!(object.is_live());
        later.release(resolver.cache());
        assert!(!object.is_live());
    }
}
