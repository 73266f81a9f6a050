//! Device context collaborator
//!
//! The residency core never talks to a graphics API directly. It asks a
//! [`DeviceContext`] to commit or release memory, to register bindless
//! handles, and to issue a memory barrier before residency is resolved for a
//! frame. [`HeadlessDevice`] is an in-process implementation with no GPU
//! behind it, used by tests and offline tooling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::bindless::HandleValue;
use crate::object::ObjectId;
use crate::signal::ResidencySignal;
use crate::sparse::PageCoord;

/// Device memory information in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    /// Total device memory
    pub total: usize,
    /// Currently free device memory
    pub free: usize,
    /// Dedicated video memory
    pub dedicated: usize,
}

/// Hardware limits relevant to sparse residency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest addressable extent of a 2D sparse texture, in texels per axis
    pub max_sparse_texture_2d: u32,
    /// Largest addressable extent of a 3D sparse texture, in texels per axis
    pub max_sparse_texture_3d: u32,
    /// Page shape of 2D sparse textures (width, height, depth) in texels
    pub sparse_page_2d: [u32; 3],
    /// Page shape of 3D sparse textures (width, height, depth) in texels
    pub sparse_page_3d: [u32; 3],
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_sparse_texture_2d: 16384,
            max_sparse_texture_3d: 2048,
            sparse_page_2d: [128, 128, 1],
            sparse_page_3d: [32, 32, 16],
        }
    }
}

/// Unit of device memory the residency cache commits or releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResidencyUnit {
    /// A whole object
    Object { id: ObjectId, bytes: usize },
    /// One page of a sparse texture
    Page {
        id: ObjectId,
        page: PageCoord,
        bytes: usize,
    },
}

impl ResidencyUnit {
    pub fn object(&self) -> ObjectId {
        match *self {
            ResidencyUnit::Object { id, .. } | ResidencyUnit::Page { id, .. } => id,
        }
    }

    pub fn bytes(&self) -> usize {
        match *self {
            ResidencyUnit::Object { bytes, .. } | ResidencyUnit::Page { bytes, .. } => bytes,
        }
    }
}

/// Device context consumed by the residency core
///
/// Implementations must not call back into the residency cache: `commit` and
/// `release` are invoked while the cache's state lock is held.
pub trait DeviceContext: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Make this context current on the calling thread
    fn make_current(&self) {}

    /// Query device memory
    fn memory_info(&self) -> MemoryInfo;

    /// Query sparse residency limits
    fn limits(&self) -> DeviceLimits {
        DeviceLimits::default()
    }

    /// Make prior writes to resources visible before residency is resolved
    fn memory_barrier(&self);

    /// Request device memory for a unit. Completion is reported through the
    /// returned signal.
    fn commit(&self, unit: &ResidencyUnit) -> ResidencySignal;

    /// Release device memory for a unit
    fn release(&self, unit: &ResidencyUnit);

    /// Allocate a device-visible handle value for an object
    fn create_handle(&self, object: ObjectId) -> HandleValue;

    /// Register a handle with the device so shaders can dereference it
    fn register_handle(&self, handle: HandleValue) -> ResidencySignal;

    /// Unregister a previously registered handle
    fn unregister_handle(&self, handle: HandleValue);
}

#[derive(Default)]
struct HeadlessState {
    committed: usize,
    deferred: bool,
    pending: Vec<ResidencySignal>,
    released: Vec<ResidencyUnit>,
    registered: HashSet<HandleValue>,
    barriers: u64,
}

/// Device context with no GPU behind it
///
/// Memory commits are bookkept in process. By default every request completes
/// immediately; with [`set_deferred`](Self::set_deferred) requests stay
/// pending until [`complete_pending`](Self::complete_pending) is called, which
/// models a device that finishes residency work asynchronously.
pub struct HeadlessDevice {
    memory: MemoryInfo,
    limits: DeviceLimits,
    next_handle: AtomicU64,
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    /// Create a headless device reporting the given amount of dedicated memory
    pub fn new(dedicated: usize) -> Self {
        Self {
            memory: MemoryInfo {
                total: dedicated,
                free: dedicated,
                dedicated,
            },
            limits: DeviceLimits::default(),
            next_handle: AtomicU64::new(0x1000),
            state: Mutex::new(HeadlessState::default()),
        }
    }

    /// Override the reported sparse limits
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Hold completion of new requests until `complete_pending` is called
    pub fn set_deferred(&self, deferred: bool) {
        self.state.lock().deferred = deferred;
    }

    /// Complete every pending request. Returns how many were completed.
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        for signal in &pending {
            signal.complete();
        }
        pending.len()
    }

    /// Bytes currently committed on this device
    pub fn committed_bytes(&self) -> usize {
        self.state.lock().committed
    }

    /// Every unit released so far, in release order
    pub fn released_units(&self) -> Vec<ResidencyUnit> {
        self.state.lock().released.clone()
    }

    /// Number of memory barriers issued
    pub fn barrier_count(&self) -> u64 {
        self.state.lock().barriers
    }

    pub fn is_handle_registered(&self, handle: HandleValue) -> bool {
        self.state.lock().registered.contains(&handle)
    }

    fn new_signal(state: &mut HeadlessState) -> ResidencySignal {
        if state.deferred {
            let signal = ResidencySignal::pending();
            state.pending.push(signal.clone());
            signal
        } else {
            ResidencySignal::completed()
        }
    }
}

impl Default for HeadlessDevice {
    /// A headless device with 1 GiB of dedicated memory
    fn default() -> Self {
        Self::new(1024 * 1024 * 1024)
    }
}

impl DeviceContext for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn memory_info(&self) -> MemoryInfo {
        let committed = self.committed_bytes();
        MemoryInfo {
            free: self.memory.free.saturating_sub(committed),
            ..self.memory
        }
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn memory_barrier(&self) {
        self.state.lock().barriers += 1;
    }

    fn commit(&self, unit: &ResidencyUnit) -> ResidencySignal {
        let mut state = self.state.lock();
        state.committed += unit.bytes();
        Self::new_signal(&mut state)
    }

    fn release(&self, unit: &ResidencyUnit) {
        let mut state = self.state.lock();
        state.committed = state.committed.saturating_sub(unit.bytes());
        state.released.push(*unit);
    }

    fn create_handle(&self, _object: ObjectId) -> HandleValue {
        HandleValue(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn register_handle(&self, handle: HandleValue) -> ResidencySignal {
        let mut state = self.state.lock();
        state.registered.insert(handle);
        Self::new_signal(&mut state)
    }

    fn unregister_handle(&self, handle: HandleValue) {
        self.state.lock().registered.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_release_bookkeeping() {
        let device = HeadlessDevice::new(1000);
        let unit = ResidencyUnit::Object {
            id: ObjectId::from_raw(1),
            bytes: 300,
        };

        let signal = device.commit(&unit);
        assert!(signal.is_complete());
        assert_eq!(device.committed_bytes(), 300);
        assert_eq!(device.memory_info().free, 700);

        device.release(&unit);
        assert_eq!(device.committed_bytes(), 0);
        assert_eq!(device.released_units(), vec![unit]);
    }

    #[test]
    fn test_deferred_completion() {
        let device = HeadlessDevice::default();
        device.set_deferred(true);

        let signal = device.commit(&ResidencyUnit::Object {
            id: ObjectId::from_raw(2),
            bytes: 10,
        });
        assert!(!signal.is_complete());

        assert_eq!(device.complete_pending(), 1);
        assert!(signal.is_complete());
        assert_eq!(device.complete_pending(), 0);
    }

    #[test]
    fn test_handle_registration() {
        let device = HeadlessDevice::default();
        let a = device.create_handle(ObjectId::from_raw(1));
        let b = device.create_handle(ObjectId::from_raw(1));
        assert_ne!(a, b);

        assert!(device.register_handle(a).is_complete());
        assert!(device.is_handle_registered(a));
        device.unregister_handle(a);
        assert!(!device.is_handle_registered(a));
    }

    #[test]
    fn test_barrier_count() {
        let device = HeadlessDevice::default();
        device.memory_barrier();
        device.memory_barrier();
        assert_eq!(device.barrier_count(), 2);
    }
}
