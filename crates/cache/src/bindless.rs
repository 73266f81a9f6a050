//! Bindless texture and image handles
//!
//! A [`BindlessHandle`] wraps the device-visible handle value of one
//! cacheable object. Its identity is stable across residency toggles. The
//! handle only reports resident once both the object's memory commit and the
//! device-side handle registration have completed, so a task that observes
//! "resident" can embed the value in submitted work.
//!
//! A registration is tied to one residency generation of the object. Once the
//! cache evicts the object the handle stops reporting resident, and the next
//! make-resident request registers it again against the fresh commit.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ResidencyError;
use crate::object::CacheableObject;
use crate::signal::SignalSet;

/// Opaque device-visible handle value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleValue(pub u64);

impl fmt::Display for HandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

struct Registration {
    /// Object residency generation the request was made against
    generation: u64,
    signals: SignalSet,
}

#[derive(Default)]
struct HandleState {
    /// Last make-resident request, `None` while non-resident
    residency: Option<Registration>,
}

struct HandleInner {
    value: HandleValue,
    object: CacheableObject,
    state: Mutex<HandleState>,
    in_flight: AtomicUsize,
}

/// Bindless handle for a texture or image
///
/// Cloning is cheap; clones share residency state and the in-flight count.
#[derive(Clone)]
pub struct BindlessHandle {
    inner: Arc<HandleInner>,
}

impl BindlessHandle {
    pub(crate) fn new(value: HandleValue, object: CacheableObject) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                value,
                object,
                state: Mutex::new(HandleState::default()),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn value(&self) -> HandleValue {
        self.inner.value
    }

    /// Object the handle refers to
    pub fn object(&self) -> &CacheableObject {
        &self.inner.object
    }

    /// Returns true once residency was requested, every device request
    /// behind it has completed and the object has not been evicted since
    pub fn is_resident(&self) -> bool {
        self.is_current(&self.inner.state.lock())
    }

    /// Returns true if residency was requested, whether or not it completed
    pub fn is_requested(&self) -> bool {
        self.inner.state.lock().residency.is_some()
    }

    /// Number of live [`InFlightGuard`]s
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Reference the handle from work about to be submitted
    ///
    /// The returned guard keeps the handle in flight until dropped.
    ///
    /// # Errors
    ///
    /// `HandleNotResident` unless the handle is resident.
    pub fn begin_use(&self) -> Result<InFlightGuard, ResidencyError> {
        let state = self.inner.state.lock();
        if !self.is_current(&state) {
            return Err(ResidencyError::HandleNotResident {
                handle: self.inner.value,
            });
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(state);

        Ok(InFlightGuard {
            handle: self.inner.clone(),
        })
    }

    fn is_current(&self, state: &HandleState) -> bool {
        let object = &self.inner.object;
        state.residency.as_ref().is_some_and(|registration| {
            object.is_resident()
                && registration.generation == object.residency_generation()
                && registration.signals.is_complete()
        })
    }

    /// Record a make-resident request against residency `generation` of the
    /// object and return its signals
    ///
    /// A request already recorded for the same generation is returned as is.
    /// Otherwise `request` builds the new signals; its argument is true when
    /// an earlier registration is being replaced.
    pub(crate) fn request_residency(&self, generation: u64, request: impl FnOnce(bool) -> SignalSet) -> SignalSet {
        let mut state = self.inner.state.lock();
        if let Some(registration) = state.residency.as_ref().filter(|r| r.generation == generation) {
            return registration.signals.clone();
        }
        let signals = request(state.residency.is_some());
        state.residency = Some(Registration {
            generation,
            signals: signals.clone(),
        });
        signals
    }

    /// Clear residency unless the handle is in flight.
    /// Returns whether residency had been requested.
    pub(crate) fn clear_residency(&self) -> Result<bool, ResidencyError> {
        let mut state = self.inner.state.lock();
        let in_flight = self.inner.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            return Err(ResidencyError::HandleInUse {
                handle: self.inner.value,
                in_flight,
            });
        }
        Ok(state.residency.take().is_some())
    }
}

impl PartialEq for BindlessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.value == other.inner.value
    }
}

impl Eq for BindlessHandle {}

impl fmt::Debug for BindlessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindlessHandle")
            .field("value", &self.inner.value)
            .field("object", &self.inner.object.id())
            .field("resident", &self.is_resident())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Marks a bindless handle as referenced by in-flight work
///
/// Dropping the guard releases the reference.
pub struct InFlightGuard {
    handle: Arc<HandleInner>,
}

impl InFlightGuard {
    pub fn value(&self) -> HandleValue {
        self.handle.value
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.handle.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InFlightGuard").field(&self.handle.value).finish()
    }
}
