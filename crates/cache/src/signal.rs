//! Completion signals for asynchronous residency requests
//!
//! Residency toggles are requests to the device that complete at some later
//! point. Nothing in this crate blocks on them: consumers poll the signal and
//! treat an incomplete request as "not resident yet".

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Completion signal for a single residency request
///
/// Clones share the same underlying flag, so the device side can complete the
/// request while any number of consumers observe it.
///
/// # Example
///
/// ```
/// use lumen_cache::ResidencySignal;
///
/// let signal = ResidencySignal::pending();
/// let observer = signal.clone();
///
/// assert!(!observer.is_complete());
/// signal.complete();
/// assert!(observer.is_complete());
/// ```
#[derive(Debug, Clone)]
pub struct ResidencySignal {
    done: Arc<AtomicBool>,
}

impl ResidencySignal {
    /// Create a signal for a request that has not completed yet
    pub fn pending() -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a signal that is already complete
    pub fn completed() -> Self {
        Self {
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the request as complete
    ///
    /// All clones observe the completion. Completing twice is a no-op.
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Check whether the request has completed
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl Default for ResidencySignal {
    fn default() -> Self {
        Self::completed()
    }
}

/// All-of join over several residency signals
///
/// An empty set is complete.
#[derive(Debug, Clone, Default)]
pub struct SignalSet {
    signals: Vec<ResidencySignal>,
}

impl SignalSet {
    /// Create an empty signal set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signal to the set
    pub fn push(&mut self, signal: ResidencySignal) {
        self.signals.push(signal);
    }

    /// Merge another set into this one
    pub fn extend(&mut self, other: SignalSet) {
        self.signals.extend(other.signals);
    }

    /// Returns true once every signal in the set has completed
    pub fn is_complete(&self) -> bool {
        self.signals.iter().all(ResidencySignal::is_complete)
    }

    /// Number of signals still pending
    pub fn pending_count(&self) -> usize {
        self.signals.iter().filter(|s| !s.is_complete()).count()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

impl From<ResidencySignal> for SignalSet {
    fn from(signal: ResidencySignal) -> Self {
        Self {
            signals: vec![signal],
        }
    }
}

impl FromIterator<ResidencySignal> for SignalSet {
    fn from_iter<I: IntoIterator<Item = ResidencySignal>>(iter: I) -> Self {
        Self {
            signals: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_clone_observes_completion() {
        let signal = ResidencySignal::pending();
        let clone = signal.clone();
        assert!(!clone.is_complete());

        signal.complete();
        assert!(clone.is_complete());

        // Idempotent
        signal.complete();
        assert!(signal.is_complete());
    }

    #[test]
    fn test_completed_signal() {
        assert!(ResidencySignal::completed().is_complete());
        assert!(ResidencySignal::default().is_complete());
    }

    #[test]
    fn test_signal_set_requires_all() {
        let a = ResidencySignal::pending();
        let b = ResidencySignal::pending();
        let set: SignalSet = vec![a.clone(), b.clone()].into_iter().collect();

        assert!(!set.is_complete());
        assert_eq!(set.pending_count(), 2);

        a.complete();
        assert!(!set.is_complete());
        assert_eq!(set.pending_count(), 1);

        b.complete();
        assert!(set.is_complete());
    }

    #[test]
    fn test_empty_signal_set_is_complete() {
        let set = SignalSet::new();
        assert!(set.is_empty());
        assert!(set.is_complete());
    }
}
