//! Frame-time diagnostics
//!
//! Frame-time conditions are recovered locally (tasks are dropped, the cache
//! is allowed to run over budget) and reported to a [`DiagnosticsSink`]
//! instead of failing the frame.

use parking_lot::Mutex;

use crate::error::ResidencyError;

/// Eviction could not bring the cache under budget because every remaining
/// object is live. Not an error: memory use is temporarily elevated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftOverBudget {
    /// Resident footprint after the eviction pass, in bytes
    pub footprint: usize,
    /// Configured budget, in bytes
    pub budget: usize,
    /// Number of live objects pinning the footprint
    pub live_objects: usize,
}

impl SoftOverBudget {
    /// Bytes above budget
    pub fn excess(&self) -> usize {
        self.footprint.saturating_sub(self.budget)
    }
}

/// A diagnostic event raised while building or resolving a frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameDiagnostic {
    /// The residency cache ended an eviction pass over budget
    SoftOverBudget(SoftOverBudget),

    /// A task's resources could not be made resident this frame
    ResolutionFailure {
        task_id: u64,
        task_name: String,
        error: ResidencyError,
    },

    /// A task was dropped because a prerequisite was dropped
    TaskDropped {
        task_id: u64,
        task_name: String,
        upstream_id: u64,
    },
}

/// Receiver of frame diagnostics
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, diagnostic: FrameDiagnostic);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, diagnostic: FrameDiagnostic) {
        match diagnostic {
            FrameDiagnostic::SoftOverBudget(over) => {
                tracing::warn!(
                    footprint = over.footprint,
                    budget = over.budget,
                    live_objects = over.live_objects,
                    "residency cache over budget, all remaining objects are live"
                );
            }
            FrameDiagnostic::ResolutionFailure {
                task_id,
                task_name,
                error,
            } => {
                tracing::warn!(task_id, task = %task_name, %error, "dropping task for this frame");
            }
            FrameDiagnostic::TaskDropped {
                task_id,
                task_name,
                upstream_id,
            } => {
                tracing::warn!(
                    task_id,
                    task = %task_name,
                    upstream_id,
                    "dropping task whose prerequisite was dropped"
                );
            }
        }
    }
}

/// Collects diagnostics in memory
///
/// Useful in tests and for tools that summarise a run.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<FrameDiagnostic>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all recorded events, leaving the recorder empty
    pub fn drain(&self) -> Vec<FrameDiagnostic> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<FrameDiagnostic> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl DiagnosticsSink for RecordingDiagnostics {
    fn report(&self, diagnostic: FrameDiagnostic) {
        self.events.lock().push(diagnostic);
    }
}
