//! Frame scheduler
//!
//! Turns a task graph into a frame plan: tasks in stable dependency order,
//! each one resolved against the residency cache. Tasks whose resources
//! cannot be made resident this frame are dropped together with everything
//! downstream of them; the rest of the frame goes ahead.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lumen_cache::{DiagnosticsSink, FrameDiagnostic, ResidencyCache, ResidencyError};
use parking_lot::Mutex;

use crate::error::TaskError;
use crate::graph::TaskGraph;
use crate::resolve::{FrameLeases, ResidencyResolver};
use crate::submit::{Submission, SubmissionQueue};
use crate::task::{GpuTask, TaskId, TaskState};

/// Frame scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Frames scheduled
    pub frames_scheduled: u64,

    /// Tasks whose resources were confirmed resident
    pub tasks_resolved: u64,

    /// Tasks dropped (resolution failures, dropped prerequisites, cancellations)
    pub tasks_dropped: u64,

    /// Explicit cancellations
    pub tasks_cancelled: u64,

    /// Tasks handed to submission
    pub tasks_submitted: u64,

    /// Tasks dispatched and retired
    pub tasks_retired: u64,
}

impl SchedulerStats {
    /// Tasks submitted but not yet retired
    pub fn in_flight(&self) -> u64 {
        self.tasks_submitted - self.tasks_retired
    }
}

/// Why a task was left out of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// A referenced resource could not be made resident
    ResolutionFailed(ResidencyError),
    /// A prerequisite was dropped
    UpstreamDropped(TaskId),
    /// Cancelled before submission
    Cancelled,
}

/// A task left out of a frame, with the reason
#[derive(Debug, Clone)]
pub struct DroppedTask {
    pub task: GpuTask,
    pub reason: DropReason,
}

/// Per-frame task states, shared with the submission thread
#[derive(Default)]
pub(crate) struct StateTracker {
    states: Mutex<HashMap<TaskId, TaskState>>,
}

impl StateTracker {
    fn new(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            states: Mutex::new(ids.into_iter().map(|id| (id, TaskState::Constructed)).collect()),
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<TaskState> {
        self.states.lock().get(&id).copied()
    }

    /// Move a task to `to`, checking the state machine
    pub(crate) fn transition(&self, id: TaskId, to: TaskState) -> Result<(), TaskError> {
        let mut states = self.states.lock();
        let from = states.get(&id).copied().ok_or(TaskError::UnknownTask(id))?;
        if !from.can_transition(to) {
            return Err(TaskError::InvalidTransition { task: id, from, to });
        }
        states.insert(id, to);
        Ok(())
    }
}

/// Tasks of one frame, resolved and ready for submission
///
/// Dropping a plan without submitting it releases the objects it leased.
pub struct FramePlan {
    frame: u64,
    submissions: Vec<GpuTask>,
    dropped: Vec<DroppedTask>,
    leases: Option<FrameLeases>,
    tracker: Arc<StateTracker>,
    cache: Arc<ResidencyCache>,
}

impl FramePlan {
    /// Frame number from the residency cache's frame counter
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Resolved tasks in submission order
    pub fn submissions(&self) -> &[GpuTask] {
        &self.submissions
    }

    pub fn submission_ids(&self) -> Vec<TaskId> {
        self.submissions.iter().map(GpuTask::id).collect()
    }

    /// Tasks left out of this frame, in the order they were dropped
    pub fn dropped(&self) -> &[DroppedTask] {
        &self.dropped
    }

    pub fn dropped_ids(&self) -> Vec<TaskId> {
        self.dropped.iter().map(|d| d.task.id()).collect()
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.tracker.get(id)
    }

    /// Objects held live for this frame
    pub fn leased_objects(&self) -> usize {
        self.leases.as_ref().map_or(0, FrameLeases::object_count)
    }

    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }
}

impl Drop for FramePlan {
    fn drop(&mut self) {
        if let Some(leases) = self.leases.take() {
            leases.release(&self.cache);
        }
    }
}

#[derive(Default)]
pub(crate) struct TicketState {
    retired: AtomicBool,
}

impl TicketState {
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

/// Handle to a submitted frame
///
/// Submitted tasks can no longer be cancelled, only observed until retired.
#[derive(Clone)]
pub struct FrameTicket {
    frame: u64,
    tracker: Arc<StateTracker>,
    state: Arc<TicketState>,
}

impl FrameTicket {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Returns true once every task of the frame retired and its leases were released
    pub fn is_retired(&self) -> bool {
        self.state.retired.load(Ordering::Acquire)
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.tracker.get(id)
    }

    /// Attempt to cancel a task of a submitted frame
    ///
    /// # Errors
    ///
    /// `AlreadySubmitted` for submitted or retired tasks, `InvalidTransition`
    /// for tasks already dropped, `UnknownTask` for tasks not in the frame.
    pub fn cancel(&self, id: TaskId) -> Result<(), TaskError> {
        match self.tracker.get(id) {
            None => Err(TaskError::UnknownTask(id)),
            Some(state) if state.is_submitted() => Err(TaskError::AlreadySubmitted(id)),
            Some(_) => self.tracker.transition(id, TaskState::Dropped),
        }
    }
}

impl std::fmt::Debug for FrameTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTicket")
            .field("frame", &self.frame)
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Builds and submits frames
///
/// Scheduling runs on the frame-builder thread. Submission either happens
/// inline ([`execute`](Self::execute)) or on a [`SubmissionQueue`] thread
/// ([`submit`](Self::submit)); plans are immutable once handed off.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lumen_cache::{CacheableObject, HeadlessDevice, ResidencyCache, ResourceKind};
/// use lumen_scheduler::{from_fn, FrameScheduler, GpuTaskFactory, ResidencyResolver, ResourceRef, TaskGraph};
///
/// let cache = Arc::new(ResidencyCache::new(1 << 20, Arc::new(HeadlessDevice::default())));
/// let scheduler = FrameScheduler::new(ResidencyResolver::for_cache(cache.clone()));
///
/// let albedo = CacheableObject::new("albedo", ResourceKind::Texture, 4096);
/// let factory = GpuTaskFactory::new();
/// let draw = factory.make_gpu_task(
///     from_fn(|_| {}).with_resources(vec![ResourceRef::Object(albedo.clone())]),
/// );
///
/// let mut graph = TaskGraph::new();
/// graph.insert(draw.clone()).unwrap();
///
/// let plan = scheduler.schedule(&graph);
/// assert_eq!(plan.submission_ids(), vec![draw.id()]);
///
/// let ticket = scheduler.execute(plan);
/// assert!(ticket.is_retired());
/// assert!(!albedo.is_live());
/// ```
pub struct FrameScheduler {
    resolver: ResidencyResolver,
    diagnostics: Arc<dyn DiagnosticsSink>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl FrameScheduler {
    /// Create a scheduler reporting to the cache's diagnostics sink
    pub fn new(resolver: ResidencyResolver) -> Self {
        let diagnostics = resolver.cache().diagnostics().clone();
        Self {
            resolver,
            diagnostics,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn resolver(&self) -> &ResidencyResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        self.resolver.cache()
    }

    pub fn stats(&self) -> SchedulerStats {
        *self.stats.lock()
    }

    /// Build the plan for the next frame
    ///
    /// Starts a new cache frame, makes the device current on the calling
    /// thread and issues a memory barrier, then walks the graph
    /// in topological order resolving each task's resources. A task is
    /// dropped if a prerequisite was dropped or if resolution fails; drops
    /// are reported to the diagnostics sink. Nothing carries over: the next
    /// call tries every task again.
    pub fn schedule(&self, graph: &TaskGraph) -> FramePlan {
        let cache = self.resolver.cache();
        let frame = cache.begin_frame();
        cache.device().make_current();
        cache.device().memory_barrier();

        let order = graph.topological_order();
        let tracker = Arc::new(StateTracker::new(order.iter().map(GpuTask::id)));
        let mut leases = FrameLeases::new();
        let mut submissions = Vec::with_capacity(order.len());
        let mut dropped = Vec::new();
        let mut dropped_ids = HashSet::new();

        for task in order {
            let upstream = task.dependency_ids().find(|d| dropped_ids.contains(d));
            let reason = match upstream {
                Some(upstream) => Some(DropReason::UpstreamDropped(upstream)),
                None => self
                    .resolver
                    .resolve(&task, &mut leases)
                    .err()
                    .map(DropReason::ResolutionFailed),
            };

            let state = if reason.is_some() {
                TaskState::Dropped
            } else {
                TaskState::Resolved
            };
            if let Err(err) = tracker.transition(task.id(), state) {
                tracing::error!(task = %task.id(), %err, "unexpected task state");
            }

            match reason {
                None => submissions.push(task),
                Some(reason) => {
                    self.report_drop(&task, &reason);
                    dropped_ids.insert(task.id());
                    dropped.push(DroppedTask { task, reason });
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.frames_scheduled += 1;
            stats.tasks_resolved += submissions.len() as u64;
            stats.tasks_dropped += dropped.len() as u64;
        }
        tracing::debug!(
            frame,
            resolved = submissions.len(),
            dropped = dropped.len(),
            leased = leases.object_count(),
            "frame scheduled"
        );

        FramePlan {
            frame,
            submissions,
            dropped,
            leases: Some(leases),
            tracker,
            cache: cache.clone(),
        }
    }

    /// Drop a resolved task and everything downstream of it from a plan
    ///
    /// Returns the dropped ids, the cancelled task first.
    ///
    /// # Errors
    ///
    /// `UnknownTask` if the task is not in the plan, `InvalidTransition` if
    /// it was already dropped.
    pub fn cancel(&self, plan: &mut FramePlan, id: TaskId) -> Result<Vec<TaskId>, TaskError> {
        match plan.tracker.get(id) {
            None => return Err(TaskError::UnknownTask(id)),
            Some(state) if state.is_submitted() => return Err(TaskError::AlreadySubmitted(id)),
            Some(_) => plan.tracker.transition(id, TaskState::Dropped)?,
        }

        let mut cancelled = vec![id];
        let mut removed = HashSet::from([id]);
        let mut kept = Vec::with_capacity(plan.submissions.len());

        for task in plan.submissions.drain(..) {
            if task.id() == id {
                plan.dropped.push(DroppedTask {
                    task,
                    reason: DropReason::Cancelled,
                });
                continue;
            }

            let upstream = task.dependency_ids().find(|d| removed.contains(d));
            match upstream {
                Some(upstream) => {
                    if let Err(err) = plan.tracker.transition(task.id(), TaskState::Dropped) {
                        tracing::error!(task = %task.id(), %err, "unexpected task state");
                    }
                    removed.insert(task.id());
                    cancelled.push(task.id());
                    let reason = DropReason::UpstreamDropped(upstream);
                    self.report_drop(&task, &reason);
                    plan.dropped.push(DroppedTask { task, reason });
                }
                None => kept.push(task),
            }
        }
        plan.submissions = kept;

        let mut stats = self.stats.lock();
        stats.tasks_cancelled += 1;
        stats.tasks_dropped += cancelled.len() as u64;
        drop(stats);

        tracing::debug!(task = %id, dropped = cancelled.len(), "task cancelled");
        Ok(cancelled)
    }

    /// Submit and run a plan on the calling thread
    pub fn execute(&self, plan: FramePlan) -> FrameTicket {
        let (submission, ticket) = self.hand_off(plan);
        submission.run();
        ticket
    }

    /// Submit a plan to the submission thread
    pub fn submit(&self, plan: FramePlan, queue: &SubmissionQueue) -> FrameTicket {
        let (submission, ticket) = self.hand_off(plan);
        queue.enqueue(submission);
        ticket
    }

    /// Mark every resolved task Submitted and package the frame
    fn hand_off(&self, mut plan: FramePlan) -> (Submission, FrameTicket) {
        let tasks = std::mem::take(&mut plan.submissions);
        for task in &tasks {
            if let Err(err) = plan.tracker.transition(task.id(), TaskState::Submitted) {
                tracing::error!(task = %task.id(), %err, "unexpected task state");
            }
        }
        self.stats.lock().tasks_submitted += tasks.len() as u64;

        let ticket = FrameTicket {
            frame: plan.frame,
            tracker: plan.tracker.clone(),
            state: Arc::new(TicketState::default()),
        };
        let submission = Submission {
            frame: plan.frame,
            tasks,
            leases: plan.leases.take().unwrap_or_default(),
            tracker: plan.tracker.clone(),
            ticket: ticket.state.clone(),
            cache: plan.cache.clone(),
            stats: self.stats.clone(),
        };
        (submission, ticket)
    }

    fn report_drop(&self, task: &GpuTask, reason: &DropReason) {
        let diagnostic = match reason {
            DropReason::ResolutionFailed(error) => FrameDiagnostic::ResolutionFailure {
                task_id: task.id().raw(),
                task_name: task.name().to_string(),
                error: error.clone(),
            },
            DropReason::UpstreamDropped(upstream) => FrameDiagnostic::TaskDropped {
                task_id: task.id().raw(),
                task_name: task.name().to_string(),
                upstream_id: upstream.raw(),
            },
            DropReason::Cancelled => return,
        };
        self.diagnostics.report(diagnostic);
    }
}
