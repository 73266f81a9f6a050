//! GPU tasks
//!
//! A [`GpuTask`] is an immutable description of one unit of submittable work:
//! a dispatchable action, an optional framebuffer target and an ordered set
//! of prerequisite tasks. Tasks are cheap to clone and never change after
//! construction; "mutating" a task builds a new value (see
//! [`GpuTaskFactory::mutate_gpu_task`](crate::GpuTaskFactory::mutate_gpu_task)).

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lumen_cache::{BindlessHandle, CacheableObject, PageRegion, SparseTexture};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identity, stable across mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Framebuffer a task renders into, referenced by identity only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u64);

impl fmt::Display for FramebufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb{}", self.0)
    }
}

/// How long a task stays in a task graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskLifetime {
    /// Rebuilt every frame
    #[default]
    Frame,
    /// Passthrough task kept across frames
    Persistent,
}

/// Per-frame state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Constructed,
    /// Every referenced resource is confirmed resident
    Resolved,
    /// Handed to the submission queue; can no longer be dropped
    Submitted,
    Retired,
    /// Removed from this frame's submission
    Dropped,
}

impl TaskState {
    /// Returns true if the state machine allows moving to `to`
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Constructed, Resolved)
                | (Constructed, Dropped)
                | (Resolved, Submitted)
                | (Resolved, Dropped)
                | (Submitted, Retired)
        )
    }

    pub fn is_submitted(self) -> bool {
        matches!(self, TaskState::Submitted | TaskState::Retired)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Constructed => "constructed",
            TaskState::Resolved => "resolved",
            TaskState::Submitted => "submitted",
            TaskState::Retired => "retired",
            TaskState::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

/// A GPU-resident resource referenced by a dispatchable action
#[derive(Debug, Clone)]
pub enum ResourceRef {
    /// A whole object (buffer, texture or image)
    Object(CacheableObject),
    /// A texel region of a sparse texture
    Pages {
        texture: SparseTexture,
        region: PageRegion,
    },
    /// A bindless handle embedded in the submitted work
    Bindless(BindlessHandle),
}

/// Opaque unit of work bound into a GPU task
///
/// The scheduler never interprets the action. It asks for the resources the
/// action references so they can be made resident before submission, then
/// calls [`dispatch`](Self::dispatch) with the task's target.
///
/// Use [`from_fn`] to turn a closure into an action.
pub trait Dispatchable: Send + Sync {
    /// Execute against the bound target
    fn dispatch(&self, target: Option<FramebufferId>);

    /// Resources that must be resident before the action is submitted
    fn resources(&self) -> Vec<ResourceRef> {
        Vec::new()
    }
}

/// Action backed by a closure
pub struct FnAction<F> {
    run: F,
    resources: Vec<ResourceRef>,
}

/// Wrap a closure as a [`Dispatchable`] action referencing no resources
pub fn from_fn<F>(run: F) -> FnAction<F>
where
    F: Fn(Option<FramebufferId>) + Send + Sync,
{
    FnAction {
        run,
        resources: Vec::new(),
    }
}

impl<F> FnAction<F> {
    /// Declare the resources the closure reads or writes
    pub fn with_resources(mut self, resources: Vec<ResourceRef>) -> Self {
        self.resources = resources;
        self
    }
}

impl<F> Dispatchable for FnAction<F>
where
    F: Fn(Option<FramebufferId>) + Send + Sync,
{
    fn dispatch(&self, target: Option<FramebufferId>) {
        (self.run)(target)
    }

    fn resources(&self) -> Vec<ResourceRef> {
        self.resources.clone()
    }
}

struct TaskInner {
    id: TaskId,
    name: String,
    action: Arc<dyn Dispatchable>,
    target: Option<FramebufferId>,
    dependencies: Vec<GpuTask>,
    lifetime: TaskLifetime,
    revision: u32,
}

/// Immutable description of one unit of GPU work
#[derive(Clone)]
pub struct GpuTask {
    inner: Arc<TaskInner>,
}

impl GpuTask {
    pub(crate) fn from_parts(
        id: TaskId,
        name: String,
        action: Arc<dyn Dispatchable>,
        target: Option<FramebufferId>,
        dependencies: Vec<GpuTask>,
        lifetime: TaskLifetime,
        revision: u32,
    ) -> Self {
        // Keep the first occurrence of each prerequisite
        let mut seen = HashSet::new();
        let dependencies = dependencies
            .into_iter()
            .filter(|dep| seen.insert(dep.id()))
            .collect();

        Self {
            inner: Arc::new(TaskInner {
                id,
                name,
                action,
                target,
                dependencies,
                lifetime,
                revision,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn action(&self) -> &Arc<dyn Dispatchable> {
        &self.inner.action
    }

    pub fn target(&self) -> Option<FramebufferId> {
        self.inner.target
    }

    /// Prerequisites in declaration order
    pub fn dependencies(&self) -> &[GpuTask] {
        &self.inner.dependencies
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.inner.dependencies.iter().map(GpuTask::id)
    }

    pub fn lifetime(&self) -> TaskLifetime {
        self.inner.lifetime
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.lifetime == TaskLifetime::Persistent
    }

    /// Number of mutations this task went through
    pub fn revision(&self) -> u32 {
        self.inner.revision
    }

    /// Resources referenced by the action
    pub fn resources(&self) -> Vec<ResourceRef> {
        self.inner.action.resources()
    }

    /// Run the action against the task's target
    pub fn dispatch(&self) {
        self.inner.action.dispatch(self.inner.target);
    }

    /// Returns true if `id` is a direct or transitive prerequisite
    pub fn depends_on(&self, id: TaskId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<&GpuTask> = self.inner.dependencies.iter().collect();
        while let Some(task) = stack.pop() {
            if task.id() == id {
                return true;
            }
            if visited.insert(task.id()) {
                stack.extend(task.dependencies());
            }
        }
        false
    }
}

impl PartialEq for GpuTask {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && self.inner.revision == other.inner.revision
    }
}

impl Eq for GpuTask {}

impl fmt::Debug for GpuTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTask")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("target", &self.inner.target)
            .field("dependencies", &self.dependency_ids().collect::<Vec<_>>())
            .field("lifetime", &self.inner.lifetime)
            .field("revision", &self.inner.revision)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_cache::ResourceKind;
    use std::sync::atomic::AtomicUsize;

    fn leaf(name: &str) -> GpuTask {
        GpuTask::from_parts(
            TaskId::next(),
            name.to_string(),
            Arc::new(from_fn(|_| {})),
            None,
            Vec::new(),
            TaskLifetime::Frame,
            0,
        )
    }

    #[test]
    fn test_state_machine_transitions() {
        use TaskState::*;
        assert!(Constructed.can_transition(Resolved));
        assert!(Constructed.can_transition(Dropped));
        assert!(Resolved.can_transition(Submitted));
        assert!(Resolved.can_transition(Dropped));
        assert!(Submitted.can_transition(Retired));

        assert!(!Submitted.can_transition(Dropped));
        assert!(!Retired.can_transition(Dropped));
        assert!(!Constructed.can_transition(Submitted));
        assert!(!Dropped.can_transition(Resolved));
    }

    #[test]
    fn test_dependencies_are_deduplicated() {
        let a = leaf("a");
        let b = leaf("b");
        let task = GpuTask::from_parts(
            TaskId::next(),
            "c".into(),
            Arc::new(from_fn(|_| {})),
            None,
            vec![a.clone(), b.clone(), a.clone()],
            TaskLifetime::Frame,
            0,
        );
        assert_eq!(task.dependency_ids().collect::<Vec<_>>(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_depends_on_is_transitive() {
        let a = leaf("a");
        let b = GpuTask::from_parts(
            TaskId::next(),
            "b".into(),
            Arc::new(from_fn(|_| {})),
            None,
            vec![a.clone()],
            TaskLifetime::Frame,
            0,
        );
        let c = GpuTask::from_parts(
            TaskId::next(),
            "c".into(),
            Arc::new(from_fn(|_| {})),
            None,
            vec![b.clone()],
            TaskLifetime::Frame,
            0,
        );
        assert!(c.depends_on(a.id()));
        assert!(c.depends_on(b.id()));
        assert!(!a.depends_on(c.id()));
    }

    #[test]
    fn test_dispatch_passes_target() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let task = GpuTask::from_parts(
            TaskId::next(),
            "blit".into(),
            Arc::new(from_fn(move |target| {
                if let Some(fb) = target {
                    seen_clone.store(fb.0 as usize, Ordering::SeqCst);
                }
            })),
            Some(FramebufferId(9)),
            Vec::new(),
            TaskLifetime::Frame,
            0,
        );
        task.dispatch();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_fn_action_reports_resources() {
        let object = CacheableObject::new("lut", ResourceKind::Texture, 16);
        let action = from_fn(|_| {}).with_resources(vec![ResourceRef::Object(object.clone())]);
        assert!(from_fn(|_| {}).resources().is_empty());
        let resources = action.resources();
        assert_eq!(resources.len(), 1);
        assert!(matches!(&resources[0], ResourceRef::Object(o) if *o == object));
    }
}
