//! GPU task factory
//!
//! Builds [`GpuTask`] values and derives new revisions of existing tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::TaskError;
use crate::task::{Dispatchable, FramebufferId, GpuTask, TaskId, TaskLifetime};

/// Factory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryStats {
    /// Tasks constructed (not counting mutations)
    pub created: u64,
    /// New revisions produced by mutation
    pub mutated: u64,
}

/// Constructs GPU tasks
///
/// # Example
///
/// ```
/// use lumen_scheduler::{from_fn, FramebufferId, GpuTaskFactory};
///
/// let factory = GpuTaskFactory::new();
/// let shadow = factory.make_named_gpu_task("shadow", from_fn(|_| {}), Some(FramebufferId(1)));
/// let lighting = factory
///     .make_gpu_task_with_dependencies("lighting", from_fn(|_| {}), Some(FramebufferId(2)), vec![shadow.clone()])
///     .unwrap();
///
/// assert!(lighting.depends_on(shadow.id()));
///
/// // Resizing the target produces a new revision with the same identity
/// let resized = factory.mutate_gpu_task(&lighting).target(Some(FramebufferId(3))).build().unwrap();
/// assert_eq!(resized.id(), lighting.id());
/// assert_eq!(resized.revision(), 1);
/// ```
#[derive(Debug, Default)]
pub struct GpuTaskFactory {
    created: AtomicU64,
    mutated: AtomicU64,
}

impl GpuTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a leaf task: no target, no dependencies
    pub fn make_gpu_task(&self, action: impl Dispatchable + 'static) -> GpuTask {
        let id = TaskId::next();
        self.build(id, format!("task-{}", id.raw()), Arc::new(action), None, Vec::new(), TaskLifetime::Frame)
    }

    /// Build a named task bound to a render target
    pub fn make_named_gpu_task(
        &self,
        name: impl Into<String>,
        action: impl Dispatchable + 'static,
        framebuffer: Option<FramebufferId>,
    ) -> GpuTask {
        self.build(TaskId::next(), name.into(), Arc::new(action), framebuffer, Vec::new(), TaskLifetime::Frame)
    }

    /// Build a task with explicit prerequisites
    ///
    /// # Errors
    ///
    /// `CyclicDependency` if the dependency set would make the task depend on
    /// itself. No task is created in that case.
    pub fn make_gpu_task_with_dependencies(
        &self,
        name: impl Into<String>,
        action: impl Dispatchable + 'static,
        framebuffer: Option<FramebufferId>,
        dependencies: Vec<GpuTask>,
    ) -> Result<GpuTask, TaskError> {
        let id = TaskId::next();
        check_acyclic(id, &dependencies)?;
        Ok(self.build(id, name.into(), Arc::new(action), framebuffer, dependencies, TaskLifetime::Frame))
    }

    /// Build a passthrough task that stays in the graph across frames
    pub fn make_persistent_gpu_task(
        &self,
        name: impl Into<String>,
        action: impl Dispatchable + 'static,
        framebuffer: Option<FramebufferId>,
        dependencies: Vec<GpuTask>,
    ) -> Result<GpuTask, TaskError> {
        let id = TaskId::next();
        check_acyclic(id, &dependencies)?;
        Ok(self.build(id, name.into(), Arc::new(action), framebuffer, dependencies, TaskLifetime::Persistent))
    }

    /// Start a new revision of a task
    ///
    /// The result keeps the task's identity and name. The original value is
    /// left untouched, so a revision already handed to the submission queue
    /// is never affected.
    pub fn mutate_gpu_task<'a>(&'a self, task: &'a GpuTask) -> TaskMutation<'a> {
        TaskMutation {
            factory: self,
            base: task,
            action: None,
            target: None,
            dependencies: task.dependencies().to_vec(),
            lifetime: task.lifetime(),
        }
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            created: self.created.load(Ordering::Relaxed),
            mutated: self.mutated.load(Ordering::Relaxed),
        }
    }

    fn build(
        &self,
        id: TaskId,
        name: String,
        action: Arc<dyn Dispatchable>,
        target: Option<FramebufferId>,
        dependencies: Vec<GpuTask>,
        lifetime: TaskLifetime,
    ) -> GpuTask {
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(task = %id, name = %name, "task created");
        GpuTask::from_parts(id, name, action, target, dependencies, lifetime, 0)
    }
}

/// Overrides for a new revision of a task
///
/// Unset fields are taken from the base task.
#[must_use = "a mutation does nothing until `build` is called"]
pub struct TaskMutation<'a> {
    factory: &'a GpuTaskFactory,
    base: &'a GpuTask,
    action: Option<Arc<dyn Dispatchable>>,
    target: Option<Option<FramebufferId>>,
    dependencies: Vec<GpuTask>,
    lifetime: TaskLifetime,
}

impl<'a> TaskMutation<'a> {
    /// Replace the action
    pub fn action(mut self, action: impl Dispatchable + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    /// Re-target the task (`None` unbinds it)
    pub fn target(mut self, target: Option<FramebufferId>) -> Self {
        self.target = Some(target);
        self
    }

    /// Replace the whole dependency set
    pub fn dependencies(mut self, dependencies: Vec<GpuTask>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Add a prerequisite, replacing an older revision of the same task
    pub fn add_dependency(mut self, dependency: GpuTask) -> Self {
        match self.dependencies.iter_mut().find(|d| d.id() == dependency.id()) {
            Some(existing) => *existing = dependency,
            None => self.dependencies.push(dependency),
        }
        self
    }

    pub fn remove_dependency(mut self, id: TaskId) -> Self {
        self.dependencies.retain(|d| d.id() != id);
        self
    }

    pub fn lifetime(mut self, lifetime: TaskLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Build the new revision
    ///
    /// # Errors
    ///
    /// `CyclicDependency` if a new prerequisite already depends on this task.
    pub fn build(self) -> Result<GpuTask, TaskError> {
        let id = self.base.id();
        check_acyclic(id, &self.dependencies)?;

        let revision = self.base.revision() + 1;
        self.factory.mutated.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(task = %id, revision, "task mutated");

        Ok(GpuTask::from_parts(
            id,
            self.base.name().to_string(),
            self.action.unwrap_or_else(|| self.base.action().clone()),
            self.target.unwrap_or_else(|| self.base.target()),
            self.dependencies,
            self.lifetime,
            revision,
        ))
    }
}

/// Fail if any dependency is `id` or transitively depends on it
fn check_acyclic(id: TaskId, dependencies: &[GpuTask]) -> Result<(), TaskError> {
    match dependencies.iter().find(|dep| dep.id() == id || dep.depends_on(id)) {
        Some(dep) => Err(TaskError::CyclicDependency {
            task: id,
            dependency: dep.id(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::from_fn;

    #[test]
    fn test_leaf_task() {
        let factory = GpuTaskFactory::new();
        let task = factory.make_gpu_task(from_fn(|_| {}));
        assert!(task.target().is_none());
        assert!(task.dependencies().is_empty());
        assert_eq!(task.name(), format!("task-{}", task.id().raw()));
        assert_eq!(task.revision(), 0);
    }

    #[test]
    fn test_named_task_with_target() {
        let factory = GpuTaskFactory::new();
        let task = factory.make_named_gpu_task("tonemap", from_fn(|_| {}), Some(FramebufferId(4)));
        assert_eq!(task.name(), "tonemap");
        assert_eq!(task.target(), Some(FramebufferId(4)));
        assert_eq!(factory.stats().created, 1);
    }

    #[test]
    fn test_mutation_keeps_identity_and_bumps_revision() {
        let factory = GpuTaskFactory::new();
        let dep = factory.make_gpu_task(from_fn(|_| {}));
        let task = factory.make_named_gpu_task("bloom", from_fn(|_| {}), Some(FramebufferId(1)));

        let next = factory
            .mutate_gpu_task(&task)
            .target(Some(FramebufferId(2)))
            .add_dependency(dep.clone())
            .build()
            .unwrap();

        assert_eq!(next.id(), task.id());
        assert_eq!(next.name(), "bloom");
        assert_eq!(next.revision(), 1);
        assert_eq!(next.target(), Some(FramebufferId(2)));
        assert!(next.depends_on(dep.id()));

        // The original revision is untouched
        assert_eq!(task.target(), Some(FramebufferId(1)));
        assert!(task.dependencies().is_empty());
        assert_ne!(next, task);
        assert_eq!(factory.stats().mutated, 1);
    }

    #[test]
    fn test_remove_dependency() {
        let factory = GpuTaskFactory::new();
        let a = factory.make_gpu_task(from_fn(|_| {}));
        let b = factory.make_gpu_task(from_fn(|_| {}));
        let task = factory
            .make_gpu_task_with_dependencies("c", from_fn(|_| {}), None, vec![a.clone(), b.clone()])
            .unwrap();

        let next = factory.mutate_gpu_task(&task).remove_dependency(a.id()).build().unwrap();
        assert_eq!(next.dependency_ids().collect::<Vec<_>>(), vec![b.id()]);
    }

    #[test]
    fn test_mutation_introducing_cycle_fails() {
        let factory = GpuTaskFactory::new();
        let a = factory.make_named_gpu_task("a", from_fn(|_| {}), None);
        let b = factory
            .make_gpu_task_with_dependencies("b", from_fn(|_| {}), None, vec![a.clone()])
            .unwrap();
        let c = factory
            .make_gpu_task_with_dependencies("c", from_fn(|_| {}), None, vec![b.clone()])
            .unwrap();

        let err = factory.mutate_gpu_task(&a).add_dependency(c.clone()).build().unwrap_err();
        assert_eq!(
            err,
            TaskError::CyclicDependency {
                task: a.id(),
                dependency: c.id(),
            }
        );

        let err = factory.mutate_gpu_task(&a).add_dependency(a.clone()).build().unwrap_err();
        assert!(matches!(err, TaskError::CyclicDependency { .. }));
        assert_eq!(factory.stats().mutated, 0);
    }

    #[test]
    fn test_persistent_task() {
        let factory = GpuTaskFactory::new();
        let task = factory
            .make_persistent_gpu_task("present", from_fn(|_| {}), Some(FramebufferId(0)), Vec::new())
            .unwrap();
        assert!(task.is_persistent());

        let demoted = factory
            .mutate_gpu_task(&task)
            .lifetime(TaskLifetime::Frame)
            .build()
            .unwrap();
        assert!(!demoted.is_persistent());
    }
}
