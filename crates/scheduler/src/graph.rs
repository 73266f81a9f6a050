//! Task graph with a stable topological order
//!
//! The graph stores one revision per task identity. Dependencies are followed
//! by identity, so re-inserting a new revision of a task re-wires every task
//! that depends on it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::TaskError;
use crate::task::{GpuTask, TaskId};

struct GraphEntry {
    task: GpuTask,
    /// Insertion sequence, kept when a task is replaced
    position: u64,
}

/// Directed acyclic graph of GPU tasks for one or more frames
///
/// Every dependency of a task in the graph is itself in the graph.
///
/// # Example
///
/// ```
/// use lumen_scheduler::{from_fn, GpuTaskFactory, TaskGraph};
///
/// let factory = GpuTaskFactory::new();
/// let depth = factory.make_named_gpu_task("depth", from_fn(|_| {}), None);
/// let ssao = factory
///     .make_gpu_task_with_dependencies("ssao", from_fn(|_| {}), None, vec![depth.clone()])
///     .unwrap();
///
/// let mut graph = TaskGraph::new();
/// graph.insert(ssao.clone()).unwrap(); // pulls in `depth` as well
///
/// let order: Vec<_> = graph.topological_order().iter().map(|t| t.id()).collect();
/// assert_eq!(order, vec![depth.id(), ssao.id()]);
/// ```
#[derive(Default)]
pub struct TaskGraph {
    entries: HashMap<TaskId, GraphEntry>,
    next_position: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id)
    }

    /// The revision of a task currently in the graph
    pub fn get(&self, id: TaskId) -> Option<&GpuTask> {
        self.entries.get(&id).map(|e| &e.task)
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> Vec<GpuTask> {
        let mut entries: Vec<&GraphEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.position);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    /// Insert a task, or replace the graph's revision of it
    ///
    /// Prerequisites missing from the graph are inserted first. Prerequisites
    /// already in the graph keep the graph's revision. A replaced task keeps
    /// its insertion position.
    ///
    /// # Errors
    ///
    /// `CyclicDependency` if the task would transitively depend on itself
    /// through the graph's edges. The graph is unchanged in that case.
    pub fn insert(&mut self, task: GpuTask) -> Result<(), TaskError> {
        let root = task.id();
        let missing = self.missing_prerequisites(&task);
        let pending: HashMap<TaskId, &GpuTask> = missing.iter().map(|t| (t.id(), t)).collect();

        for dependency in task.dependency_ids() {
            if dependency == root || self.reaches(dependency, root, &pending) {
                return Err(TaskError::CyclicDependency {
                    task: root,
                    dependency,
                });
            }
        }

        for prerequisite in missing {
            self.push(prerequisite);
        }
        match self.entries.get_mut(&root) {
            Some(entry) => entry.task = task,
            None => self.push(task),
        }

        tracing::trace!(task = %root, tasks = self.entries.len(), "task inserted");
        Ok(())
    }

    /// Remove a task together with every task that transitively depends on it
    ///
    /// Returns the removed ids, the requested task first.
    pub fn remove(&mut self, id: TaskId) -> Result<Vec<TaskId>, TaskError> {
        if !self.entries.contains_key(&id) {
            return Err(TaskError::UnknownTask(id));
        }

        let removed = self.with_dependents(&[id]);
        for removed_id in &removed {
            self.entries.remove(removed_id);
        }
        Ok(removed)
    }

    /// Tasks that directly depend on `id`, in insertion order
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        let mut dependents: Vec<&GraphEntry> = self
            .entries
            .values()
            .filter(|e| e.task.dependency_ids().any(|d| d == id))
            .collect();
        dependents.sort_by_key(|e| e.position);
        dependents.into_iter().map(|e| e.task.id()).collect()
    }

    /// Drop frame-lifetime tasks, keeping persistent passthrough tasks
    ///
    /// A persistent task that depends on a frame-lifetime task is dropped as
    /// well. Returns the removed ids.
    pub fn retain_persistent(&mut self) -> Vec<TaskId> {
        let frame_tasks: Vec<TaskId> = self
            .tasks()
            .iter()
            .filter(|t| !t.is_persistent())
            .map(GpuTask::id)
            .collect();

        let removed = self.with_dependents(&frame_tasks);
        for id in &removed {
            self.entries.remove(id);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Submission order: every task after its prerequisites
    ///
    /// Stable: among tasks whose prerequisites are satisfied, the one inserted
    /// first comes first, so an unchanged graph always yields the same order.
    pub fn topological_order(&self) -> Vec<GpuTask> {
        let mut indegree: HashMap<TaskId, usize> = HashMap::with_capacity(self.entries.len());
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

        for (&id, entry) in &self.entries {
            let mut count = 0;
            for dependency in entry.task.dependency_ids() {
                if self.entries.contains_key(&dependency) {
                    count += 1;
                    dependents.entry(dependency).or_default().push(id);
                }
            }
            indegree.insert(id, count);
        }

        let mut ready: BinaryHeap<Reverse<(u64, TaskId)>> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| Reverse((self.entries[id].position, *id)))
            .collect();

        let mut order = Vec::with_capacity(self.entries.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(self.entries[&id].task.clone());
            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((self.entries[dependent].position, *dependent)));
                    }
                }
            }
        }
        order
    }

    fn push(&mut self, task: GpuTask) {
        let position = self.next_position;
        self.next_position += 1;
        self.entries.insert(task.id(), GraphEntry { task, position });
    }

    /// Transitive prerequisites of `task` that are not in the graph, each
    /// after its own prerequisites
    fn missing_prerequisites(&self, task: &GpuTask) -> Vec<GpuTask> {
        fn visit(graph: &TaskGraph, task: &GpuTask, root: TaskId, seen: &mut HashSet<TaskId>, out: &mut Vec<GpuTask>) {
            for dependency in task.dependencies() {
                let id = dependency.id();
                if id == root || graph.entries.contains_key(&id) || !seen.insert(id) {
                    continue;
                }
                visit(graph, dependency, root, seen, out);
                out.push(dependency.clone());
            }
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        visit(self, task, task.id(), &mut seen, &mut out);
        out
    }

    /// Whether `target` is reachable from `from` along dependency edges,
    /// looking tasks up in the graph first and in `pending` otherwise
    fn reaches(&self, from: TaskId, target: TaskId, pending: &HashMap<TaskId, &GpuTask>) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            let task = self.entries.get(&id).map(|e| &e.task).or_else(|| pending.get(&id).copied());
            if let Some(task) = task {
                stack.extend(task.dependency_ids());
            }
        }
        false
    }

    /// `roots` plus every task transitively depending on them
    fn with_dependents(&self, roots: &[TaskId]) -> Vec<TaskId> {
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (&id, entry) in &self.entries {
            for dependency in entry.task.dependency_ids() {
                dependents.entry(dependency).or_default().push(id);
            }
        }

        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: Vec<TaskId> = roots.to_vec();
        queue.reverse();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            if let Some(next) = dependents.get_mut(&id) {
                next.sort_by_key(|d| self.entries.get(d).map_or(u64::MAX, |e| e.position));
                queue.extend(next.iter().rev());
            }
        }
        out
    }
}
