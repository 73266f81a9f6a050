//! Lumen GPU Task Scheduler
//!
//! Dependency-ordered GPU task scheduling on top of the residency cache.
//!
//! Tasks are immutable values built by a [`GpuTaskFactory`] and collected in a
//! [`TaskGraph`]. Every frame, [`FrameScheduler::schedule`] walks the graph in
//! a stable topological order and makes each task's resources resident. Tasks
//! whose resources cannot be made resident are dropped along with their
//! dependents; the resulting [`FramePlan`] is executed inline or handed to a
//! [`SubmissionQueue`] thread.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lumen_cache::{CacheableObject, HeadlessDevice, ResidencyCache, ResourceKind};
//! use lumen_scheduler::{
//!     from_fn, FrameScheduler, FramebufferId, GpuTaskFactory, ResidencyResolver, ResourceRef,
//!     SubmissionQueue, TaskGraph,
//! };
//!
//! let device = Arc::new(HeadlessDevice::default());
//! let cache = Arc::new(ResidencyCache::new(64 << 20, device));
//! let scheduler = FrameScheduler::new(ResidencyResolver::for_cache(cache));
//! let factory = GpuTaskFactory::new();
//!
//! let depth = CacheableObject::new("depth", ResourceKind::Image, 8 << 20);
//! let prepass = factory.make_named_gpu_task(
//!     "prepass",
//!     from_fn(|_| {}).with_resources(vec![ResourceRef::Object(depth.clone())]),
//!     Some(FramebufferId(1)),
//! );
//! let lighting = factory
//!     .make_gpu_task_with_dependencies("lighting", from_fn(|_| {}), Some(FramebufferId(2)), vec![prepass.clone()])
//!     .unwrap();
//!
//! let mut graph = TaskGraph::new();
//! graph.insert(lighting.clone()).unwrap();
//!
//! let queue = SubmissionQueue::new().unwrap();
//! let plan = scheduler.schedule(&graph);
//! assert_eq!(plan.submission_ids(), vec![prepass.id(), lighting.id()]);
//!
//! let ticket = scheduler.submit(plan, &queue);
//! queue.flush();
//! assert!(ticket.is_retired());
//! ```

mod error;
mod factory;
mod graph;
mod resolve;
mod scheduler;
mod submit;
mod task;

// Re-export public API
pub use error::TaskError;
pub use factory::{FactoryStats, GpuTaskFactory, TaskMutation};
pub use graph::TaskGraph;
pub use resolve::{FrameLeases, ResidencyResolver};
pub use scheduler::{DropReason, DroppedTask, FramePlan, FrameScheduler, FrameTicket, SchedulerStats};
pub use submit::SubmissionQueue;
pub use task::{
    from_fn, Dispatchable, FnAction, FramebufferId, GpuTask, ResourceRef, TaskId, TaskLifetime, TaskState,
};
