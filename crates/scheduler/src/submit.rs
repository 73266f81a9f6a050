//! Submission queue
//!
//! Runs submitted frames on a dedicated thread. Frames are processed in the
//! order they were submitted; each task is dispatched in plan order, then the
//! frame's leases are released and its ticket retired.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, SendError, Sender};
use lumen_cache::ResidencyCache;
use parking_lot::Mutex;

use crate::resolve::FrameLeases;
use crate::scheduler::{SchedulerStats, StateTracker, TicketState};
use crate::task::{GpuTask, TaskState};

/// One frame handed off for submission
pub(crate) struct Submission {
    pub(crate) frame: u64,
    pub(crate) tasks: Vec<GpuTask>,
    pub(crate) leases: FrameLeases,
    pub(crate) tracker: Arc<StateTracker>,
    pub(crate) ticket: Arc<TicketState>,
    pub(crate) cache: Arc<ResidencyCache>,
    pub(crate) stats: Arc<Mutex<SchedulerStats>>,
}

impl Submission {
    /// Dispatch every task, then release the frame
    pub(crate) fn run(self) {
        for task in &self.tasks {
            task.dispatch();
            if let Err(err) = self.tracker.transition(task.id(), TaskState::Retired) {
                tracing::error!(task = %task.id(), %err, "unexpected task state");
            }
        }
        self.stats.lock().tasks_retired += self.tasks.len() as u64;

        self.leases.release(&self.cache);
        self.ticket.retire();
        tracing::debug!(frame = self.frame, tasks = self.tasks.len(), "frame retired");
    }
}

enum Command {
    Run(Submission),
    Flush(Sender<()>),
}

/// Submission thread fed by a channel
///
/// Dropping the queue stops the thread after every frame already submitted
/// has run.
pub struct SubmissionQueue {
    sender: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl SubmissionQueue {
    /// Start the submission thread
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("lumen-submit".to_string())
            .spawn(move || Self::run(receiver))?;

        tracing::info!("submission thread started");
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    fn run(receiver: Receiver<Command>) {
        for command in receiver.iter() {
            match command {
                Command::Run(submission) => submission.run(),
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::info!("submission thread stopped");
    }

    /// Hand a frame to the submission thread
    ///
    /// If the thread is gone the frame runs on the calling thread instead.
    pub(crate) fn enqueue(&self, submission: Submission) {
        let Some(sender) = &self.sender else {
            submission.run();
            return;
        };
        if let Err(SendError(Command::Run(submission))) = sender.send(Command::Run(submission)) {
            tracing::warn!(frame = submission.frame, "submission thread gone, running inline");
            submission.run();
        }
    }

    /// Block until every frame submitted so far has retired
    ///
    /// Returns false if the submission thread is no longer running.
    pub fn flush(&self) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let (done, wait) = crossbeam_channel::bounded(1);
        sender.send(Command::Flush(done)).is_ok() && wait.recv().is_ok()
    }

    /// Run the remaining frames and stop the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("submission thread panicked");
            }
        }
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::GpuTaskFactory;
    use crate::graph::TaskGraph;
    use crate::resolve::ResidencyResolver;
    use crate::scheduler::FrameScheduler;
    use crate::task::{from_fn, ResourceRef};
    use lumen_cache::{CacheableObject, HeadlessDevice, ResourceKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> FrameScheduler {
        let cache = Arc::new(ResidencyCache::new(1 << 20, Arc::new(HeadlessDevice::default())));
        FrameScheduler::new(ResidencyResolver::for_cache(cache))
    }

    #[test]
    fn test_frames_run_on_submission_thread() {
        let scheduler = scheduler();
        let queue = SubmissionQueue::new().unwrap();
        let factory = GpuTaskFactory::new();

        let thread_name = Arc::new(Mutex::new(None));
        let name_slot = thread_name.clone();
        let object = CacheableObject::new("vertex buffer", ResourceKind::Buffer, 512);
        let task = factory.make_gpu_task(
            from_fn(move |_| {
                *name_slot.lock() = thread::current().name().map(str::to_string);
            })
            .with_resources(vec![ResourceRef::Object(object.clone())]),
        );

        let mut graph = TaskGraph::new();
        graph.insert(task.clone()).unwrap();

        let ticket = scheduler.submit(scheduler.schedule(&graph), &queue);
        assert!(queue.flush());

        assert!(ticket.is_retired());
        assert_eq!(ticket.state_of(task.id()), Some(TaskState::Retired));
        assert_eq!(thread_name.lock().as_deref(), Some("lumen-submit"));
        assert!(!object.is_live());
    }

    #[test]
    fn test_frames_retire_in_submission_order() {
        let scheduler = scheduler();
        let queue = SubmissionQueue::new().unwrap();
        let factory = GpuTaskFactory::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = Vec::new();
        for frame in 0..4 {
            let log = order.clone();
            let task = factory.make_gpu_task(from_fn(move |_| log.lock().push(frame)));
            let mut graph = TaskGraph::new();
            graph.insert(task).unwrap();
            tickets.push(scheduler.submit(scheduler.schedule(&graph), &queue));
        }

        queue.shutdown();
        assert!(tickets.iter().all(|t| t.is_retired()));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(scheduler.stats().in_flight(), 0);
    }

    #[test]
    fn test_drop_joins_thread() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = GpuTaskFactory::new().make_gpu_task(from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut graph = TaskGraph::new();
        graph.insert(task).unwrap();

        let ticket = {
            let queue = SubmissionQueue::new().unwrap();
            scheduler.submit(scheduler.schedule(&graph), &queue)
        };
        assert!(ticket.is_retired());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
