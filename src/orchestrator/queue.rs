//! Cross-thread task scheduling
//!
//! Producers on any thread append callbacks and raise `Schedule`; the
//! orchestrator drains the whole queue in one batch per wake. Draining
//! swaps the queue with an empty one so the lock is never held while a
//! callback runs and new submissions keep arriving meanwhile.
//!
//! Once the orchestrator stops, the queue is closed: pending and later
//! tasks are dropped unrun, which also releases anyone blocked in
//! [`Scheduler::invoke`].

use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};

use tracing::debug;

use crate::events::{EventFlag, EventFlagSet};

/// A unit of work executed once on the orchestrator thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    tasks: Vec<Task>,
    closed: bool,
}

/// Mutex-guarded FIFO of pending tasks
#[derive(Default)]
pub struct TaskQueue {
    pending: Mutex<Pending>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `task`; a closed queue hands it back instead
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let mut pending = self.lock();
        if pending.closed {
            return Err(task);
        }
        pending.tasks.push(task);
        Ok(())
    }

    /// Take an exclusive snapshot of every queued task
    pub fn take_all(&self) -> Vec<Task> {
        std::mem::take(&mut self.lock().tasks)
    }

    /// Refuse further tasks and return the ones never run
    pub fn close(&self) -> Vec<Task> {
        let mut pending = self.lock();
        pending.closed = true;
        std::mem::take(&mut pending.tasks)
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Shared {
    tasks: TaskQueue,
    events: Arc<EventFlagSet>,
    main_thread: OnceLock<ThreadId>,
}

/// Cheap, cloneable handle used by workers to reach the orchestrator
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(events: Arc<EventFlagSet>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tasks: TaskQueue::new(),
                events,
                main_thread: OnceLock::new(),
            }),
        }
    }

    /// Queue `task` to run on the orchestrator thread
    ///
    /// Tasks run exactly once, in submission order, after the flag
    /// categories of the wake in which `Schedule` was observed.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.shared.tasks.push(Box::new(task)) {
            Ok(()) => self.shared.events.raise(EventFlag::Schedule),
            Err(_dropped) => debug!("orchestrator stopped, task dropped"),
        }
    }

    /// Raise a flag without queueing work
    pub fn raise(&self, flag: EventFlag) {
        self.shared.events.raise(flag);
    }

    pub fn events(&self) -> &Arc<EventFlagSet> {
        &self.shared.events
    }

    /// Record the calling thread as the orchestrator thread
    ///
    /// Only the first call has any effect.
    pub fn bind_current_thread(&self) {
        let _ = self.shared.main_thread.set(thread::current().id());
    }

    /// Whether the caller is running on the orchestrator thread
    pub fn is_main_thread(&self) -> bool {
        self.shared.main_thread.get() == Some(&thread::current().id())
    }

    /// Run `task` on the orchestrator thread and wait for its result
    ///
    /// Runs inline when already on the orchestrator thread. Returns `None`
    /// if the task was dropped without running (queue closed).
    pub fn invoke<F, R>(&self, task: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_main_thread() {
            return Some(task());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.schedule(move || {
            let _ = tx.send(task());
        });
        rx.recv().ok()
    }

    /// Drain the queue snapshot and run every task; returns how many ran
    pub fn run_pending(&self) -> usize {
        let tasks = self.shared.tasks.take_all();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.shared.tasks.len()
    }

    /// Stop accepting tasks and drop the ones still queued
    ///
    /// Called when the dispatch loop exits.
    pub fn close(&self) -> usize {
        let dropped = self.shared.tasks.close();
        dropped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(EventFlagSet::new()))
    }

    #[test]
    fn test_schedule_raises_flag_once() {
        let scheduler = scheduler();
        scheduler.schedule(|| {});
        scheduler.schedule(|| {});

        let flags = scheduler.events().wait();
        assert!(flags.contains(EventFlag::Schedule));
        assert_eq!(flags.len(), 1);
        assert_eq!(scheduler.pending(), 2);
    }

    #[test]
    fn test_run_pending_preserves_submission_order() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            scheduler.schedule(move || order.lock().unwrap().push(name));
        }

        assert_eq!(scheduler.run_pending(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_tasks_scheduled_while_draining_wait_for_next_batch() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_scheduler = scheduler.clone();
        let inner_order = Arc::clone(&order);
        scheduler.schedule(move || {
            inner_order.lock().unwrap().push("first");
            let nested_order = Arc::clone(&inner_order);
            inner_scheduler.schedule(move || nested_order.lock().unwrap().push("nested"));
        });

        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["first", "nested"]);
    }

    #[test]
    fn test_cross_thread_order_is_kept_on_consumer() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));

        // A then B then C, each from its own thread, strictly sequenced
        for name in ["A", "B", "C"] {
            let producer = scheduler.clone();
            let order = Arc::clone(&order);
            thread::spawn(move || producer.schedule(move || order.lock().unwrap().push(name)))
                .join()
                .unwrap();
        }

        let consumer = scheduler.clone();
        let handle = thread::spawn(move || {
            consumer.bind_current_thread();
            consumer.events().wait();
            consumer.run_pending()
        });
        assert_eq!(handle.join().unwrap(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_invoke_runs_on_bound_thread() {
        let scheduler = scheduler();
        let consumer = scheduler.clone();
        let handle = thread::spawn(move || {
            consumer.bind_current_thread();
            let flags = consumer.events().wait_timeout(Duration::from_secs(5));
            assert!(flags.contains(EventFlag::Schedule));
            consumer.run_pending();
            thread::current().id()
        });

        let ran_on = scheduler.invoke(|| thread::current().id());
        let consumer_id = handle.join().unwrap();
        assert_eq!(ran_on, Some(consumer_id));
    }

    #[test]
    fn test_invoke_returns_none_when_queue_closes() {
        let scheduler = scheduler();
        let caller = scheduler.clone();
        let waiting = thread::spawn(move || caller.invoke(|| 1));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while scheduler.pending() == 0 {
            assert!(std::time::Instant::now() < deadline, "invoke never queued");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(scheduler.close(), 1);
        assert_eq!(waiting.join().unwrap(), None);
    }

    #[test]
    fn test_closed_queue_drops_new_tasks() {
        let scheduler = scheduler();
        scheduler.close();

        scheduler.schedule(|| panic!("must not run"));
        assert_eq!(scheduler.pending(), 0);
        assert!(scheduler.events().pending().is_empty());

        let caller = scheduler.clone();
        let result = thread::spawn(move || caller.invoke(|| 2)).join().unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_invoke_inline_on_main_thread() {
        let scheduler = scheduler();
        scheduler.bind_current_thread();
        assert_eq!(scheduler.invoke(|| 42), Some(42));
        assert_eq!(scheduler.pending(), 0);
    }
}
