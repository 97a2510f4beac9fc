//! "Next tick" task queue.
//!
//! Aliasing replays and debounced recoherence are deferred here and run at the
//! end of the current scheduling step, either by the host driver after each
//! inbound frame or by an embedding calling [`crate::Client::flush`].

use parking_lot::Mutex;
use std::collections::VecDeque;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<VecDeque<Task>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.lock().push_back(Box::new(task));
    }

    /// Runs queued tasks in FIFO order, including tasks they defer, and
    /// returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        // The lock is released before each task runs so tasks can defer more work.
        while let Some(task) = self.next_task() {
            task();
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    fn next_task(&self) -> Option<Task> {
        self.tasks.lock().pop_front()
    }
}
