//! Per-worker ready-queue policy.
//!
//! Strict FIFO. Tasks carry a priority class for future policies, but the
//! current scheduler ignores it; a woken task is appended at the tail like
//! any other, even when the waker runs on the same worker.

use std::sync::Arc;

use crate::task::Task;
use crate::taskqueue::TaskQueue;

pub(crate) struct Scheduler {
    ready: TaskQueue,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            ready: TaskQueue::new(),
        }
    }

    pub fn put_ready(&mut self, t: Arc<Task>) {
        self.ready.append(t);
    }

    pub fn fetch_ready(&mut self) -> Option<Arc<Task>> {
        self.ready.remove()
    }

    /// Drain every remaining task into `action`. Used during worker
    /// finalisation for best-effort teardown.
    pub fn drain(&mut self, action: impl FnMut(Arc<Task>)) {
        self.ready.iterate_remove(|_| true, action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerCtx;

    #[test]
    fn test_fifo_order() {
        let w = WorkerCtx::new(0);
        let mut sched = Scheduler::new();
        let tasks: Vec<_> = (0..3)
            .map(|_| Task::new(Arc::clone(&w), Box::new(|| {}), 0))
            .collect();
        for t in &tasks {
            sched.put_ready(Arc::clone(t));
        }
        for t in &tasks {
            assert_eq!(sched.fetch_ready().unwrap().uid(), t.uid());
        }
        assert!(sched.fetch_ready().is_none());
    }
}
