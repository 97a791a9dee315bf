//! Task control block and lifecycle state machine.
//!
//! A task is a unit of cooperative execution with its own stack, pinned to
//! the worker it was created on for its whole life. The control block is
//! shared (`Arc`) between the owning worker, ready queues and stream waiter
//! slots; the coroutine itself stays worker-local.
//!
//! ## State machine
//!
//! ```text
//! CREATED --(run)------------> READY
//! READY   --(dispatch)-------> RUNNING
//! RUNNING --(yield)----------> READY
//! RUNNING --(block on X)-----> BLOCKED{X}
//! BLOCKED --(unblock)--------> READY
//! RUNNING --(return / exit)--> ZOMBIE
//! ```
//!
//! Only the owning worker moves a task out of READY; only the peer that
//! freed a resource moves it out of BLOCKED. The `poll_token` and
//! `wakeup_sid` words are the only fields touched cross-thread while a
//! task is blocked, via compare-and-swap (see `stream::poll`).

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::coro;
use crate::monitor::TaskMon;
use crate::worker::WorkerCtx;

/// Stack size used when task creation does not specify one.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// `poll_token` value meaning "not currently polling".
pub(crate) const POLL_IDLE: usize = usize::MAX;

/// The execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created but not yet handed to its worker.
    Created,
    /// Waiting in its worker's ready queue.
    Ready,
    /// Executing on its worker.
    Running,
    /// Suspended in a stream waiter slot.
    Blocked(BlockReason),
    /// Terminated. Destroyed by the worker after monitoring finalisation.
    Zombie,
}

/// What a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// A stream to become non-empty.
    Input,
    /// A stream to become non-full.
    Output,
    /// Any stream of a poll set to become non-empty.
    Any,
}

impl TaskState {
    /// Single-letter state code used in monitoring output.
    pub(crate) fn code(self) -> char {
        match self {
            TaskState::Created => 'C',
            TaskState::Ready => 'R',
            TaskState::Running => 'U',
            TaskState::Blocked(_) => 'B',
            TaskState::Zombie => 'Z',
        }
    }
}

pub(crate) struct TaskInner {
    pub state: TaskState,
    /// Entry function, taken by the owning worker at first dispatch.
    pub entry: Option<Box<dyn FnOnce() + Send>>,
    /// Monitoring record, attached before the task first runs.
    pub mon: Option<Arc<TaskMon>>,
    /// Priority class, reserved for future scheduling policies.
    #[allow(dead_code)]
    pub prio: i32,
}

/// Task control block.
pub struct Task {
    uid: u32,
    stacksize: usize,
    worker: Arc<WorkerCtx>,
    inner: Mutex<TaskInner>,
    /// Single-word arbiter for multi-stream polling. Holds `POLL_IDLE`
    /// outside of a poll; the poller sets it to the size of its stream set
    /// and whoever swaps it back to `POLL_IDLE` owns the single wake-up.
    pub(crate) poll_token: AtomicUsize,
    /// UID of the stream that caused the last wake-up; 0 when unset.
    pub(crate) wakeup_sid: AtomicU32,
}

impl Task {
    pub(crate) fn new(
        worker: Arc<WorkerCtx>,
        entry: Box<dyn FnOnce() + Send>,
        stacksize: usize,
    ) -> Arc<Task> {
        static NEXT_UID: AtomicU32 = AtomicU32::new(1);
        let stacksize = if stacksize == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stacksize
        };
        Arc::new(Task {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            stacksize,
            worker,
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                entry: Some(entry),
                mon: None,
                prio: 0,
            }),
            poll_token: AtomicUsize::new(POLL_IDLE),
            wakeup_sid: AtomicU32::new(0),
        })
    }

    /// Unique, monotonically assigned task identifier.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Id of the worker this task lives on.
    pub fn worker_id(&self) -> usize {
        self.worker.wid
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn stacksize(&self) -> usize {
        self.stacksize
    }

    pub(crate) fn worker(&self) -> &Arc<WorkerCtx> {
        &self.worker
    }

    pub(crate) fn take_entry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.inner.lock().entry.take()
    }

    pub(crate) fn set_mon(&self, mon: Arc<TaskMon>) {
        self.inner.lock().mon = Some(mon);
    }

    pub(crate) fn mon(&self) -> Option<Arc<TaskMon>> {
        self.inner.lock().mon.clone()
    }

    /// Name of the task's monitoring record, when one is attached.
    pub fn monitor_name(&self) -> Option<String> {
        self.inner.lock().mon.as_ref().map(|m| m.name().to_string())
    }

    pub(crate) fn drop_mon(&self) {
        self.inner.lock().mon = None;
    }

    /// Mark a blocked task ready and hand it back to its owning worker.
    ///
    /// Called by the task that freed the resource the blocked task waits
    /// for; safe across workers (the wake travels through the owning
    /// worker's inbox, and the READY transition happens on the owning
    /// worker, after the task has fully switched out).
    pub fn unblock(self: &Arc<Self>) {
        self.worker.wakeup(Arc::clone(self));
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("uid", &self.uid)
            .field("worker", &self.worker.wid)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Current-task context
// ---------------------------------------------------------------------------

thread_local! {
    /// Task currently dispatched on this worker thread. Set by the worker
    /// around every coroutine resume.
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(t: Arc<Task>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = Some(t));
}

pub(crate) fn clear_current() {
    CURRENT_TASK.with(|c| *c.borrow_mut() = None);
}

/// The task currently executing on this thread, if any.
pub fn current() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

// ---------------------------------------------------------------------------
// Suspension points
// ---------------------------------------------------------------------------

/// Give up the processor: the task is appended at the tail of its worker's
/// ready queue and the worker picks the next ready task.
pub fn yield_current() {
    let t = current().expect("yield_current called outside of a task");
    t.set_state(TaskState::Ready);
    coro::suspend();
}

/// Block the current task. The caller must have installed the task in the
/// waiter slot of the stream that triggers the block beforehand.
pub fn block_current(reason: BlockReason) {
    let t = current().expect("block_current called outside of a task");
    t.set_state(TaskState::Blocked(reason));
    coro::suspend();
}

/// Terminate the current task and switch out for good.
///
/// Returning from the task's entry function is equivalent.
pub fn exit_current() -> ! {
    let t = current().expect("exit_current called outside of a task");
    t.set_state(TaskState::Zombie);
    loop {
        // A zombie is never dispatched again; the worker unwinds the stack.
        coro::suspend();
    }
}
