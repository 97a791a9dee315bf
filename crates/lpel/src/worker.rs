//! Worker kernel threads.
//!
//! Each worker owns a scheduler, a monitoring context and a remote-wakeup
//! inbox. Tasks execute on the worker's thread through coroutine switches;
//! the worker regains control whenever a task yields, blocks or exits, and
//! acts on the state the task left behind.
//!
//! Cross-worker communication happens exclusively through the inbox:
//! unblocking a task of another worker, assigning a fresh task, and the
//! termination sentinel. Wakes travel through the inbox even when the
//! target task is still in the middle of switching out; the owning worker
//! drains the inbox only from its scheduling context, so it never resumes
//! a coroutine before it has actually suspended, and no foreign thread
//! ever writes the state word of a task that may still be running.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::coro::{self, Coro};
use crate::monitor::MonCtx;
use crate::sched::Scheduler;
use crate::task::{self, Task, TaskState};
use crate::RuntimeShared;

pub(crate) enum WorkerMsg {
    /// A freshly created task to take ownership of.
    Assign(Arc<Task>),
    /// A task of this worker was unblocked by another thread.
    Wake(Arc<Task>),
    /// Termination sentinel: drain the ready queue, then exit.
    Terminate,
}

thread_local! {
    /// Id of the worker owning this thread, if it is a worker thread.
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

pub(crate) fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER.with(|c| c.get())
}

/// Shared handle of one worker: its inbox and its ready queue.
pub(crate) struct WorkerCtx {
    pub wid: usize,
    inbox_tx: Sender<WorkerMsg>,
    inbox_rx: Receiver<WorkerMsg>,
    sched: Mutex<Scheduler>,
    /// Tasks assigned and not yet destroyed. Reported at worker exit.
    num_tasks: AtomicUsize,
}

impl WorkerCtx {
    pub fn new(wid: usize) -> Arc<WorkerCtx> {
        let (inbox_tx, inbox_rx) = unbounded();
        Arc::new(WorkerCtx {
            wid,
            inbox_tx,
            inbox_rx,
            sched: Mutex::new(Scheduler::new()),
            num_tasks: AtomicUsize::new(0),
        })
    }

    pub fn send(&self, msg: WorkerMsg) {
        let _ = self.inbox_tx.send(msg);
    }

    /// Hand an unblocked task back to this worker.
    ///
    /// From the worker's own thread the task goes straight to the tail of
    /// the ready queue: the target is guaranteed to have switched out,
    /// since only one task runs per worker. From anywhere else the wake
    /// travels through the inbox, and the READY transition is deferred to
    /// the inbox drain so that no thread but the owning worker ever writes
    /// the state of a task that may still be mid-switch. The send also
    /// rouses the worker if it is parked.
    pub fn wakeup(&self, t: Arc<Task>) {
        if current_worker_id() == Some(self.wid) {
            t.set_state(TaskState::Ready);
            self.sched.lock().put_ready(t);
        } else {
            self.send(WorkerMsg::Wake(t));
        }
    }
}

/// Body of one worker thread.
pub(crate) fn worker_loop(shared: Arc<RuntimeShared>, wid: usize) {
    let ctx = Arc::clone(&shared.workers[wid]);
    CURRENT_WORKER.with(|c| c.set(Some(wid)));

    // Affinity failures are non-fatal; the worker runs unpinned.
    let _ = shared.assign_thread(wid as i32);

    let mut mon = shared
        .mon
        .as_ref()
        .and_then(|ms| MonCtx::create(wid, &format!("worker{wid:02}"), ms));
    if let Some(m) = &mut mon {
        m.debug(format_args!("Worker {wid} started."));
    }

    // Coroutines are !Send and live here, keyed by task uid, until their
    // task is destroyed.
    let mut coros: FxHashMap<u32, Coro> = FxHashMap::default();
    let mut terminate = false;

    loop {
        // Drain the remote inbox into the local ready queue.
        while let Ok(msg) = ctx.inbox_rx.try_recv() {
            handle_msg(&ctx, msg, &mut terminate);
        }

        let next = ctx.sched.lock().fetch_ready();
        let t = match next {
            Some(t) => t,
            None => {
                if terminate {
                    break;
                }
                // Park on the inbox until someone hands us work.
                if let Some(m) = &mut mon {
                    m.wait_start();
                }
                let msg = match ctx.inbox_rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                };
                if let Some(m) = &mut mon {
                    m.wait_stop();
                }
                handle_msg(&ctx, msg, &mut terminate);
                continue;
            }
        };

        dispatch(&ctx, t, &mut coros, &mut mon);
    }

    // Best-effort teardown: leftover ready tasks and the stacks of tasks
    // still blocked at shutdown.
    ctx.sched.lock().drain(|t| {
        if let Some(mut c) = coros.remove(&t.uid()) {
            c.unwind();
        }
    });
    for (_, mut c) in coros.drain() {
        c.unwind();
    }

    if let Some(m) = &mut mon {
        let (wait_cnt, wait_total) = m.wait_stats();
        m.debug(format_args!(
            "Worker {wid} exited. tasks {} wait_cnt {wait_cnt}, wait_time {}.{:09}",
            ctx.num_tasks.load(Ordering::Relaxed),
            wait_total.as_secs(),
            wait_total.subsec_nanos()
        ));
    }
    CURRENT_WORKER.with(|c| c.set(None));
}

fn handle_msg(ctx: &WorkerCtx, msg: WorkerMsg, terminate: &mut bool) {
    match msg {
        WorkerMsg::Assign(t) => {
            ctx.num_tasks.fetch_add(1, Ordering::Relaxed);
            ctx.sched.lock().put_ready(t);
        }
        WorkerMsg::Wake(t) => {
            t.set_state(TaskState::Ready);
            ctx.sched.lock().put_ready(t);
        }
        WorkerMsg::Terminate => *terminate = true,
    }
}

/// Run one task until it switches back, then act on its new state.
fn dispatch(
    ctx: &WorkerCtx,
    t: Arc<Task>,
    coros: &mut FxHashMap<u32, Coro>,
    mon: &mut Option<MonCtx>,
) {
    t.set_state(TaskState::Running);
    let mt = t.mon();
    if let (Some(m), Some(mt)) = (mon.as_mut(), mt.as_ref()) {
        m.task_start(mt);
    }

    let coro = coros.entry(t.uid()).or_insert_with(|| {
        let entry = t
            .take_entry()
            .expect("dispatching a task that lost its entry function");
        let tref = Arc::clone(&t);
        Coro::new(
            t.stacksize(),
            Box::new(move || {
                entry();
                // Returning from the entry function is an implicit exit.
                tref.set_state(TaskState::Zombie);
            }),
        )
    });

    task::set_current(Arc::clone(&t));
    coro.resume();
    task::clear_current();
    coro::clear_yielder();

    let state = t.state();
    if let (Some(m), Some(mt)) = (mon.as_mut(), mt.as_ref()) {
        m.task_stop(mt, state);
    }

    match state {
        TaskState::Ready => ctx.sched.lock().put_ready(t),
        TaskState::Blocked(_) => {
            // The task sits in a stream waiter slot; the peer re-queues it.
        }
        TaskState::Zombie => {
            if let Some(mut c) = coros.remove(&t.uid()) {
                c.unwind();
            }
            t.drop_mon();
            ctx.num_tasks.fetch_sub(1, Ordering::Relaxed);
        }
        TaskState::Created | TaskState::Running => {
            unreachable!("task switched out in state {state:?}")
        }
    }
}
