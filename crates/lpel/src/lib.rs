//! Lightweight parallel execution layer.
//!
//! A user-space cooperative task runtime: many thousands of coroutine
//! tasks are multiplexed over a fixed pool of kernel worker threads pinned
//! to physical CPUs. Tasks communicate through bounded single-producer/
//! single-consumer [streams](stream) and switch contexts only at explicit
//! suspension points (yield, block, stream operations), so dispatching
//! never involves the kernel once a task is running.
//!
//! ## Modules
//!
//! - [`task`]: task control blocks, lifecycle state machine, suspension
//!   points
//! - [`stream`]: bounded SPSC streams, descriptors and multi-stream
//!   polling
//! - [`monitor`]: deferred per-task event log with per-worker log files
//! - [`config`] / [`error`] / [`platform`]: configuration envelope, error
//!   kinds, CPU affinity and real-time capability adapter
//!
//! ## Lifecycle
//!
//! ```no_run
//! use lpel::{Config, Lpel};
//!
//! let rt = Lpel::init(Config::default()).unwrap();
//! let t = rt.task_create(0, || println!("hello"), 0);
//! rt.task_run(t);
//! rt.stop();
//! rt.cleanup();
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod stream;
pub mod task;

mod coro;
mod sched;
mod taskqueue;
pub(crate) mod worker;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub use config::{Config, Flags, MonitorConfig};
pub use error::{Error, Result};
pub use monitor::MonitorFlags;
pub use stream::{poll, Mode, Stream, StreamDesc};
pub use task::{exit_current, yield_current, BlockReason, Task, TaskState, DEFAULT_STACK_SIZE};

use monitor::{MonShared, TaskMon};
use worker::{WorkerCtx, WorkerMsg};

/// Process-wide runtime state, frozen before the workers spawn and
/// read-only afterwards.
pub(crate) struct RuntimeShared {
    pub config: Config,
    pub workers: Vec<Arc<WorkerCtx>>,
    pub cpuset_workers: Vec<usize>,
    pub cpuset_others: Vec<usize>,
    pub mon: Option<MonShared>,
}

impl RuntimeShared {
    /// Pin the calling thread. `core == -1` selects the others CPU set;
    /// a worker id selects that worker's CPU (with real-time scheduling
    /// requested best-effort in exclusive mode), or the whole worker set
    /// when the pool is not pinned.
    pub(crate) fn assign_thread(&self, core: i32) -> Result<()> {
        if core == -1 {
            return platform::pin_to(&self.cpuset_others);
        }
        let core = core as usize;
        debug_assert!(
            core < self.config.num_workers,
            "core index outside of the worker range"
        );
        if self.config.flags.contains(Flags::PINNED) {
            platform::pin_to(&[core % self.config.proc_workers])?;
            if self.config.flags.contains(Flags::EXCLUSIVE) {
                let _ = platform::request_exclusive();
            }
            Ok(())
        } else {
            platform::pin_to(&self.cpuset_workers)
        }
    }
}

/// Runtime facade. `init` brings the worker pool up; `stop` initiates
/// termination; `cleanup` joins the workers and tears the pool down.
pub struct Lpel {
    shared: Arc<RuntimeShared>,
    joins: Vec<JoinHandle<()>>,
}

impl Lpel {
    /// Validate `config`, build the CPU sets and spawn the worker pool.
    pub fn init(config: Config) -> Result<Lpel> {
        config.check()?;

        let cpuset_workers = config.cpuset_workers();
        let cpuset_others = config.cpuset_others();
        let mon = config.monitoring.as_ref().map(MonShared::new);
        let workers: Vec<_> = (0..config.num_workers).map(WorkerCtx::new).collect();
        let shared = Arc::new(RuntimeShared {
            config,
            workers,
            cpuset_workers,
            cpuset_others,
            mon,
        });

        let mut joins = Vec::new();
        for wid in 0..shared.config.num_workers {
            let s = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("lpel-worker-{wid:02}"))
                .spawn(move || worker::worker_loop(s, wid));
            match spawned {
                Ok(handle) => joins.push(handle),
                Err(_) => {
                    for w in &shared.workers {
                        w.send(WorkerMsg::Terminate);
                    }
                    for handle in joins {
                        let _ = handle.join();
                    }
                    return Err(Error::Fail);
                }
            }
        }

        Ok(Lpel { shared, joins })
    }

    /// Initiate termination: every worker drains its remaining ready
    /// tasks, then exits. Tasks still blocked afterwards are forcibly
    /// destroyed during [`cleanup`](Lpel::cleanup).
    pub fn stop(&self) {
        for w in &self.shared.workers {
            w.send(WorkerMsg::Terminate);
        }
    }

    /// Join all worker threads and tear the runtime down.
    pub fn cleanup(self) {
        for handle in self.joins {
            let _ = handle.join();
        }
    }

    /// Pin the calling non-worker thread. `core == -1` selects the others
    /// CPU set; a worker id selects that worker's CPU placement.
    pub fn thread_assign(&self, core: i32) -> Result<()> {
        self.shared.assign_thread(core)
    }

    /// Create a task on the given worker. The task does not run until
    /// [`task_run`](Lpel::task_run); a `stacksize` of 0 selects the 8 KiB
    /// default.
    pub fn task_create(
        &self,
        worker: usize,
        func: impl FnOnce() + Send + 'static,
        stacksize: usize,
    ) -> Arc<Task> {
        assert!(
            worker < self.shared.config.num_workers,
            "worker id {} out of range",
            worker
        );
        Task::new(
            Arc::clone(&self.shared.workers[worker]),
            Box::new(func),
            stacksize,
        )
    }

    /// Attach a monitoring record to a task. No-op unless the runtime was
    /// initialised with monitoring; must happen before the task runs.
    pub fn task_monitor(&self, task: &Arc<Task>, name: &str, flags: MonitorFlags) {
        if let Some(ms) = &self.shared.mon {
            task.set_mon(TaskMon::create(task.uid(), name, flags, ms.epoch));
        }
    }

    /// Enqueue a created task as ready on its owning worker.
    pub fn task_run(&self, task: Arc<Task>) {
        debug_assert_eq!(task.state(), TaskState::Created, "task was already run");
        task.set_state(TaskState::Ready);
        let worker = Arc::clone(task.worker());
        worker.send(WorkerMsg::Assign(task));
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers
    }

    /// The opaque node identifier from the configuration.
    pub fn node(&self) -> i32 {
        self.shared.config.node
    }
}
