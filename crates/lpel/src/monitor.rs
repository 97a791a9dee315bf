//! Deferred per-task event log.
//!
//! Each worker owns a monitoring context writing to its own log file, so
//! the file handle needs no locking. Tasks carry a monitor record with
//! timing snapshots and a dirty list of stream records that changed since
//! the last flush; the whole chain is flushed in one line whenever the
//! task switches out.
//!
//! ## Threading invariant
//!
//! Every mutation of a task's monitor record and of its stream records
//! happens on the task's owning worker thread: stream events fire from the
//! task's own stream operations, and the wake-up event is recorded by the
//! woken task itself when its blocking operation resumes, never from the
//! waking thread. The mutexes below exist to make the records shareable,
//! not to arbitrate concurrent writers.
//!
//! The monitoring subsystem never reports errors back to the scheduler: a
//! failed write is silently dropped.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::MonitorConfig;
use crate::task::TaskState;

const PFIX_LEN: usize = 16;
const NAME_LEN: usize = 31;

/// Stream record event bits, printed as `?`, `!` and `*`.
const EV_MOVED: u8 = 1 << 0;
const EV_WAKEUP: u8 = 1 << 1;
const EV_BLOCKON: u8 = 1 << 2;

/// Per-task monitoring feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorFlags(u32);

impl MonitorFlags {
    pub const NONE: MonitorFlags = MonitorFlags(0);
    /// Record dispatch timing (start/stop/execution/creation times).
    pub const TIMES: MonitorFlags = MonitorFlags(1 << 0);
    /// Record stream events in the dirty list.
    pub const STREAMS: MonitorFlags = MonitorFlags(1 << 1);

    pub fn contains(self, other: MonitorFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MonitorFlags {
    type Output = MonitorFlags;

    fn bitor(self, rhs: MonitorFlags) -> MonitorFlags {
        MonitorFlags(self.0 | rhs.0)
    }
}

fn truncate(s: &str, len: usize) -> String {
    s.chars().take(len).collect()
}

/// Timestamps under one second print as bare microseconds, otherwise as
/// seconds immediately followed by a six-digit microsecond field.
fn write_time(out: &mut impl Write, d: Duration) {
    if d.as_secs() == 0 {
        let _ = write!(out, "{} ", d.subsec_micros());
    } else {
        let _ = write!(out, "{}{:06} ", d.as_secs(), d.subsec_micros());
    }
}

// ---------------------------------------------------------------------------
// Runtime-wide monitoring state
// ---------------------------------------------------------------------------

/// Monitoring configuration fixed at init: file naming plus the reference
/// timestamp all printed times are normalised against.
pub(crate) struct MonShared {
    prefix: String,
    postfix: String,
    pub epoch: Instant,
}

impl MonShared {
    pub fn new(cfg: &MonitorConfig) -> Self {
        MonShared {
            prefix: truncate(&cfg.prefix, PFIX_LEN),
            postfix: truncate(&cfg.postfix, PFIX_LEN),
            epoch: Instant::now(),
        }
    }

    pub fn filename(&self, name: &str) -> String {
        format!("{}{}{}", self.prefix, truncate(name, NAME_LEN), self.postfix)
    }
}

// ---------------------------------------------------------------------------
// Dirty list
// ---------------------------------------------------------------------------

/// Dirty-list link of a stream record.
///
/// `Off` means the record is not on its task's chain; `End` terminates a
/// chain. Keeping these distinct in one field is what lets `mark_dirty`
/// decide membership in O(1).
#[derive(Default)]
pub(crate) enum DirtyLink {
    #[default]
    Off,
    End,
    Link(Arc<StreamMon>),
}

// ---------------------------------------------------------------------------
// Task monitor record
// ---------------------------------------------------------------------------

pub(crate) struct TaskMonState {
    pub disp: u64,
    /// Block code for the stop record: 'a' after dispatch, 'i'/'o' once a
    /// stream operation blocks.
    pub blockon: char,
    creat: Duration,
    start: Option<Instant>,
    total: Duration,
    pub dirty_head: DirtyLink,
}

/// Per-task monitoring state, attached before the task first runs.
pub(crate) struct TaskMon {
    tid: u32,
    name: String,
    pub flags: MonitorFlags,
    pub state: Mutex<TaskMonState>,
}

impl TaskMon {
    pub fn create(tid: u32, name: &str, flags: MonitorFlags, epoch: Instant) -> Arc<TaskMon> {
        let creat = if flags.contains(MonitorFlags::TIMES) {
            epoch.elapsed()
        } else {
            Duration::ZERO
        };
        Arc::new(TaskMon {
            tid,
            name: truncate(name, NAME_LEN),
            flags,
            state: Mutex::new(TaskMonState {
                disp: 0,
                blockon: 'a',
                creat,
                start: None,
                total: Duration::ZERO,
                dirty_head: DirtyLink::End,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Stream monitor record
// ---------------------------------------------------------------------------

pub(crate) struct StreamMonState {
    sid: u32,
    mode: char,
    /// Lifecycle state: 'O' opened, 'I' in use, 'R' replaced, 'C' closed.
    state: char,
    counter: u64,
    flags: u8,
    dirty: DirtyLink,
    /// Lifecycle char not yet flushed. A record closed before its open (or
    /// replace) was ever flushed prints both entries in one flush.
    pending_open: Option<char>,
}

/// Mirror state of one stream descriptor, alive while monitoring is on.
pub(crate) struct StreamMon {
    montask: Arc<TaskMon>,
    state: Mutex<StreamMonState>,
}

impl StreamMon {
    /// Create a record for a freshly opened descriptor. Returns `None`
    /// when the task does not monitor streams.
    pub fn open(mt: &Arc<TaskMon>, sid: u32, mode: char) -> Option<Arc<StreamMon>> {
        if !mt.flags.contains(MonitorFlags::STREAMS) {
            return None;
        }
        let ms = Arc::new(StreamMon {
            montask: Arc::clone(mt),
            state: Mutex::new(StreamMonState {
                sid,
                mode,
                state: 'O',
                counter: 0,
                flags: 0,
                dirty: DirtyLink::Off,
                pending_open: Some('O'),
            }),
        });
        ms.mark_dirty();
        Some(ms)
    }

    /// Add the record to its task's dirty list unless it is already on it.
    fn mark_dirty(self: &Arc<Self>) {
        let mut s = self.state.lock();
        self.mark_dirty_locked(&mut s);
    }

    fn mark_dirty_locked(self: &Arc<Self>, s: &mut StreamMonState) {
        if matches!(s.dirty, DirtyLink::Off) {
            let mut t = self.montask.state.lock();
            s.dirty = mem::replace(&mut t.dirty_head, DirtyLink::Link(Arc::clone(self)));
        }
    }

    /// An item was deposited into or taken from the stream.
    pub fn moved(self: &Arc<Self>) {
        let mut s = self.state.lock();
        s.counter += 1;
        s.flags |= EV_MOVED;
        self.mark_dirty_locked(&mut s);
    }

    /// The descriptor's operation is about to block its task.
    pub fn blockon(self: &Arc<Self>) {
        let mut s = self.state.lock();
        s.flags |= EV_BLOCKON;
        let mode = s.mode;
        self.mark_dirty_locked(&mut s);
        drop(s);
        self.montask.state.lock().blockon = if mode == 'r' { 'i' } else { 'o' };
    }

    /// The descriptor's blocked operation was woken by the peer.
    ///
    /// No dirty marking: the moved() event on the same descriptor follows
    /// immediately and flushes into the same output line.
    pub fn wakeup(self: &Arc<Self>) {
        self.state.lock().flags |= EV_WAKEUP;
    }

    pub fn closed(self: &Arc<Self>) {
        self.state.lock().state = 'C';
        self.mark_dirty();
    }

    pub fn replaced(self: &Arc<Self>, new_sid: u32) {
        {
            let mut s = self.state.lock();
            s.state = 'R';
            s.sid = new_sid;
            if s.pending_open.is_some() {
                s.pending_open = Some('R');
            }
        }
        self.mark_dirty();
    }
}

// ---------------------------------------------------------------------------
// Worker monitoring context
// ---------------------------------------------------------------------------

/// Per-worker log sink. Owned by the worker loop; never shared.
pub(crate) struct MonCtx {
    #[allow(dead_code)]
    wid: usize,
    out: BufWriter<File>,
    /// Dispatches on this worker across all tasks. Written for parity with
    /// the per-task counter; not part of any output line.
    disp: u64,
    wait_cnt: u64,
    wait_total: Duration,
    wait_current: Option<Instant>,
    epoch: Instant,
}

impl MonCtx {
    /// Open the context's log file `<prefix><name><postfix>`. A failure to
    /// open leaves the worker unmonitored.
    pub fn create(wid: usize, name: &str, shared: &MonShared) -> Option<MonCtx> {
        let file = File::create(shared.filename(name)).ok()?;
        Some(MonCtx {
            wid,
            out: BufWriter::new(file),
            disp: 0,
            wait_cnt: 0,
            wait_total: Duration::ZERO,
            wait_current: None,
            epoch: shared.epoch,
        })
    }

    pub fn wait_start(&mut self) {
        self.wait_cnt += 1;
        self.wait_current = Some(Instant::now());
    }

    pub fn wait_stop(&mut self) {
        if let Some(start) = self.wait_current.take() {
            self.wait_total += start.elapsed();
        }
    }

    pub fn wait_stats(&self) -> (u64, Duration) {
        (self.wait_cnt, self.wait_total)
    }

    /// Write a timestamped `*** `-prefixed debug line and flush it.
    pub fn debug(&mut self, args: std::fmt::Arguments<'_>) {
        write_time(&mut self.out, self.epoch.elapsed());
        let _ = write!(self.out, "*** ");
        let _ = self.out.write_fmt(args);
        let _ = writeln!(self.out);
        let _ = self.out.flush();
    }

    /// A task was dispatched: stamp the start time, reset the block code
    /// and bump both dispatch counters.
    pub fn task_start(&mut self, mt: &TaskMon) {
        let mut st = mt.state.lock();
        if mt.flags.contains(MonitorFlags::TIMES) {
            st.start = Some(Instant::now());
        }
        st.blockon = 'a';
        st.disp += 1;
        self.disp += 1;
    }

    /// A task switched out: emit its stop record, flushing the dirty list.
    pub fn task_stop(&mut self, mt: &TaskMon, state: TaskState) {
        let times = mt.flags.contains(MonitorFlags::TIMES);
        let streams = mt.flags.contains(MonitorFlags::STREAMS);
        let now = Instant::now();

        let mut st = mt.state.lock();

        if times {
            write_time(&mut self.out, now.duration_since(self.epoch));
        }

        let _ = write!(self.out, "{} ", mt.tid);
        if !mt.name.is_empty() {
            let _ = write!(self.out, "{} ", mt.name);
        }
        let _ = write!(self.out, "disp {} ", st.disp);

        if matches!(state, TaskState::Blocked(_)) {
            let _ = write!(self.out, "st B{} ", st.blockon);
        } else {
            let _ = write!(self.out, "st {} ", state.code());
        }

        if times {
            let et = now.duration_since(st.start.unwrap_or(now));
            st.total += et;
            let _ = write!(self.out, "et ");
            write_time(&mut self.out, et);
            if state == TaskState::Zombie {
                let _ = write!(self.out, "creat ");
                write_time(&mut self.out, st.creat);
            }
        }

        if streams {
            let _ = write!(self.out, "[");
            let head = mem::replace(&mut st.dirty_head, DirtyLink::End);
            drop(st);
            self.flush_dirty(head);
            let _ = write!(self.out, "] ");
        }

        let _ = writeln!(self.out);
    }

    /// Print the chain and apply the per-record state transitions:
    /// opened/replaced records go in use, in-use records stay, closed
    /// records are printed one last time and freed with the chain link.
    fn flush_dirty(&mut self, head: DirtyLink) {
        let mut cur = head;
        loop {
            let ms = match cur {
                DirtyLink::End => break,
                DirtyLink::Link(ms) => ms,
                DirtyLink::Off => unreachable!("off-chain record linked into dirty list"),
            };
            let mut s = ms.state.lock();
            let next = mem::replace(&mut s.dirty, DirtyLink::Off);
            match s.state {
                'C' => {
                    if let Some(pending) = s.pending_open.take() {
                        self.write_record(&s, pending);
                        s.flags = 0;
                    }
                    self.write_record(&s, 'C');
                    // The chain link was the last strong reference besides
                    // the (already closed) descriptor; dropping it frees
                    // the record.
                }
                'O' | 'R' => {
                    let state = s.state;
                    self.write_record(&s, state);
                    s.state = 'I';
                    s.flags = 0;
                    s.pending_open = None;
                }
                'I' => {
                    self.write_record(&s, 'I');
                    s.flags = 0;
                }
                other => debug_assert!(false, "invalid stream record state {other:?}"),
            }
            drop(s);
            cur = next;
        }
    }

    fn write_record(&mut self, s: &StreamMonState, state: char) {
        let _ = write!(
            self.out,
            "{},{},{},{},{}{}{};",
            s.sid,
            s.mode,
            state,
            s.counter,
            if s.flags & EV_BLOCKON != 0 { '?' } else { '-' },
            if s.flags & EV_WAKEUP != 0 { '!' } else { '-' },
            if s.flags & EV_MOVED != 0 { '*' } else { '-' },
        );
    }
}
