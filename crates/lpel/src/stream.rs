//! Bounded single-producer/single-consumer streams.
//!
//! A stream connects exactly one producer task to one consumer task.
//! Buffer and waiter slots are guarded by one mutex internal to the
//! stream; a full/empty condition parks the calling task in the matching
//! waiter slot, and the peer operation that frees or fills the stream
//! re-queues it on its owning worker.
//!
//! ## Poll protocol
//!
//! `poll` waits until any stream of a set has data. Because every consumer
//! slot holds at most one task, concurrent producers race on the poller's
//! `poll_token`: the poller arms it with the size of its stream set, and
//! whoever swaps it back to idle (a producer, or the poller itself when it
//! finds data while installing) owns the single wake-up and publishes the
//! firing stream in `wakeup_sid`. Losers back off without blocking, so at
//! most one wake is delivered no matter how many streams become ready at
//! once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::monitor::StreamMon;
use crate::task::{self, BlockReason, Task, POLL_IDLE};

/// Direction of a stream descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

impl Mode {
    fn code(self) -> char {
        match self {
            Mode::Read => 'r',
            Mode::Write => 'w',
        }
    }
}

enum Waiter {
    /// A task blocked in a plain read or write.
    Blocked(Arc<Task>),
    /// A task registered by a multi-stream poll.
    Poll(Arc<Task>),
}

struct StreamInner<T> {
    buf: VecDeque<T>,
    prod_waiter: Option<Waiter>,
    cons_waiter: Option<Waiter>,
    prod_open: bool,
    cons_open: bool,
}

/// Stream uid source. Lives outside the generic impl so that streams of
/// every item type draw from one sequence.
static NEXT_SID: AtomicU32 = AtomicU32::new(1);

/// A bounded FIFO between one producer and one consumer task.
pub struct Stream<T> {
    uid: u32,
    capacity: usize,
    inner: Mutex<StreamInner<T>>,
}

impl<T> Stream<T> {
    pub fn new(capacity: usize) -> Arc<Stream<T>> {
        debug_assert!(capacity >= 1, "stream capacity must be at least 1");
        Arc::new(Stream {
            uid: NEXT_SID.fetch_add(1, Ordering::Relaxed),
            capacity,
            inner: Mutex::new(StreamInner {
                buf: VecDeque::with_capacity(capacity),
                prod_waiter: None,
                cons_waiter: None,
                prod_open: false,
                cons_open: false,
            }),
        })
    }

    /// Monotonic stream identifier, also used in monitoring records.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Deliver the single wake-up for a waiter taken out of a slot.
///
/// Plain blocked waiters are woken directly. Poll waiters are woken only
/// by whoever claims the poll token; losers have already had their slot
/// cleared by the take and back off silently.
fn wake(w: Waiter, sid: u32) {
    match w {
        Waiter::Blocked(t) => {
            t.wakeup_sid.store(sid, Ordering::SeqCst);
            t.unblock();
        }
        Waiter::Poll(t) => {
            if t.poll_token.swap(POLL_IDLE, Ordering::SeqCst) != POLL_IDLE {
                let won = t
                    .wakeup_sid
                    .compare_exchange(0, sid, Ordering::SeqCst, Ordering::SeqCst);
                debug_assert!(won.is_ok(), "poll token holder found wakeup slot taken");
                t.unblock();
            }
        }
    }
}

/// A task's handle to one end of a stream.
///
/// At most one read and one write descriptor may be live per stream. The
/// underlying stream can be swapped with [`StreamDesc::replace`] without
/// changing the descriptor's identity.
pub struct StreamDesc<T> {
    task: Option<Arc<Task>>,
    mode: Mode,
    stream: Mutex<Arc<Stream<T>>>,
    mon: Option<Arc<StreamMon>>,
}

impl<T> StreamDesc<T> {
    /// Bind a descriptor for the calling task to one end of `stream`.
    ///
    /// Opening a second descriptor in the same mode is a contract
    /// violation. Opening outside of a task yields a descriptor that can
    /// use the non-blocking fast paths only.
    pub fn open(stream: &Arc<Stream<T>>, mode: Mode) -> StreamDesc<T> {
        {
            let mut inner = stream.inner.lock();
            match mode {
                Mode::Read => {
                    debug_assert!(!inner.cons_open, "stream already has a read descriptor");
                    inner.cons_open = true;
                }
                Mode::Write => {
                    debug_assert!(!inner.prod_open, "stream already has a write descriptor");
                    inner.prod_open = true;
                }
            }
        }
        let task = task::current();
        let mon = task
            .as_ref()
            .and_then(|t| t.mon())
            .and_then(|mt| StreamMon::open(&mt, stream.uid, mode.code()));
        StreamDesc {
            task,
            mode,
            stream: Mutex::new(Arc::clone(stream)),
            mon,
        }
    }

    fn cur_stream(&self) -> Arc<Stream<T>> {
        self.stream.lock().clone()
    }

    /// The stream this descriptor currently points at.
    pub fn stream(&self) -> Arc<Stream<T>> {
        self.cur_stream()
    }

    /// Deposit `item`, blocking while the stream is full.
    pub fn write(&self, item: T) {
        debug_assert!(self.mode == Mode::Write, "write on a read descriptor");
        let stream = self.cur_stream();
        let mut inner = stream.inner.lock();
        if inner.buf.len() == stream.capacity {
            let t = Arc::clone(
                self.task
                    .as_ref()
                    .expect("blocking stream write outside of a task"),
            );
            inner.prod_waiter = Some(Waiter::Blocked(t));
            drop(inner);
            if let Some(ms) = &self.mon {
                ms.blockon();
            }
            task::block_current(BlockReason::Output);
            if let Some(ms) = &self.mon {
                ms.wakeup();
            }
            inner = stream.inner.lock();
            debug_assert!(inner.buf.len() < stream.capacity, "woken on a full stream");
        }
        inner.buf.push_back(item);
        let waiter = inner.cons_waiter.take();
        drop(inner);
        if let Some(w) = waiter {
            wake(w, stream.uid);
        }
        if let Some(ms) = &self.mon {
            ms.moved();
        }
    }

    /// Take the oldest item, blocking while the stream is empty.
    pub fn read(&self) -> T {
        debug_assert!(self.mode == Mode::Read, "read on a write descriptor");
        let stream = self.cur_stream();
        let mut inner = stream.inner.lock();
        if inner.buf.is_empty() {
            let t = Arc::clone(
                self.task
                    .as_ref()
                    .expect("blocking stream read outside of a task"),
            );
            inner.cons_waiter = Some(Waiter::Blocked(t));
            drop(inner);
            if let Some(ms) = &self.mon {
                ms.blockon();
            }
            task::block_current(BlockReason::Input);
            if let Some(ms) = &self.mon {
                ms.wakeup();
            }
            inner = stream.inner.lock();
        }
        let item = inner.buf.pop_front().expect("woken on an empty stream");
        let waiter = inner.prod_waiter.take();
        drop(inner);
        if let Some(w) = waiter {
            wake(w, stream.uid);
        }
        if let Some(ms) = &self.mon {
            ms.moved();
        }
        item
    }

    /// Swap the underlying stream, keeping the descriptor identity. Used
    /// to rewire pipelines without re-announcing the descriptor.
    pub fn replace(&self, new_stream: &Arc<Stream<T>>) {
        let mut cur = self.stream.lock();
        {
            let mut old = cur.inner.lock();
            match self.mode {
                Mode::Read => old.cons_open = false,
                Mode::Write => old.prod_open = false,
            }
        }
        {
            let mut fresh = new_stream.inner.lock();
            match self.mode {
                Mode::Read => {
                    debug_assert!(!fresh.cons_open, "stream already has a read descriptor");
                    fresh.cons_open = true;
                }
                Mode::Write => {
                    debug_assert!(!fresh.prod_open, "stream already has a write descriptor");
                    fresh.prod_open = true;
                }
            }
        }
        *cur = Arc::clone(new_stream);
        drop(cur);
        if let Some(ms) = &self.mon {
            ms.replaced(new_stream.uid);
        }
    }

    /// Release this end of the stream. The monitoring record survives on
    /// the dirty list until the task's next flush.
    pub fn close(self) {
        let stream = self.cur_stream();
        {
            let mut inner = stream.inner.lock();
            match self.mode {
                Mode::Read => inner.cons_open = false,
                Mode::Write => inner.prod_open = false,
            }
        }
        if let Some(ms) = &self.mon {
            ms.closed();
        }
    }
}

/// Wait until any of the given input streams has data; returns the index
/// of the descriptor whose stream fired.
///
/// At most one wake-up is delivered per poll, even when several streams
/// become ready concurrently (see the module doc for the arbitration).
pub fn poll<T>(sds: &[&StreamDesc<T>]) -> usize {
    assert!(!sds.is_empty(), "poll over an empty stream set");
    let t = task::current().expect("poll outside of a task");
    debug_assert!(
        sds.iter().all(|sd| sd.mode == Mode::Read),
        "poll over a write descriptor"
    );

    t.wakeup_sid.store(0, Ordering::SeqCst);
    t.poll_token.store(sds.len(), Ordering::SeqCst);

    // Install as consumer-waiter on every empty stream; stop early when a
    // stream already has data.
    let mut streams = Vec::with_capacity(sds.len());
    let mut installed = 0;
    let mut found = None;
    for sd in sds {
        let stream = sd.cur_stream();
        let mut inner = stream.inner.lock();
        if !inner.buf.is_empty() {
            drop(inner);
            found = Some(stream.uid);
            break;
        }
        inner.cons_waiter = Some(Waiter::Poll(Arc::clone(&t)));
        drop(inner);
        streams.push(stream);
        installed += 1;
    }

    match found {
        Some(sid) => {
            // Data found while installing: withdraw the poll token. Losing
            // this swap means a producer claimed the wake concurrently, and
            // its wake-up must be consumed by blocking.
            if t.poll_token
                .compare_exchange(sds.len(), POLL_IDLE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let won = t
                    .wakeup_sid
                    .compare_exchange(0, sid, Ordering::SeqCst, Ordering::SeqCst);
                debug_assert!(won.is_ok(), "poll token holder found wakeup slot taken");
            } else {
                task::block_current(BlockReason::Any);
            }
        }
        None => task::block_current(BlockReason::Any),
    }

    // Uninstall leftover registrations. The waking producer has already
    // cleared its own slot, as have producers that lost the race.
    for stream in &streams {
        let mut inner = stream.inner.lock();
        if matches!(&inner.cons_waiter, Some(Waiter::Poll(p)) if Arc::ptr_eq(p, &t)) {
            inner.cons_waiter = None;
        }
    }
    debug_assert_eq!(t.poll_token.load(Ordering::SeqCst), POLL_IDLE);

    let sid = t.wakeup_sid.load(Ordering::SeqCst);
    let idx = sds
        .iter()
        .position(|sd| sd.cur_stream().uid == sid)
        .expect("woken by a stream outside of the poll set");
    if let Some(ms) = &sds[idx].mon {
        ms.wakeup();
    }
    idx
}
