//! Stackful coroutine primitive, wrapped over corosensei.
//!
//! Every task body runs inside a coroutine with its own stack. The active
//! coroutine's `Yielder` is published through a thread-local so that
//! suspension points deep inside the call chain (task yield, stream
//! blocking) can switch back to the worker's scheduling context without
//! threading the yielder through every call.
//!
//! Coroutines are `!Send`: they are created on their owning worker thread
//! at first dispatch and never leave it.

use std::cell::Cell;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

thread_local! {
    /// Raw pointer to the current coroutine's `Yielder`.
    ///
    /// Set inside the coroutine body before the task entry runs, re-set
    /// after every suspension, cleared by the worker after a resume
    /// returns.
    ///
    /// Safety: the pointer is only dereferenced while the coroutine that
    /// installed it is running; the yielder it points to is borrowed for
    /// the duration of the coroutine body.
    static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };
}

/// Suspend the current coroutine and switch back to the worker's
/// scheduling context.
///
/// After the coroutine is resumed the yielder is re-installed, since
/// another coroutine may have run on this thread in between.
///
/// Panics when called outside of a coroutine.
pub(crate) fn suspend() {
    CURRENT_YIELDER.with(|c| {
        let ptr = c
            .get()
            .expect("suspension point reached outside of a task context");
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        c.set(Some(ptr));
    });
}

/// Clear the yielder thread-local after a resume has returned to the
/// worker.
pub(crate) fn clear_yielder() {
    CURRENT_YIELDER.with(|c| c.set(None));
}

/// A task's execution context: stack plus saved registers.
pub(crate) struct Coro {
    coro: Coroutine<(), (), ()>,
}

impl Coro {
    /// Allocate a stack of `stacksize` bytes and create a context that
    /// will run `entry` on it.
    pub fn new(stacksize: usize, entry: Box<dyn FnOnce() + Send>) -> Self {
        let stack = DefaultStack::new(stacksize).expect("failed to allocate coroutine stack");
        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });
            entry();
        });
        Coro { coro }
    }

    /// Switch into the coroutine. Returns `true` if it suspended, `false`
    /// if it ran to completion.
    pub fn resume(&mut self) -> bool {
        match self.coro.resume(()) {
            CoroutineResult::Yield(()) => true,
            CoroutineResult::Return(()) => false,
        }
    }

    /// Tear down a suspended coroutine by unwinding its stack. Used when a
    /// blocked task is forcibly destroyed at shutdown.
    pub fn unwind(&mut self) {
        if !self.coro.done() {
            self.coro.force_unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_to_completion() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let mut coro = Coro::new(64 * 1024, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!coro.resume());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suspend_and_resume() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let mut coro = Coro::new(64 * 1024, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            suspend();
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(coro.resume());
        clear_yielder();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(!coro.resume());
        clear_yielder();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unwind_releases_suspended_stack() {
        struct SetOnDrop(Arc<AtomicU32>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicU32::new(0));
        let d = Arc::clone(&drops);
        let mut coro = Coro::new(64 * 1024, Box::new(move || {
            let _guard = SetOnDrop(d);
            suspend();
        }));

        assert!(coro.resume());
        clear_yielder();
        coro.unwind();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
