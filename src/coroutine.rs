//! Stackful coroutines.
//!
//! A `Coroutine` owns its own stack and runs a callback until the callback returns
//! or the coroutine suspends itself with [`Coroutine::yield_to_hold`] /
//! [`Coroutine::yield_to_ready`]. Suspending always returns control to whoever
//! called [`Coroutine::swap_in`], i.e. the scheduling loop of the current thread.
//!
//! State walk: `Init -> Exec -> {Hold, Ready, Term, Except}`, and back to `Exec`
//! from `Hold`/`Ready` on the next `swap_in`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use generator::{Generator, Gn};
use parking_lot::Mutex;

use crate::config;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL: AtomicUsize = AtomicUsize::new(0);

/// Smallest stack handed to the context library, in bytes.
const MIN_STACK_SIZE: usize = 16 * 1024;

thread_local! {
    /// 当前线程正在执行的协程
    static CURRENT: RefCell<Option<Coroutine>> = RefCell::new(None);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Created (or reset) but never run.
    Init = 0,
    /// Running on some thread right now.
    Exec = 1,
    /// Suspended, waiting for someone to schedule it again.
    Hold = 2,
    /// Suspended, eligible to be re-queued immediately.
    Ready = 3,
    /// Callback returned.
    Term = 4,
    /// Callback panicked.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Exec,
            2 => State::Hold,
            3 => State::Ready,
            4 => State::Term,
            _ => State::Except,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

/// Why a coroutine parked on a descriptor event was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Wake {
    /// The descriptor became ready.
    Ready = 1,
    /// The event was cancelled before it fired.
    Cancelled = 2,
}

/// Panic message slot shared between a coroutine and its trampoline.
type Failure = Arc<Mutex<Option<String>>>;

const NO_STATE: u8 = u8::MAX;
const NO_WAKE: u8 = 0;

struct Inner {
    id: u64,
    stack_size: usize,
    state: AtomicU8,
    /// State to publish once the coroutine has actually switched out.
    parked: AtomicU8,
    wake: AtomicU8,
    failure: Failure,
    context: Mutex<Generator<'static, (), ()>>,
}

/// Reference-counted handle to a stackful coroutine.
#[derive(Clone)]
pub struct Coroutine {
    inner: Arc<Inner>,
}

impl Coroutine {
    /// Create a coroutine running `f` on a fresh stack of `stack_size` bytes
    /// (0 picks the configured default).
    pub fn new<F>(f: F, stack_size: usize) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            config::get().stack_size
        } else {
            stack_size
        };
        let stack_size = stack_size.max(MIN_STACK_SIZE);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        // the context library sizes stacks in machine words
        let words = stack_size / mem::size_of::<usize>();
        let failure = Failure::default();
        let context = Gn::<()>::new_opt(words, trampoline(f, failure.clone()));

        TOTAL.fetch_add(1, Ordering::Relaxed);
        log::debug!("coroutine {} created with a {} byte stack", id, stack_size);

        Self {
            inner: Arc::new(Inner {
                id,
                stack_size,
                state: AtomicU8::new(State::Init as u8),
                parked: AtomicU8::new(NO_STATE),
                wake: AtomicU8::new(NO_WAKE),
                failure,
                context: Mutex::new(context),
            }),
        }
    }

    /// The coroutine running on this thread, if any.
    pub fn current() -> Option<Coroutine> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Id of the running coroutine, 0 outside of one.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |co| co.id()))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    pub fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Panic message of a coroutine that ended in `Except`.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    pub(crate) fn set_wake(&self, wake: Wake) {
        self.inner.wake.store(wake as u8, Ordering::Release);
    }

    /// Consume the reason of the last descriptor-event wake.
    pub fn take_wake(&self) -> Option<Wake> {
        match self.inner.wake.swap(NO_WAKE, Ordering::AcqRel) {
            1 => Some(Wake::Ready),
            2 => Some(Wake::Cancelled),
            _ => None,
        }
    }

    /// Run the coroutine on the calling thread until it suspends or finishes.
    ///
    /// Resuming a coroutine that is running, or one that already finished, is a
    /// fatal error.
    pub fn swap_in(&self) {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Hold | State::Ready),
            "coroutine {} cannot be resumed from {:?}",
            self.id(),
            state
        );

        let finished = {
            let mut context = match self.inner.context.try_lock() {
                Some(context) => context,
                None => panic!("coroutine {} is already running on another thread", self.id()),
            };
            self.inner.parked.store(NO_STATE, Ordering::Relaxed);
            self.set_state(State::Exec);

            let prev = CURRENT.with(|c| c.replace(Some(self.clone())));
            let _ = context.resume();
            CURRENT.with(|c| *c.borrow_mut() = prev);
            context.is_done()
        };

        // The context lock is released before the new state becomes visible, so a
        // worker that observes `Hold`/`Ready` can always take it.
        let next = if finished {
            if self.inner.failure.lock().is_some() {
                State::Except
            } else {
                State::Term
            }
        } else {
            match self.inner.parked.swap(NO_STATE, Ordering::Relaxed) {
                NO_STATE => State::Hold,
                v => State::from_u8(v),
            }
        };
        self.set_state(next);
    }

    /// Switch back to the thread's scheduling context. The coroutine is left in
    /// `Hold` unless it asked for something else first.
    pub fn swap_out() {
        Self::suspend(NO_STATE);
    }

    pub fn yield_to_hold() {
        Self::suspend(State::Hold as u8);
    }

    pub fn yield_to_ready() {
        Self::suspend(State::Ready as u8);
    }

    fn suspend(next: u8) {
        let current = Self::current();
        let co = match current {
            Some(co) if generator::is_generator() => co,
            _ => panic!("yield called outside of a coroutine"),
        };
        co.inner.parked.store(next, Ordering::Relaxed);
        drop(co);
        #[allow(deprecated)]
        generator::yield_with(());
    }

    /// Reuse the stack of a finished (or never started) coroutine for `f`.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "coroutine {} cannot be reset from {:?}",
            self.id(),
            state
        );
        let mut context = match self.inner.context.try_lock() {
            Some(context) => context,
            None => panic!("coroutine {} reset while running", self.id()),
        };
        *self.inner.failure.lock() = None;
        context.init_code(trampoline(f, self.inner.failure.clone()));
        self.inner.wake.store(NO_WAKE, Ordering::Relaxed);
        self.set_state(State::Init);
    }
}

/// Entry point of every coroutine: runs the callback and turns a panic into the
/// `Except` outcome instead of unwinding into the scheduler.
fn trampoline<F>(f: F, failure: Failure) -> impl FnOnce() + Send + 'static
where
    F: FnOnce() + Send + 'static,
{
    move || {
        let payload = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => return,
            Err(payload) => payload,
        };
        // dropping a suspended generator unwinds its stack with this payload
        if payload.is::<generator::Error>() {
            panic::resume_unwind(payload);
        }
        let message = panic_message(&*payload);
        log::error!(
            "coroutine {} panicked: {}\n{}",
            Coroutine::current_id(),
            message,
            Backtrace::force_capture()
        );
        *failure.lock() = Some(message);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        TOTAL.fetch_sub(1, Ordering::Relaxed);
        let state = State::from_u8(*self.state.get_mut());
        if matches!(state, State::Hold | State::Ready) {
            log::warn!(
                "coroutine {} dropped while suspended in {:?}, unwinding its stack",
                self.id,
                state
            );
        }
        log::debug!("coroutine {} destroyed", self.id);
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// Number of coroutines alive in the process.
pub fn total() -> usize {
    TOTAL.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn state_walk() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let co = Coroutine::new(
            move || {
                let me = Coroutine::current().unwrap();
                seen2.lock().unwrap().push(me.state());
                Coroutine::yield_to_hold();
                seen2.lock().unwrap().push(me.state());
                Coroutine::yield_to_ready();
            },
            0,
        );

        assert_eq!(co.state(), State::Init);
        co.swap_in();
        assert_eq!(co.state(), State::Hold);
        co.swap_in();
        assert_eq!(co.state(), State::Ready);
        co.swap_in();
        assert_eq!(co.state(), State::Term);
        assert_eq!(*seen.lock().unwrap(), vec![State::Exec, State::Exec]);
        assert!(Coroutine::current().is_none());
    }

    #[test]
    fn panic_becomes_except() {
        let co = Coroutine::new(|| panic!("boom"), 0);
        co.swap_in();
        assert_eq!(co.state(), State::Except);
        assert_eq!(co.failure().as_deref(), Some("boom"));
    }

    #[test]
    fn resuming_itself_is_fatal() {
        let co = Coroutine::new(|| Coroutine::current().unwrap().swap_in(), 0);
        co.swap_in();
        assert_eq!(co.state(), State::Except);
        assert!(co.failure().unwrap().contains("cannot be resumed from Exec"));
    }

    #[test]
    #[should_panic(expected = "cannot be resumed")]
    fn resuming_finished_is_fatal() {
        let co = Coroutine::new(|| {}, 0);
        co.swap_in();
        co.swap_in();
    }

    #[test]
    fn reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let co = Coroutine::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        co.swap_in();
        assert_eq!(co.state(), State::Term);

        let h = hits.clone();
        co.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(co.state(), State::Init);
        co.swap_in();
        assert_eq!(co.state(), State::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn reset_clears_failure() {
        let co = Coroutine::new(|| panic!("first"), 0);
        co.swap_in();
        co.reset(|| {});
        assert!(co.failure().is_none());
        co.swap_in();
        assert_eq!(co.state(), State::Term);
    }

    #[test]
    fn wake_is_consumed_once() {
        let co = Coroutine::new(|| {}, 0);
        assert_eq!(co.take_wake(), None);
        co.set_wake(Wake::Cancelled);
        assert_eq!(co.take_wake(), Some(Wake::Cancelled));
        assert_eq!(co.take_wake(), None);
    }

    #[test]
    fn nested_current() {
        let co = Coroutine::new(
            || {
                let outer = Coroutine::current_id();
                let inner = Coroutine::new(move || assert_ne!(Coroutine::current_id(), outer), 0);
                inner.swap_in();
                assert_eq!(inner.state(), State::Term);
                assert_eq!(Coroutine::current_id(), outer);
            },
            0,
        );
        co.swap_in();
        assert_eq!(co.state(), State::Term);
        assert!(total() >= 1);
    }

    #[test]
    #[should_panic(expected = "outside of a coroutine")]
    fn yield_outside_is_fatal() {
        Coroutine::yield_to_hold();
    }
}
