//! I/O-aware scheduler.
//!
//! [`IoManager`] is a [`Scheduler`] whose idle coroutines wait on an
//! edge-triggered epoll instance instead of parking. Besides descriptor
//! readiness, that wait is cut short by the wake pipe (new work, a new earliest
//! timer, shutdown) and bounded by the next timer deadline.

mod epoll;
mod fd_event;

pub use fd_event::Event;

use std::fmt;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{EpollEvent, EpollFlags};

use self::epoll::{Epoll, WakePipe};
use self::fd_event::{FdState, FdTable, Target, Waiter};
use crate::config;
use crate::coroutine::{Coroutine, Wake};
use crate::error::{Error, Result};
use crate::executor::{Driver, Scheduler, Task};
use crate::timer::{Timer, TimerManager};

const MAX_EVENTS: usize = 256;

/// Driver state of an [`IoManager`].
pub struct Reactor {
    epoll: Epoll,
    wake: WakePipe,
    fds: FdTable,
    /// Armed (fd, event) pairs across all descriptors.
    pending: AtomicUsize,
    timers: TimerManager,
}

impl Reactor {
    fn new() -> Result<Self> {
        let epoll = Epoll::new().map_err(Error::Setup)?;
        let wake = WakePipe::new().map_err(Error::Setup)?;
        epoll
            .add(wake.read_fd(), EpollFlags::EPOLLIN | EpollFlags::EPOLLET)
            .map_err(Error::Setup)?;
        Ok(Self {
            epoll,
            wake,
            fds: FdTable::new(),
            pending: AtomicUsize::new(0),
            timers: TimerManager::new(),
        })
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Write the epoll registration of `fd` to match `events`.
    fn update(&self, fd: RawFd, old: EpollFlags, events: EpollFlags) -> Result<()> {
        let (op, res) = if events.is_empty() {
            ("DEL", self.epoll.delete(fd))
        } else if old.is_empty() {
            ("ADD", self.epoll.add(fd, EpollFlags::EPOLLET | events))
        } else {
            ("MOD", self.epoll.modify(fd, EpollFlags::EPOLLET | events))
        };
        res.map_err(|source| {
            log::error!(
                "epoll_ctl({}) fd={} events={:?}: {}",
                op,
                fd,
                events,
                source
            );
            Error::Register { fd, op, source }
        })
    }

    /// Like [`update`](Self::update) when removing interest. A descriptor the
    /// kernel already dropped (closed behind our back) counts as removed.
    fn unregister(&self, fd: RawFd, old: EpollFlags, events: EpollFlags) -> bool {
        match self.update(fd, old, events) {
            Ok(()) => true,
            Err(Error::Register {
                source: Errno::EBADF | Errno::ENOENT,
                ..
            }) => {
                log::debug!("fd {} left epoll without us, dropping its waiters", fd);
                true
            }
            Err(_) => false,
        }
    }

    fn arm(&self, sched: &Scheduler, fd: RawFd, event: Event, target: Target) -> Result<()> {
        let ctx = self.fds.get_or_grow(fd);
        let mut state = ctx.state.lock();
        assert!(
            !state.is_armed(event),
            "fd {} already has a {:?} waiter",
            fd,
            event
        );
        self.update(fd, state.events, state.events | event.flag())?;
        let scheduler = Scheduler::current().unwrap_or_else(|| sched.clone());
        state.arm(event, Waiter { scheduler, target });
        self.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Disarm `event` on `fd`, firing the waiter with `wake` if given.
    fn disarm(&self, fd: RawFd, event: Event, wake: Option<Wake>) -> bool {
        let ctx = match self.fds.get(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock();
        if !state.is_armed(event) {
            return false;
        }
        let old = state.events;
        if !self.unregister(fd, old, old & !event.flag()) {
            return false;
        }
        let waiter = state.disarm(event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if let (Some(waiter), Some(wake)) = (waiter, wake) {
            waiter.fire(wake);
        }
        true
    }

    /// Disarm every event in `events` and resume the waiters with `wake`.
    fn fire(&self, state: &mut FdState, events: EpollFlags, wake: Wake) {
        for event in [Event::Read, Event::Write] {
            if !events.contains(event.flag()) {
                continue;
            }
            if let Some(waiter) = state.disarm(event) {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                waiter.fire(wake);
            }
        }
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.fds.get(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock();
        if state.events.is_empty() {
            return false;
        }
        let armed = state.events;
        if !self.unregister(fd, armed, EpollFlags::empty()) {
            return false;
        }
        self.fire(&mut state, armed, Wake::Cancelled);
        true
    }

    /// Resume whoever waits for the readiness reported in `ev`.
    fn dispatch(&self, ev: &EpollEvent) {
        let fd = ev.data() as RawFd;
        if fd == self.wake.read_fd() {
            self.wake.drain();
            return;
        }
        let ctx = match self.fds.get(fd) {
            Some(ctx) => ctx,
            None => return,
        };
        let mut state = ctx.state.lock();
        let interest = EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT;
        let mut ready = ev.events();
        if ready.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            ready |= interest & state.events;
        }
        let fired = ready & interest & state.events;
        if fired.is_empty() {
            return;
        }

        let old = state.events;
        if self.update(fd, old, old & !fired).is_err() {
            return;
        }
        self.fire(&mut state, fired, Wake::Ready);
    }
}

impl Driver for Reactor {
    fn tickle(&self, sched: &Scheduler) {
        if sched.has_idle_threads() {
            self.wake.notify();
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        !self.timers.has_timer() && self.pending() == 0 && sched.base_stopping()
    }

    fn idle(&self, sched: &Scheduler) {
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        let mut expired = Vec::new();
        loop {
            if self.stopping(sched) {
                log::debug!(
                    "{} idle exits on worker {:?}",
                    sched.name(),
                    Scheduler::current_worker()
                );
                self.tickle(sched);
                break;
            }

            let cap = config::get().max_poll_timeout;
            let timeout = self.timers.next_timeout().map_or(cap, |t| t.min(cap));
            let n = match self.epoll.wait(&mut events, timeout.as_millis() as isize) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("epoll_wait failed: {}", e);
                    0
                }
            };

            self.timers.list_expired(&mut expired);
            if !expired.is_empty() {
                sched.schedule_all(expired.drain(..).map(|cb| Task::from_fn(move || cb())));
            }
            for ev in &events[..n] {
                self.dispatch(ev);
            }

            Coroutine::yield_to_hold();
        }
    }

    fn as_reactor(&self) -> Option<&Reactor> {
        Some(self)
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("pending", &self.pending())
            .field("fds", &self.fds.len())
            .field("timers", &self.timers)
            .finish()
    }
}

/// 支持IO事件和定时器的调度器
#[derive(Clone)]
pub struct IoManager {
    sched: Scheduler,
}

impl IoManager {
    /// Create and start an I/O scheduler.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Result<Self> {
        let reactor = Reactor::new()?;
        let sched = Scheduler::with_driver(threads, use_caller, name, reactor);
        let manager = Self { sched };

        let weak = manager.sched.downgrade();
        manager.timers().set_front_hook(move || {
            if let Some(sched) = weak.upgrade() {
                sched.tickle();
            }
        });
        manager.sched.start()?;
        Ok(manager)
    }

    /// The I/O scheduler running this thread, if any.
    pub fn current() -> Option<IoManager> {
        Scheduler::current().and_then(Self::from_scheduler)
    }

    /// View `sched` as an I/O scheduler if it is driven by a reactor.
    pub(crate) fn from_scheduler(sched: Scheduler) -> Option<IoManager> {
        sched.reactor()?;
        Some(Self { sched })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    fn reactor(&self) -> &Reactor {
        match self.sched.reactor() {
            Some(reactor) => reactor,
            None => unreachable!("io manager without a reactor"),
        }
    }

    /// Park the running coroutine until `fd` is ready for `event`, or the
    /// event is cancelled. The caller still has to yield.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let co = match Coroutine::current() {
            Some(co) => co,
            None => panic!("add_event without a callback needs a running coroutine"),
        };
        self.reactor()
            .arm(&self.sched, fd, event, Target::Coroutine(co))
    }

    /// Run `f` once `fd` is ready for `event` (or the event is cancelled).
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor()
            .arm(&self.sched, fd, event, Target::Callback(Box::new(f)))
    }

    /// Drop the waiter without resuming it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().disarm(fd, event, None)
    }

    /// Resume the waiter right away with [`Wake::Cancelled`].
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor().disarm(fd, event, Some(Wake::Cancelled))
    }

    /// Cancel both directions of `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor().cancel_all(fd)
    }

    pub fn add_timer<F>(&self, timeout: Duration, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers().add_timer(timeout, callback, recurring)
    }

    pub fn add_condition_timer<F, T>(
        &self,
        timeout: Duration,
        callback: F,
        guard: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers()
            .add_condition_timer(timeout, callback, guard, recurring)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.reactor().timers
    }

    /// Number of armed descriptor events.
    pub fn pending_events(&self) -> usize {
        self.reactor().pending()
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.sched)
            .field("reactor", self.reactor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn callback_event_and_del() {
        let reactor = Reactor::new().unwrap();
        let sched = Scheduler::new(1, false, "reactor-unit");
        let (r, w) = unistd::pipe().unwrap();

        reactor
            .arm(&sched, r, Event::Read, Target::Callback(Box::new(|| {})))
            .unwrap();
        assert_eq!(reactor.pending(), 1);
        assert!(reactor.disarm(r, Event::Read, None));
        assert!(!reactor.disarm(r, Event::Read, None));
        assert_eq!(reactor.pending(), 0);
        assert_eq!(sched.queued(), 0);

        reactor
            .arm(&sched, r, Event::Read, Target::Callback(Box::new(|| {})))
            .unwrap();
        unistd::write(w, b"x").unwrap();
        let mut events = vec![EpollEvent::empty(); 8];
        let n = reactor.epoll.wait(&mut events, 1000).unwrap();
        for ev in &events[..n] {
            reactor.dispatch(ev);
        }
        assert_eq!(reactor.pending(), 0);
        assert_eq!(sched.queued(), 1);

        unistd::close(r).unwrap();
        unistd::close(w).unwrap();
    }

    #[test]
    fn registering_a_bad_fd_fails() {
        let reactor = Reactor::new().unwrap();
        let sched = Scheduler::new(1, false, "reactor-unit");
        let err = reactor
            .arm(&sched, 900, Event::Write, Target::Callback(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(err, Error::Register { fd: 900, op: "ADD", .. }));
        assert_eq!(reactor.pending(), 0);
        assert!(!reactor.cancel_all(900));
    }
}
