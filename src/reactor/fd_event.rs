//! Per-descriptor waiter bookkeeping.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::sys::epoll::EpollFlags;
use parking_lot::{Mutex, RwLock};

use crate::coroutine::{Coroutine, Wake};
use crate::executor::Scheduler;

const INITIAL_TABLE_SIZE: usize = 32;

/// Readiness direction a waiter is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub(crate) fn flag(self) -> EpollFlags {
        match self {
            Event::Read => EpollFlags::EPOLLIN,
            Event::Write => EpollFlags::EPOLLOUT,
        }
    }
}

pub(crate) enum Target {
    Coroutine(Coroutine),
    Callback(Box<dyn FnOnce() + Send>),
}

/// Who to resume, and where, once an event fires.
pub(crate) struct Waiter {
    pub(crate) scheduler: Scheduler,
    pub(crate) target: Target,
}

impl Waiter {
    /// Hand the target to its scheduler, tagging coroutines with `wake`.
    pub(crate) fn fire(self, wake: Wake) {
        match self.target {
            Target::Coroutine(co) => {
                co.set_wake(wake);
                self.scheduler.schedule_coroutine(co);
            }
            Target::Callback(f) => self.scheduler.schedule(f),
        }
    }
}

pub(crate) struct FdState {
    /// Events currently registered with epoll.
    pub(crate) events: EpollFlags,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl Default for FdState {
    fn default() -> Self {
        Self {
            events: EpollFlags::empty(),
            read: None,
            write: None,
        }
    }
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut Option<Waiter> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    pub(crate) fn is_armed(&self, event: Event) -> bool {
        self.events.contains(event.flag())
    }

    pub(crate) fn arm(&mut self, event: Event, waiter: Waiter) {
        assert!(!self.is_armed(event), "already armed for {:?}", event);
        self.events |= event.flag();
        *self.slot(event) = Some(waiter);
    }

    /// Clear `event` and hand back its waiter.
    pub(crate) fn disarm(&mut self, event: Event) -> Option<Waiter> {
        self.events.remove(event.flag());
        self.slot(event).take()
    }
}

/// 每个文件描述符对应的等待者
pub(crate) struct FdContext {
    fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Debug for FdContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdContext")
            .field("fd", &self.fd())
            .field("events", &self.state.lock().events)
            .finish()
    }
}

/// Descriptor-indexed table of contexts. Entries are never removed, only
/// reused by the next descriptor with the same number.
pub(crate) struct FdTable {
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        let table = Self {
            contexts: RwLock::new(Vec::new()),
        };
        table.grow(INITIAL_TABLE_SIZE);
        table
    }

    fn grow(&self, len: usize) {
        let mut contexts = self.contexts.write();
        let start = contexts.len();
        if len > start {
            contexts.extend((start..len).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
        }
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().get(fd as usize).cloned()
    }

    pub(crate) fn get_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "invalid descriptor {}", fd);
        if let Some(ctx) = self.get(fd) {
            return ctx;
        }
        let fd = fd as usize;
        self.grow((fd * 3 / 2).max(fd + 1));
        Arc::clone(&self.contexts.read()[fd])
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.read().len()
    }
}
