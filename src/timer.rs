//! Deadline-ordered timers.
//!
//! Deadlines are milliseconds on a monotonic clock. The manager only keeps the
//! ordering; whoever drives it (the reactor) asks for the next timeout, waits,
//! then collects the expired callbacks and schedules them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A clock going back by more than this flushes every timer.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Milliseconds since the first call in this process.
pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

fn as_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

struct Entry {
    interval: u64,
    deadline: u64,
    recurring: bool,
    callback: Callback,
    /// Cleared on cancel so callbacks already collected for firing turn into
    /// no-ops.
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    entries: FxHashMap<u64, Entry>,
    /// (deadline, id): ids break ties in insertion order.
    order: BTreeSet<(u64, u64)>,
    /// Front hook already fired since the last `next_timeout`.
    tickled: bool,
    /// Clock reading of the previous expiry scan.
    previous: u64,
}

impl State {
    fn insert(&mut self, id: u64, entry: Entry) -> bool {
        let key = (entry.deadline, id);
        self.order.insert(key);
        self.entries.insert(id, entry);
        let at_front = self.order.iter().next() == Some(&key) && !self.tickled;
        if at_front {
            self.tickled = true;
        }
        at_front
    }

    fn remove(&mut self, id: u64) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&(entry.deadline, id));
        Some(entry)
    }
}

struct Shared {
    state: RwLock<State>,
    next_id: AtomicU64,
    /// Called when an insert lands at the front of the order.
    on_front: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

impl Shared {
    fn insert(&self, id: u64, entry: Entry) {
        let at_front = self.state.write().insert(id, entry);
        if at_front {
            if let Some(hook) = self.on_front.get() {
                hook();
            }
        }
    }
}

/// 定时器集合, 按截止时间排序
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                next_id: AtomicU64::new(1),
                on_front: OnceCell::new(),
            }),
        }
    }

    /// Install the hook run when a new timer becomes the earliest one. Only the
    /// first installation takes effect.
    pub(crate) fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shared.on_front.set(Box::new(hook)).is_err() {
            log::warn!("timer front hook installed twice, keeping the first");
        }
    }

    /// Register `callback` to fire once after `timeout`, or every `timeout` when
    /// `recurring`.
    pub fn add_timer<F>(&self, timeout: Duration, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add(timeout, Arc::new(callback), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback is skipped once
    /// `guard` can no longer be upgraded.
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
        self.add_timer(
            timeout,
            move || {
                if guard.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    fn add(&self, timeout: Duration, callback: Callback, recurring: bool) -> Timer {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let interval = as_ms(timeout);
        self.shared.insert(
            id,
            Entry {
                interval,
                deadline: now_ms().saturating_add(interval),
                recurring,
                callback,
                live: Arc::new(AtomicBool::new(true)),
            },
        );
        Timer {
            id,
            manager: Arc::downgrade(&self.shared),
        }
    }

    /// Time until the earliest deadline, zero if already due, `None` without
    /// timers. Re-arms the front hook.
    pub fn next_timeout(&self) -> Option<Duration> {
        let mut state = self.shared.state.write();
        state.tickled = false;
        let &(deadline, _) = state.order.iter().next()?;
        Some(Duration::from_millis(deadline.saturating_sub(now_ms())))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.state.read().order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }

    /// Append the callbacks of every expired timer to `out`, in deadline order.
    /// Recurring timers are rescheduled one interval from now.
    pub fn list_expired(&self, out: &mut Vec<Callback>) {
        self.list_expired_at(now_ms(), out)
    }

    pub(crate) fn list_expired_at(&self, now: u64, out: &mut Vec<Callback>) {
        if !self.has_timer() {
            return;
        }
        let mut state = self.shared.state.write();
        let rollover = now < state.previous.saturating_sub(ROLLOVER_MS);
        state.previous = now;
        if rollover {
            log::warn!("clock went back by more than an hour, firing all timers");
        }

        let expired: Vec<(u64, u64)> = if rollover {
            state.order.iter().copied().collect()
        } else {
            state
                .order
                .iter()
                .take_while(|(deadline, _)| *deadline <= now)
                .copied()
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        out.reserve(expired.len());
        for (_, id) in expired {
            let mut entry = match state.remove(id) {
                Some(entry) => entry,
                None => continue,
            };
            let (live, callback) = (entry.live.clone(), entry.callback.clone());
            out.push(Arc::new(move || {
                if live.load(Ordering::Acquire) {
                    callback()
                }
            }));
            if entry.recurring {
                entry.deadline = now.saturating_add(entry.interval);
                let key = (entry.deadline, id);
                state.order.insert(key);
                state.entries.insert(id, entry);
            }
        }
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("TimerManager")
            .field("timers", &state.order.len())
            .field("next_deadline", &state.order.iter().next().map(|k| k.0))
            .finish()
    }
}

/// Handle to a registered timer.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    manager: Weak<Shared>,
}

impl Timer {
    /// Remove the timer. Returns false when it already fired (one-shot) or was
    /// cancelled.
    pub fn cancel(&self) -> bool {
        match self.manager.upgrade() {
            Some(shared) => match shared.state.write().remove(self.id) {
                Some(entry) => {
                    entry.live.store(false, Ordering::Release);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Push the deadline to one interval from now.
    pub fn refresh(&self) -> bool {
        let shared = match self.manager.upgrade() {
            Some(shared) => shared,
            None => return false,
        };
        let mut state = shared.state.write();
        let mut entry = match state.remove(self.id) {
            Some(entry) => entry,
            None => return false,
        };
        entry.deadline = now_ms().saturating_add(entry.interval);
        state.order.insert((entry.deadline, self.id));
        state.entries.insert(self.id, entry);
        true
    }

    /// Change the interval. The new deadline counts from now with `from_now`,
    /// otherwise from the original start.
    pub fn reset(&self, interval: Duration, from_now: bool) -> bool {
        let shared = match self.manager.upgrade() {
            Some(shared) => shared,
            None => return false,
        };
        let interval = as_ms(interval);
        let mut entry = {
            let mut state = shared.state.write();
            match state.entries.get(&self.id) {
                None => return false,
                Some(entry) if entry.interval == interval && !from_now => return true,
                Some(_) => {}
            }
            match state.remove(self.id) {
                Some(entry) => entry,
                None => return false,
            }
        };
        let start = if from_now {
            now_ms()
        } else {
            entry.deadline.saturating_sub(entry.interval)
        };
        entry.interval = interval;
        entry.deadline = start.saturating_add(interval);
        shared.insert(self.id, entry);
        true
    }

    pub(crate) fn deadline(&self) -> Option<u64> {
        let shared = self.manager.upgrade()?;
        let state = shared.state.read();
        state.entries.get(&self.id).map(|e| e.deadline)
    }

    pub fn is_pending(&self) -> bool {
        self.deadline().is_some()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .finish()
    }
}
