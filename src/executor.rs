//! N:M scheduler.
//!
//! `Scheduler` owns a pool of worker threads that share one ready queue of
//! [`Task`]s. Each worker loops: claim a task it may run, swap it in until it
//! suspends, and run its idle coroutine when nothing is claimable. What "idle"
//! means is up to the [`Driver`]: the plain scheduler parks on a condition
//! variable, the [`IoManager`](crate::IoManager) waits on epoll.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::config;
use crate::coroutine::{Coroutine, State};
use crate::error::Result;
use crate::hook;
use crate::reactor::Reactor;

scoped_tls::scoped_thread_local!(pub(crate) static EX: Scheduler);

thread_local! {
    /// Index of the worker the current thread runs, if it is one.
    static WORKER: Cell<Option<usize>> = Cell::new(None);
}

/// Extension points of the worker loop.
pub trait Driver: Send + Sync + 'static {
    /// Wake an idle worker so it notices new work.
    fn tickle(&self, sched: &Scheduler);

    /// Body of every worker's idle coroutine. Should suspend back to the worker
    /// loop regularly and must return once `stopping` holds.
    fn idle(&self, sched: &Scheduler);

    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }

    fn as_reactor(&self) -> Option<&Reactor> {
        None
    }
}

/// Idle behaviour of the plain scheduler: sleep until tickled.
#[derive(Default)]
pub struct Park {
    notified: Mutex<bool>,
    cvar: Condvar,
}

impl Driver for Park {
    fn tickle(&self, _sched: &Scheduler) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cvar.notify_one();
    }

    fn idle(&self, sched: &Scheduler) {
        let timeout = config::get().max_poll_timeout;
        while !sched.stopping() {
            {
                let mut notified = self.notified.lock();
                if !*notified {
                    self.cvar.wait_for(&mut notified, timeout);
                }
                *notified = false;
            }
            Coroutine::yield_to_hold();
        }
        // let the next parked worker re-check
        self.tickle(sched);
    }
}

pub(crate) enum Work {
    Coroutine(Coroutine),
    Callback(Box<dyn FnOnce() + Send>),
}

/// A unit of work for the ready queue: a coroutine to resume or a callback to
/// run in a fresh coroutine, optionally pinned to one worker.
pub struct Task {
    work: Work,
    thread: Option<usize>,
}

impl Task {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            work: Work::Callback(Box::new(f)),
            thread: None,
        }
    }

    pub fn from_coroutine(co: Coroutine) -> Self {
        Self {
            work: Work::Coroutine(co),
            thread: None,
        }
    }

    /// Only let worker `worker` run this task.
    pub fn on_thread(mut self, worker: usize) -> Self {
        self.thread = Some(worker);
        self
    }

    pub fn thread(&self) -> Option<usize> {
        self.thread
    }

    /// Whether a worker may claim this task now.
    fn is_claimable(&self) -> bool {
        match &self.work {
            // still switching out on some other thread
            Work::Coroutine(co) if co.state() == State::Exec => false,
            _ => true,
        }
    }
}

impl From<Coroutine> for Task {
    fn from(co: Coroutine) -> Self {
        Task::from_coroutine(co)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Task");
        match &self.work {
            Work::Coroutine(co) => d.field("coroutine", &co.id()),
            Work::Callback(_) => d.field("callback", &true),
        };
        d.field("thread", &self.thread).finish()
    }
}

/// 存储`Task`的队列
pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        const DEFAULT_TASK_QUEUE_SIZE: usize = 4096;
        Self::new_with_capacity(DEFAULT_TASK_QUEUE_SIZE)
    }

    pub(crate) fn new_with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a task, returns whether the queue was empty before.
    pub(crate) fn push(&self, task: Task) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    pub(crate) fn push_all<I: IntoIterator<Item = Task>>(&self, tasks: I) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.extend(tasks);
        was_empty && !queue.is_empty()
    }

    /// Claim the first task `worker` may run. Bumps `active` when one is claimed
    /// and `idle` when none is, both under the queue lock so a concurrent push
    /// either sees the idle worker or gets seen by it.
    ///
    /// The returned flag asks the caller to wake another worker: some task was
    /// skipped for affinity, or work remains after the claim.
    pub(crate) fn pop_for(
        &self,
        worker: usize,
        active: &AtomicUsize,
        idle: &AtomicUsize,
    ) -> (Option<Task>, bool) {
        let mut queue = self.queue.lock();
        let mut tickle = false;
        let mut found = None;
        for (i, task) in queue.iter().enumerate() {
            if task.thread.map_or(false, |t| t != worker) {
                tickle = true;
                continue;
            }
            if task.is_claimable() {
                found = Some(i);
                break;
            }
        }

        let task = found.and_then(|i| queue.remove(i));
        if task.is_some() {
            active.fetch_add(1, Ordering::SeqCst);
            tickle |= !queue.is_empty();
        } else {
            idle.fetch_add(1, Ordering::SeqCst);
        }
        (task, tickle)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

struct Shared {
    name: String,
    /// Worker count, the caller thread included in use-caller mode.
    size: usize,
    caller: Option<ThreadId>,
    queue: TaskQueue,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Runs the caller thread's worker loop in use-caller mode.
    root: Option<Coroutine>,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    driver: Box<dyn Driver>,
}

/// `Scheduler`负责`Task`的调度和执行
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Plain scheduler with `threads` workers. With `use_caller` the creating
    /// thread is worker 0 and only joins in while [`stop`](Self::stop) runs.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> Self {
        Self::with_driver(threads, use_caller, name, Park::default())
    }

    pub fn with_driver<D: Driver>(
        threads: usize,
        use_caller: bool,
        name: impl Into<String>,
        driver: D,
    ) -> Self {
        assert!(threads > 0, "a scheduler needs at least one worker");
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let root = use_caller.then(|| {
                let weak = weak.clone();
                Coroutine::new(
                    move || {
                        if let Some(shared) = weak.upgrade() {
                            Scheduler { shared }.run(0);
                        }
                    },
                    0,
                )
            });
            Shared {
                name: name.into(),
                size: threads,
                caller: use_caller.then(|| thread::current().id()),
                queue: TaskQueue::new(),
                threads: Mutex::new(Vec::with_capacity(threads)),
                root,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                driver: Box::new(driver),
            }
        });
        Self { shared }
    }

    /// The scheduler whose worker loop runs on this thread.
    pub fn current() -> Option<Scheduler> {
        if EX.is_set() {
            Some(EX.with(|s| s.clone()))
        } else {
            None
        }
    }

    /// Index of the worker running on this thread.
    pub fn current_worker() -> Option<usize> {
        WORKER.with(|w| w.get())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of workers, the caller thread included in use-caller mode.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn has_idle_threads(&self) -> bool {
        self.shared.idle.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub(crate) fn reactor(&self) -> Option<&Reactor> {
        self.shared.driver.as_reactor()
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Arc::downgrade(&self.shared))
    }

    pub(crate) fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Spawn the worker threads. Does nothing while already running.
    pub fn start(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.auto_stop.store(false, Ordering::SeqCst);

        let first = usize::from(self.shared.root.is_some());
        let mut threads = self.shared.threads.lock();
        for index in first..self.shared.size {
            let sched = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name(), index))
                .spawn(move || EX.set(&sched, || sched.run(index)))?;
            threads.push(handle);
        }
        log::debug!(
            "scheduler {} started {} worker threads",
            self.name(),
            threads.len()
        );
        Ok(())
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::from_fn(f));
    }

    pub fn schedule_coroutine(&self, co: Coroutine) {
        self.schedule_task(Task::from_coroutine(co));
    }

    pub fn schedule_task(&self, task: Task) {
        if self.shared.queue.push(task) {
            self.tickle();
        }
    }

    pub fn schedule_all<I: IntoIterator<Item = Task>>(&self, tasks: I) {
        if self.shared.queue.push_all(tasks) {
            self.tickle();
        }
    }

    /// Move the running coroutine onto worker `worker` of this scheduler (any
    /// worker with `None`).
    pub fn switch_to(&self, worker: Option<usize>) {
        let co = match Coroutine::current() {
            Some(co) => co,
            None => panic!("switch_to called outside of a coroutine"),
        };
        let here = Scheduler::current().map_or(false, |s| s.same_as(self));
        if here && (worker.is_none() || worker == Self::current_worker()) {
            return;
        }
        let task = Task::from_coroutine(co);
        self.schedule_task(match worker {
            Some(worker) => task.on_thread(worker),
            None => task,
        });
        Coroutine::yield_to_hold();
    }

    pub fn tickle(&self) {
        self.shared.driver.tickle(self);
    }

    pub fn stopping(&self) -> bool {
        self.shared.driver.stopping(self)
    }

    /// Stopping condition without any driver-specific state: stop was requested,
    /// the queue is drained and no worker is running a task.
    pub fn base_stopping(&self) -> bool {
        self.shared.auto_stop.load(Ordering::SeqCst)
            && self.shared.stopping.load(Ordering::SeqCst)
            && self.shared.queue.is_empty()
            && self.shared.active.load(Ordering::SeqCst) == 0
    }

    /// Drain all work and join the workers.
    ///
    /// Must not race with outside threads still scheduling work. In use-caller
    /// mode it has to be called on the creating thread, which then runs its own
    /// worker loop until the scheduler is idle.
    pub fn stop(&self) {
        let shared = &self.shared;
        if let Some(caller) = shared.caller {
            assert_eq!(
                thread::current().id(),
                caller,
                "use-caller scheduler {} must be stopped from the thread that created it",
                shared.name
            );
        }
        log::debug!("scheduler {} stopping", shared.name);
        shared.auto_stop.store(true, Ordering::SeqCst);
        shared.stopping.store(true, Ordering::SeqCst);
        for _ in 0..shared.size {
            self.tickle();
        }

        if let Some(root) = &shared.root {
            if root.state() == State::Init && !self.stopping() {
                EX.set(self, || root.swap_in());
            }
        }

        let threads = mem::take(&mut *shared.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                log::error!("scheduler {} worker exited with a panic", shared.name);
            }
        }
        shared.started.store(false, Ordering::SeqCst);
        log::debug!("scheduler {} stopped", shared.name);
    }

    /// Worker loop.
    fn run(&self, index: usize) {
        log::debug!("scheduler {} worker {} running", self.name(), index);
        let hooked = hook::is_enabled();
        hook::set_enabled(true);
        let prev_worker = WORKER.with(|w| w.replace(Some(index)));

        let idle = {
            let sched = self.clone();
            Coroutine::new(move || sched.shared.driver.idle(&sched), 0)
        };
        // finished callback coroutine kept around for its stack
        let mut spare: Option<Coroutine> = None;
        let shared = &self.shared;

        loop {
            let (task, tickle) = shared.queue.pop_for(index, &shared.active, &shared.idle);
            if tickle {
                self.tickle();
            }

            let (work, thread) = match task {
                Some(Task { work, thread }) => (Some(work), thread),
                None => (None, None),
            };
            // ready coroutines go back to the queue with their affinity
            let requeue = |co: Coroutine| {
                self.schedule_task(Task {
                    work: Work::Coroutine(co),
                    thread,
                })
            };

            match work {
                Some(Work::Coroutine(co)) => {
                    if !co.state().is_terminal() {
                        co.swap_in();
                    }
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                    if co.state() == State::Ready {
                        requeue(co);
                    }
                }
                Some(Work::Callback(f)) => {
                    let co = match spare.take() {
                        Some(co) => {
                            co.reset(f);
                            co
                        }
                        None => Coroutine::new(f, 0),
                    };
                    co.swap_in();
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                    match co.state() {
                        State::Ready => requeue(co),
                        State::Term | State::Except => spare = Some(co),
                        // parked: whoever wakes it holds a handle
                        _ => {}
                    }
                }
                None => {
                    if idle.state().is_terminal() {
                        shared.idle.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                    idle.swap_in();
                    shared.idle.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            }

            if shared.stopping.load(Ordering::SeqCst) {
                // idle workers may be waiting for the last task to finish
                self.tickle();
            }
        }

        WORKER.with(|w| w.set(prev_worker));
        hook::set_enabled(hooked);
        log::debug!("scheduler {} worker {} exited", self.name(), index);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = &self.shared;
        f.debug_struct("Scheduler")
            .field("name", &shared.name)
            .field("size", &shared.size)
            .field("use_caller", &shared.root.is_some())
            .field("active", &shared.active.load(Ordering::Relaxed))
            .field("idle", &shared.idle.load(Ordering::Relaxed))
            .field("queued", &self.queued())
            .field("stopping", &shared.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle that does not keep the scheduler alive.
#[derive(Clone)]
pub(crate) struct WeakScheduler(Weak<Shared>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|shared| Scheduler { shared })
    }
}
