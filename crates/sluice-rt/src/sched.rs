//! Task scheduling: a work-stealing pool driving filter tasks.
//!
//! Every unit of work in a session is a [`Task`]: a process call, a
//! pid connection step, an event delivery, a teardown step. Tasks are
//! posted to a global injector; worker threads keep a local deque,
//! batch-steal from the injector and steal from each other when idle.
//! A task may ask to be requeued after a delay (stream resets, pid
//! deletion waiting on shared packets, timed reschedules).
//!
//! With `threads == 0` the pool degenerates to a deterministic
//! single-threaded loop on the caller, which keeps task order exactly
//! as posted; tests rely on this mode.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::events::Event;
use crate::filter::Filter;
use crate::pid::{Pid, PidInstance};

/// What a task does when it runs.
pub(crate) enum TaskKind {
    /// Run the filter's process callback.
    Process,
    /// Find destinations for a freshly created pid.
    PidInit { pid: Arc<Pid> },
    /// Connect `pid` to the task's filter.
    PidConnect { pid: Arc<Pid> },
    /// Re-run configure after a property change.
    PidReconfigure { pid: Arc<Pid> },
    /// Drain and reset one input instance after stop/seek.
    PidReset { inst: Arc<PidInstance> },
    /// Detach an instance; requeues until shared packets die.
    PidInstDelete { pid: Arc<Pid>, inst: Arc<PidInstance> },
    /// Disconnect `pid` from the task's filter.
    PidDisconnect { pid: Arc<Pid> },
    /// Deliver an event and propagate toward the sources.
    EventDownstream { evt: Event },
    /// Deliver an event and propagate toward the sinks.
    EventUpstream { evt: Event },
    /// Finalize and destroy the filter.
    FilterRemove,
}

impl TaskKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TaskKind::Process => "process",
            TaskKind::PidInit { .. } => "pid_init",
            TaskKind::PidConnect { .. } => "pid_connect",
            TaskKind::PidReconfigure { .. } => "pid_reconfigure",
            TaskKind::PidReset { .. } => "pid_reset",
            TaskKind::PidInstDelete { .. } => "pid_inst_delete",
            TaskKind::PidDisconnect { .. } => "pid_disconnect",
            TaskKind::EventDownstream { .. } => "downstream_event",
            TaskKind::EventUpstream { .. } => "upstream_event",
            TaskKind::FilterRemove => "filter_remove",
        }
    }
}

pub(crate) struct Task {
    pub filter: Arc<Filter>,
    pub kind: TaskKind,
}

/// Returned by the task executor.
pub(crate) enum TaskOutcome {
    Done,
    /// The executor rescheduled the task itself (via
    /// [`Scheduler::reschedule`]); it stays active.
    Requeued,
}

struct DelayedTask {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DelayedTask {}
impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // min-heap on due time
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The task pool. Owned by the session.
pub(crate) struct Scheduler {
    injector: Injector<Task>,
    delayed: Mutex<BinaryHeap<DelayedTask>>,
    delayed_seq: AtomicU64,
    /// Tasks posted and not yet completed (queued, delayed or running).
    active: AtomicU64,
    idle_mx: Mutex<()>,
    idle_cv: Condvar,
    aborted: AtomicBool,
}

impl Scheduler {
    pub(crate) fn new() -> Scheduler {
        Scheduler {
            injector: Injector::new(),
            delayed: Mutex::new(BinaryHeap::new()),
            delayed_seq: AtomicU64::new(0),
            active: AtomicU64::new(0),
            idle_mx: Mutex::new(()),
            idle_cv: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn post(&self, task: Task) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.injector.push(task);
        self.idle_cv.notify_all();
    }

    fn requeue(&self, task: Task, delay: Duration) {
        let seq = self.delayed_seq.fetch_add(1, Ordering::AcqRel);
        self.delayed.lock().push(DelayedTask {
            due: Instant::now() + delay,
            seq,
            task,
        });
        self.idle_cv.notify_all();
    }

    /// Account for a task executed inline (direct dispatch) instead of
    /// through the queue.
    pub(crate) fn inline_begin(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn inline_done(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.idle_cv.notify_all();
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.idle_cv.notify_all();
    }

    pub(crate) fn active_tasks(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Move due delayed tasks to the injector; returns the next due
    /// instant, if any.
    fn flush_delayed(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut delayed = self.delayed.lock();
        while let Some(head) = delayed.peek() {
            if head.due <= now {
                let entry = delayed.pop().expect("peeked entry");
                self.injector.push(entry.task);
            } else {
                return Some(head.due);
            }
        }
        None
    }

    /// Drive the pool until every task completes. `exec` runs each
    /// task; requeue outcomes keep the task alive.
    pub(crate) fn run(&self, threads: usize, exec: &(dyn Fn(Task) -> TaskOutcome + Sync)) {
        if threads == 0 {
            self.run_single(exec);
            return;
        }
        let workers: Vec<Worker<Task>> = (0..threads).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Task>> = workers.iter().map(|w| w.stealer()).collect();
        let stealers = &stealers;
        std::thread::scope(|scope| {
            for (i, local) in workers.into_iter().enumerate() {
                scope.spawn(move || {
                    self.worker_loop(i, local, stealers, exec);
                });
            }
        });
    }

    fn run_single(&self, exec: &dyn Fn(Task) -> TaskOutcome) {
        loop {
            if self.aborted.load(Ordering::Acquire) {
                self.drain_pending();
                return;
            }
            let next_due = self.flush_delayed();
            match self.injector.steal() {
                Steal::Success(task) => match exec(task) {
                    TaskOutcome::Done => {
                        self.active.fetch_sub(1, Ordering::AcqRel);
                    }
                    TaskOutcome::Requeued => {}
                },
                _ => {
                    if self.active_tasks() == 0 {
                        return;
                    }
                    if let Some(due) = next_due {
                        let now = Instant::now();
                        if due > now {
                            std::thread::sleep((due - now).min(Duration::from_millis(2)));
                        }
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    fn worker_loop(
        &self,
        _idx: usize,
        local: Worker<Task>,
        stealers: &[Stealer<Task>],
        exec: &(dyn Fn(Task) -> TaskOutcome + Sync),
    ) {
        let backoff = Backoff::new();
        loop {
            if self.aborted.load(Ordering::Acquire) {
                self.drain_pending();
                return;
            }
            let next_due = self.flush_delayed();

            let task = local.pop().or_else(|| {
                std::iter::repeat_with(|| {
                    self.injector
                        .steal_batch_and_pop(&local)
                        .or_else(|| stealers.iter().map(|s| s.steal()).collect())
                })
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            });

            match task {
                Some(task) => {
                    backoff.reset();
                    match exec(task) {
                        TaskOutcome::Done => {
                            self.active.fetch_sub(1, Ordering::AcqRel);
                            self.idle_cv.notify_all();
                        }
                        TaskOutcome::Requeued => {}
                    }
                }
                None => {
                    if self.active_tasks() == 0 {
                        self.idle_cv.notify_all();
                        return;
                    }
                    if backoff.is_completed() {
                        let mut guard = self.idle_mx.lock();
                        let timeout = next_due
                            .map(|due| due.saturating_duration_since(Instant::now()))
                            .unwrap_or(Duration::from_millis(2));
                        self.idle_cv
                            .wait_for(&mut guard, timeout.max(Duration::from_micros(100)));
                        backoff.reset();
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Requeue entry point used by the session executor.
    pub(crate) fn reschedule(&self, task: Task, delay: Duration) {
        self.requeue(task, delay);
    }

    /// Mark one active task complete without running it (abort path).
    fn drain_pending(&self) {
        while let Steal::Success(_) = self.injector.steal() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        let mut delayed = self.delayed.lock();
        while delayed.pop().is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
