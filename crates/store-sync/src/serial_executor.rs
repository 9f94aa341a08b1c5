//! Labelled, strictly serial task queues with deadlock-safe re-entrant
//! synchronous dispatch (spec §4.1).
//!
//! Each `SerialExecutor` owns one dedicated OS thread that drains a job
//! channel one job at a time — the "serial" guarantee falls out of that
//! thread running nothing else. `submit_sync` from a foreign thread sends a
//! job and blocks on a response channel; `submit_sync` called from *within*
//! a job already running on this queue's logical call chain is detected via
//! a thread-local stack of entered queue ids and, per the configured
//! [`ReentrantPolicy`], runs inline instead of deadlocking.
//!
//! The entered-queue stack is propagated across the thread hop that a
//! blocking synchronous cross-queue call performs, so that `in_current_stack`
//! stays correct transitively (queue A calling into queue B calling back
//! into queue A is detected as reentrant even though B's code runs on B's
//! own worker thread, not A's) — this is what spec §4.1 means by tracking
//! the stack "per OS thread": the thread that ends up running a job adopts
//! the stack of whichever chain of synchronous calls produced that job.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use syncstore_core::{Error, Result};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a queue, used for reentrancy detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

thread_local! {
    static ENTERED_QUEUES: RefCell<Vec<QueueId>> = const { RefCell::new(Vec::new()) };
}

/// What `submit_sync` does when called reentrantly against its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReentrantPolicy {
    #[default]
    ExecuteInline,
    Skip,
    LogAndSkip,
    Assert,
    EnqueueAnyway,
}

/// How a named timer's re-scheduling interacts with a pending fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerBehavior {
    /// Rescheduling resets the fire time to `now + delay`.
    Delay,
    /// Rescheduling leaves the fire time unchanged unless the new
    /// `now + delay` is earlier.
    Coalesce,
    /// First call fires immediately; later calls within `delay` of the
    /// previous fire collapse into one deferred fire at `previous_fire +
    /// delay`.
    Throttle,
}

struct Job {
    inherited: Vec<QueueId>,
    task: Box<dyn FnOnce() + Send>,
}

struct TimerState {
    generation: u64,
    fire_at: Instant,
    last_fired_at: Option<Instant>,
}

/// A labelled serial task queue (spec §4.1).
pub struct SerialExecutor {
    id: QueueId,
    label: String,
    sender: mpsc::Sender<Job>,
    policy: ReentrantPolicy,
    worker: Mutex<Option<JoinHandle<()>>>,
    timers: Mutex<HashMap<String, Arc<Mutex<TimerState>>>>,
}

impl SerialExecutor {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::with_policy(label, ReentrantPolicy::default())
    }

    pub fn with_policy(label: impl Into<String>, policy: ReentrantPolicy) -> Arc<Self> {
        let label = label.into();
        let id = QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker_label = label.clone();
        let worker = std::thread::Builder::new()
            .name(format!("serial-executor-{worker_label}"))
            .spawn(move || {
                for job in receiver.iter() {
                    ENTERED_QUEUES.with(|stack| {
                        let mut guard = stack.borrow_mut();
                        *guard = job.inherited;
                        guard.push(id);
                    });
                    (job.task)();
                    ENTERED_QUEUES.with(|stack| stack.borrow_mut().clear());
                }
            })
            .expect("spawning serial executor worker thread");

        Arc::new(Self {
            id,
            label,
            sender,
            policy,
            worker: Mutex::new(Some(worker)),
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// True if the *current* thread's call chain has already entered this
    /// queue (directly, or transitively via another queue's synchronous
    /// dispatch into this one).
    pub fn in_current_stack(&self) -> bool {
        ENTERED_QUEUES.with(|stack| stack.borrow().contains(&self.id))
    }

    fn current_inherited_stack() -> Vec<QueueId> {
        ENTERED_QUEUES.with(|stack| stack.borrow().clone())
    }

    /// Enqueues `task` and returns immediately without waiting for it to run.
    pub fn submit_async<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inherited = Self::current_inherited_stack();
        let _ = self.sender.send(Job {
            inherited,
            task: Box::new(task),
        });
    }

    /// Runs `task` on this queue and blocks the caller until it completes.
    ///
    /// If the caller is already logically inside this queue, applies the
    /// configured [`ReentrantPolicy`] instead of deadlocking.
    pub fn submit_sync<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.in_current_stack() {
            return self.run_reentrant(task);
        }

        let inherited = Self::current_inherited_stack();
        let (tx, rx) = mpsc::channel::<R>();
        let job = Job {
            inherited,
            task: Box::new(move || {
                let _ = tx.send(task());
            }),
        };
        self.sender
            .send(job)
            .map_err(|_| Error::io(format!("{} queue is closed", self.label)))?;
        rx.recv()
            .map_err(|_| Error::io(format!("{} queue dropped its result", self.label)))
    }

    fn run_reentrant<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.policy {
            ReentrantPolicy::ExecuteInline => Ok(task()),
            ReentrantPolicy::Skip => Err(Error::reentrant(self.label.clone())),
            ReentrantPolicy::LogAndSkip => {
                log::warn!("{}: skipping reentrant submit_sync", self.label);
                Err(Error::reentrant(self.label.clone()))
            }
            ReentrantPolicy::Assert => {
                panic!("{}: reentrant submit_sync with Assert policy", self.label)
            }
            ReentrantPolicy::EnqueueAnyway => {
                log::warn!(
                    "{}: enqueueing reentrant submit_sync anyway, may deadlock",
                    self.label
                );
                let inherited = Self::current_inherited_stack();
                let (tx, rx) = mpsc::channel::<R>();
                let job = Job {
                    inherited,
                    task: Box::new(move || {
                        let _ = tx.send(task());
                    }),
                };
                self.sender
                    .send(job)
                    .map_err(|_| Error::io(format!("{} queue is closed", self.label)))?;
                rx.recv()
                    .map_err(|_| Error::io(format!("{} queue dropped its result", self.label)))
            }
        }
    }

    /// (Re)schedules a named timer whose task fires on this queue.
    pub fn schedule_timer<F>(&self, name: &str, delay: Duration, behavior: TimerBehavior, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let state = {
            let mut timers = self.timers.lock().expect("timers mutex poisoned");
            timers
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(TimerState {
                        generation: 0,
                        fire_at: now,
                        last_fired_at: None,
                    }))
                })
                .clone()
        };

        let expected_generation = {
            let mut guard = state.lock().expect("timer state mutex poisoned");
            guard.generation += 1;

            match behavior {
                TimerBehavior::Delay => {
                    guard.fire_at = now + delay;
                }
                TimerBehavior::Coalesce => {
                    let candidate = now + delay;
                    // `generation` was just incremented above, so `== 1`
                    // means this is the very first schedule this timer has
                    // ever seen — there is no earlier fire_at to keep, so
                    // the candidate becomes it outright. Every later
                    // reschedule only pulls fire_at earlier, never later.
                    if guard.generation == 1 || candidate < guard.fire_at {
                        guard.fire_at = candidate;
                    }
                }
                TimerBehavior::Throttle => match guard.last_fired_at {
                    None => guard.fire_at = now,
                    Some(previous_fire) => {
                        let next_allowed = previous_fire + delay;
                        if now >= next_allowed {
                            guard.fire_at = now;
                        } else if guard.fire_at < next_allowed {
                            guard.fire_at = next_allowed;
                        }
                        // else: a throttled fire is already scheduled at or
                        // after next_allowed; leave it where it is.
                    }
                },
            }
            guard.generation
        };

        // Incrementing `generation` above means any thread spawned by an
        // earlier call to this timer will see a mismatch on its next poll
        // and exit without firing — at most one spawned thread per timer
        // name ever reaches the fire point.
        let sender = self.sender.clone();
        let inherited = Self::current_inherited_stack();
        let state_for_thread = state.clone();
        let mut task = Some(task);
        std::thread::spawn(move || {
            loop {
                let sleep_for = {
                    let guard = state_for_thread.lock().expect("timer state mutex poisoned");
                    if guard.generation != expected_generation {
                        return; // superseded by a later reschedule
                    }
                    guard.fire_at.saturating_duration_since(Instant::now())
                };
                if sleep_for.is_zero() {
                    break;
                }
                std::thread::sleep(sleep_for.min(Duration::from_millis(50)));
            }

            let mut guard = state_for_thread.lock().expect("timer state mutex poisoned");
            if guard.generation != expected_generation {
                return;
            }
            guard.last_fired_at = Some(Instant::now());
            drop(guard);

            if let Some(task) = task.take() {
                let _ = sender.send(Job {
                    inherited,
                    task: Box::new(task),
                });
            }
        });
    }

    /// Cancels a named timer; a pending fire for it will not run.
    pub fn cancel_timer(&self, name: &str) {
        let timers = self.timers.lock().expect("timers mutex poisoned");
        if let Some(state) = timers.get(name) {
            let mut guard = state.lock().expect("timer state mutex poisoned");
            guard.generation += 1;
        }
    }

    /// Cancels every named timer on this queue (spec §5: tear-down cancels
    /// all named timers).
    pub fn cancel_all_timers(&self) {
        let timers = self.timers.lock().expect("timers mutex poisoned");
        for state in timers.values() {
            let mut guard = state.lock().expect("timer state mutex poisoned");
            guard.generation += 1;
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        // Dropping `sender` (the last clone a consumer might have held) lets
        // the worker's `for job in receiver.iter()` end naturally; join so
        // in-flight async jobs finish before the executor disappears.
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}
