//! Bounded work queue: a FIFO of deferred tasks pumped through K lanes.
//!
//! Every lane is a tokio task running a bounded pull loop. The pending
//! tasks, the in-flight count, the lane count and the engine state all live
//! under one scheduling mutex, so the completion check ("queue empty and
//! nothing in flight") is evaluated atomically with the decrement that makes
//! it true. A task that pushes a follow-up before returning is therefore
//! always observed before Done is declared.
//!
//! The lock is never held across an `.await`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, watch};
use tokio::sync::futures::Notified;
use tracing::{debug, info, warn};

use super::EngineState;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A deferred unit of work. Nothing runs until a lane pops it.
pub struct Task {
    name: &'static str,
    future: TaskFuture,
}

impl Task {
    pub fn new<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            future: Box::pin(future),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

/// When the queue declares itself Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done as soon as nothing is pending, in flight or deferred.
    OnDrain,
    /// Never Done; idle lanes park until more work arrives.
    Never,
}

/// Receives task failures and the Done signal.
///
/// Callbacks run on the lane that observed the event, outside the scheduling
/// lock. They must not block.
pub trait QueueObserver: Send + Sync {
    fn task_failed(&self, task: &'static str, error: &anyhow::Error) {
        let _ = (task, error);
    }

    fn drained(&self) {}
}

/// Observer that only relies on the lane's own logging.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl QueueObserver for NoopObserver {}

struct Sched {
    state: EngineState,
    pending: VecDeque<Task>,
    inflight: usize,
    deferred: usize,
    active_lanes: usize,
    executed: u64,
}

struct Shared {
    name: &'static str,
    lanes: usize,
    completion: Completion,
    sched: Mutex<Sched>,
    wake: Notify,
    done: watch::Sender<bool>,
    observer: Arc<dyn QueueObserver>,
}

fn transition(sched: &mut Sched, to: EngineState) -> Result<()> {
    if !sched.state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: sched.state,
            to,
        });
    }
    sched.state = to;
    Ok(())
}

enum Step {
    Run(Task),
    Park,
    Exit { finished: bool },
}

/// Handle to a bounded work queue. Cheap to clone; tasks capture clones to
/// push their own follow-ups.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// A queue with `lanes` lanes that finishes once drained.
    pub fn new(name: &'static str, lanes: usize) -> Result<Self> {
        Self::with_observer(name, lanes, Completion::OnDrain, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        name: &'static str,
        lanes: usize,
        completion: Completion,
        observer: Arc<dyn QueueObserver>,
    ) -> Result<Self> {
        if lanes == 0 {
            return Err(Error::Validation(format!(
                "queue '{name}' needs at least one lane"
            )));
        }

        let (done, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                lanes,
                completion,
                sched: Mutex::new(Sched {
                    state: EngineState::Initialized,
                    pending: VecDeque::new(),
                    inflight: 0,
                    deferred: 0,
                    active_lanes: 0,
                    executed: 0,
                }),
                wake: Notify::new(),
                done,
                observer,
            }),
        })
    }

    pub fn lanes(&self) -> usize {
        self.shared.lanes
    }

    pub fn state(&self) -> EngineState {
        self.sched().state
    }

    /// Number of tasks executing right now.
    pub fn inflight(&self) -> usize {
        self.sched().inflight
    }

    /// Number of tasks waiting for a lane.
    pub fn pending(&self) -> usize {
        self.sched().pending.len()
    }

    /// Total number of tasks that ran to completion (successfully or not).
    pub fn executed(&self) -> u64 {
        self.sched().executed
    }

    /// Append a task to the tail of the queue.
    ///
    /// Allowed in every state but Done. While Initialized or Paused the task
    /// simply waits for `start()` / `resume()`.
    pub fn push(&self, task: Task) {
        let wake = {
            let mut sched = self.sched();
            if sched.state.is_terminal() {
                warn!(queue = self.shared.name, task = task.name, "push after done, task dropped");
                return;
            }
            sched.pending.push_back(task);
            sched.state == EngineState::Running
        };
        if wake {
            self.shared.wake.notify_one();
        }
    }

    /// Push `task` once `delay` has elapsed.
    ///
    /// The delay occupies no lane, but it does hold the queue open: Done is
    /// not declared while a deferred task is still sleeping.
    pub fn defer(&self, delay: Duration, task: Task) {
        {
            let mut sched = self.sched();
            if sched.state.is_terminal() {
                warn!(queue = self.shared.name, task = task.name, "defer after done, task dropped");
                return;
            }
            sched.deferred += 1;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.release_deferred(task);
        });
    }

    /// Initialized -> Running. Seeds the lanes.
    pub fn start(&self) -> Result<()> {
        let spawn = {
            let mut sched = self.sched();
            if sched.state != EngineState::Initialized {
                return Err(Error::InvalidTransition {
                    from: sched.state,
                    to: EngineState::Running,
                });
            }
            transition(&mut sched, EngineState::Running)?;
            self.arm(&mut sched)
        };
        info!(queue = self.shared.name, lanes = self.shared.lanes, "queue started");
        self.spawn_lanes(spawn);
        Ok(())
    }

    /// Running -> Paused. Executing tasks run to completion; nothing new
    /// starts until `resume()`.
    pub fn pause(&self) -> Result<()> {
        {
            let mut sched = self.sched();
            transition(&mut sched, EngineState::Paused)?;
        }
        info!(queue = self.shared.name, "queue paused");
        // Parked lanes wake, see Paused and exit.
        self.shared.wake.notify_waiters();
        Ok(())
    }

    /// Paused -> Running. Re-arms lanes up to the configured count.
    pub fn resume(&self) -> Result<()> {
        let spawn = {
            let mut sched = self.sched();
            if sched.state != EngineState::Paused {
                return Err(Error::InvalidTransition {
                    from: sched.state,
                    to: EngineState::Running,
                });
            }
            transition(&mut sched, EngineState::Running)?;
            self.arm(&mut sched)
        };
        info!(queue = self.shared.name, lanes = spawn, "queue resumed");
        self.spawn_lanes(spawn);
        Ok(())
    }

    /// Resolves once the queue has declared Done. Never resolves for a
    /// `Completion::Never` queue.
    pub async fn wait(&self) {
        let mut rx = self.shared.done.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot close.
        let _ = rx.wait_for(|done| *done).await;
    }

    fn sched(&self) -> MutexGuard<'_, Sched> {
        self.shared
            .sched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve lane slots; lanes still finishing a task from before a pause
    /// count against the limit.
    fn arm(&self, sched: &mut Sched) -> usize {
        let spawn = self.shared.lanes - sched.active_lanes;
        sched.active_lanes += spawn;
        spawn
    }

    fn spawn_lanes(&self, count: usize) {
        for lane in 0..count {
            let queue = self.clone();
            tokio::spawn(async move { queue.run_lane(lane).await });
        }
    }

    fn release_deferred(&self, task: Task) {
        let wake = {
            let mut sched = self.sched();
            sched.deferred -= 1;
            sched.pending.push_back(task);
            sched.state == EngineState::Running
        };
        if wake {
            self.shared.wake.notify_one();
        }
    }

    fn is_drained(&self, sched: &Sched) -> bool {
        self.shared.completion == Completion::OnDrain
            && sched.state == EngineState::Running
            && sched.pending.is_empty()
            && sched.inflight == 0
            && sched.deferred == 0
    }

    async fn run_lane(self, lane: usize) {
        debug!(queue = self.shared.name, lane, "lane started");

        loop {
            let notified = self.shared.wake.notified();
            tokio::pin!(notified);

            let step = {
                let mut sched = self.sched();
                self.next_step(&mut sched, notified.as_mut())
            };

            match step {
                Step::Run(task) => self.execute(lane, task).await,
                Step::Park => notified.await,
                Step::Exit { finished } => {
                    if finished {
                        self.announce_done();
                    }
                    break;
                }
            }
        }

        debug!(queue = self.shared.name, lane, "lane stopped");
    }

    fn next_step(&self, sched: &mut Sched, notified: Pin<&mut Notified<'_>>) -> Step {
        if sched.state != EngineState::Running {
            sched.active_lanes -= 1;
            return Step::Exit { finished: false };
        }

        if let Some(task) = sched.pending.pop_front() {
            sched.inflight += 1;
            return Step::Run(task);
        }

        if self.is_drained(sched) {
            sched.state = EngineState::Done;
            sched.active_lanes -= 1;
            return Step::Exit { finished: true };
        }

        // Register before the lock is released so a push in between is
        // not missed.
        notified.enable();
        Step::Park
    }

    async fn execute(&self, lane: usize, task: Task) {
        let name = task.name;

        // Spawned so a panicking task surfaces as a failure instead of
        // taking the lane (and its in-flight slot) down with it.
        let outcome = match tokio::spawn(task.future).await {
            Ok(result) => result,
            Err(join) => Err(anyhow::anyhow!("task panicked: {join}")),
        };

        match &outcome {
            Ok(()) => {
                metrics::queue_tasks().add(
                    1,
                    &[
                        KeyValue::new("queue", self.shared.name),
                        KeyValue::new("outcome", "ok"),
                    ],
                );
            }
            Err(error) => {
                warn!(queue = self.shared.name, lane, task = name, error = %error, "task failed");
                metrics::queue_tasks().add(
                    1,
                    &[
                        KeyValue::new("queue", self.shared.name),
                        KeyValue::new("outcome", "error"),
                    ],
                );
                self.shared.observer.task_failed(name, error);
            }
        }

        let finished = {
            let mut sched = self.sched();
            sched.inflight -= 1;
            sched.executed += 1;
            if self.is_drained(&sched) {
                sched.state = EngineState::Done;
                true
            } else {
                false
            }
        };

        if finished {
            self.announce_done();
        }
    }

    fn announce_done(&self) {
        info!(queue = self.shared.name, executed = self.executed(), "queue drained");
        // Observer first: anyone woken by `wait()` sees the Done notification
        // already delivered.
        self.shared.observer.drained();
        self.shared.done.send_replace(true);
        self.shared.wake.notify_waiters();
    }
}
