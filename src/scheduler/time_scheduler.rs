//! Dynamically rescheduling task runner.
//!
//! A single tokio task drains a deadline-ordered heap. After each run a task is
//! asked for its next interval, so retransmission entries can back off and
//! gossip rounds can pick a fresh random delay. The worker suspends itself
//! after `suspend_interval` without work and is respawned by the next `add`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_SUSPEND_INTERVAL: Duration = Duration::from_millis(2000);

/// A unit of work run by the [`TimeScheduler`].
pub trait TimedTask: Send + Sync {
    /// Cancelled tasks are dropped lazily the next time they reach the head.
    fn cancelled(&self) -> bool;

    /// Delay until the next execution. Called once when the task is added and
    /// again after every run.
    fn next_interval(&self) -> Duration;

    fn run(&self);
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: Arc<dyn TimedTask>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap and we want the earliest deadline on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    queue: BinaryHeap<Scheduled>,
    running: bool,
    stopped: bool,
    next_seq: u64,
}

pub struct TimeScheduler {
    state: Mutex<State>,
    wakeup: Notify,
    suspend_interval: Duration,
}

impl TimeScheduler {
    pub fn new() -> Arc<Self> {
        Self::with_suspend_interval(DEFAULT_SUSPEND_INTERVAL)
    }

    pub fn with_suspend_interval(suspend_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                running: false,
                stopped: false,
                next_seq: 0,
            }),
            wakeup: Notify::new(),
            suspend_interval,
        })
    }

    /// Schedules `task` to first run after `task.next_interval()`.
    pub fn add(self: &Arc<Self>, task: Arc<dyn TimedTask>) {
        let deadline = Instant::now() + task.next_interval();

        let spawn_worker = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                tracing::debug!("Time scheduler is stopped, dropping task");
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Scheduled {
                deadline,
                seq,
                task,
            });
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if spawn_worker {
            self.spawn_worker();
        }
        self.wakeup.notify_one();
    }

    /// Number of scheduled tasks, cancelled ones included until they are dropped.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Drops every task and stops the worker. Later `add` calls are ignored.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
            state.queue.clear();
        }
        self.wakeup.notify_one();
    }

    fn spawn_worker(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let scheduler = self.clone();
                handle.spawn(async move {
                    scheduler.run_loop().await;
                });
            }
            Err(_) => {
                self.state.lock().unwrap().running = false;
                tracing::warn!("No tokio runtime available, task stays queued until the next add");
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        tracing::debug!("Time scheduler worker started");

        loop {
            let next_deadline = {
                let mut state = self.state.lock().unwrap();
                if state.stopped {
                    state.running = false;
                    break;
                }
                while state.queue.peek().is_some_and(|top| top.task.cancelled()) {
                    state.queue.pop();
                }
                state.queue.peek().map(|top| top.deadline)
            };

            match next_deadline {
                None => {
                    let woken = tokio::time::timeout(self.suspend_interval, self.wakeup.notified())
                        .await
                        .is_ok();
                    if !woken {
                        let mut state = self.state.lock().unwrap();
                        if state.queue.is_empty() || state.stopped {
                            state.running = false;
                            tracing::debug!("Time scheduler idle, suspending worker");
                            break;
                        }
                    }
                }
                Some(deadline) if deadline <= Instant::now() => {
                    let due = self.state.lock().unwrap().queue.pop();
                    if let Some(entry) = due {
                        self.execute(entry);
                    }
                }
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, self.wakeup.notified()).await;
                }
            }
        }

        tracing::debug!("Time scheduler worker stopped");
    }

    fn execute(&self, entry: Scheduled) {
        if entry.task.cancelled() {
            return;
        }

        entry.task.run();

        if entry.task.cancelled() {
            return;
        }

        // Fixed-rate: the next run is measured from the scheduled time, not
        // from when the previous run finished, unless we fell behind.
        let interval = entry.task.next_interval();
        let now = Instant::now();
        let mut deadline = entry.deadline + interval;
        if deadline < now {
            deadline = now + interval;
        }

        let mut state = self.state.lock().unwrap();
        if !state.stopped {
            state.queue.push(Scheduled {
                deadline,
                seq: entry.seq,
                task: entry.task,
            });
        }
    }
}
