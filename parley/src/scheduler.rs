use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bot::BotType;
use crate::task::{Schedule, ScheduledTask};

/// Identifies a task across rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub bot_type: BotType,
    pub identifier: String,
}

impl TaskKey {
    pub fn new(bot_type: BotType, identifier: impl Into<String>) -> Self {
        Self {
            bot_type,
            identifier: identifier.into(),
        }
    }

    pub fn of(task: &ScheduledTask) -> Self {
        Self::new(task.bot_type().clone(), task.identifier())
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bot_type, self.identifier)
    }
}

/// Called on every tick. Its future is awaited before the timer rearms.
pub type FireFn = Arc<dyn Fn(Arc<ScheduledTask>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives one timer per task. Scheduling a task whose key is already running replaces
/// the old timer.
pub struct TaskScheduler {
    token: CancellationToken,
    timers: DashMap<TaskKey, Timer>,
    fire: FireFn,
}

impl TaskScheduler {
    pub fn new(token: CancellationToken, fire: FireFn) -> Self {
        Self {
            token,
            timers: DashMap::new(),
            fire,
        }
    }

    pub fn schedule(&self, task: Arc<ScheduledTask>) {
        let key = TaskKey::of(&task);
        let token = self.token.child_token();
        let handle = tokio::spawn(drive(task, token.clone(), self.fire.clone()));

        if let Some(old) = self.timers.insert(key.clone(), Timer { token, handle }) {
            old.token.cancel();
            debug!(task = %key, "replaced task timer");
        } else {
            info!(task = %key, "task scheduled");
        }
    }

    /// Stops the task's timer. Returns whether one was running.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        match self.timers.remove(key) {
            Some((_, timer)) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Stops every timer and waits for them to exit.
    pub async fn shutdown(&self) {
        let keys: Vec<TaskKey> = self.timers.iter().map(|entry| entry.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, timer)) = self.timers.remove(&key) {
                timer.token.cancel();
                handles.push(timer.handle);
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("task timer panicked: {}", e);
                }
            }
        }
    }
}

async fn drive(task: Arc<ScheduledTask>, token: CancellationToken, fire: FireFn) {
    match task.schedule() {
        Schedule::Every(interval) => {
            let Some(start) = Instant::now().checked_add(*interval) else {
                error!(task = %TaskKey::of(&task), "interval out of range, task will not run");
                return;
            };
            let mut ticker = tokio::time::interval_at(start, *interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => fire(task.clone()).await,
                }
            }
        }
        Schedule::Cron(_) => loop {
            let now = Utc::now();
            let Some(next) = task.schedule().next_after(now) else {
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => fire(task.clone()).await,
            }
        },
    }

    debug!(task = %TaskKey::of(&task), "task timer stopped");
}
