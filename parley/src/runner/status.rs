use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::bot::BotType;

/// Runner lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Built, `run` not called yet.
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotStatus {
    pub bot_type: BotType,
    /// Whether the bot's run loop is alive.
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub state: RunnerState,
    pub bots: Vec<BotStatus>,
}

struct Inner {
    state: RunnerState,
    bots: BTreeMap<BotType, bool>,
}

/// Cheap, cloneable view of a runner's health.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<Inner>>,
}

impl StatusHandle {
    pub(crate) fn new<'a>(bot_types: impl IntoIterator<Item = &'a BotType>) -> Self {
        let bots = bot_types
            .into_iter()
            .map(|bot_type| (bot_type.clone(), false))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: RunnerState::Idle,
                bots,
            })),
        }
    }

    pub fn snapshot(&self) -> Status {
        let inner = self.inner.read();
        Status {
            state: inner.state,
            bots: inner
                .bots
                .iter()
                .map(|(bot_type, running)| BotStatus {
                    bot_type: bot_type.clone(),
                    running: *running,
                })
                .collect(),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.inner.read().state
    }

    pub fn is_bot_running(&self, bot_type: &BotType) -> bool {
        self.inner.read().bots.get(bot_type).copied().unwrap_or(false)
    }

    pub(crate) fn set_state(&self, state: RunnerState) {
        self.inner.write().state = state;
    }

    pub(crate) fn set_bot_running(&self, bot_type: &BotType, running: bool) {
        self.inner.write().bots.insert(bot_type.clone(), running);
    }
}
