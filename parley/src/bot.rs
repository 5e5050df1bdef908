use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::Context;
use crate::error::BotError;
use crate::message::{Input, Output};

/// Identifies one adapter instance or platform.
///
/// Used as the namespace key for registered commands, tasks, configuration directories
/// and watcher subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotType(String);

impl BotType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the configuration directory for this bot type.
    pub fn dir_name(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for BotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BotType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Handle a bot uses to report errors from its run loop.
#[derive(Debug, Clone)]
pub struct ErrorNotifier {
    tx: mpsc::UnboundedSender<BotError>,
}

impl ErrorNotifier {
    pub fn new(tx: mpsc::UnboundedSender<BotError>) -> Self {
        Self { tx }
    }

    /// Never blocks. Errors sent after the runner stopped are dropped.
    pub fn notify(&self, err: BotError) {
        let _ = self.tx.send(err);
    }
}

/// A chat-service adapter as seen by the runner.
///
/// Implementations own connection handling and protocol decoding; the runner only
/// consumes this surface.
#[async_trait]
pub trait Bot: Send + Sync + 'static {
    fn bot_type(&self) -> BotType;

    /// Long-lived intake loop. Must push every inbound message to `input_tx` and return
    /// promptly once `token` is cancelled.
    async fn run(
        &self,
        token: CancellationToken,
        input_tx: mpsc::Sender<Input>,
        notifier: ErrorNotifier,
    );

    /// Called for an input that resolved to neither a pending conversation nor a command.
    async fn respond(&self, ctx: Context, input: Input) -> Result<()> {
        debug!(
            bot_type = %ctx.bot_type(),
            sender = input.sender_key(),
            "no command matched input"
        );
        Ok(())
    }

    async fn send_message(&self, ctx: Context, output: Output) -> Result<()>;
}

/// Receives critical bot failures.
#[async_trait]
pub trait Alerter: Send + Sync + 'static {
    async fn alert(&self, ctx: Context, bot_type: &BotType, err: &BotError) -> Result<()>;
}
