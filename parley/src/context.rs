use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bot::BotType;

/// Execution context handed to every command, continuation and task executor.
///
/// Carries the bot type the work belongs to and a cancellation token derived from the
/// runner's root token. The runtime imposes no timeout of its own; executors that need
/// one derive it with [`Context::with_timeout`].
#[derive(Debug, Clone)]
pub struct Context {
    bot_type: BotType,
    token: CancellationToken,
    // One per `with_timeout` in the lineage. Dropping the last clone stops that timer.
    timers: Vec<Arc<DropGuard>>,
}

impl Context {
    pub fn new(bot_type: BotType, token: CancellationToken) -> Self {
        Self {
            bot_type,
            token,
            timers: Vec::new(),
        }
    }

    pub fn bot_type(&self) -> &BotType {
        &self.bot_type
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the runner shuts down or a derived timeout elapses.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A child context; cancelling it leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            bot_type: self.bot_type.clone(),
            token: self.token.child_token(),
            timers: self.timers.clone(),
        }
    }

    /// A child context that cancels itself after `timeout`.
    ///
    /// The timer lives as long as the returned context or anything derived from it.
    /// Once they are all dropped it stops without cancelling the token.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let token = child.token.clone();
        let released = CancellationToken::new();
        let stop = released.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
                _ = stop.cancelled() => {}
            }
        });
        child.timers.push(Arc::new(released.drop_guard()));
        child
    }

    /// Runs `fut` until it completes or the context is cancelled.
    pub async fn run<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }
}
