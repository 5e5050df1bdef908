use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bot::{Bot, BotType, ErrorNotifier};
use crate::context::Context;
use crate::error::BotError;
use crate::message::{Input, Output};

/// In-memory bot for tests.
///
/// Inputs and errors are pushed through the paired [`MockHandle`]; outputs the runner
/// sends come back out of it.
pub struct MockBot {
    bot_type: BotType,
    inputs: Mutex<Option<mpsc::UnboundedReceiver<Input>>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<BotError>>>,
    outputs: mpsc::UnboundedSender<Output>,
    unmatched: Arc<Mutex<Vec<Input>>>,
}

pub struct MockHandle {
    inputs: mpsc::UnboundedSender<Input>,
    errors: mpsc::UnboundedSender<BotError>,
    outputs: mpsc::UnboundedReceiver<Output>,
    unmatched: Arc<Mutex<Vec<Input>>>,
}

impl MockBot {
    pub fn new(bot_type: impl Into<BotType>) -> (Self, MockHandle) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let unmatched = Arc::new(Mutex::new(Vec::new()));

        let bot = Self {
            bot_type: bot_type.into(),
            inputs: Mutex::new(Some(input_rx)),
            errors: Mutex::new(Some(error_rx)),
            outputs: output_tx,
            unmatched: unmatched.clone(),
        };
        let handle = MockHandle {
            inputs: input_tx,
            errors: error_tx,
            outputs: output_rx,
            unmatched,
        };
        (bot, handle)
    }
}

#[async_trait]
impl Bot for MockBot {
    fn bot_type(&self) -> BotType {
        self.bot_type.clone()
    }

    async fn run(
        &self,
        token: CancellationToken,
        input_tx: mpsc::Sender<Input>,
        notifier: ErrorNotifier,
    ) {
        let inputs = self.inputs.lock().take();
        let errors = self.errors.lock().take();
        // A second run after the first one consumed the channels just idles.
        let (Some(mut inputs), Some(mut errors)) = (inputs, errors) else {
            token.cancelled().await;
            return;
        };

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(err) = errors.recv() => notifier.notify(err),
                Some(input) = inputs.recv() => {
                    if input_tx.send(input).await.is_err() {
                        break;
                    }
                }
                else => {
                    token.cancelled().await;
                    break;
                }
            }
        }
    }

    async fn respond(&self, _ctx: Context, input: Input) -> Result<()> {
        self.unmatched.lock().push(input);
        Ok(())
    }

    async fn send_message(&self, _ctx: Context, output: Output) -> Result<()> {
        self.outputs.send(output)?;
        Ok(())
    }
}

impl MockHandle {
    /// Delivers an ordinary message from `sender_key`, replying to `sender_key`.
    pub fn say(&self, sender_key: &str, message: &str) {
        self.send(Input::new(sender_key, message, sender_key));
    }

    pub fn send(&self, input: Input) {
        let _ = self.inputs.send(input);
    }

    pub fn raise(&self, err: BotError) {
        let _ = self.errors.send(err);
    }

    /// Next output the runner sent, waiting at most `timeout`.
    pub async fn next_output(&mut self, timeout: Duration) -> Option<Output> {
        tokio::time::timeout(timeout, self.outputs.recv())
            .await
            .ok()
            .flatten()
    }

    /// Inputs that reached [`Bot::respond`] because nothing handled them.
    pub fn unmatched(&self) -> Vec<Input> {
        self.unmatched.lock().clone()
    }
}
