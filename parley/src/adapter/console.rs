use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bot::{Bot, BotType, ErrorNotifier};
use crate::context::Context;
use crate::error::BotError;
use crate::message::{Input, Output};

const CONSOLE_USER: &str = "console_user";
const CONSOLE_DESTINATION: &str = "console";

/// Line-oriented bot over stdin/stdout, for running commands locally.
///
/// `.help` lists command instructions and `.abort` drops the pending conversation;
/// every other non-empty line is an ordinary message.
#[derive(Clone)]
pub struct ConsoleBot {
    bot_type: BotType,
    output_format: String,
}

impl ConsoleBot {
    pub fn new(bot_type: impl Into<BotType>) -> Self {
        Self {
            bot_type: bot_type.into(),
            output_format: "\x1b[36m[{}]\x1b[0m {}".to_string(),
        }
    }

    /// `{}` placeholders are replaced by the destination, then the content.
    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    fn parse_line(&self, line: &str) -> Option<Input> {
        let line = line.trim();
        let sender = format!("{}:{}", self.bot_type, CONSOLE_USER);
        match line {
            "" => None,
            ".help" => Some(Input::help(sender, CONSOLE_DESTINATION)),
            ".abort" => Some(Input::abort(sender, CONSOLE_DESTINATION)),
            _ => Some(Input::new(sender, line, CONSOLE_DESTINATION)),
        }
    }

    fn render(&self, output: &Output) -> String {
        self.output_format
            .replacen("{}", output.destination().as_str(), 1)
            .replacen("{}", &output.content().to_string(), 1)
    }
}

#[async_trait]
impl Bot for ConsoleBot {
    fn bot_type(&self) -> BotType {
        self.bot_type.clone()
    }

    async fn run(
        &self,
        token: CancellationToken,
        input_tx: mpsc::Sender<Input>,
        notifier: ErrorNotifier,
    ) {
        info!(bot_type = %self.bot_type, "console bot started, type something...");
        let mut reader = io::BufReader::new(io::stdin()).lines();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = reader.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    let Some(input) = self.parse_line(&line) else {
                        continue;
                    };
                    if input_tx.send(input).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!(bot_type = %self.bot_type, "stdin closed");
                    break;
                }
                Err(e) => {
                    notifier.notify(BotError::critical(e));
                    break;
                }
            }
        }
    }

    async fn respond(&self, _ctx: Context, input: Input) -> Result<()> {
        warn!(bot_type = %self.bot_type, "unknown command: {}", input.message());
        Ok(())
    }

    async fn send_message(&self, _ctx: Context, output: Output) -> Result<()> {
        println!("{}", self.render(&output));
        Ok(())
    }
}
