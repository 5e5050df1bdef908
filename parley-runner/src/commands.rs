//! Commands and tasks bundled with the runner.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parley::prelude::*;
use serde::{Deserialize, Serialize};

/// How long an unanswered guessing game stays open.
const GUESS_TTL: Duration = Duration::from_secs(120);

pub fn register(registry: &mut Registry, bot_type: &str) -> Result<(), BuildError> {
    registry.add_command(echo(bot_type)?)?;
    registry.add_command(greet(bot_type)?)?;
    registry.add_command(guess(bot_type)?)?;
    registry.add_task(heartbeat(bot_type)?)?;
    Ok(())
}

fn echo(bot_type: &str) -> Result<CommandProps, BuildError> {
    CommandProps::builder()
        .bot_type(bot_type)
        .identifier("echo")
        .instruction("Input .echo <text> to get the same text back")
        .match_prefix(".echo")
        .func(|_ctx, input: Input| async move {
            let text = input.strip_prefix(".echo").unwrap_or_default();
            if text.is_empty() {
                return Ok(CommandResponse::empty());
            }
            Ok(CommandResponse::new(text.to_string()))
        })
        .build()
}

// ============================================================================
// Greeting (configurable)
// ============================================================================

/// Read from `<base_dir>/<bot_type>/greet.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreetConfig {
    pub greeting: String,
    pub signature: Option<String>,
}

impl Default for GreetConfig {
    fn default() -> Self {
        Self {
            greeting: "Hello".to_string(),
            signature: None,
        }
    }
}

fn greet(bot_type: &str) -> Result<CommandProps, BuildError> {
    CommandProps::builder()
        .bot_type(bot_type)
        .identifier("greet")
        .instruction("Input .greet <name> to be greeted")
        .match_prefix(".greet")
        .configurable_func(
            GreetConfig::default(),
            |_ctx, input: Input, config: Arc<GreetConfig>| async move {
                let name = match input.strip_prefix(".greet") {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => "stranger".to_string(),
                };
                let mut text = format!("{}, {}!", config.greeting, name);
                if let Some(signature) = &config.signature {
                    text.push_str(&format!("\n-- {signature}"));
                }
                Ok(CommandResponse::new(text))
            },
        )
        .build()
}

// ============================================================================
// Guessing game (multi-turn)
// ============================================================================

fn guess(bot_type: &str) -> Result<CommandProps, BuildError> {
    CommandProps::builder()
        .bot_type(bot_type)
        .identifier("guess")
        .instruction("Input .guess to play a number guessing game, .abort to give up")
        .match_prefix(".guess")
        .func(|_ctx, _input: Input| async move {
            let answer = Utc::now().timestamp_subsec_nanos() % 100 + 1;
            Ok(CommandResponse::new("I picked a number between 1 and 100. Your guess?")
                .with_user_context(guess_turn(answer, 0)))
        })
        .build()
}

fn guess_turn(answer: u32, tries: u32) -> UserContext {
    UserContext::new(move |_ctx: Context, input: Input| async move {
        let Ok(guess) = input.message().trim().parse::<u32>() else {
            return Ok(CommandResponse::new("Please enter a number between 1 and 100.")
                .with_user_context(guess_turn(answer, tries)));
        };

        let tries = tries + 1;
        let hint = match guess.cmp(&answer) {
            Ordering::Less => "bigger",
            Ordering::Greater => "smaller",
            Ordering::Equal => {
                return Ok(CommandResponse::new(format!(
                    "Correct! It was {answer}, you needed {tries} tries."
                )));
            }
        };
        Ok(CommandResponse::new(format!("Try {hint}."))
            .with_user_context(guess_turn(answer, tries)))
    })
    .with_ttl(GUESS_TTL)
}

// ============================================================================
// Heartbeat (configurable task)
// ============================================================================

/// Read from `<base_dir>/<bot_type>/heartbeat.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub schedule: Option<String>,
    pub destination: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            schedule: Some("@every 1h".to_string()),
            destination: Some("console".to_string()),
        }
    }
}

impl TaskConfig for HeartbeatConfig {
    fn schedule(&self) -> Option<String> {
        self.schedule.clone()
    }

    fn default_destination(&self) -> Option<Destination> {
        self.destination.clone().map(Destination::new)
    }
}

fn heartbeat(bot_type: &str) -> Result<TaskProps, BuildError> {
    let beats = Arc::new(AtomicU64::new(0));
    TaskProps::builder()
        .bot_type(bot_type)
        .identifier("heartbeat")
        .configurable_func(
            HeartbeatConfig::default(),
            move |_ctx, _config: Arc<HeartbeatConfig>| {
                let beat = beats.fetch_add(1, AtomicOrdering::Relaxed) + 1;
                async move {
                    Ok(vec![TaskResult::new(format!(
                        "heartbeat #{beat} at {}",
                        Utc::now().format("%H:%M:%S")
                    ))])
                }
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_commands_register() {
        let mut registry = Registry::new();
        register(&mut registry, "console").unwrap();
        assert_eq!(registry.bot_types(), vec![BotType::new("console")]);
    }

    #[test]
    fn heartbeat_defaults_carry_schedule_and_destination() {
        let config = HeartbeatConfig::default();
        assert_eq!(TaskConfig::schedule(&config).as_deref(), Some("@every 1h"));
        assert_eq!(
            config.default_destination(),
            Some(Destination::new("console"))
        );
    }
}
