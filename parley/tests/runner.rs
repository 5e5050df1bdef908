use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley::adapter::{MockBot, MockHandle};
use parley::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(3);

fn echo(bot_type: &str) -> CommandProps {
    CommandProps::builder()
        .bot_type(bot_type)
        .identifier("echo")
        .instruction("Input .echo <text>")
        .match_prefix(".echo")
        .func(|_ctx, input: Input| async move {
            let text = input.strip_prefix(".echo").unwrap_or_default().to_string();
            Ok(CommandResponse::new(text))
        })
        .build()
        .unwrap()
}

fn retry_turn() -> UserContext {
    UserContext::new(|_ctx: Context, input: Input| async move {
        if input.message() == "yes" {
            Ok(CommandResponse::new("done"))
        } else {
            Ok(CommandResponse::new("again?").with_user_context(retry_turn()))
        }
    })
}

fn retry(bot_type: &str) -> CommandProps {
    CommandProps::builder()
        .bot_type(bot_type)
        .identifier("retry")
        .instruction("Input .retry to start")
        .match_prefix(".retry")
        .func(|_ctx, _input: Input| async move {
            Ok(CommandResponse::new("continue?").with_user_context(retry_turn()))
        })
        .build()
        .unwrap()
}

struct Started {
    token: CancellationToken,
    status: StatusHandle,
    handle: JoinHandle<Result<(), RunnerError>>,
}

impl Started {
    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("runner did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(self.status.state(), RunnerState::Stopped);
    }
}

async fn start(runner: Runner) -> Started {
    let token = CancellationToken::new();
    let status = runner.status();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { runner.run(token).await }
    });

    wait_until(|| {
        let snapshot = status.snapshot();
        snapshot.state == RunnerState::Running && snapshot.bots.iter().all(|bot| bot.running)
    })
    .await;

    Started {
        token,
        status,
        handle,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn reply(handle: &mut MockHandle) -> String {
    handle
        .next_output(WAIT)
        .await
        .expect("no reply")
        .content()
        .to_string()
}

fn runner_with(registry: Registry, bot: MockBot) -> Runner {
    Runner::builder(RunnerConfig::default())
        .bot(bot)
        .registry(registry)
        .build()
        .unwrap()
}

#[tokio::test]
async fn matched_command_replies_and_unmatched_input_reaches_bot() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    let (bot, mut handle) = MockBot::new("slack");
    let started = start(runner_with(registry, bot)).await;

    handle.say("u1", ".echo hi");
    let output = handle.next_output(WAIT).await.unwrap();
    assert_eq!(output.destination().as_str(), "u1");
    assert_eq!(output.content().as_text(), Some("hi"));

    handle.say("u1", "howdy");
    wait_until(|| handle.unmatched().len() == 1).await;
    assert_eq!(handle.unmatched()[0].message(), "howdy");
    assert!(handle.next_output(Duration::from_millis(100)).await.is_none());

    started.stop().await;
}

#[tokio::test]
async fn conversation_continues_until_finished() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    registry.add_command(retry("slack")).unwrap();
    let (bot, mut handle) = MockBot::new("slack");
    let started = start(runner_with(registry, bot)).await;

    handle.say("u1", ".retry");
    assert_eq!(reply(&mut handle).await, "continue?");

    // Continuation bypasses command matching.
    handle.say("u1", ".echo no");
    assert_eq!(reply(&mut handle).await, "again?");

    handle.say("u1", "yes");
    assert_eq!(reply(&mut handle).await, "done");

    // Conversation over, ordinary matching again.
    handle.say("u1", ".echo back");
    assert_eq!(reply(&mut handle).await, "back");

    started.stop().await;
}

#[tokio::test]
async fn conversations_are_per_sender() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    registry.add_command(retry("slack")).unwrap();
    let (bot, mut handle) = MockBot::new("slack");
    let started = start(runner_with(registry, bot)).await;

    handle.say("u1", ".retry");
    assert_eq!(reply(&mut handle).await, "continue?");

    handle.say("u2", ".echo other");
    let output = handle.next_output(WAIT).await.unwrap();
    assert_eq!(output.destination().as_str(), "u2");
    assert_eq!(output.content().as_text(), Some("other"));

    handle.say("u1", "yes");
    assert_eq!(reply(&mut handle).await, "done");

    started.stop().await;
}

#[tokio::test]
async fn first_registered_match_wins() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    registry
        .add_command(
            CommandProps::builder()
                .bot_type("slack")
                .identifier("shout")
                .match_func(|input| input.message().starts_with('.'))
                .func(|_ctx, _input: Input| async move { Ok(CommandResponse::new("SHOUT")) })
                .build()
                .unwrap(),
        )
        .unwrap();
    let (bot, mut handle) = MockBot::new("slack");
    let started = start(runner_with(registry, bot)).await;

    handle.say("u1", ".echo first");
    assert_eq!(reply(&mut handle).await, "first");

    handle.say("u1", ".other");
    assert_eq!(reply(&mut handle).await, "SHOUT");

    started.stop().await;
}

#[tokio::test]
async fn help_lists_instructions_and_abort_drops_conversation() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    registry.add_command(retry("slack")).unwrap();
    let (bot, mut handle) = MockBot::new("slack");
    let started = start(runner_with(registry, bot)).await;

    handle.send(Input::help("u1", "u1"));
    let output = handle.next_output(WAIT).await.unwrap();
    match output.content() {
        OutputContent::Help(helps) => {
            let ids: Vec<_> = helps.iter().map(|h| h.identifier.as_str()).collect();
            assert_eq!(ids, vec!["echo", "retry"]);
        }
        other => panic!("unexpected content: {other:?}"),
    }

    handle.say("u1", ".retry");
    assert_eq!(reply(&mut handle).await, "continue?");

    handle.send(Input::abort("u1", "u1"));
    handle.say("u1", ".echo free");
    assert_eq!(reply(&mut handle).await, "free");

    started.stop().await;
}

#[derive(Default)]
struct RecordingAlerter {
    alerts: Arc<Mutex<Vec<BotType>>>,
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, _ctx: Context, bot_type: &BotType, _err: &BotError) -> anyhow::Result<()> {
        self.alerts.lock().push(bot_type.clone());
        Ok(())
    }
}

#[tokio::test]
async fn critical_error_stops_only_that_bot() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    registry.add_command(echo("discord")).unwrap();

    let (slack, slack_handle) = MockBot::new("slack");
    let (discord, mut discord_handle) = MockBot::new("discord");
    let alerter = RecordingAlerter::default();
    let alerts = alerter.alerts.clone();

    let runner = Runner::builder(RunnerConfig::default())
        .bot(slack)
        .bot(discord)
        .alerter(alerter)
        .registry(registry)
        .build()
        .unwrap();
    let started = start(runner).await;

    slack_handle.raise(BotError::continuable(anyhow::anyhow!("hiccup")));
    slack_handle.raise(BotError::critical(anyhow::anyhow!("connection lost")));

    let status = started.status.clone();
    wait_until(|| !status.is_bot_running(&BotType::new("slack"))).await;
    assert_eq!(*alerts.lock(), vec![BotType::new("slack")]);
    assert!(status.is_bot_running(&BotType::new("discord")));
    assert_eq!(status.state(), RunnerState::Running);

    discord_handle.say("d1", ".echo still here");
    assert_eq!(reply(&mut discord_handle).await, "still here");

    started.stop().await;
}

#[tokio::test]
async fn scheduled_task_delivers_to_default_destination() {
    let mut registry = Registry::new();
    registry
        .add_task(
            TaskProps::builder()
                .bot_type("slack")
                .identifier("tick")
                .schedule("@every 50ms")
                .default_destination("general")
                .func(|_ctx| async move {
                    Ok(vec![
                        TaskResult::new("tick"),
                        TaskResult::new("direct").to("ops"),
                    ])
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    let (bot, mut handle) = MockBot::new("slack");
    let started = start(runner_with(registry, bot)).await;

    let first = handle.next_output(WAIT).await.unwrap();
    assert_eq!(first.destination().as_str(), "general");
    assert_eq!(first.content().as_text(), Some("tick"));

    let second = handle.next_output(WAIT).await.unwrap();
    assert_eq!(second.destination().as_str(), "ops");
    assert_eq!(second.content().as_text(), Some("direct"));

    started.stop().await;
}

#[tokio::test]
async fn panicking_command_does_not_stop_workers() {
    let mut registry = Registry::new();
    registry.add_command(echo("slack")).unwrap();
    registry
        .add_command(
            CommandProps::builder()
                .bot_type("slack")
                .identifier("boom")
                .match_prefix(".boom")
                .func(|_ctx, _input: Input| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(CommandResponse::empty())
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    let mut config = RunnerConfig::default();
    config.worker.worker_num = 1;
    let (bot, mut handle) = MockBot::new("slack");
    let runner = Runner::builder(config)
        .bot(bot)
        .registry(registry)
        .build()
        .unwrap();
    let started = start(runner).await;

    handle.say("u1", ".boom");
    handle.say("u1", ".echo alive");
    assert_eq!(reply(&mut handle).await, "alive");

    started.stop().await;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct GreetConfig {
    greeting: String,
}

impl Default for GreetConfig {
    fn default() -> Self {
        Self {
            greeting: "Hello".to_string(),
        }
    }
}

#[tokio::test]
async fn configuration_change_rebuilds_command() {
    let dir = tempfile::tempdir().unwrap();
    let bot_dir = dir.path().join("slack");
    std::fs::create_dir_all(&bot_dir).unwrap();
    std::fs::write(bot_dir.join("greet.yaml"), "greeting: Hi\n").unwrap();

    let mut registry = Registry::new();
    registry
        .add_command(
            CommandProps::builder()
                .bot_type("slack")
                .identifier("greet")
                .match_prefix(".greet")
                .configurable_func(
                    GreetConfig::default(),
                    |_ctx, input: Input, config: Arc<GreetConfig>| async move {
                        let name = input.strip_prefix(".greet").unwrap_or_default().to_string();
                        Ok(CommandResponse::new(format!("{} {}", config.greeting, name)))
                    },
                )
                .build()
                .unwrap(),
        )
        .unwrap();

    let mut config = RunnerConfig::default();
    config.watcher.base_dir = Some(dir.path().to_path_buf());
    config.watcher.debounce_ms = 50;
    let (bot, mut handle) = MockBot::new("slack");
    let runner = Runner::builder(config)
        .bot(bot)
        .registry(registry)
        .build()
        .unwrap();
    let started = start(runner).await;

    handle.say("u1", ".greet ann");
    assert_eq!(reply(&mut handle).await, "Hi ann");

    std::fs::write(bot_dir.join("greet.yaml"), "greeting: Howdy\n").unwrap();

    let mut last = String::new();
    for _ in 0..50 {
        handle.say("u1", ".greet ann");
        last = reply(&mut handle).await;
        if last == "Howdy ann" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(last, "Howdy ann");

    started.stop().await;
}

#[tokio::test]
async fn invalid_schedule_fails_at_registration() {
    let err = TaskProps::builder()
        .bot_type("slack")
        .identifier("bad")
        .schedule("not a schedule")
        .func(|_ctx| async move { Ok(Vec::new()) })
        .build()
        .unwrap_err();
    assert!(matches!(err, BuildError::InvalidSchedule { .. }));
}
