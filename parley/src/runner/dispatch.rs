//! Routing of inputs and task firings onto the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bot::{Bot, BotType};
use crate::command::UserContext;
use crate::context::Context;
use crate::error::PoolError;
use crate::message::{Input, InputKind, Output, OutputContent};
use crate::observability::{MetricsSink, elapsed_ms};
use crate::registry::Registry;
use crate::scheduler::FireFn;
use crate::task::ScheduledTask;
use crate::user_context::UserContextStore;
use crate::worker::WorkerPool;

pub(crate) type BotMap = Arc<HashMap<BotType, Arc<dyn Bot>>>;

pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    contexts: Arc<UserContextStore>,
    pool: Arc<WorkerPool>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<Registry>,
        contexts: Arc<UserContextStore>,
        pool: Arc<WorkerPool>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            contexts,
            pool,
            metrics,
        }
    }

    /// Handles one input from `bot`.
    ///
    /// The sender's pending conversation is taken here, in arrival order, so that it is
    /// handed to exactly one job. Everything else runs on the pool; this only waits when
    /// the pool's queue is full.
    pub(crate) async fn accept(
        &self,
        bot: Arc<dyn Bot>,
        token: &CancellationToken,
        input: Input,
    ) -> Result<(), PoolError> {
        let bot_type = bot.bot_type();
        self.metrics
            .incr_counter("inputs_total", 1, &[("bot_type", bot_type.as_str())]);

        match input.input_kind() {
            InputKind::Abort => {
                if self.contexts.remove(input.sender_key()) {
                    debug!(
                        bot_type = %bot_type,
                        sender = input.sender_key(),
                        "conversation aborted"
                    );
                }
                Ok(())
            }
            InputKind::Help => {
                let helps = self.registry.command_set(&bot_type).helps();
                let ctx = Context::new(bot_type, token.child_token());
                let output = Output::new(input.reply_to().clone(), OutputContent::Help(helps));
                self.pool
                    .enqueue(move || async move { deliver(bot.as_ref(), ctx, output).await })
                    .await
            }
            InputKind::Message => {
                let job = Job {
                    bot,
                    ctx: Context::new(bot_type.clone(), token.child_token()),
                    pending: self.contexts.take(input.sender_key()),
                    input,
                    registry: self.registry.clone(),
                    contexts: self.contexts.clone(),
                    metrics: self.metrics.clone(),
                };
                self.pool.enqueue(move || job.run()).await
            }
        }
    }
}

/// One message on its way through a continuation or a command.
struct Job {
    bot: Arc<dyn Bot>,
    ctx: Context,
    pending: Option<UserContext>,
    input: Input,
    registry: Arc<Registry>,
    contexts: Arc<UserContextStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl Job {
    async fn run(self) {
        let Job {
            bot,
            ctx,
            pending,
            input,
            registry,
            contexts,
            metrics,
        } = self;
        let bot_type = ctx.bot_type().clone();
        let sender = input.sender_key().to_string();
        let reply_to = input.reply_to().clone();

        let started = Instant::now();
        let (command, result) = match pending {
            Some(next) => {
                debug!(bot_type = %bot_type, sender = %sender, "resuming conversation");
                ("user_context".to_string(), next.invoke(ctx.clone(), input).await)
            }
            None => match registry.command_set(&bot_type).find_first_matched(&input) {
                Some(command) => (
                    command.identifier().to_string(),
                    command.execute(ctx.clone(), input).await,
                ),
                None => {
                    if let Err(e) = bot.respond(ctx, input).await {
                        warn!(bot_type = %bot_type, sender = %sender, "respond failed: {:#}", e);
                    }
                    return;
                }
            },
        };

        let labels = [("bot_type", bot_type.as_str()), ("command", command.as_str())];
        metrics.incr_counter("commands_executed_total", 1, &labels);
        metrics.observe_duration_ms("command_duration_ms", elapsed_ms(started), &labels);

        match result {
            Ok(response) => {
                let (content, next) = response.into_parts();
                if let Some(next) = next {
                    contexts.insert(sender.clone(), next);
                }
                if let Some(content) = content {
                    deliver(bot.as_ref(), ctx, Output::new(reply_to, content)).await;
                }
            }
            Err(e) => {
                metrics.incr_counter("command_errors_total", 1, &labels);
                error!(
                    bot_type = %bot_type,
                    command = %command,
                    sender = %sender,
                    "command failed: {:#}", e
                );
            }
        }
    }
}

async fn deliver(bot: &dyn Bot, ctx: Context, output: Output) {
    let destination = output.destination().clone();
    if let Err(e) = bot.send_message(ctx, output).await {
        warn!(
            bot_type = %bot.bot_type(),
            destination = %destination,
            "failed to send message: {:#}", e
        );
    }
}

/// Enqueues every firing of a task onto the pool; the task's results go to the bot of
/// its bot type.
pub(crate) fn task_fire(
    bots: BotMap,
    pool: Arc<WorkerPool>,
    token: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) -> FireFn {
    Arc::new(move |task: Arc<ScheduledTask>| {
        let bots = bots.clone();
        let pool = pool.clone();
        let token = token.clone();
        let metrics = metrics.clone();
        async move {
            let Some(bot) = bots.get(task.bot_type()).cloned() else {
                warn!(
                    bot_type = %task.bot_type(),
                    task = task.identifier(),
                    "no bot registered for task"
                );
                return;
            };

            metrics.incr_counter("tasks_fired_total", 1, &[("task", task.identifier())]);
            let ctx = Context::new(task.bot_type().clone(), token.child_token());
            let enqueued = pool
                .enqueue(move || async move { run_task(bot.as_ref(), task, ctx).await })
                .await;
            if let Err(e) = enqueued {
                debug!("task firing dropped: {}", e);
            }
        }
        .boxed()
    })
}

async fn run_task(bot: &dyn Bot, task: Arc<ScheduledTask>, ctx: Context) {
    match task.execute(ctx.clone()).await {
        Ok(results) => {
            for output in task.outputs(results) {
                deliver(bot, ctx.clone(), output).await;
            }
        }
        Err(e) => error!(
            bot_type = %task.bot_type(),
            task = task.identifier(),
            "task failed: {:#}", e
        ),
    }
}
