//! The top-level orchestrator.
//!
//! A [`Runner`] owns the worker pool, the registry, the user context store and the
//! registered bots. [`Runner::run`] starts everything, blocks until the given token is
//! cancelled, then propagates cancellation and waits for every component to stop.

mod dispatch;
mod status;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bot::{Alerter, Bot, BotType, ErrorNotifier};
use crate::config::RunnerConfig;
use crate::context::Context;
use crate::error::{BotError, RunnerError};
use crate::message::Input;
use crate::observability::{MetricsSink, NoopMetrics};
use crate::registry::Registry;
use crate::scheduler::TaskScheduler;
use crate::task::ScheduledTask;
use crate::user_context::UserContextStore;
use crate::watcher::{ConfigWatcher, FileWatcher, NullWatcher};
use crate::worker::WorkerPool;

use self::dispatch::{BotMap, Dispatcher, task_fire};
pub use self::status::{BotStatus, RunnerState, Status, StatusHandle};

/// Capacity of each bot's input channel.
const INTAKE_CAPACITY: usize = 100;

// ============================================================================
// Runner Builder
// ============================================================================

/// Builder for [`Runner`].
///
/// # Example
///
/// ```ignore
/// let mut registry = Registry::new();
/// registry.add_command(echo_props)?;
///
/// let runner = Runner::builder(config)
///     .bot(ConsoleBot::new("console"))
///     .alerter(LogAlerter)
///     .registry(registry)
///     .build()?;
///
/// runner.run(token).await?;
/// ```
pub struct RunnerBuilder {
    config: RunnerConfig,
    bots: Vec<Arc<dyn Bot>>,
    alerters: Vec<Arc<dyn Alerter>>,
    registry: Registry,
    watcher: Option<Arc<dyn ConfigWatcher>>,
    metrics: Arc<dyn MetricsSink>,
}

impl RunnerBuilder {
    pub fn bot<B: Bot>(self, bot: B) -> Self {
        self.bot_arc(Arc::new(bot))
    }

    pub fn bot_arc(mut self, bot: Arc<dyn Bot>) -> Self {
        self.bots.push(bot);
        self
    }

    pub fn alerter<A: Alerter>(mut self, alerter: A) -> Self {
        self.alerters.push(Arc::new(alerter));
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Uses `watcher` instead of the one derived from the watcher configuration.
    pub fn config_watcher(mut self, watcher: Arc<dyn ConfigWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<Runner, RunnerError> {
        if self.bots.is_empty() {
            return Err(RunnerError::NoBots);
        }

        let mut seen = HashSet::new();
        for bot in &self.bots {
            let bot_type = bot.bot_type();
            if !seen.insert(bot_type.clone()) {
                return Err(RunnerError::DuplicateBot(bot_type));
            }
        }

        for bot_type in self.registry.bot_types() {
            if !seen.contains(&bot_type) {
                warn!(
                    bot_type = %bot_type,
                    "commands or tasks registered for a bot type with no bot"
                );
            }
        }

        let status = StatusHandle::new(&seen);
        Ok(Runner {
            config: self.config,
            bots: self.bots,
            alerters: self.alerters.into(),
            registry: Arc::new(self.registry),
            watcher: self.watcher,
            metrics: self.metrics,
            status,
        })
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct Runner {
    config: RunnerConfig,
    bots: Vec<Arc<dyn Bot>>,
    alerters: Arc<[Arc<dyn Alerter>]>,
    registry: Arc<Registry>,
    watcher: Option<Arc<dyn ConfigWatcher>>,
    metrics: Arc<dyn MetricsSink>,
    status: StatusHandle,
}

impl Runner {
    pub fn builder(config: RunnerConfig) -> RunnerBuilder {
        RunnerBuilder {
            config,
            bots: Vec::new(),
            alerters: Vec::new(),
            registry: Registry::new(),
            watcher: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs until `token` is cancelled.
    ///
    /// Fails early when a command or task cannot be built or the configuration watcher
    /// cannot start. After cancellation, returns once every bot, worker, timer and the
    /// watcher have stopped.
    pub async fn run(&self, token: CancellationToken) -> Result<(), RunnerError> {
        let root = token.child_token();
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        // 1. Configuration watcher
        let watcher: Arc<dyn ConfigWatcher> = match (&self.watcher, &self.config.watcher.base_dir)
        {
            (Some(watcher), _) => watcher.clone(),
            (None, Some(base_dir)) => {
                let (watcher, handle) = FileWatcher::spawn(
                    root.clone(),
                    base_dir.clone(),
                    self.config.watcher.debounce(),
                )?;
                background.push(handle);
                Arc::new(watcher)
            }
            (None, None) => {
                debug!("no configuration directory, command and task configuration is static");
                Arc::new(NullWatcher)
            }
        };

        // 2. Live commands and tasks
        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Arc<ScheduledTask>>();
        if let Err(e) = self.registry.build_all(watcher.clone(), task_tx).await {
            root.cancel();
            join_all(background).await;
            return Err(e.into());
        }

        // 3. Worker pool and conversation store
        let pool = Arc::new(WorkerPool::start(
            root.clone(),
            &self.config.worker,
            self.metrics.clone(),
        ));
        let contexts = Arc::new(UserContextStore::from_config(&self.config.user_context));
        if let Some(interval) = self.config.user_context.sweep_interval() {
            background.push(contexts.clone().spawn_sweeper(root.clone(), interval));
        }

        // 4. Task timers
        let bot_map: BotMap = Arc::new(
            self.bots
                .iter()
                .map(|bot| (bot.bot_type(), bot.clone()))
                .collect::<HashMap<_, _>>(),
        );
        let scheduler = Arc::new(TaskScheduler::new(
            root.clone(),
            task_fire(bot_map, pool.clone(), root.clone(), self.metrics.clone()),
        ));
        {
            let scheduler = scheduler.clone();
            let root = root.clone();
            background.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = root.cancelled() => break,
                        task = task_rx.recv() => match task {
                            Some(task) => scheduler.schedule(task),
                            None => break,
                        },
                    }
                }
            }));
        }

        // 5. Bots
        let dispatcher = Arc::new(Dispatcher::new(
            self.registry.clone(),
            contexts,
            pool.clone(),
            self.metrics.clone(),
        ));
        let mut bots = JoinSet::new();
        for bot in &self.bots {
            bots.spawn(supervise_bot(
                bot.clone(),
                root.child_token(),
                dispatcher.clone(),
                self.alerters.clone(),
                self.status.clone(),
            ));
        }

        self.status.set_state(RunnerState::Running);
        info!(bots = self.bots.len(), "runner started");

        root.cancelled().await;

        // 6. Drain
        self.status.set_state(RunnerState::ShuttingDown);
        info!("runner shutting down");

        while let Some(res) = bots.join_next().await {
            if let Err(e) = res {
                error!("bot supervisor failed: {}", e);
            }
        }
        pool.wait().await;
        scheduler.shutdown().await;
        join_all(background).await;

        self.status.set_state(RunnerState::Stopped);
        info!("runner stopped");
        Ok(())
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("background task failed: {}", e);
        }
    }
}

/// Runs one bot with its intake and error loops. Returns once the bot's run loop has
/// returned and both loops have stopped.
async fn supervise_bot(
    bot: Arc<dyn Bot>,
    token: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    alerters: Arc<[Arc<dyn Alerter>]>,
    status: StatusHandle,
) {
    let bot_type = bot.bot_type();
    let (input_tx, mut input_rx) = mpsc::channel::<Input>(INTAKE_CAPACITY);
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<BotError>();

    status.set_bot_running(&bot_type, true);
    info!(bot_type = %bot_type, "bot started");

    let run = {
        let bot = bot.clone();
        let token = token.clone();
        tokio::spawn(async move {
            bot.run(token, input_tx, ErrorNotifier::new(err_tx)).await;
        })
    };

    let intake = {
        let bot = bot.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    input = input_rx.recv() => match input {
                        Some(input) => input,
                        None => break,
                    },
                };
                if let Err(e) = dispatcher.accept(bot.clone(), &token, input).await {
                    debug!(bot_type = %bot.bot_type(), "input dropped: {}", e);
                    break;
                }
            }
        })
    };

    let errors = {
        let bot_type = bot_type.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let err = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    err = err_rx.recv() => match err {
                        Some(err) => err,
                        None => break,
                    },
                };
                if !err.is_critical() {
                    warn!(bot_type = %bot_type, "bot error: {}", err);
                    continue;
                }

                error!(bot_type = %bot_type, "critical bot error: {}", err);
                let ctx = Context::new(bot_type.clone(), CancellationToken::new());
                for alerter in alerters.iter() {
                    if let Err(e) = alerter.alert(ctx.clone(), &bot_type, &err).await {
                        warn!(bot_type = %bot_type, "alerter failed: {:#}", e);
                    }
                }
                token.cancel();
            }
        })
    };

    if let Err(e) = run.await {
        error!(bot_type = %bot_type, "bot run loop failed: {}", e);
    }
    status.set_bot_running(&bot_type, false);
    info!(bot_type = %bot_type, "bot stopped");

    // The run loop may return on its own; stop the intake with it.
    token.cancel();
    for handle in [intake, errors] {
        if let Err(e) = handle.await {
            error!(bot_type = %bot_type, "bot loop failed: {}", e);
        }
    }
}
