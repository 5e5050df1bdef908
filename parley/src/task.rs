//! Scheduled tasks: handlers fired on a timer instead of by an input.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::bot::BotType;
use crate::command::load_config;
use crate::context::Context;
use crate::error::BuildError;
use crate::message::{Destination, Output, OutputContent};
use crate::watcher::ConfigWatcher;

// ============================================================================
// Schedule
// ============================================================================

/// When a task fires.
///
/// Accepted expressions:
/// - `@every 30s`, `@every 1h30m`, `@every 250ms` (units `ms`, `s`, `m`, `h`)
/// - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`
/// - 6 or 7 field cron expressions with a leading seconds field, evaluated in UTC
#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, BuildError> {
        let expr = expr.trim();
        let invalid = |message: String| BuildError::InvalidSchedule {
            expr: expr.to_string(),
            message,
        };

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_interval(rest.trim()).map_err(invalid)?;
            if interval.is_zero() {
                return Err(invalid("interval must be greater than zero".to_string()));
            }
            if interval > MAX_INTERVAL {
                return Err(invalid("interval too large".to_string()));
            }
            return Ok(Schedule::Every(interval));
        }

        let cron_expr = match expr {
            "@hourly" => "0 0 * * * *",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@weekly" => "0 0 0 * * Sun",
            "@monthly" => "0 0 0 1 * *",
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            other => other,
        };

        cron::Schedule::from_str(cron_expr)
            .map(|schedule| Schedule::Cron(Box::new(schedule)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// Next firing strictly after `now`. `None` when a cron schedule is exhausted.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| now + d)
            }
            Schedule::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

/// Longest accepted `@every` interval (100 years). Timers add it to the current
/// instant, which must not overflow.
const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn parse_interval(value: &str) -> Result<Duration, String> {
    if value.is_empty() {
        return Err("missing interval".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit after `{}`", rest))?;
        if digits == 0 {
            return Err(format!("expected a number at `{}`", rest));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid number `{}`: {}", &rest[..digits], e))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            other => return Err(format!("unknown unit `{}`", other)),
        };
        total = total
            .checked_add(unit)
            .ok_or_else(|| "interval too large".to_string())?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

// ============================================================================
// Task results and configuration
// ============================================================================

/// One piece of content produced by a task run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub content: OutputContent,
    /// Falls back to the task's default destination when unset.
    pub destination: Option<Destination>,
}

impl TaskResult {
    pub fn new(content: impl Into<OutputContent>) -> Self {
        Self {
            content: content.into(),
            destination: None,
        }
    }

    pub fn to(mut self, destination: impl Into<Destination>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Configuration of a configurable task.
///
/// Either capability, when it returns a value, overrides what was set on the builder.
pub trait TaskConfig: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn schedule(&self) -> Option<String> {
        None
    }

    fn default_destination(&self) -> Option<Destination> {
        None
    }
}

// ============================================================================
// Built task
// ============================================================================

type TaskFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Vec<TaskResult>>> + Send + Sync>;

pub struct ScheduledTask {
    bot_type: BotType,
    identifier: String,
    schedule: Schedule,
    default_destination: Option<Destination>,
    exec: TaskFn,
}

impl ScheduledTask {
    pub fn bot_type(&self) -> &BotType {
        &self.bot_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn default_destination(&self) -> Option<&Destination> {
        self.default_destination.as_ref()
    }

    pub async fn execute(&self, ctx: Context) -> Result<Vec<TaskResult>> {
        (self.exec)(ctx).await
    }

    /// Resolves each result's destination. Results with none are logged and dropped.
    pub fn outputs(&self, results: Vec<TaskResult>) -> Vec<Output> {
        results
            .into_iter()
            .filter_map(|result| {
                match result.destination.or_else(|| self.default_destination.clone()) {
                    Some(destination) => Some(Output::new(destination, result.content)),
                    None => {
                        warn!(
                            bot_type = %self.bot_type,
                            task = %self.identifier,
                            "task result has no destination, dropping it"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("bot_type", &self.bot_type)
            .field("identifier", &self.identifier)
            .field("schedule", &self.schedule)
            .field("default_destination", &self.default_destination)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Buildable task
// ============================================================================

struct BoundTask {
    exec: TaskFn,
    schedule: Option<String>,
    default_destination: Option<Destination>,
}

type TaskBinder =
    Arc<dyn Fn(&BotType, &str, &dyn ConfigWatcher) -> Result<BoundTask, BuildError> + Send + Sync>;

/// Registered template of a scheduled task.
#[derive(Clone)]
pub struct TaskProps {
    bot_type: BotType,
    identifier: String,
    schedule: Option<String>,
    default_destination: Option<Destination>,
    binder: TaskBinder,
    configurable: bool,
}

impl TaskProps {
    pub fn builder() -> TaskPropsBuilder {
        TaskPropsBuilder::default()
    }

    pub fn bot_type(&self) -> &BotType {
        &self.bot_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_configurable(&self) -> bool {
        self.configurable
    }

    /// Builds a fresh task bound to the configuration currently on disk.
    pub fn build(&self, watcher: &dyn ConfigWatcher) -> Result<Arc<ScheduledTask>, BuildError> {
        let bound = (self.binder)(&self.bot_type, &self.identifier, watcher)?;

        let schedule = match (bound.schedule, &self.schedule) {
            // Comes from a configuration file: a bad value is a configuration error.
            (Some(expr), _) => Schedule::parse(&expr).map_err(|e| match e {
                BuildError::InvalidSchedule { expr, message } => {
                    BuildError::ConfiguredSchedule { expr, message }
                }
                other => other,
            })?,
            (None, Some(expr)) => Schedule::parse(expr)?,
            (None, None) => return Err(BuildError::InsufficientArguments("schedule")),
        };

        Ok(Arc::new(ScheduledTask {
            bot_type: self.bot_type.clone(),
            identifier: self.identifier.clone(),
            schedule,
            default_destination: bound
                .default_destination
                .or_else(|| self.default_destination.clone()),
            exec: bound.exec,
        }))
    }
}

impl fmt::Debug for TaskProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProps")
            .field("bot_type", &self.bot_type)
            .field("identifier", &self.identifier)
            .field("schedule", &self.schedule)
            .field("configurable", &self.configurable)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct TaskPropsBuilder {
    bot_type: Option<BotType>,
    identifier: Option<String>,
    schedule: Option<String>,
    default_destination: Option<Destination>,
    binder: Option<TaskBinder>,
    configurable: bool,
}

impl TaskPropsBuilder {
    pub fn bot_type(mut self, bot_type: impl Into<BotType>) -> Self {
        self.bot_type = Some(bot_type.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    pub fn default_destination(mut self, destination: impl Into<Destination>) -> Self {
        self.default_destination = Some(destination.into());
        self
    }

    pub fn func<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<TaskResult>>> + Send + 'static,
    {
        let exec: TaskFn = Arc::new(move |ctx| f(ctx).boxed());
        self.binder = Some(Arc::new(
            move |_: &BotType, _: &str, _: &dyn ConfigWatcher| -> Result<BoundTask, BuildError> {
                Ok(BoundTask {
                    exec: exec.clone(),
                    schedule: None,
                    default_destination: None,
                })
            },
        ));
        self.configurable = false;
        self
    }

    /// Executor that receives a configuration value; see
    /// [`CommandPropsBuilder::configurable_func`](crate::command::CommandPropsBuilder::configurable_func).
    pub fn configurable_func<C, F, Fut>(mut self, config: C, f: F) -> Self
    where
        C: TaskConfig,
        F: Fn(Context, Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<TaskResult>>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.binder = Some(Arc::new(
            move |bot_type: &BotType,
                  identifier: &str,
                  watcher: &dyn ConfigWatcher|
                  -> Result<BoundTask, BuildError> {
                let config = Arc::new(load_config(
                    watcher,
                    bot_type,
                    identifier,
                    config.clone(),
                )?);
                let schedule = config.schedule();
                let default_destination = config.default_destination();
                let f = f.clone();
                let exec: TaskFn = Arc::new(move |ctx| f(ctx, config.clone()).boxed());
                Ok(BoundTask {
                    exec,
                    schedule,
                    default_destination,
                })
            },
        ));
        self.configurable = true;
        self
    }

    pub fn build(self) -> Result<TaskProps, BuildError> {
        let bot_type = self
            .bot_type
            .ok_or(BuildError::InsufficientArguments("bot_type"))?;
        let identifier = self
            .identifier
            .filter(|id| !id.is_empty())
            .ok_or(BuildError::InsufficientArguments("identifier"))?;
        let binder = self
            .binder
            .ok_or(BuildError::InsufficientArguments("func"))?;

        match &self.schedule {
            Some(expr) => {
                Schedule::parse(expr)?;
            }
            // Only a configuration file can still supply one.
            None if !self.configurable => {
                return Err(BuildError::InsufficientArguments("schedule"));
            }
            None => {}
        }

        Ok(TaskProps {
            bot_type,
            identifier,
            schedule: self.schedule,
            default_destination: self.default_destination,
            binder,
            configurable: self.configurable,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::watcher::NullWatcher;

    #[test]
    fn parse_every() {
        let cases = [
            ("@every 30s", Duration::from_secs(30)),
            ("@every 1h30m", Duration::from_secs(5400)),
            ("@every 250ms", Duration::from_millis(250)),
            ("@every 2m5s", Duration::from_secs(125)),
        ];
        for (expr, expected) in cases {
            match Schedule::parse(expr).unwrap() {
                Schedule::Every(d) => assert_eq!(d, expected, "{}", expr),
                other => panic!("unexpected {:?} for {}", other, expr),
            }
        }
    }

    #[test]
    fn parse_rejects_bad_expressions() {
        for expr in [
            "@every",
            "@every 10",
            "@every 5d",
            "@every 0s",
            "@every 18446744073709551615s1s",
            "@every 18446744073709551615h",
            "@every 876001h",
            "not a cron",
        ] {
            assert!(
                matches!(
                    Schedule::parse(expr),
                    Err(BuildError::InvalidSchedule { .. })
                ),
                "{}",
                expr
            );
        }
    }

    #[test]
    fn cron_and_aliases_compute_next_fire_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap();

        let hourly = Schedule::parse("@hourly").unwrap();
        assert_eq!(
            hourly.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap())
        );

        let every_minute = Schedule::parse("0 * * * * *").unwrap();
        assert_eq!(
            every_minute.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 12, 35, 0).unwrap())
        );

        let every = Schedule::parse("@every 10s").unwrap();
        assert_eq!(
            every.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 3, 10, 12, 35, 6).unwrap())
        );
    }

    #[test]
    fn task_without_schedule_is_rejected() {
        let err = TaskProps::builder()
            .bot_type("slack")
            .identifier("heartbeat")
            .func(|_| async { Ok(vec![]) })
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientArguments("schedule")));
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct ReportConfig {
        cron: Option<String>,
        channel: Option<String>,
    }

    impl TaskConfig for ReportConfig {
        fn schedule(&self) -> Option<String> {
            self.cron.clone()
        }

        fn default_destination(&self) -> Option<Destination> {
            self.channel.clone().map(Destination::from)
        }
    }

    #[test]
    fn configurable_task_needs_schedule_at_build_time() {
        let props = TaskProps::builder()
            .bot_type("slack")
            .identifier("report")
            .configurable_func(ReportConfig::default(), |_, _| async { Ok(vec![]) })
            .build()
            .unwrap();

        let err = props.build(&NullWatcher).unwrap_err();
        assert!(matches!(err, BuildError::InsufficientArguments("schedule")));
    }

    #[test]
    fn bad_schedule_from_config_is_not_fatal() {
        let defaults = ReportConfig {
            cron: Some("@every 30 minutes".to_string()),
            channel: None,
        };
        let props = TaskProps::builder()
            .bot_type("slack")
            .identifier("report")
            .schedule("@every 1h")
            .configurable_func(defaults, |_, _| async { Ok(vec![]) })
            .build()
            .unwrap();

        let err = props.build(&NullWatcher).unwrap_err();
        assert!(matches!(err, BuildError::ConfiguredSchedule { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn config_capabilities_override_builder_values() {
        let defaults = ReportConfig {
            cron: Some("@every 5m".to_string()),
            channel: Some("C-config".to_string()),
        };
        let task = TaskProps::builder()
            .bot_type("slack")
            .identifier("report")
            .schedule("@every 1h")
            .default_destination("C-builder")
            .configurable_func(defaults, |_, config: Arc<ReportConfig>| async move {
                Ok(vec![
                    TaskResult::new(format!("via {:?}", config.channel)),
                    TaskResult::new("explicit").to("C-explicit"),
                ])
            })
            .build()
            .unwrap()
            .build(&NullWatcher)
            .unwrap();

        assert!(matches!(task.schedule(), Schedule::Every(d) if *d == Duration::from_secs(300)));
        assert_eq!(task.default_destination().map(|d| d.as_str()), Some("C-config"));

        let ctx = Context::new(BotType::new("slack"), CancellationToken::new());
        let outputs = task.outputs(task.execute(ctx).await.unwrap());
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].destination().as_str(), "C-config");
        assert_eq!(outputs[1].destination().as_str(), "C-explicit");
    }

    #[test]
    fn results_without_destination_are_dropped() {
        let task = TaskProps::builder()
            .bot_type("slack")
            .identifier("heartbeat")
            .schedule("@every 1m")
            .func(|_| async { Ok(vec![]) })
            .build()
            .unwrap()
            .build(&NullWatcher)
            .unwrap();

        let outputs = task.outputs(vec![
            TaskResult::new("lost"),
            TaskResult::new("kept").to("C1"),
        ]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].content().as_text(), Some("kept"));
    }
}
