//! Commands: matched-and-executed handlers for inbound text.
//!
//! A [`CommandProps`] is the registered template; building it against a
//! [`ConfigWatcher`] binds the latest configuration into a concrete [`Command`]. The live
//! commands of one bot type sit in a [`CommandSet`], an ordered snapshot that is swapped,
//! never mutated, when a command is rebuilt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bot::BotType;
use crate::context::Context;
use crate::error::{BuildError, WatchError};
use crate::message::{CommandHelp, Input, OutputContent};
use crate::watcher::ConfigWatcher;

// ============================================================================
// Responses and conversations
// ============================================================================

/// The stored "next step" of a conversation. Invoked at most once.
pub type Continuation =
    Box<dyn FnOnce(Context, Input) -> BoxFuture<'static, Result<CommandResponse>> + Send + Sync>;

/// Routes the sender's next input straight to a continuation, bypassing command matching.
pub struct UserContext {
    next: Continuation,
    ttl: Option<Duration>,
}

impl UserContext {
    pub fn new<F, Fut>(next: F) -> Self
    where
        F: FnOnce(Context, Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandResponse>> + Send + 'static,
    {
        Self {
            next: Box::new(move |ctx, input| next(ctx, input).boxed()),
            ttl: None,
        }
    }

    /// Overrides the store-wide TTL for this conversation step.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub async fn invoke(self, ctx: Context, input: Input) -> Result<CommandResponse> {
        (self.next)(ctx, input).await
    }
}

impl fmt::Debug for UserContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserContext")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// What a command or continuation hands back to the runner.
#[derive(Debug, Default)]
pub struct CommandResponse {
    content: Option<OutputContent>,
    user_context: Option<UserContext>,
}

impl CommandResponse {
    pub fn new(content: impl Into<OutputContent>) -> Self {
        Self {
            content: Some(content.into()),
            user_context: None,
        }
    }

    /// A response that sends nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Keeps the conversation open: the sender's next input goes to `user_context`.
    pub fn with_user_context(mut self, user_context: UserContext) -> Self {
        self.user_context = Some(user_context);
        self
    }

    pub fn content(&self) -> Option<&OutputContent> {
        self.content.as_ref()
    }

    pub fn user_context(&self) -> Option<&UserContext> {
        self.user_context.as_ref()
    }

    pub fn into_parts(self) -> (Option<OutputContent>, Option<UserContext>) {
        (self.content, self.user_context)
    }
}

// ============================================================================
// Command trait
// ============================================================================

#[async_trait]
pub trait Command: Send + Sync + 'static {
    /// Unique within the command's bot type.
    fn identifier(&self) -> &str;

    /// Human-readable usage, listed by help. Empty hides the command from help.
    fn instruction(&self) -> &str {
        ""
    }

    fn matches(&self, input: &Input) -> bool;

    async fn execute(&self, ctx: Context, input: Input) -> Result<CommandResponse>;
}

/// Decides whether a command handles an input.
#[derive(Clone)]
pub enum Matcher {
    /// The first token of the message equals the prefix.
    Prefix(String),
    Pattern(Regex),
    Func(Arc<dyn Fn(&Input) -> bool + Send + Sync>),
}

impl Matcher {
    pub fn matches(&self, input: &Input) -> bool {
        match self {
            Matcher::Prefix(prefix) => input.strip_prefix(prefix).is_some(),
            Matcher::Pattern(re) => re.is_match(input.message()),
            Matcher::Func(f) => f(input),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Prefix(prefix) => f.debug_tuple("Prefix").field(prefix).finish(),
            Matcher::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Matcher::Func(_) => f.write_str("Func(..)"),
        }
    }
}

// ============================================================================
// Live command set
// ============================================================================

pub type CommandList = Arc<[Arc<dyn Command>]>;

/// The ordered live commands of one bot type.
///
/// Readers take a snapshot; writers build a new list and swap it in, so a dispatch that
/// already holds a snapshot keeps the instances it started with.
pub struct CommandSet {
    bot_type: BotType,
    commands: RwLock<CommandList>,
}

impl CommandSet {
    pub fn new(bot_type: BotType) -> Self {
        Self {
            bot_type,
            commands: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn bot_type(&self) -> &BotType {
        &self.bot_type
    }

    pub fn snapshot(&self) -> CommandList {
        self.commands.read().clone()
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First command, in registration order, whose matcher accepts the input.
    pub fn find_first_matched(&self, input: &Input) -> Option<Arc<dyn Command>> {
        self.snapshot()
            .iter()
            .find(|command| command.matches(input))
            .cloned()
    }

    pub fn helps(&self) -> Vec<CommandHelp> {
        self.snapshot()
            .iter()
            .filter(|command| !command.instruction().is_empty())
            .map(|command| CommandHelp {
                identifier: command.identifier().to_string(),
                instruction: command.instruction().to_string(),
            })
            .collect()
    }

    pub fn push(&self, command: Arc<dyn Command>) {
        let mut guard = self.commands.write();
        let mut list: Vec<_> = guard.iter().cloned().collect();
        list.push(command);
        *guard = Arc::from(list);
    }

    /// Swaps in the list `f` derives from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&[Arc<dyn Command>]) -> Vec<Arc<dyn Command>>,
    {
        let mut guard = self.commands.write();
        let list = f(&guard);
        *guard = Arc::from(list);
    }
}

impl fmt::Debug for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self
            .snapshot()
            .iter()
            .map(|c| c.identifier().to_string())
            .collect();
        f.debug_struct("CommandSet")
            .field("bot_type", &self.bot_type)
            .field("commands", &ids)
            .finish()
    }
}

// ============================================================================
// Buildable command
// ============================================================================

type CommandFn =
    Arc<dyn Fn(Context, Input) -> BoxFuture<'static, Result<CommandResponse>> + Send + Sync>;

type CommandBinder =
    Arc<dyn Fn(&BotType, &str, &dyn ConfigWatcher) -> Result<CommandFn, BuildError> + Send + Sync>;

/// Reads the configuration for `bot_type`/`identifier` on top of `config`.
/// A missing file keeps `config` as is.
pub(crate) fn load_config<C>(
    watcher: &dyn ConfigWatcher,
    bot_type: &BotType,
    identifier: &str,
    mut config: C,
) -> Result<C, WatchError>
where
    C: Serialize + DeserializeOwned + Send,
{
    match watcher.read(bot_type, identifier, &mut config) {
        Ok(()) => Ok(config),
        Err(e) if e.is_not_found() => Ok(config),
        Err(e) => Err(e),
    }
}

/// Registered template of a command.
#[derive(Clone)]
pub struct CommandProps {
    bot_type: BotType,
    identifier: String,
    instruction: String,
    matcher: Matcher,
    binder: CommandBinder,
    configurable: bool,
}

impl CommandProps {
    pub fn builder() -> CommandPropsBuilder {
        CommandPropsBuilder::default()
    }

    pub fn bot_type(&self) -> &BotType {
        &self.bot_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Whether the command reads a configuration file and should be rebuilt when it
    /// changes.
    pub fn is_configurable(&self) -> bool {
        self.configurable
    }

    /// Builds a fresh command bound to the configuration currently on disk.
    pub fn build(&self, watcher: &dyn ConfigWatcher) -> Result<Arc<dyn Command>, BuildError> {
        let exec = (self.binder)(&self.bot_type, &self.identifier, watcher)?;
        Ok(Arc::new(BuiltCommand {
            identifier: self.identifier.clone(),
            instruction: self.instruction.clone(),
            matcher: self.matcher.clone(),
            exec,
        }))
    }
}

impl fmt::Debug for CommandProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProps")
            .field("bot_type", &self.bot_type)
            .field("identifier", &self.identifier)
            .field("matcher", &self.matcher)
            .field("configurable", &self.configurable)
            .finish_non_exhaustive()
    }
}

/// Builder for [`CommandProps`].
///
/// ```ignore
/// let props = CommandProps::builder()
///     .bot_type("slack")
///     .identifier("echo")
///     .instruction("Input .echo <text>")
///     .match_prefix(".echo")
///     .func(|_ctx, input| async move {
///         let text = input.strip_prefix(".echo").unwrap_or_default().to_string();
///         Ok(CommandResponse::new(text))
///     })
///     .build()?;
/// ```
#[derive(Default)]
pub struct CommandPropsBuilder {
    bot_type: Option<BotType>,
    identifier: Option<String>,
    instruction: String,
    matcher: Option<Matcher>,
    binder: Option<CommandBinder>,
    configurable: bool,
}

impl CommandPropsBuilder {
    pub fn bot_type(mut self, bot_type: impl Into<BotType>) -> Self {
        self.bot_type = Some(bot_type.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn match_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.matcher = Some(Matcher::Prefix(prefix.into()));
        self
    }

    pub fn match_pattern(mut self, pattern: Regex) -> Self {
        self.matcher = Some(Matcher::Pattern(pattern));
        self
    }

    pub fn match_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&Input) -> bool + Send + Sync + 'static,
    {
        self.matcher = Some(Matcher::Func(Arc::new(f)));
        self
    }

    /// Executor without configuration.
    pub fn func<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandResponse>> + Send + 'static,
    {
        let exec: CommandFn = Arc::new(move |ctx, input| f(ctx, input).boxed());
        self.binder = Some(Arc::new(
            move |_: &BotType, _: &str, _: &dyn ConfigWatcher| -> Result<CommandFn, BuildError> {
                Ok(exec.clone())
            },
        ));
        self.configurable = false;
        self
    }

    /// Executor that receives a configuration value.
    ///
    /// `config` holds the defaults. Every build decodes the configuration file on top of
    /// a fresh clone of them; the resulting value is shared read-only with every
    /// invocation of that build.
    pub fn configurable_func<C, F, Fut>(mut self, config: C, f: F) -> Self
    where
        C: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: Fn(Context, Input, Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandResponse>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.binder = Some(Arc::new(
            move |bot_type: &BotType,
                  identifier: &str,
                  watcher: &dyn ConfigWatcher|
                  -> Result<CommandFn, BuildError> {
            let config = Arc::new(load_config(
                watcher,
                bot_type,
                identifier,
                config.clone(),
            )?);
            let f = f.clone();
            let exec: CommandFn =
                Arc::new(move |ctx, input| f(ctx, input, config.clone()).boxed());
            Ok(exec)
        },
        ));
        self.configurable = true;
        self
    }

    pub fn build(self) -> Result<CommandProps, BuildError> {
        let bot_type = self
            .bot_type
            .ok_or(BuildError::InsufficientArguments("bot_type"))?;
        let identifier = self
            .identifier
            .filter(|id| !id.is_empty())
            .ok_or(BuildError::InsufficientArguments("identifier"))?;
        let matcher = self
            .matcher
            .ok_or(BuildError::InsufficientArguments("matcher"))?;
        let binder = self
            .binder
            .ok_or(BuildError::InsufficientArguments("func"))?;

        Ok(CommandProps {
            bot_type,
            identifier,
            instruction: self.instruction,
            matcher,
            binder,
            configurable: self.configurable,
        })
    }
}

struct BuiltCommand {
    identifier: String,
    instruction: String,
    matcher: Matcher,
    exec: CommandFn,
}

#[async_trait]
impl Command for BuiltCommand {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn matches(&self, input: &Input) -> bool {
        self.matcher.matches(input)
    }

    async fn execute(&self, ctx: Context, input: Input) -> Result<CommandResponse> {
        (self.exec)(ctx, input).await
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::watcher::{ConfigDestination, NullWatcher, WatchCallback};

    fn ctx() -> Context {
        Context::new(BotType::new("slack"), CancellationToken::new())
    }

    fn echo() -> CommandProps {
        CommandProps::builder()
            .bot_type("slack")
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

    fn fixed(id: &str, reply: &'static str, matcher: Matcher) -> Arc<dyn Command> {
        Arc::new(BuiltCommand {
            identifier: id.to_string(),
            instruction: String::new(),
            matcher,
            exec: Arc::new(move |_: Context, _: Input| {
                async move { Ok(CommandResponse::new(reply)) }.boxed()
            }),
        })
    }

    /// Serves a fixed value for every identifier.
    struct StaticWatcher(serde_json::Value);

    #[async_trait]
    impl ConfigWatcher for StaticWatcher {
        fn read(
            &self,
            _bot_type: &BotType,
            _identifier: &str,
            dest: &mut dyn ConfigDestination,
        ) -> Result<(), WatchError> {
            dest.overlay(self.0.clone())
                .map_err(|e| WatchError::Decode {
                    path: "static".into(),
                    message: e.to_string(),
                })
        }

        async fn watch(
            &self,
            _bot_type: &BotType,
            _identifier: &str,
            _callback: WatchCallback,
        ) -> Result<(), WatchError> {
            Ok(())
        }

        async fn unwatch(&self, _bot_type: &BotType) -> Result<(), WatchError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WeatherConfig {
        api_key: String,
        units: String,
    }

    fn weather() -> CommandProps {
        CommandProps::builder()
            .bot_type("slack")
            .identifier("weather")
            .match_prefix(".weather")
            .configurable_func(
                WeatherConfig {
                    api_key: "none".to_string(),
                    units: "metric".to_string(),
                },
                |_ctx, _input, config: Arc<WeatherConfig>| async move {
                    Ok(CommandResponse::new(format!(
                        "{}/{}",
                        config.api_key, config.units
                    )))
                },
            )
            .build()
            .unwrap()
    }

    #[test]
    fn builder_reports_missing_arguments() {
        let err = CommandProps::builder()
            .identifier("echo")
            .match_prefix(".echo")
            .func(|_, _| async { Ok(CommandResponse::empty()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientArguments("bot_type")));

        let err = CommandProps::builder()
            .bot_type("slack")
            .match_prefix(".echo")
            .func(|_, _| async { Ok(CommandResponse::empty()) })
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientArguments("identifier")));

        let err = CommandProps::builder()
            .bot_type("slack")
            .identifier("echo")
            .match_prefix(".echo")
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InsufficientArguments("func")));
        assert!(err.is_fatal());
    }

    #[test]
    fn matcher_kinds() {
        let input = Input::new("slack:U1", ".weather tokyo", "C1");

        assert!(Matcher::Prefix(".weather".into()).matches(&input));
        assert!(!Matcher::Prefix(".w".into()).matches(&input));
        assert!(Matcher::Pattern(Regex::new(r"^\.weather\s+\w+$").unwrap()).matches(&input));
        assert!(Matcher::Func(Arc::new(|i: &Input| i.message().contains("tokyo"))).matches(&input));
    }

    #[tokio::test]
    async fn built_command_executes() {
        let command = echo().build(&NullWatcher).unwrap();
        let input = Input::new("slack:U1", ".echo hi", "C1");

        assert!(command.matches(&input));
        assert!(!command.matches(&Input::new("slack:U1", "howdy", "C1")));

        let response = command.execute(ctx(), input).await.unwrap();
        assert_eq!(response.content().and_then(|c| c.as_text()), Some("hi"));
        assert!(response.user_context().is_none());
    }

    #[tokio::test]
    async fn missing_config_keeps_defaults() {
        let command = weather().build(&NullWatcher).unwrap();
        let response = command
            .execute(ctx(), Input::new("slack:U1", ".weather", "C1"))
            .await
            .unwrap();
        assert_eq!(response.content().unwrap().to_string(), "none/metric");
    }

    #[tokio::test]
    async fn config_overlays_defaults_per_build() {
        let props = weather();
        let first = props
            .build(&StaticWatcher(json!({ "api_key": "k1" })))
            .unwrap();
        let second = props
            .build(&StaticWatcher(json!({ "api_key": "k2", "units": "imperial" })))
            .unwrap();

        let input = Input::new("slack:U1", ".weather", "C1");
        let a = first.execute(ctx(), input.clone()).await.unwrap();
        let b = second.execute(ctx(), input).await.unwrap();

        // The earlier build still sees its own configuration.
        assert_eq!(a.content().unwrap().to_string(), "k1/metric");
        assert_eq!(b.content().unwrap().to_string(), "k2/imperial");
    }

    #[test]
    fn undecodable_config_fails_the_build() {
        let err = weather()
            .build(&StaticWatcher(json!({ "api_key": 42 })))
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::Config(WatchError::Decode { .. })));
        assert!(!err.is_fatal());
    }

    #[test]
    fn first_match_wins_in_registration_order() {
        let set = CommandSet::new(BotType::new("slack"));
        set.push(fixed("first", "1", Matcher::Pattern(Regex::new("hello").unwrap())));
        set.push(fixed("second", "2", Matcher::Prefix("hello".into())));

        let found = set
            .find_first_matched(&Input::new("slack:U1", "hello there", "C1"))
            .unwrap();
        assert_eq!(found.identifier(), "first");
        assert!(
            set.find_first_matched(&Input::new("slack:U1", "bye", "C1"))
                .is_none()
        );
    }

    #[test]
    fn update_leaves_old_snapshots_intact() {
        let set = CommandSet::new(BotType::new("slack"));
        set.push(fixed("a", "1", Matcher::Prefix("a".into())));
        set.push(fixed("b", "2", Matcher::Prefix("b".into())));

        let before = set.snapshot();
        set.update(|current| {
            let mut list = current.to_vec();
            list[0] = fixed("a", "3", Matcher::Prefix("x".into()));
            list
        });

        let ids: Vec<_> = set
            .snapshot()
            .iter()
            .map(|c| c.identifier().to_string())
            .collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(before[0].matches(&Input::new("slack:U1", "a", "C1")));
        assert!(!set.snapshot()[0].matches(&Input::new("slack:U1", "a", "C1")));
    }

    #[test]
    fn helps_skip_commands_without_instruction() {
        let set = CommandSet::new(BotType::new("slack"));
        set.push(echo().build(&NullWatcher).unwrap());
        set.push(fixed("hidden", "x", Matcher::Prefix(".hidden".into())));

        let helps = set.helps();
        assert_eq!(helps.len(), 1);
        assert_eq!(helps[0].identifier, "echo");
        assert_eq!(helps[0].instruction, "Input .echo <text>");
    }

    #[tokio::test]
    async fn user_context_invokes_continuation() {
        let uc = UserContext::new(|_ctx, input: Input| async move {
            Ok(CommandResponse::new(format!("retry: {}", input.message())))
        })
        .with_ttl(Duration::from_secs(5));
        assert_eq!(uc.ttl(), Some(Duration::from_secs(5)));

        let response = uc
            .invoke(ctx(), Input::new("slack:U1", "again", "C1"))
            .await
            .unwrap();
        assert_eq!(response.content().unwrap().to_string(), "retry: again");
    }
}
