//! Command dispatch: maps triggers to handler records and runs them.
//!
//! A trigger is either a prefix command name (`!ping`) or an interaction id.
//! Each matching handler runs with a fresh [`HandlerContext`] carrying a
//! self-only [`CapabilityToken`]. Handler errors and panics are caught per
//! handler and never reach other handlers or later events.

mod handler;

pub use handler::{
    CapabilityToken, CommandHandler, HandlerContext, Permission, handler_fn,
};

use crate::connection::ActionSink;
use crate::error::dispatch::{DispatchError, HandlerError};
use crate::queue::{EventConsumer, InboundEvent};

use common::ErrorLocation;

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PREFIX: &str = "!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TriggerKind {
    Prefix,
    Interaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Trigger {
    Command(String),
    Interaction(String),
}

/// Registration record for a handler.
#[derive(Debug, Clone)]
pub struct Command {
    name: String,
    kind: TriggerKind,
    permission: Permission,
    aliases: Vec<String>,
    cooldown: Duration,
    description: String,
    usage: String,
}

impl Command {
    /// Prefix command matched by name (case-insensitive).
    pub fn prefix(name: impl Into<String>) -> Self {
        Self::new(name.into().to_lowercase(), TriggerKind::Prefix)
    }

    /// Interaction matched by exact id.
    pub fn interaction(id: impl Into<String>) -> Self {
        Self::new(id.into(), TriggerKind::Interaction)
    }

    fn new(name: String, kind: TriggerKind) -> Self {
        Self {
            name,
            kind,
            permission: Permission::SelfOnly,
            aliases: Vec::new(),
            cooldown: Duration::ZERO,
            description: String::new(),
            usage: String::new(),
        }
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into().to_lowercase());
        self
    }

    /// Minimum time between two runs for the same author.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn triggers(&self) -> Vec<Trigger> {
        match self.kind {
            TriggerKind::Prefix => std::iter::once(&self.name)
                .chain(&self.aliases)
                .map(|name| Trigger::Command(name.clone()))
                .collect(),
            TriggerKind::Interaction => vec![Trigger::Interaction(self.name.clone())],
        }
    }
}

/// Entry of [`CommandDispatcher::command_list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub name: String,
    pub kind: TriggerKind,
    pub permission: Permission,
    pub aliases: Vec<String>,
    pub description: String,
    pub usage: String,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub total_uses: u64,
    pub failures: u64,
    pub unique_users: usize,
    pub last_used: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events_seen: u64,
    pub events_dispatched: u64,
    pub handler_runs: u64,
    pub handler_failures: u64,
    pub cooldown_skips: u64,
}

/// Counts for a single [`CommandDispatcher::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub matched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct UsageState {
    last_used_by: HashMap<String, Instant>,
    users: HashSet<String>,
    total_uses: u64,
    failures: u64,
    last_used: Option<SystemTime>,
}

struct HandlerRecord {
    command: Command,
    handler: Arc<dyn CommandHandler>,
    usage: Mutex<UsageState>,
}

#[derive(Default)]
struct Registry {
    /// Registration order, used for invocation order.
    order: Vec<String>,
    records: HashMap<String, Arc<HandlerRecord>>,
    triggers: HashMap<Trigger, Vec<String>>,
}

#[derive(Default)]
struct Counters {
    events_seen: AtomicU64,
    events_dispatched: AtomicU64,
    handler_runs: AtomicU64,
    handler_failures: AtomicU64,
    cooldown_skips: AtomicU64,
}

pub struct CommandDispatcher {
    account_id: String,
    prefix: RwLock<String>,
    registry: RwLock<Registry>,
    actions: Arc<dyn ActionSink>,
    counters: Counters,
}

impl CommandDispatcher {
    /// `account_id` is the bot's own account; prefix commands from other
    /// authors are ignored. An empty id accepts every author.
    pub fn new(
        account_id: impl Into<String>,
        prefix: impl Into<String>,
        actions: Arc<dyn ActionSink>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            prefix: RwLock::new(prefix.into()),
            registry: RwLock::new(Registry::default()),
            actions,
            counters: Counters::default(),
        }
    }

    pub fn prefix(&self) -> String {
        read(&self.prefix).clone()
    }

    pub fn set_prefix(&self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        info!("Command prefix set to '{prefix}'");
        *write(&self.prefix) = prefix;
    }

    /// Register `handler` under `command`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::PermissionDenied`] for anything broader than
    ///   [`Permission::SelfOnly`]
    /// - [`DispatchError::DuplicateTrigger`] if another command already has
    ///   this name, whatever its kind
    ///
    /// Aliases may share a trigger with other commands; every command bound
    /// to a trigger runs, in registration order. A command is bound to each
    /// of its own triggers once.
    #[track_caller]
    pub fn register(
        &self,
        command: Command,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), DispatchError> {
        if command.permission != Permission::SelfOnly {
            warn!(
                "Refusing handler '{}' with permission '{}'",
                command.name, command.permission
            );
            return Err(DispatchError::PermissionDenied {
                handler: command.name,
                permission: command.permission.to_string(),
                location: ErrorLocation::from(Location::caller()),
            });
        }

        let mut registry = write(&self.registry);

        if registry.records.contains_key(&command.name) {
            return Err(DispatchError::DuplicateTrigger {
                trigger: command.name.clone(),
                handler: command.name,
                location: ErrorLocation::from(Location::caller()),
            });
        }

        for trigger in command.triggers() {
            let names = registry.triggers.entry(trigger).or_default();
            if !names.contains(&command.name) {
                names.push(command.name.clone());
            }
        }

        info!("Registered command: {}", command.name);
        registry.order.push(command.name.clone());
        registry.records.insert(
            command.name.clone(),
            Arc::new(HandlerRecord {
                command,
                handler,
                usage: Mutex::new(UsageState::default()),
            }),
        );

        Ok(())
    }

    /// Remove a command and its aliases.
    #[track_caller]
    pub fn unregister(&self, name: &str) -> Result<(), DispatchError> {
        let mut registry = write(&self.registry);

        let Some(record) = registry.records.remove(name) else {
            return Err(DispatchError::unknown_command(name));
        };

        for trigger in record.command.triggers() {
            if let Some(names) = registry.triggers.get_mut(&trigger) {
                names.retain(|n| n != name);
                if names.is_empty() {
                    registry.triggers.remove(&trigger);
                }
            }
        }
        registry.order.retain(|n| n != name);

        info!("Unregistered command: {name}");
        Ok(())
    }

    /// Registered commands in registration order.
    pub fn command_list(&self) -> Vec<CommandInfo> {
        let registry = read(&self.registry);
        registry
            .order
            .iter()
            .filter_map(|name| registry.records.get(name))
            .map(|record| {
                let command = &record.command;
                CommandInfo {
                    name: command.name.clone(),
                    kind: command.kind,
                    permission: command.permission,
                    aliases: command.aliases.clone(),
                    description: command.description.clone(),
                    usage: command.usage.clone(),
                    cooldown_ms: command.cooldown.as_millis() as u64,
                }
            })
            .collect()
    }

    pub fn command_stats(&self, name: &str) -> Option<CommandStats> {
        let registry = read(&self.registry);
        let record = registry.records.get(name)?;
        let usage = lock(&record.usage);
        Some(CommandStats {
            total_uses: usage.total_uses,
            failures: usage.failures,
            unique_users: usage.users.len(),
            last_used: usage.last_used,
        })
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            events_seen: self.counters.events_seen.load(Ordering::Relaxed),
            events_dispatched: self.counters.events_dispatched.load(Ordering::Relaxed),
            handler_runs: self.counters.handler_runs.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            cooldown_skips: self.counters.cooldown_skips.load(Ordering::Relaxed),
        }
    }

    /// Run every handler matching `event`, in registration order.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        self.counters.events_seen.fetch_add(1, Ordering::Relaxed);

        let Some((trigger, args)) = self.parse_trigger(event) else {
            trace!("Event #{} ({}) has no trigger", event.seq, event.kind);
            return DispatchOutcome::default();
        };

        let author = author_id(&event.payload).unwrap_or_else(|| self.account_id.clone());
        if matches!(trigger, Trigger::Command(_))
            && !self.account_id.is_empty()
            && author != self.account_id
        {
            trace!("Ignoring command from foreign author on event #{}", event.seq);
            return DispatchOutcome::default();
        }

        let records = self.resolve(&trigger);
        let mut outcome = DispatchOutcome {
            matched: records.len(),
            ..DispatchOutcome::default()
        };

        if records.is_empty() {
            if let Trigger::Command(name) = &trigger {
                debug!("Unknown command '{name}' on event #{}", event.seq);
            }
            return outcome;
        }

        self.counters
            .events_dispatched
            .fetch_add(1, Ordering::Relaxed);

        let trigger_name = match &trigger {
            Trigger::Command(name) | Trigger::Interaction(name) => name.clone(),
        };

        for record in records {
            if record.command.permission != Permission::SelfOnly {
                outcome.skipped += 1;
                continue;
            }

            if let Some(remaining) = self.cooldown_remaining(&record, &author) {
                info!(
                    "Command '{}' on cooldown for {author}, {remaining:?} left",
                    record.command.name
                );
                self.counters.cooldown_skips.fetch_add(1, Ordering::Relaxed);
                outcome.skipped += 1;
                continue;
            }

            let ctx = HandlerContext::new(
                CapabilityToken::self_only(self.account_id.clone()),
                Arc::clone(&self.actions),
                trigger_name.clone(),
                args.clone(),
                self.prefix(),
            );

            let result = run_isolated(&record, event, &ctx).await;
            self.counters.handler_runs.fetch_add(1, Ordering::Relaxed);

            let mut usage = lock(&record.usage);
            usage.last_used_by.insert(author.clone(), Instant::now());
            usage.users.insert(author.clone());
            usage.total_uses += 1;
            usage.last_used = Some(SystemTime::now());

            match result {
                Ok(()) => {
                    debug!("Command '{}' handled event #{}", record.command.name, event.seq);
                    outcome.succeeded += 1;
                }
                Err(e) => {
                    error!(
                        "Command '{}' failed on event #{}: {e}",
                        record.command.name, event.seq
                    );
                    usage.failures += 1;
                    self.counters
                        .handler_failures
                        .fetch_add(1, Ordering::Relaxed);
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }

    /// Dispatch events in sequence order until the queue closes or `cancel`
    /// fires.
    pub async fn run(&self, mut consumer: EventConsumer, cancel: CancellationToken) {
        info!("Dispatcher started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = consumer.dequeue() => event,
            };

            let Some(event) = event else {
                debug!("Event queue closed");
                break;
            };

            self.dispatch(&event).await;
        }

        info!("Dispatcher stopped");
    }

    fn parse_trigger(&self, event: &InboundEvent) -> Option<(Trigger, Vec<String>)> {
        if let Some(id) = event.payload.get("interaction_id").and_then(Value::as_str) {
            return Some((Trigger::Interaction(id.to_string()), Vec::new()));
        }

        let content = event.payload.get("content").and_then(Value::as_str)?;
        let prefix = self.prefix();
        let rest = content.strip_prefix(prefix.as_str())?.trim();

        let mut words = rest.split_whitespace();
        let name = words.next()?.to_lowercase();
        let args = words.map(str::to_string).collect();

        Some((Trigger::Command(name), args))
    }

    fn resolve(&self, trigger: &Trigger) -> Vec<Arc<HandlerRecord>> {
        let registry = read(&self.registry);
        registry
            .triggers
            .get(trigger)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| registry.records.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn cooldown_remaining(&self, record: &HandlerRecord, author: &str) -> Option<Duration> {
        if record.command.cooldown.is_zero() {
            return None;
        }

        let usage = lock(&record.usage);
        let last = usage.last_used_by.get(author)?;
        let ready_at = *last + record.command.cooldown;
        let now = Instant::now();

        (now < ready_at).then(|| ready_at - now)
    }
}

async fn run_isolated(
    record: &HandlerRecord,
    event: &InboundEvent,
    ctx: &HandlerContext,
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(record.handler.handle(event, ctx))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());

            Err(HandlerError::panicked(message))
        }
    }
}

fn author_id(payload: &Value) -> Option<String> {
    match payload.get("author_id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
