use crate::helpers::scripted_upstream::RecordingSink;

use bot_core::dispatch::{
    Command, CommandDispatcher, CommandHandler, HandlerContext, Permission, TriggerKind, handler_fn,
};
use bot_core::error::dispatch::{DispatchError, HandlerError};
use bot_core::queue::InboundEvent;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::{Value, json};

const SELF_ID: &str = "1087654321098765432";

fn dispatcher(sink: &Arc<RecordingSink>) -> CommandDispatcher {
    CommandDispatcher::new(SELF_ID, "!", sink.clone())
}

fn event(seq: u64, payload: Value) -> InboundEvent {
    InboundEvent {
        seq,
        kind: "message".to_string(),
        payload,
        received_at: SystemTime::now(),
    }
}

fn own_message(seq: u64, content: &str) -> InboundEvent {
    event(
        seq,
        json!({ "author_id": SELF_ID, "channel_id": "42", "content": content }),
    )
}

struct PanickingHandler;

#[async_trait]
impl CommandHandler for PanickingHandler {
    async fn handle(&self, _event: &InboundEvent, _ctx: &HandlerContext) -> Result<(), HandlerError> {
        panic!("handler blew up")
    }
}

fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

/// **VALUE**: One failing handler does not stop the next handler on the same trigger.
///
/// **WHY THIS MATTERS**: Handlers are user code. A bug in one must not take down
/// unrelated commands bound to the same word.
///
/// **BUG THIS CATCHES**: `?` on the first handler's result short-circuiting the loop.
#[tokio::test]
async fn given_two_handlers_on_trigger_when_first_fails_then_second_still_runs() {
    // GIVEN: "fail" bound to "go", and "ok" aliased to "go"
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    let ok_runs = counter();

    dispatcher
        .register(
            Command::prefix("go"),
            handler_fn(|_event, _ctx| async { Err::<(), _>(HandlerError::failed("boom")) }),
        )
        .unwrap();
    {
        let ok_runs = ok_runs.clone();
        dispatcher
            .register(
                Command::prefix("ok").alias("go"),
                handler_fn(move |event, ctx| {
                    let ok_runs = ok_runs.clone();
                    async move {
                        ok_runs.fetch_add(1, Ordering::SeqCst);
                        ctx.reply(&event, "done").await?;
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();
    }

    // WHEN
    let outcome = dispatcher.dispatch(&own_message(1, "!go")).await;

    // THEN
    assert_eq!(outcome.matched, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(ok_runs.load(Ordering::SeqCst), 1);

    let actions = sink.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].category, "message");
    assert_eq!(actions[0].payload["content"], "done");
    assert_eq!(actions[0].payload["channel_id"], "42");

    assert_eq!(dispatcher.stats().handler_failures, 1);
    assert_eq!(dispatcher.command_stats("go").unwrap().failures, 1);
}

/// **VALUE**: A panicking handler is contained and later events still dispatch.
///
/// **BUG THIS CATCHES**: A panic unwinding through the dispatcher task, which would
/// silently stop all command handling for the rest of the session.
#[tokio::test]
async fn given_panicking_handler_when_dispatched_then_failure_recorded_and_dispatch_continues() {
    // GIVEN
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    let pings = counter();

    dispatcher
        .register(
            Command::prefix("explode"),
            Arc::new(PanickingHandler),
        )
        .unwrap();
    {
        let pings = pings.clone();
        dispatcher
            .register(
                Command::prefix("ping"),
                handler_fn(move |_event, _ctx| {
                    let pings = pings.clone();
                    async move {
                        pings.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();
    }

    // WHEN
    let exploded = dispatcher.dispatch(&own_message(1, "!explode")).await;
    let pinged = dispatcher.dispatch(&own_message(2, "!ping")).await;

    // THEN
    assert_eq!(exploded.failed, 1);
    assert_eq!(pinged.succeeded, 1);
    assert_eq!(pings.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.stats().handler_failures, 1);
}

/// **VALUE**: Handlers asking for more than self-only authority are refused.
///
/// **WHY THIS MATTERS**: The bot acts for one account. A handler that can act for a
/// whole guild turns the bot into an abuse tool.
#[test]
fn given_broader_permission_when_registering_then_permission_denied() {
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);

    for permission in [Permission::Guild, Permission::Any] {
        let result = dispatcher.register(
            Command::prefix("ban").permission(permission),
            handler_fn(|_event, _ctx| async { Ok::<(), HandlerError>(()) }),
        );
        assert!(matches!(result, Err(DispatchError::PermissionDenied { .. })));
    }

    assert!(dispatcher.command_list().is_empty());
}

/// **VALUE**: Registering the same name twice is rejected.
#[test]
fn given_registered_name_when_registering_again_then_duplicate_trigger() {
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    dispatcher
        .register(Command::prefix("ping"), handler_fn(|_e, _c| async { Ok::<(), HandlerError>(()) }))
        .unwrap();

    let result = dispatcher.register(
        Command::prefix("PING"),
        handler_fn(|_e, _c| async { Ok::<(), HandlerError>(()) }),
    );

    assert!(matches!(
        result,
        Err(DispatchError::DuplicateTrigger { ref trigger, .. }) if trigger == "ping"
    ));
}

/// **VALUE**: A name is unique across command kinds, and a command never runs twice for
/// one trigger.
///
/// **WHY THIS MATTERS**: Stats, cooldowns and `unregister` are keyed by name. An alias
/// repeating the command's own name must not double every reply.
///
/// **BUG THIS CATCHES**:
/// - An interaction silently shadowing a prefix command of the same name
/// - A self-alias binding the handler to its trigger twice
#[tokio::test]
async fn given_name_and_self_alias_when_registering_then_unique_and_bound_once() {
    // GIVEN: "echo" aliased to itself
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    let runs = counter();
    {
        let runs = runs.clone();
        dispatcher
            .register(
                Command::prefix("echo").alias("echo").alias("ECHO"),
                handler_fn(move |_e, _c| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();
    }

    // WHEN: An interaction reuses the name, then the command is invoked
    let interaction = dispatcher.register(
        Command::interaction("echo"),
        handler_fn(|_e, _c| async { Ok::<(), HandlerError>(()) }),
    );
    let outcome = dispatcher.dispatch(&own_message(1, "!echo")).await;

    // THEN
    assert!(matches!(
        interaction,
        Err(DispatchError::DuplicateTrigger { ref trigger, .. }) if trigger == "echo"
    ));
    assert_eq!(outcome.matched, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// **VALUE**: Cooldowns are per author and expire.
///
/// **BUG THIS CATCHES**: Cooldown measured from registration, or never cleared.
#[tokio::test(start_paused = true)]
async fn given_cooldown_when_invoked_twice_quickly_then_second_skipped_until_expiry() {
    // GIVEN
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    let runs = counter();
    {
        let runs = runs.clone();
        dispatcher
            .register(
                Command::prefix("roll").cooldown(Duration::from_secs(5)),
                handler_fn(move |_e, _c| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();
    }

    // WHEN
    dispatcher.dispatch(&own_message(1, "!roll")).await;
    let second = dispatcher.dispatch(&own_message(2, "!roll")).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    dispatcher.dispatch(&own_message(3, "!roll")).await;

    // THEN
    assert_eq!(second.skipped, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.stats().cooldown_skips, 1);
}

/// **VALUE**: Prefix matching is case-insensitive, honors aliases and passes arguments.
#[tokio::test]
async fn given_alias_when_invoked_with_args_then_handler_sees_args() {
    // GIVEN
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    dispatcher
        .register(
            Command::prefix("echo").alias("say"),
            handler_fn(|event, ctx| async move {
                ctx.reply(&event, ctx.args.join(" ")).await?;
                Ok::<(), HandlerError>(())
            }),
        )
        .unwrap();

    // WHEN
    let outcome = dispatcher
        .dispatch(&own_message(1, "!SAY hello   world"))
        .await;

    // THEN
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(sink.actions()[0].payload["content"], "hello world");
}

/// **VALUE**: Unregistering removes the name and its aliases.
#[tokio::test]
async fn given_registered_command_when_unregistered_then_no_longer_matches() {
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    dispatcher
        .register(
            Command::prefix("echo").alias("say"),
            handler_fn(|_e, _c| async { Ok::<(), HandlerError>(()) }),
        )
        .unwrap();

    dispatcher.unregister("echo").unwrap();

    assert_eq!(dispatcher.dispatch(&own_message(1, "!say hi")).await.matched, 0);
    assert_eq!(dispatcher.dispatch(&own_message(2, "!echo hi")).await.matched, 0);
    assert!(matches!(
        dispatcher.unregister("echo"),
        Err(DispatchError::UnknownCommand { .. })
    ));
}

/// **VALUE**: Prefix commands typed by other accounts are ignored.
///
/// **WHY THIS MATTERS**: The bot runs under the user's own account; other people in a
/// channel must not be able to drive it.
#[tokio::test]
async fn given_foreign_author_when_command_sent_then_ignored() {
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    let runs = counter();
    {
        let runs = runs.clone();
        dispatcher
            .register(
                Command::prefix("ping"),
                handler_fn(move |_e, _c| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();
    }

    let outcome = dispatcher
        .dispatch(&event(1, json!({ "author_id": "999", "content": "!ping" })))
        .await;

    assert_eq!(outcome.matched, 0);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

/// **VALUE**: Interactions match by exact id; content without the prefix is no trigger.
#[tokio::test]
async fn given_interaction_command_when_interaction_arrives_then_handler_runs() {
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    let runs = counter();
    {
        let runs = runs.clone();
        dispatcher
            .register(
                Command::interaction("confirm-button"),
                handler_fn(move |_e, ctx| {
                    let runs = runs.clone();
                    async move {
                        assert_eq!(ctx.trigger, "confirm-button");
                        assert_eq!(ctx.capability().scope(), Permission::SelfOnly);
                        assert_eq!(ctx.capability().account_id(), SELF_ID);
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                }),
            )
            .unwrap();
    }

    let clicked = dispatcher
        .dispatch(&event(1, json!({ "interaction_id": "confirm-button" })))
        .await;
    let chatter = dispatcher
        .dispatch(&own_message(2, "confirm-button"))
        .await;

    assert_eq!(clicked.succeeded, 1);
    assert_eq!(chatter, Default::default());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        dispatcher.command_list()[0].kind,
        TriggerKind::Interaction
    );
}

/// **VALUE**: Per-command usage statistics and the changed prefix both take effect.
#[tokio::test]
async fn given_prefix_change_when_dispatching_then_new_prefix_used_and_stats_counted() {
    // GIVEN
    let sink = RecordingSink::new();
    let dispatcher = dispatcher(&sink);
    dispatcher
        .register(
            Command::prefix("ping").description("Replies pong").usage("!ping"),
            handler_fn(|_e, _c| async { Ok::<(), HandlerError>(()) }),
        )
        .unwrap();

    // WHEN
    dispatcher.dispatch(&own_message(1, "!ping")).await;
    dispatcher.set_prefix("?");
    let old = dispatcher.dispatch(&own_message(2, "!ping")).await;
    let new = dispatcher.dispatch(&own_message(3, "?ping")).await;

    // THEN
    assert_eq!(old.matched, 0);
    assert_eq!(new.succeeded, 1);

    let stats = dispatcher.command_stats("ping").unwrap();
    assert_eq!(stats.total_uses, 2);
    assert_eq!(stats.unique_users, 1);
    assert!(stats.last_used.is_some());

    let info = &dispatcher.command_list()[0];
    assert_eq!(info.description, "Replies pong");
    assert_eq!(info.permission, Permission::SelfOnly);
}
