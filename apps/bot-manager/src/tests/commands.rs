// Unit tests for the built-in commands.

use crate::commands::{PING_REPLY, help_text, register_builtin};

use bot_core::connection::{ActionReceipt, ActionSink};
use bot_core::dispatch::CommandDispatcher;
use bot_core::error::ConnectionError;
use bot_core::queue::InboundEvent;
use bot_core::upstream::OutboundAction;

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use serde_json::json;

const SELF_ID: &str = "42";

#[derive(Default)]
struct Replies(Mutex<Vec<OutboundAction>>);

impl Replies {
    fn contents(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|action| action.payload["content"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl ActionSink for Replies {
    async fn send_action(&self, action: OutboundAction) -> Result<ActionReceipt, ConnectionError> {
        self.0.lock().unwrap().push(action);
        Ok(ActionReceipt::Sent)
    }
}

fn message(seq: u64, content: &str) -> InboundEvent {
    InboundEvent {
        seq,
        kind: "message".to_string(),
        payload: json!({ "author_id": SELF_ID, "channel_id": "1", "content": content }),
        received_at: SystemTime::now(),
    }
}

fn dispatcher_with_builtins(replies: &Arc<Replies>) -> Arc<CommandDispatcher> {
    let dispatcher = Arc::new(CommandDispatcher::new(SELF_ID, "!", replies.clone()));
    register_builtin(&dispatcher).expect("builtins register");
    dispatcher
}

/// **VALUE**: `!ping` answers `pong` in the same channel.
///
/// **WHY THIS MATTERS**: It is the operator's end-to-end check that events flow in and
/// actions flow out.
#[tokio::test]
async fn given_builtins_when_ping_dispatched_then_pong_reply() {
    // GIVEN
    let replies = Arc::new(Replies::default());
    let dispatcher = dispatcher_with_builtins(&replies);

    // WHEN
    let outcome = dispatcher.dispatch(&message(1, "!ping")).await;

    // THEN
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(replies.contents(), vec![PING_REPLY.to_string()]);
}

/// **VALUE**: `!help` lists commands with the current prefix.
///
/// **BUG THIS CATCHES**: Help text built once at registration, showing a stale prefix
/// or missing commands registered later.
#[tokio::test]
async fn given_prefix_changed_when_help_dispatched_then_lists_with_new_prefix() {
    // GIVEN
    let replies = Arc::new(Replies::default());
    let dispatcher = dispatcher_with_builtins(&replies);
    dispatcher.set_prefix("?");

    // WHEN
    let outcome = dispatcher.dispatch(&message(1, "?commands")).await;

    // THEN
    assert_eq!(outcome.succeeded, 1);
    let help = &replies.contents()[0];
    assert!(help.contains("?ping - Check that the bot is alive"));
    assert!(help.contains("?help - List available commands"));
}

/// **VALUE**: Help text has one line per command in registration order.
#[test]
fn given_builtins_when_help_text_built_then_one_line_per_command() {
    let replies = Arc::new(Replies::default());
    let dispatcher = dispatcher_with_builtins(&replies);

    let text = help_text(&dispatcher, "!");

    assert_eq!(text.lines().count(), 2);
    assert!(text.starts_with("!ping"));
}
