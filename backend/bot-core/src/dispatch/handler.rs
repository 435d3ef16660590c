use crate::config::MESSAGE_CATEGORY;
use crate::connection::{ActionReceipt, ActionSink};
use crate::error::connection::ConnectionError;
use crate::error::dispatch::HandlerError;
use crate::queue::InboundEvent;
use crate::upstream::OutboundAction;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

/// Who a handler may act for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Permission {
    /// Only the bot's own account.
    SelfOnly,
    Guild,
    Any,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::SelfOnly => "self",
            Permission::Guild => "guild",
            Permission::Any => "any",
        })
    }
}

/// Proof that a handler runs with self-only authority.
///
/// Only the dispatcher mints these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityToken {
    account_id: String,
    scope: Permission,
}

impl CapabilityToken {
    pub(crate) fn self_only(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            scope: Permission::SelfOnly,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn scope(&self) -> Permission {
        self.scope
    }
}

/// Everything a handler gets besides the event. No global state.
#[derive(Clone)]
pub struct HandlerContext {
    capability: CapabilityToken,
    actions: Arc<dyn ActionSink>,
    /// Command name or interaction id that matched.
    pub trigger: String,
    /// Whitespace-separated words after the command name.
    pub args: Vec<String>,
    pub prefix: String,
}

impl HandlerContext {
    pub(crate) fn new(
        capability: CapabilityToken,
        actions: Arc<dyn ActionSink>,
        trigger: String,
        args: Vec<String>,
        prefix: String,
    ) -> Self {
        Self {
            capability,
            actions,
            trigger,
            args,
            prefix,
        }
    }

    pub fn capability(&self) -> &CapabilityToken {
        &self.capability
    }

    /// Send an action through the rate limiter.
    pub async fn send(&self, action: OutboundAction) -> Result<ActionReceipt, ConnectionError> {
        self.actions.send_action(action).await
    }

    /// Post `content` to the channel the event came from.
    pub async fn reply(
        &self,
        event: &InboundEvent,
        content: impl Into<String>,
    ) -> Result<ActionReceipt, ConnectionError> {
        let payload = json!({
            "channel_id": event.payload.get("channel_id").cloned().unwrap_or_default(),
            "content": content.into(),
        });
        self.send(OutboundAction::new(MESSAGE_CATEGORY, payload)).await
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(InboundEvent, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &InboundEvent, ctx: &HandlerContext) -> Result<(), HandlerError> {
        (self.0)(event.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(InboundEvent, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
