//! Commands every worker ships with.

use bot_core::dispatch::{Command, CommandDispatcher, handler_fn};
use bot_core::error::{DispatchError, HandlerError};

use std::sync::{Arc, Weak};

pub const PING_REPLY: &str = "pong";

/// Register `ping` and `help` on `dispatcher`.
pub fn register_builtin(dispatcher: &Arc<CommandDispatcher>) -> Result<(), DispatchError> {
    dispatcher.register(
        Command::prefix("ping")
            .description("Check that the bot is alive")
            .usage("ping"),
        handler_fn(|event, ctx| async move {
            ctx.reply(&event, PING_REPLY).await?;
            Ok::<(), HandlerError>(())
        }),
    )?;

    // Weak: the dispatcher owns this handler.
    let registry: Weak<CommandDispatcher> = Arc::downgrade(dispatcher);
    dispatcher.register(
        Command::prefix("help")
            .alias("commands")
            .description("List available commands")
            .usage("help"),
        handler_fn(move |event, ctx| {
            let registry = registry.clone();
            async move {
                let Some(dispatcher) = registry.upgrade() else {
                    return Err(HandlerError::failed("dispatcher is gone"));
                };
                ctx.reply(&event, help_text(&dispatcher, &ctx.prefix)).await?;
                Ok(())
            }
        }),
    )?;

    Ok(())
}

/// One line per prefix command: `<prefix><name> - <description>`.
pub fn help_text(dispatcher: &CommandDispatcher, prefix: &str) -> String {
    dispatcher
        .command_list()
        .into_iter()
        .filter(|info| info.kind == bot_core::dispatch::TriggerKind::Prefix)
        .map(|info| {
            if info.description.is_empty() {
                format!("{prefix}{}", info.name)
            } else {
                format!("{prefix}{} - {}", info.name, info.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
