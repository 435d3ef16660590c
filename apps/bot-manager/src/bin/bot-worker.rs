use bot_manager::cli::WorkerCli;
use bot_manager::commands::register_builtin;
use bot_manager::error::ManagerError;
use bot_manager::logger::{LogTarget, initialize_with_forwarding};
use bot_manager::paths::AppPaths;

use bot_core::config::{BotConfig, JsonFileStore};
use bot_core::ipc::IpcChannel;
use bot_core::token_store::SecureTokenStore;
use bot_core::upstream::websocket::WebSocketUpstream;
use bot_core::worker::WorkerRuntime;

use common::{ErrorLocation, RedactedToken};

use std::fs::create_dir_all;
use std::panic::Location;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = WorkerCli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: WorkerCli) -> Result<(), ManagerError> {
    let paths = AppPaths::resolve(cli.common.config, cli.common.data_dir);

    create_dir_all(&paths.log_dir).map_err(|e| ManagerError::Manager {
        message: format!("Failed to create log directory: {e}"),
        location: ErrorLocation::from(Location::caller()),
    })?;

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    initialize_with_forwarding(&paths.log_dir, LogTarget::Stderr, Some(log_tx))?;

    info!("Bot worker starting (PID: {})", std::process::id());

    let config = BotConfig::load(&paths.config_file)?;
    let url = config
        .upstream
        .url
        .clone()
        .ok_or_else(|| ManagerError::manager("No upstream url configured ([upstream] url)"))?;

    let credentials = Arc::new(SecureTokenStore::new(
        Arc::new(JsonFileStore::new(paths.credentials_file())),
        RedactedToken::new(cli.passphrase.passphrase),
    ));

    let ipc = config.ipc.clone();
    let runtime = WorkerRuntime::new(config, Arc::new(WebSocketUpstream::new(url)), credentials)
        .with_log_forwarding(log_rx);
    register_builtin(runtime.dispatcher())?;

    let (sender, receiver) = IpcChannel::from_parts(tokio::io::stdin(), tokio::io::stdout(), &ipc);
    runtime.run(sender, receiver).await?;

    info!("Bot worker exiting");
    Ok(())
}
