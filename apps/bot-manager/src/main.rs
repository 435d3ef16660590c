use bot_manager::cli::{ManagerCli, ManagerCommand, PassphraseArgs, RunArgs};
use bot_manager::error::ManagerError;
use bot_manager::logger::{LogTarget, initialize as LoggerInitialize};
use bot_manager::paths::AppPaths;

use bot_core::config::{BotConfig, JsonFileStore, KeyValueStore};
use bot_core::ipc::start_control_server;
use bot_core::supervisor::{ProcessLauncher, ProcessSupervisor};
use bot_core::token_store::SecureTokenStore;

use common::{ErrorLocation, RedactedToken};

use std::fs::create_dir_all;
use std::io::{BufRead, stdin};
use std::panic::Location;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

/// Session-store key holding the current control token.
const CONTROL_TOKEN_KEY: &str = "control_token";

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let cli = ManagerCli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: ManagerCli) -> Result<(), ManagerError> {
    let paths = AppPaths::resolve(cli.common.config.clone(), cli.common.data_dir.clone());

    create_dir_all(&paths.log_dir).map_err(|e| ManagerError::Manager {
        message: format!("Failed to create log directory: {e}"),
        location: ErrorLocation::from(Location::caller()),
    })?;

    LoggerInitialize(&paths.log_dir, LogTarget::Stdout)?;

    info!("Bot manager starting");
    info!("Config file: {}", paths.config_file.display());
    info!("Data directory: {}", paths.data_dir.display());

    match cli.command.unwrap_or(ManagerCommand::Run(RunArgs::default())) {
        ManagerCommand::Run(args) => supervise(&paths, args).await,
        ManagerCommand::SetToken { passphrase, token } => set_token(&paths, passphrase, token),
        ManagerCommand::ClearToken => {
            let store = JsonFileStore::new(paths.credentials_file());
            SecureTokenStore::new(Arc::new(store), RedactedToken::new(String::new())).clear()?;
            info!("Credential cleared");
            Ok(())
        }
        ManagerCommand::TokenStatus { passphrase } => {
            let tokens = token_store(&paths, passphrase);
            if !tokens.is_configured()? {
                info!("No credential stored");
                return Ok(());
            }
            let credential = tokens.get()?;
            info!("Credential stored and readable ({} characters)", credential.len());
            Ok(())
        }
    }
}

async fn supervise(paths: &AppPaths, args: RunArgs) -> Result<(), ManagerError> {
    let config = BotConfig::load(&paths.config_file)?;
    let port = args.port.unwrap_or(config.control.port);

    let worker_args = vec![
        "--config".to_string(),
        paths.config_file.display().to_string(),
        "--data-dir".to_string(),
        paths.data_dir.display().to_string(),
    ];

    let launcher = Arc::new(ProcessLauncher::new(
        config.supervisor.worker_binary.clone(),
        worker_args,
        config.ipc.clone(),
    ));
    let overrides = Arc::new(JsonFileStore::new(paths.overrides_file()));
    let autostart = !args.no_autostart;

    let supervisor = ProcessSupervisor::spawn(config, launcher, overrides);

    info!("Starting control server on port {port}");
    let server = start_control_server(port, args.control_token, supervisor.clone()).await?;

    // Control clients read the token from the session file, never from logs.
    let session = JsonFileStore::new(paths.session_file());
    session.set(CONTROL_TOKEN_KEY, server.auth_token())?;
    info!(
        "Control server listening on {} (token in {})",
        server.local_addr(),
        paths.session_file().display()
    );

    if autostart && let Err(e) = supervisor.start().await {
        warn!("Worker did not start: {e}");
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Interrupted, shutting down");
        }
        _ = server.stopped() => {
            info!("Shutdown requested by control client");
        }
    }

    supervisor.shutdown().await;
    server.shutdown();

    if let Err(e) = session.remove(CONTROL_TOKEN_KEY) {
        warn!("Failed to clear control token: {e}");
    }

    info!("Bot manager stopped");
    Ok(())
}

fn set_token(
    paths: &AppPaths,
    passphrase: PassphraseArgs,
    token: Option<String>,
) -> Result<(), ManagerError> {
    let token = match token {
        Some(token) => RedactedToken::new(token),
        None => {
            let mut line = String::new();
            stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| ManagerError::credential(format!("Failed to read token: {e}")))?;
            let token = RedactedToken::new(line.trim().to_string());
            drop(line);
            token
        }
    };

    token_store(paths, passphrase).set(token.as_str())?;
    info!("Credential stored in {}", paths.credentials_file().display());
    Ok(())
}

fn token_store(paths: &AppPaths, passphrase: PassphraseArgs) -> SecureTokenStore {
    SecureTokenStore::new(
        Arc::new(JsonFileStore::new(paths.credentials_file())),
        RedactedToken::new(passphrase.passphrase),
    )
}
