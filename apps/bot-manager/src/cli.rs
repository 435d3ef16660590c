//! Command-line arguments for both binaries.
//!
//! Every option can also come from the environment (after `.env` is loaded).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Config file (TOML). Defaults to the platform config directory.
    #[arg(long, env = "BOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for logs, stores and session files.
    #[arg(long, env = "BOT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct PassphraseArgs {
    /// Passphrase protecting the stored credential.
    #[arg(long, env = "BOT_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,
}

/// Control process: supervises the worker and serves the control socket.
#[derive(Debug, Parser)]
#[command(name = "bot-manager", version, about)]
pub struct ManagerCli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Option<ManagerCommand>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ManagerCommand {
    /// Supervise the worker until interrupted (the default).
    Run(RunArgs),
    /// Encrypt and store the upstream credential.
    SetToken {
        #[command(flatten)]
        passphrase: PassphraseArgs,
        /// Credential to store. Read from stdin when omitted.
        #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Remove the stored credential.
    ClearToken,
    /// Report whether a credential is stored and decrypts.
    TokenStatus {
        #[command(flatten)]
        passphrase: PassphraseArgs,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Control server port; 0 picks a free one. Overrides `[control] port`.
    #[arg(long, env = "BOT_CONTROL_PORT")]
    pub port: Option<u16>,

    /// Token control clients must present. Generated per run when omitted.
    #[arg(long, env = "BOT_CONTROL_TOKEN", hide_env_values = true)]
    pub control_token: Option<String>,

    /// Leave the worker stopped until a control client starts it.
    #[arg(long)]
    pub no_autostart: bool,
}

/// Worker process: launched by `bot-manager` with IPC on stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "bot-worker", version, about)]
pub struct WorkerCli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub passphrase: PassphraseArgs,
}
