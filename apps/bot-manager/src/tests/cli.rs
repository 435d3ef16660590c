// Unit tests for argument parsing.

use crate::cli::{ManagerCli, ManagerCommand, WorkerCli};

use std::path::PathBuf;

use clap::{CommandFactory, Parser};

/// **VALUE**: The argument definitions are internally consistent.
///
/// **BUG THIS CATCHES**: Conflicting flag names or a bad `env` attribute, which clap
/// only reports at runtime.
#[test]
fn given_cli_definitions_when_debug_asserted_then_valid() {
    ManagerCli::command().debug_assert();
    WorkerCli::command().debug_assert();
}

/// **VALUE**: No subcommand means run.
#[test]
fn given_no_subcommand_when_parsed_then_command_is_none() {
    let cli = ManagerCli::try_parse_from(["bot-manager", "--config", "/tmp/bot.toml"]).unwrap();

    assert!(cli.command.is_none());
    assert_eq!(cli.common.config, Some(PathBuf::from("/tmp/bot.toml")));
}

/// **VALUE**: Run flags parse.
#[test]
fn given_run_flags_when_parsed_then_values_set() {
    let cli = ManagerCli::try_parse_from(["bot-manager", "run", "--port", "0", "--no-autostart"])
        .unwrap();

    match cli.command {
        Some(ManagerCommand::Run(args)) => {
            assert_eq!(args.port, Some(0));
            assert!(args.no_autostart);
        }
        other => panic!("expected run, got {other:?}"),
    }
}

/// **VALUE**: The worker accepts the arguments the manager launches it with.
///
/// **WHY THIS MATTERS**: A mismatch makes every launch exit immediately, which the
/// supervisor sees as a crash loop.
#[test]
fn given_manager_style_args_when_worker_parses_then_ok() {
    let cli = WorkerCli::try_parse_from([
        "bot-worker",
        "--config",
        "/etc/bot/bot.toml",
        "--data-dir",
        "/var/lib/bot",
        "--passphrase",
        "secret",
    ])
    .unwrap();

    assert_eq!(cli.common.data_dir, Some(PathBuf::from("/var/lib/bot")));
    assert_eq!(cli.passphrase.passphrase, "secret");
}
