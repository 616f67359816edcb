//! dblock CLI - named cross-process locks on database advisory locks

mod worker;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dblock_core::config::{self, DriverConfig};
use dblock_core::prelude::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use worker::Worker;

/// Exit status when the lock could not be acquired in time (EX_TEMPFAIL)
const EXIT_NOT_ACQUIRED: u8 = 75;

#[derive(Parser)]
#[command(name = "dblock")]
#[command(author, version, about = "Named cross-process locks on database advisory locks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML driver configuration (defaults to DBLOCK_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print information about the lock driver
    Info,

    /// Execute JSON lock commands read from stdin, one per line
    Worker,

    /// Run a command while holding one or more locks
    Exec {
        /// Lock name (repeat for a multi lock)
        #[arg(short, long = "lock", required = true)]
        locks: Vec<String>,

        /// Give up after this many seconds instead of waiting indefinitely
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DriverConfig> {
    match path {
        Some(path) => DriverConfig::load(path),
        None => DriverConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    // stdout belongs to the worker protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("dblock=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => cmd_info(&config).await,
        Commands::Worker => cmd_worker(&config).await,
        Commands::Exec {
            locks,
            timeout,
            command,
        } => cmd_exec(&config, locks, timeout, &command).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_info(config: &DriverConfig) -> anyhow::Result<ExitCode> {
    let connected = config::connect(config).await?;
    for message in &connected.info {
        println!("{}", message);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_worker(config: &DriverConfig) -> anyhow::Result<ExitCode> {
    let connected = config::connect(config).await?;
    for message in &connected.info {
        eprintln!("{}", message);
    }

    let mut worker = Worker::new(LockFactory::new(connected.driver), tokio::io::stdout());
    worker.run(tokio::io::BufReader::new(tokio::io::stdin())).await?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_exec(
    config: &DriverConfig,
    locks: Vec<String>,
    timeout: Option<u64>,
    command: &[String],
) -> anyhow::Result<ExitCode> {
    let (program, args) = command
        .split_first()
        .context("No command given after `--`")?;

    let connected = config::connect(config).await?;
    let lock = LockFactory::new(connected.driver).create(locks.iter().cloned())?;

    let run = move || async move {
        tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
    };

    let status = match timeout {
        None => Some(lock.synchronize(run).await?),
        Some(seconds) => lock.try_synchronize_with_timeout(seconds, run).await?.success(),
    };

    let Some(status) = status else {
        warn!(lock_names = ?locks, timeout_seconds = ?timeout, "Lock not acquired, command not run");
        eprintln!("Lock not acquired within {} seconds", timeout.unwrap_or_default());
        return Ok(ExitCode::from(EXIT_NOT_ACQUIRED));
    };

    info!(lock_names = ?locks, status = %status, "Command finished");

    // killed by a signal: no code
    let code = status.code().unwrap_or(1);
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_arguments() {
        let cli = Cli::try_parse_from([
            "dblock", "exec", "--lock", "b", "-l", "a", "--timeout", "5", "--", "echo", "hi",
        ])
        .unwrap();

        match cli.command {
            Commands::Exec {
                locks,
                timeout,
                command,
            } => {
                assert_eq!(locks, vec!["b", "a"]);
                assert_eq!(timeout, Some(5));
                assert_eq!(command, vec!["echo", "hi"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_exec_requires_a_lock_and_a_command() {
        assert!(Cli::try_parse_from(["dblock", "exec", "--", "true"]).is_err());
        assert!(Cli::try_parse_from(["dblock", "exec", "--lock", "a"]).is_err());
    }
}
