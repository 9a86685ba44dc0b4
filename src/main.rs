//! passwd-driver - change the login password through the system passwd program.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeroize::Zeroizing;

use passwd_driver::config::BackendConfig;
use passwd_driver::passwd::{PasswdError, PasswdHandler};

#[derive(Parser)]
#[command(
    name = "passwd-driver",
    about = "Change your login password through the system passwd program",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the password-change program.
    #[arg(long)]
    program: Option<PathBuf>,

    /// TOML file with backend settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up if passwd does not answer within this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<BackendConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            BackendConfig::from_toml_str(&content).map_err(|e| e.to_string())?
        }
        None => BackendConfig::default(),
    };
    if let Some(program) = &cli.program {
        config.program.clone_from(program);
    }
    Ok(config)
}

fn prompt(label: &str) -> Result<Zeroizing<String>, String> {
    rpassword::prompt_password(label)
        .map(Zeroizing::new)
        .map_err(|e| format!("Failed to read password: {e}"))
}

async fn run(cli: &Cli) -> Result<(), String> {
    let config = load_config(cli)?;
    let limit = Duration::from_secs(cli.timeout);

    let current = prompt("Current password: ")?;
    let new = prompt("New password: ")?;
    let retyped = prompt("Retype new password: ")?;
    if *new != *retyped {
        return Err("The passwords do not match".to_string());
    }

    let mut handler = PasswdHandler::new(config);

    let auth = tokio::time::timeout(limit, handler.authenticate_and_wait(&current)).await;
    match auth {
        Ok(Ok(())) => tracing::info!("Authenticated"),
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => {
            handler.destroy();
            return Err(PasswdError::Incomplete.to_string());
        }
    }

    let change = tokio::time::timeout(limit, handler.change_password_and_wait(&new)).await;
    match change {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => {
            handler.destroy();
            return Err(PasswdError::Incomplete.to_string());
        }
    }

    if tokio::time::timeout(limit, handler.run_until_idle()).await.is_err() {
        tracing::warn!("passwd did not exit after the change, killing it");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(()) => {
            println!("Password changed");
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("passwd-driver: {message}");
            ExitCode::FAILURE
        }
    }
}
