//! CLI entry point and shared setup.

mod args;
mod status;
mod watch;

use std::path::Path;

use clap::Parser;
use folio_realtime::{RealtimeConfig, RealtimeError};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use args::{Cli, Commands, ConnectionArgs};

/// Errors surfaced to the user by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

/// Parse arguments and run the selected command.
pub fn run_cli() {
    // .env values act as defaults for the FOLIO_* environment variables.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Watch { page, cursor } => resolve_config(&cli.connection)
            .and_then(|config| watch::handle_watch(&cli.connection, config, &page, cursor)),
        Commands::Status => resolve_config(&cli.connection)
            .map(|config| status::handle_status(&cli.connection, &config)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Logs go to stderr so presence output on stdout stays readable.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio=info,folio_realtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Build the realtime configuration from the config file and flags.
///
/// Flags and `FOLIO_*` variables override values from the file.
fn resolve_config(args: &ConnectionArgs) -> Result<RealtimeConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => RealtimeConfig::default(),
    };

    if let Some(server) = &args.server {
        config.channel.server_url = server.clone();
    }

    let user = &mut config.user;
    if let Some(id) = &args.user_id {
        user.id = id.clone();
    }
    if let Some(name) = &args.user_name {
        user.name = name.clone();
    }
    if let Some(email) = &args.user_email {
        user.email = email.clone();
    }
    if user.id.is_empty() {
        user.id = format!("cli-{}", std::process::id());
        if user.name.is_empty() {
            user.name = "folio cli".to_string();
        }
    }

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<RealtimeConfig, CliError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        CliError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Show a secret as its length only.
fn redact(secret: Option<&str>) -> String {
    match secret {
        Some(s) if !s.is_empty() => format!("(set, {} chars)", s.chars().count()),
        _ => "(not set)".to_string(),
    }
}
