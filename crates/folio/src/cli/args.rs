//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use folio_realtime::Cursor;

/// Folio realtime client.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// JSON file with realtime settings (reconnect, throttle, presence)
    #[arg(long, global = true, env = "FOLIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Realtime server URL (http(s):// or ws(s)://)
    #[arg(long, global = true, env = "FOLIO_SERVER_URL")]
    pub server: Option<String>,

    /// Bearer token presented when connecting
    #[arg(long, global = true, env = "FOLIO_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// User id published in presence
    #[arg(long, global = true, env = "FOLIO_USER_ID")]
    pub user_id: Option<String>,

    /// Display name published in presence
    #[arg(long, global = true, env = "FOLIO_USER_NAME")]
    pub user_name: Option<String>,

    /// Email published in presence
    #[arg(long, global = true, env = "FOLIO_USER_EMAIL")]
    pub user_email: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Open a page and print its live presence until Ctrl+C
    Watch {
        /// Page id to open
        #[arg(long, short)]
        page: String,

        /// Publish a cursor position, as "x,y"
        #[arg(long, value_parser = parse_cursor)]
        cursor: Option<Cursor>,
    },

    /// Show the resolved configuration
    Status,
}

/// Parse `"x,y"` into a cursor.
pub fn parse_cursor(value: &str) -> Result<Cursor, String> {
    let (x, y) = value
        .split_once(',')
        .ok_or_else(|| format!("expected \"x,y\", got \"{}\"", value))?;
    let x: f64 = x
        .trim()
        .parse()
        .map_err(|e| format!("invalid x coordinate \"{}\": {}", x.trim(), e))?;
    let y: f64 = y
        .trim()
        .parse()
        .map_err(|e| format!("invalid y coordinate \"{}\": {}", y.trim(), e))?;
    if !x.is_finite() || !y.is_finite() {
        return Err("coordinates must be finite".to_string());
    }
    Ok(Cursor::new(x, y))
}
