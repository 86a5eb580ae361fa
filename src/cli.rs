//! CLI argument definitions using clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Multiplexing language server proxy
#[derive(Parser, Debug)]
#[command(name = "xlang-proxy")]
#[command(about = "Routes language server clients to shared per-workspace backends")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true, env = "XLANG_PROXY_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the proxy daemon
    Serve(ServeArgs),

    /// Print the resolved configuration and exit
    CheckConfig,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address for LSP-framed TCP clients (overrides `listen`)
    #[arg(long)]
    pub listen: Option<String>,

    /// Address for WebSocket clients (overrides `websocket_listen`)
    #[arg(long)]
    pub websocket_listen: Option<String>,

    /// Seconds of inactivity before a session is reaped
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Do not log errors returned to clients
    #[arg(long)]
    pub quiet_errors: bool,
}
