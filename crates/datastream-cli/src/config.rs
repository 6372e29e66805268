use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "datastream", about = "Data stream server and client")]
pub struct Cli {
    /// Log level or filter directive (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server with a demo sequencer producing blocks
    Server(ServerArgs),
    /// Tail a server's stream and print entries
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// TOML server configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Stream file path (overrides the config file)
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Pause between produced blocks, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Roll back every Nth block instead of committing it
    #[arg(long)]
    pub rollback_every: Option<u64>,

    /// Upper bound of transactions per block
    #[arg(long, default_value_t = 20)]
    pub max_transactions: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:6900")]
    pub server: SocketAddr,

    /// First entry to replay (defaults to the last ten entries)
    #[arg(long)]
    pub from: Option<u64>,
}
