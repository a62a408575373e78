//! Daemon command-line options
//!
//! Every option is optional so that values from a `--config` TOML file (or
//! the built-in defaults) apply unless overridden here.

use clap::Parser;
use std::path::PathBuf;

#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about = "Stash - multi-client file exchange daemon")]
pub struct DaemonOpts {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address (host:port) [default: 0.0.0.0:4321]
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding one subdirectory per user
    #[arg(long)]
    pub users_root: Option<PathBuf>,

    /// Directory receiving anonymous SEND_FILE uploads
    #[arg(long)]
    pub inbox: Option<PathBuf>,

    /// JSON file holding registered accounts
    #[arg(long)]
    pub accounts: Option<PathBuf>,

    /// Also append console lines to this file
    #[arg(long)]
    pub console_log: Option<PathBuf>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Cap on concurrently served connections
    #[arg(long)]
    pub max_connections: Option<usize>,
}
