//! docsync CLI
//!
//! Command-line tools for a docsync data directory.
//!
//! # Commands
//!
//! - `status` - Store size and documents by sync status
//! - `pending` - Queued and failed operations
//! - `mappings` - Local to remote identifier tables
//! - `conflicts` - Unresolved conflicts
//! - `probe` - Check whether a remote is reachable
//! - `sync` - Connect to a remote and push local changes

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// docsync command-line tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long, env = "DOCSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store size and documents by sync status
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued and failed operations
    Pending {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List identifier mappings
    Mappings {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List unresolved conflicts
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check whether a remote is reachable
    Probe {
        /// Base URL of the remote
        url: String,

        /// Probe timeout in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// Connect to a remote and push local changes
    Sync {
        /// Base URL of the remote
        #[arg(short, long, env = "DOCSYNC_URL")]
        url: String,

        /// Bearer token
        #[arg(long, env = "DOCSYNC_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Batch-sync this local workspace instead of draining the queue
        #[arg(short, long)]
        workspace: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.data_dir.ok_or("Data directory required for status")?;
            commands::status::run(&path, &format).await?;
        }
        Commands::Pending { format } => {
            let path = cli.data_dir.ok_or("Data directory required for pending")?;
            commands::pending::run(&path, &format).await?;
        }
        Commands::Mappings { format } => {
            let path = cli.data_dir.ok_or("Data directory required for mappings")?;
            commands::mappings::run(&path, &format).await?;
        }
        Commands::Conflicts { format } => {
            let path = cli.data_dir.ok_or("Data directory required for conflicts")?;
            commands::conflicts::run(&path, &format).await?;
        }
        Commands::Probe { url, timeout } => {
            commands::probe::run(&url, Duration::from_secs(timeout)).await?;
        }
        Commands::Sync {
            url,
            token,
            workspace,
            format,
        } => {
            let path = cli.data_dir.ok_or("Data directory required for sync")?;
            commands::sync::run(&path, &url, token, workspace.as_deref(), &format).await?;
        }
        Commands::Version => {
            println!("docsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
