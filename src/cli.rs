use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "linkmirror")]
#[command(author, version, about = "Mirror a mounted drive into a symlink tree for a media server")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service: watchers, poller, workers and status server
    Run {
        /// Override the status server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not start the status server
        #[arg(long)]
        no_server: bool,
    },

    /// Run a single full synchronization and exit
    Sync {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Write a database backup now
    Backup,

    /// Write an inventory snapshot now
    Snapshot,

    /// Display version information
    Version,
}
