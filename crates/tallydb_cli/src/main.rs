//! TallyDB CLI
//!
//! Command-line tools for inspecting a TallyDB store offline.
//!
//! # Commands
//!
//! - `outbox` - List pending outbox entries
//! - `status` - Show outbox counters and recorded upload failures
//! - `discard` - Drop a pending group without uploading it

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TallyDB command-line tools.
#[derive(Parser)]
#[command(name = "tallydb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending outbox entries in upload order
    Outbox {
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Skip this many entries
        #[arg(short, long, default_value = "0")]
        offset: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show outbox counters and recorded upload failures
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Drop a pending group without uploading it
    Discard {
        /// Group to drop
        #[arg(short, long)]
        group: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Outbox {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for outbox")?;
            commands::outbox::run(&path, limit, offset, &format)?;
        }
        Commands::Status { format } => {
            let path = cli.path.ok_or("Database path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::Discard { group } => {
            let path = cli.path.ok_or("Database path required for discard")?;
            commands::discard::run(&path, group)?;
        }
        Commands::Version => {
            println!("TallyDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("TallyDB Core v{}", tallydb_core::VERSION);
        }
    }

    Ok(())
}
