//! LodeDB CLI
//!
//! Command-line tools for LodeDB environment maintenance.
//!
//! # Commands
//!
//! - `stat` - Environment and database statistics
//! - `verify` - Structural verification of databases
//! - `dump` - Print every key/value pair of a database
//! - `checkpoint` - Take a checkpoint
//! - `recover` - Run recovery, optionally from the start of the log
//! - `archive` - Remove log files no longer needed
//! - `log-dump` - Print log records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LodeDB command-line environment tools.
#[derive(Parser)]
#[command(name = "lodedb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Environment directory
    #[arg(global = true, short = 'H', long)]
    home: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Page cache size in pages
    #[arg(global = true, long, default_value = "1024")]
    cache_pages: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display environment and database statistics
    Stat {
        /// Only this database
        #[arg(short, long)]
        db: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify database structure
    Verify {
        /// Only this database (default: all)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Print the contents of a database
    Dump {
        /// Database to dump
        #[arg(short, long)]
        db: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Take a checkpoint
    Checkpoint,

    /// Run recovery and report what it did
    Recover {
        /// Replay the whole log instead of starting at the last checkpoint
        #[arg(short, long)]
        catastrophic: bool,
    },

    /// Remove log files that recovery no longer needs
    Archive,

    /// Dump log records for debugging
    LogDump {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let home = || cli.home.clone().ok_or("environment directory required (--home)");
    let cache_pages = cli.cache_pages;

    match &cli.command {
        Commands::Stat { db, format } => {
            commands::stat::run(&home()?, cache_pages, db.as_deref(), format)?;
        }
        Commands::Verify { db } => {
            commands::verify::run(&home()?, cache_pages, db.as_deref())?;
        }
        Commands::Dump { db, format } => {
            commands::dump::run(&home()?, cache_pages, db, format)?;
        }
        Commands::Checkpoint => {
            commands::maintenance::checkpoint(&home()?, cache_pages)?;
        }
        Commands::Recover { catastrophic } => {
            commands::maintenance::recover(&home()?, cache_pages, *catastrophic)?;
        }
        Commands::Archive => {
            commands::maintenance::archive(&home()?, cache_pages)?;
        }
        Commands::LogDump { limit, format } => {
            commands::log_dump::run(&home()?, *limit, format)?;
        }
        Commands::Version => {
            println!("LodeDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("LodeDB Core v{}", lodedb_core::VERSION);
        }
    }

    Ok(())
}
