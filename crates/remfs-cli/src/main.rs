//! remfs CLI - Command-line front end for remote file connectors
//!
//! Provides commands for:
//! - Listing directories and subdirectory trees
//! - Creating and removing entries
//! - Uploading local files with conflict handling
//! - Searching and measuring sizes
//! - Running one-shot or continuous synchronization

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod output;

use commands::{
    browse::{DuCommand, LsCommand, SearchCommand, TreeCommand},
    config::ConfigCommand,
    modify::{MkdirCommand, RmCommand},
    sync::SyncCommand,
    upload::UploadCommand,
};
use context::GlobalArgs;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "remfs", version, about = "Client for elFinder-compatible file connectors")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Connector endpoint, overriding the configured one
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List a directory (the volume root by default)
    Ls(LsCommand),
    /// Show the subdirectory tree of a directory
    Tree(TreeCommand),
    /// Create a directory
    Mkdir(MkdirCommand),
    /// Remove entries by id
    Rm(RmCommand),
    /// Upload local files
    Upload(UploadCommand),
    /// Search entries by name
    Search(SearchCommand),
    /// Show the recursive size of entries
    Du(DuCommand),
    /// Synchronize the cached view with the connector
    Sync(SyncCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let globals = GlobalArgs {
        config: cli.config.clone(),
        url: cli.url.clone(),
    };
    init_tracing(cli.verbose, globals.logging_json());

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match cli.command {
        Commands::Ls(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Tree(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Mkdir(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Rm(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Upload(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Search(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Du(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Sync(cmd) => cmd.execute(globals.load_config()?, format).await,
        Commands::Config(cmd) => cmd.execute(&globals, format).await,
    }
}
