//! Lanlink CLI - Serverless chat and file transfer on the local network
//!
//! Every running instance announces itself on the LAN, finds the others,
//! and can exchange messages, images and files with them directly.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start a node and type commands
//! lanlink run --name alice
//!
//! # Show where the configuration lives
//! lanlink config --path
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::Parser;

mod commands;
mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Command::Run(args) if args.verbose);
    init_logging(verbose);

    match cli.command {
        Command::Run(args) => commands::run::run(args).await,
        Command::Config(args) => commands::config::run(&args),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "debug"
    } else {
        "warn,lanlink=info,lanlink_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
