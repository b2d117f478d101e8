//! Droplink CLI - browser-based local network file drop
//!
//! Droplink exposes a temporary HTTP endpoint on the local network so any
//! device with a browser can download files from this host, or upload files
//! to it, with no client app.
//!
//! ## Quick Start
//!
//! ```bash
//! # Share files (other devices download them)
//! droplink share ./photos ./document.pdf
//!
//! # Receive files (other devices upload to you)
//! droplink receive --output ~/Downloads
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Share(args) => commands::share::run(args).await,
        Command::Receive(args) => commands::receive::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,droplink=info,droplink_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
