//! Command-line interface definitions.

pub mod receive;
pub mod share;

use clap::{Parser, Subcommand};

/// Browser-based local network file drop.
#[derive(Debug, Parser)]
#[command(name = "droplink", version, about, long_about = None)]
pub struct Cli {
    /// The command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Share files: other devices download them through a browser
    Share(share::ShareArgs),
    /// Receive files: other devices upload to this host through a browser
    Receive(receive::ReceiveArgs),
}
