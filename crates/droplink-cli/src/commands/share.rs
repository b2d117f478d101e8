//! The `share` command: start a download session and answer confirmation
//! prompts on stdin.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use droplink_core::config::Config;
use droplink_core::file::format_size;
use droplink_core::gate::GateEvent;
use droplink_core::web::{DownloadEvent, DownloadServer};

use crate::ui;

/// Arguments for `droplink share`.
#[derive(Debug, Args)]
pub struct ShareArgs {
    /// Files or directories to share
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Port to start probing from
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Skip the per-device confirmation prompt
    #[arg(long)]
    pub no_confirm: bool,
}

/// Run the share command.
pub async fn run(args: ShareArgs) -> Result<()> {
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.share.start_port = port;
    }
    if args.no_confirm {
        config.share.require_confirmation = false;
    }

    let server = DownloadServer::start(&args.paths, &config)
        .await
        .context("failed to start the sharing session")?;

    let total: u64 = server.files().iter().map(|f| f.size).sum();
    println!(
        "Sharing {} file(s), {} total, from {}.",
        server.files().len(),
        format_size(total),
        crate::ui::device_name()
    );
    ui::print_access(server.url());
    if config.share.require_confirmation {
        println!("Devices must be approved here before they can download.");
    }
    println!("Press Ctrl-C to stop sharing.\n");

    let gate = server.gate();
    let mut gate_events = gate.subscribe();
    let mut download_events = server.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = gate_events.recv() => {
                match event {
                    Ok(GateEvent::ConfirmationRequested { source, identity }) => {
                        println!("Device {source} ({identity}) wants access. Allow? [y/N]");
                    }
                    Ok(GateEvent::Resolved { source, approved }) => {
                        println!("{} {source}.", if approved { "Approved" } else { "Denied" });
                    }
                    Ok(GateEvent::Expired { source }) => {
                        println!("Request from {source} expired unanswered; denied.");
                    }
                    Err(_) => {}
                }
            }
            event = download_events.recv() => {
                match event {
                    Ok(DownloadEvent::Started { source, name, .. }) => {
                        println!("{source} started downloading {name}");
                    }
                    Ok(DownloadEvent::Completed { name, bytes, .. }) => {
                        println!("Finished {name} ({})", format_size(bytes));
                    }
                    Err(_) => {}
                }
            }
            line = lines.next_line() => {
                let Ok(Some(answer)) = line else { continue };
                let approve = matches!(answer.trim().to_lowercase().as_str(), "y" | "yes");
                if let Some(oldest) = gate
                    .pending_requests()
                    .into_iter()
                    .min_by_key(|p| p.requested_at)
                {
                    gate.resolve(&oldest.source, approve);
                } else {
                    println!("Nothing waiting for a decision.");
                }
            }
        }
    }

    println!("\nStopping the sharing session…");
    server.stop().await;
    Ok(())
}
