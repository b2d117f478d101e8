//! The `receive` command: start an upload session and resolve save/discard
//! decisions on stdin.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use droplink_core::config::Config;
use droplink_core::file::format_size;
use droplink_core::gate::GateEvent;
use droplink_core::staging::StagedStatus;
use droplink_core::web::UploadServer;

use crate::ui;

/// Arguments for `droplink receive`.
#[derive(Debug, Args)]
pub struct ReceiveArgs {
    /// Directory saved files are placed in (defaults to the current dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Port to start probing from
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Require per-device confirmation before accepting uploads
    #[arg(long)]
    pub confirm: bool,

    /// Shared secret for end-to-end encrypted chunked uploads
    #[arg(long)]
    pub secret: Option<String>,
}

/// Run the receive command.
pub async fn run(args: ReceiveArgs) -> Result<()> {
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.receive.start_port = port;
    }
    if args.confirm {
        config.receive.require_confirmation = true;
    }
    if args.secret.is_some() {
        config.chunked.shared_secret = args.secret;
    }

    let output = match args.output {
        Some(dir) => dir,
        None => std::env::current_dir().context("cannot resolve the current directory")?,
    };
    let temp_dir = std::env::temp_dir().join(format!("droplink-{}", std::process::id()));

    let server = UploadServer::start(&temp_dir, &output, &config)
        .await
        .context("failed to start the receiving session")?;

    println!(
        "{} is receiving files into {}.",
        crate::ui::device_name(),
        output.display()
    );
    ui::print_access(server.url());
    println!("Received files wait for your decision before being kept.");
    println!("Press Ctrl-C to stop receiving.\n");

    let staging = server.staging();
    let gate = server.gate();
    let mut staged_events = staging.subscribe();
    let mut gate_events = gate.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = staged_events.recv() => {
                if let Ok(file) = event {
                    println!(
                        "Received {} ({}). Keep it? [y/N]",
                        file.name,
                        format_size(file.size)
                    );
                }
            }
            event = gate_events.recv() => {
                if let Ok(GateEvent::ConfirmationRequested { source, identity }) = event {
                    println!("Device {source} ({identity}) wants to upload. Allow? [y/N]");
                }
            }
            line = lines.next_line() => {
                let Ok(Some(answer)) = line else { continue };
                let yes = matches!(answer.trim().to_lowercase().as_str(), "y" | "yes");

                // Gate prompts first, then the oldest undecided file.
                if let Some(oldest) = gate
                    .pending_requests()
                    .into_iter()
                    .min_by_key(|p| p.requested_at)
                {
                    gate.resolve(&oldest.source, yes);
                    continue;
                }

                let undecided = staging
                    .list()
                    .into_iter()
                    .find(|f| f.status == StagedStatus::Pending);
                match undecided {
                    Some(file) if yes => {
                        if staging.save(file.id).await {
                            let saved = staging.get(file.id).and_then(|f| f.final_path);
                            match saved {
                                Some(path) => println!("Saved to {}", path.display()),
                                None => println!("Saved {}", file.name),
                            }
                        } else {
                            println!("Could not save {}.", file.name);
                        }
                    }
                    Some(file) => {
                        if staging.discard(file.id).await {
                            println!("Discarded {}.", file.name);
                        } else {
                            println!("Could not discard {}.", file.name);
                        }
                    }
                    None => println!("Nothing waiting for a decision."),
                }
            }
        }
    }

    println!("\nStopping; discarding undecided files…");
    server.stop().await;
    Ok(())
}
