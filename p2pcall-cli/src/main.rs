//! p2pcall CLI application

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::CliConfig;
use p2pcall_core::prelude::*;
use p2pcall_core::{LocalTrack, MediaEventSink};
use simulate::SimulateOptions;
use std::path::PathBuf;
use std::time::Duration;

mod config;
mod simulate;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "P2PCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the dial timeout
    #[arg(long, env = "P2PCALL_DIAL_TIMEOUT_MS")]
    dial_timeout_ms: Option<u64>,

    /// Override the connect timeout
    #[arg(long, env = "P2PCALL_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a whole call between two in-process peers
    Simulate {
        /// Start as a video call
        #[arg(long)]
        video: bool,

        /// Turn the camera on after connecting
        #[arg(long)]
        upgrade: bool,

        /// Callee declines
        #[arg(long, conflicts_with = "no_answer")]
        decline: bool,

        /// Callee never answers
        #[arg(long)]
        no_answer: bool,

        /// Milliseconds to stay connected
        #[arg(long, default_value = "3000")]
        hold_ms: u64,
    },

    /// Print the SDP offer a real peer connection would send
    Offer {
        /// Include a video section
        #[arg(long)]
        video: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "p2pcall=info,p2pcall_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref())?;
    config.apply_overrides(cli.dial_timeout_ms, cli.connect_timeout_ms);

    match cli.command {
        Commands::Simulate {
            video,
            upgrade,
            decline,
            no_answer,
            hold_ms,
        } => {
            let options = SimulateOptions {
                video,
                upgrade,
                decline,
                no_answer,
                hold: Duration::from_millis(hold_ms),
            };
            handle_simulate(&config, options).await?;
        }
        Commands::Offer { video } => {
            handle_offer(&config, video).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn handle_simulate(config: &CliConfig, options: SimulateOptions) -> Result<()> {
    println!("📞 Alice calls Bob over an in-process loopback");
    let outcome = simulate::run(&config.calls, options).await?;
    match outcome {
        CallEvent::Ended { reason, .. } => println!("📴 Call ended: {reason:?}"),
        CallEvent::Error { error, .. } => println!("❌ Call failed: {error}"),
        other => tracing::debug!(event = ?other, "Unexpected final event"),
    }
    Ok(())
}

async fn handle_offer(config: &CliConfig, video: bool) -> Result<()> {
    let factory = WebRtcLinkFactory::new(config.link.clone());
    let call_id = CallId::new();
    let sink = MediaEventSink::new(call_id, |call_id, event| {
        tracing::debug!(call_id = %call_id, event = ?event, "Media link event");
    });
    let link = factory.open(call_id, sink).await?;

    link.add_track(&LocalTrack::new("audio-0", TrackKind::Audio))
        .await?;
    let kind = if video {
        link.add_track(&LocalTrack::new("video-0", TrackKind::Video))
            .await?;
        MediaKind::Video
    } else {
        MediaKind::Audio
    };

    let offer = link.create_offer(kind).await?;
    print!("{}", offer.sdp);
    link.close().await?;
    Ok(())
}
