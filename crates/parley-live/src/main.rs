//! Parley CLI: hold a live voice conversation from the terminal.
//!
//! Usage:
//!   cargo run -p parley-live -- [--config parley.toml] [--duration 120]
//!
//! Talks to the configured endpoint with the default microphone and speakers
//! until the remote side ends the session, `--duration` elapses or Ctrl+C.

use anyhow::Context;
use parley_live::{
    key_source_for, CpalInput, LiveConfig, LiveSession, RodioOutput, SessionOutcome, WsConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<PathBuf>,
    duration: Option<u64>,
    print_config: bool,
    list_devices: bool,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut parsed = Args {
        config: None,
        duration: None,
        print_config: false,
        list_devices: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a file path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--duration" => {
                let secs = args.next().context("--duration needs a number of seconds")?;
                parsed.duration = Some(secs.parse().context("--duration must be whole seconds")?);
            }
            "--print-config" => parsed.print_config = true,
            "--list-devices" => parsed.list_devices = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other => anyhow::bail!("unknown argument: {} (try --help)", other),
        }
    }
    Ok(Some(parsed))
}

fn print_usage() {
    eprintln!("Parley: live voice session");
    eprintln!("  --config FILE      TOML settings (PARLEY_* env vars override)");
    eprintln!("  --duration N       End the session after N seconds");
    eprintln!("  --print-config     Show the effective settings and exit");
    eprintln!("  --list-devices     Show input devices and exit");
    eprintln!();
    eprintln!("The API key comes from api_key / PARLEY_API_KEY, else GEMINI_API_KEY.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley_live=info")),
        )
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    if args.list_devices {
        for name in CpalInput::list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = LiveConfig::load(args.config.as_deref()).context("loading configuration")?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let output = Arc::new(RodioOutput::open(config.output_format())?);
    let clock = output.clock();
    let input = Box::new(CpalInput::new(config.audio_input()));
    let connector = Arc::new(WsConnector::new(key_source_for(&config)));

    let mut session = LiveSession::new(config, input, output, clock, connector);
    let controller = session.controller();
    info!("🎙️ Session {} starting (Ctrl+C to stop)", session.id());

    let duration = args.duration;
    tokio::spawn(async move {
        let deadline = async {
            match duration {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
            _ = deadline => info!("Duration reached"),
            _ = controller.finished() => return,
        }
        controller.close().await;
    });

    let report = session.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(SessionOutcome::Failed(cause)) = &report.outcome {
        warn!("Session ended with an error: {}", cause);
        std::process::exit(1);
    }
    Ok(())
}
