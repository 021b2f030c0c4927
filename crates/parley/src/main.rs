//! Parley CLI: a voice call on the local microphone and speakers.
//!
//! Usage:
//!   cargo run -p parley -- [--placeholder] [--max-duration-ms 60000]
//!   cargo run -p parley -- --health
//!   cargo run -p parley -- --list-devices
//!
//! Lifecycle events are printed to stdout as JSON lines; logs go to stderr.
//! Ctrl-C hangs up.

use anyhow::Context;
use parley::providers::probe_health;
use parley::{
    CallConfig, CallSession, CpalFrameSource, EventEmitter, Providers, RodioSink, TracingBillingSink,
    VoiceEntitlement,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut placeholder = false;
    let mut health = false;
    let mut list_devices = false;
    let mut max_duration_ms: i64 = -1;

    while let Some(a) = args.next() {
        match a.as_str() {
            "--placeholder" => placeholder = true,
            "--health" => health = true,
            "--list-devices" => list_devices = true,
            "--max-duration-ms" => {
                if let Some(ms) = args.next() {
                    max_duration_ms = ms.parse().context("--max-duration-ms expects an integer")?;
                }
            }
            "--help" | "-h" => {
                eprintln!("Parley: real-time voice calls");
                eprintln!("  --placeholder          Offline providers (fixed transcript, echo model, silent audio)");
                eprintln!("  --max-duration-ms N    End the call after N ms (default: unlimited)");
                eprintln!("  --health               Probe the provider endpoint and exit");
                eprintln!("  --list-devices         Print input devices and exit");
                eprintln!();
                eprintln!("Config: PARLEY_CONFIG (TOML) and PARLEY__SECTION__KEY env overrides.");
                return Ok(());
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
    }

    if list_devices {
        for name in CpalFrameSource::list_input_devices()? {
            println!("🎤 {}", name);
        }
        return Ok(());
    }

    let config = CallConfig::load().context("loading configuration")?;

    if health {
        let report = probe_health(&config.providers).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let providers = if placeholder {
        info!("Using placeholder providers");
        Providers::placeholder()
    } else {
        Providers::openai(&config.providers).context("building provider clients")?
    };

    let sink = Arc::new(RodioSink::open_default().context("opening speakers")?);
    let source = Box::new(CpalFrameSource::new(config.audio.clone()));
    let (events, mut event_rx) = EventEmitter::channel();

    let entitlement = VoiceEntitlement {
        voice_allowed: true,
        max_call_duration_ms: max_duration_ms,
    };
    let session = CallSession::new(
        config,
        entitlement,
        source,
        providers,
        sink,
        events,
        Arc::new(TracingBillingSink),
    );

    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.hangup();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    let summary = session.run().await;
    let _ = printer.await;
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
