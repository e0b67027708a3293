//! peerlink CLI
//!
//! Startet einen Anruf über den Relay und gibt die Live-Metriken aus.

use anyhow::Context;
use clap::Parser;
use peerlink::config::IceServerConfig;
use peerlink::media::DeviceCapture;
use peerlink::metrics::RiskIndicator;
use peerlink::{AppConfig, CallSession};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "P2P audio/video call with live speech analysis")]
struct Cli {
    /// Pfad zur Konfigurationsdatei (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay-URL, überschreibt Datei und SIGNALING_URL
    #[arg(short, long)]
    server: Option<String>,

    /// Zusätzlicher STUN/TURN-Server (mehrfach möglich)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Eingabegerät nach Name
    #[arg(long)]
    input_device: Option<String>,

    /// Mit stummgeschaltetem Mikrofon starten
    #[arg(long)]
    muted: bool,

    /// Ohne Kamerabild starten
    #[arg(long)]
    no_video: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(AppConfig, bool, bool)> {
        let mut config =
            AppConfig::load(self.config.as_deref()).context("Failed to load configuration")?;

        config.apply_signaling_url(self.server);
        config
            .ice_servers
            .extend(self.ice_servers.iter().map(|url| IceServerConfig::stun(url)));
        if self.input_device.is_some() {
            config.capture.input_device = self.input_device;
        }
        config.validate().context("Invalid configuration")?;

        Ok((config, self.muted, self.no_video))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peerlink::init_logging();

    let (config, muted, no_video) = Cli::parse().into_config()?;
    tracing::info!("Starting peerlink, relay {}", config.signaling_url);

    let mut session = CallSession::start(&config, Box::new(DeviceCapture::new()))
        .await
        .context("Could not start the call (camera and microphone are required)")?;

    session.set_audio_enabled(!muted);
    session.set_video_enabled(!no_video);

    let mut metrics = session.metrics();
    let report = tokio::spawn(async move {
        while metrics.changed().await.is_ok() {
            let window = metrics.borrow_and_update().clone();
            if let Some(sample) = window.samples().last() {
                tracing::info!("[{}] {:.0} wpm (baseline {:.0})", sample.label, sample.wpm, sample.baseline);
            }
            if let Some(consult) = window.advisory().consult.as_ref() {
                let level = match window.advisory().risk {
                    RiskIndicator::High => "HIGH",
                    RiskIndicator::Medium => "MEDIUM",
                    RiskIndicator::Default => "normal",
                };
                tracing::info!("Risk {}: {}", level, consult.key_insight);
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, hanging up");
        }
        _ = session.wait() => {
            tracing::warn!("Relay connection lost for good");
        }
    }

    report.abort();
    session.shutdown().await;
    Ok(())
}
