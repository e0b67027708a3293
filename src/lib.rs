//! peerlink - P2P Audio/Video Call mit Live-Sprachanalyse
//!
//! Ein Anruf zwischen genau zwei Teilnehmern über einen Relay-Server mit:
//! - WebSocket-Signaling mit automatischem Reconnect
//! - WebRTC Perfect Negotiation (Offer-Kollisionen, ICE-Puffer)
//! - Segmentiertem Audio-Upload zur Analyse
//! - Live-Metriken und KI-Empfehlungen aus `ai_update`

pub mod config;
pub mod media;
pub mod metrics;
pub mod negotiation;
pub mod session;
pub mod signaling;

pub use config::{AppConfig, ConfigError};
pub use session::{CallSession, SessionError};

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Default-Direktiven, `RUST_LOG` ergänzt sie
const DEFAULT_LOG_DIRECTIVES: [&str; 2] = ["peerlink=debug", "webrtc=warn"];

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (einmal pro Prozess)
pub fn init_logging() {
    let filter = DEFAULT_LOG_DIRECTIVES
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive)
        });

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Logging already initialized");
    }
}
