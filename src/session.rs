//! Call Session
//!
//! Verdrahtet Relay, Peer Connection, Negotiation, Media und Metriken für
//! genau einen Anruf pro Prozess:
//!
//! 1. Kamera und Mikrofon öffnen (Fehler ist fatal)
//! 2. Tracks an die Peer Connection hängen
//! 3. Mit dem Relay verbinden; nach jedem Connect `reset()` und `join`
//!    im Nachrichten-Loop des Coordinators
//! 4. Audio-Upload und Metriken laufen unabhängig daneben

use crate::config::AppConfig;
use crate::media::{
    AudioChunkUploader, CaptureBackend, MediaCapturePipeline, MediaError, VideoTrack,
};
use crate::metrics::{MetricsStreamConsumer, MetricsWindow};
use crate::negotiation::{NegotiationCoordinator, NegotiationState, PeerError, WebRtcPeer};
use crate::signaling::{
    ChannelStatus, MessageKind, SignalingClient, SignalingError, SignalingSender,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Nachrichten, die der Coordinator in Zustell-Reihenfolge sieht
const NEGOTIATION_KINDS: [MessageKind; 4] = [
    MessageKind::Offer,
    MessageKind::Answer,
    MessageKind::Candidate,
    MessageKind::UserJoined,
];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    client: Arc<SignalingClient>,
    peer: Arc<WebRtcPeer>,
    coordinator: Arc<NegotiationCoordinator>,
    media: Arc<MediaCapturePipeline>,
    metrics: watch::Receiver<MetricsWindow>,
    signaling_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallSession {
    /// Baut die Session auf und verbindet mit dem Relay
    pub async fn start(
        config: &AppConfig,
        backend: Box<dyn CaptureBackend>,
    ) -> Result<Self, SessionError> {
        // Ohne Kamera und Mikrofon kein Anruf
        let media = Arc::new(MediaCapturePipeline::acquire(backend, &config.capture)?);

        let peer = Arc::new(WebRtcPeer::new(&config.ice_servers).await?);
        media.attach_to(&peer).await?;

        let client = Arc::new(SignalingClient::new(
            &config.signaling_url,
            config.reconnect.policy(),
        )?);
        let coordinator = Arc::new(NegotiationCoordinator::new(peer.clone(), client.clone()));

        // Weak, sonst halten sich Peer und Coordinator gegenseitig am Leben
        let weak = Arc::downgrade(&coordinator);
        peer.on_local_candidate(move |candidate| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_local_candidate_discovered(candidate);
            }
        });

        let mut tasks = Vec::new();

        let negotiation_rx = client.subscribe(&NEGOTIATION_KINDS);
        tasks.push(tokio::spawn(
            Arc::clone(&coordinator).run(negotiation_rx, client.status()),
        ));

        let consumer = MetricsStreamConsumer::new();
        let metrics = consumer.snapshots();
        tasks.push(tokio::spawn(consumer.run(client.on_message(MessageKind::AiUpdate))));

        let uploader = AudioChunkUploader::for_stream(client.clone(), &media.audio_stream());
        tasks.push(tokio::spawn(async move {
            uploader.run().await;
        }));

        let signaling_task = Some(client.start());
        tracing::info!("Call session started, relay {}", client.server_url());

        Ok(Self {
            client,
            peer,
            coordinator,
            media,
            metrics,
            signaling_task,
            tasks,
        })
    }

    /// Snapshots des Metrik-Fensters
    pub fn metrics(&self) -> watch::Receiver<MetricsWindow> {
        self.metrics.clone()
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.client.status()
    }

    pub fn local_id(&self) -> Option<String> {
        self.client.local_id()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.coordinator.remote_id()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.coordinator.state()
    }

    pub fn video_track(&self) -> VideoTrack {
        self.media.video_track()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.media.set_video_enabled(enabled);
    }

    /// Wartet, bis der Relay-Client aufgibt oder geschlossen wird
    pub async fn wait(&mut self) {
        if let Some(task) = self.signaling_task.as_mut() {
            if let Err(e) = task.await {
                tracing::error!("Signaling task failed: {}", e);
            }
            self.signaling_task = None;
        }
    }

    /// Beendet Media, Relay-Verbindung und Peer Connection
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down call session");
        self.media.stop();
        self.client.close();
        self.wait().await;
        self.peer.close().await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
