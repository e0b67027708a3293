//! WebRTC Peer Connection
//!
//! `PeerConnection` kapselt die Negotiation-Primitive, damit der
//! Coordinator ohne echte Verbindung testbar bleibt. `WebRtcPeer` ist die
//! Implementierung auf Basis von webrtc-rs.

use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Nothing to roll back")]
    NothingToRollBack,
}

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError::WebRTC(e.to_string())
    }
}

// ============================================================================
// PEER CONNECTION SEAM
// ============================================================================

/// Negotiation-Primitive einer Peer Connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, PeerError>;

    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;

    /// Verwirft die ausstehende lokale oder entfernte Description
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn has_remote_description(&self) -> bool;

    /// Signaling State der Verbindung ist `stable`
    fn is_stable(&self) -> bool;
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

fn to_rtc_ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            ..Default::default()
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(c: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

// ============================================================================
// WEBRTC PEER
// ============================================================================

type CandidateHandler = Arc<dyn Fn(Option<IceCandidate>) + Send + Sync>;

/// Peer Connection auf Basis von webrtc-rs.
///
/// webrtc-rs kennt keine `rollback`-Description. Ein Rollback baut deshalb
/// eine frische Verbindung mit denselben Tracks und Handlern auf.
pub struct WebRtcPeer {
    api: API,
    config: RTCConfiguration,
    pc: RwLock<Arc<RTCPeerConnection>>,
    tracks: Mutex<Vec<Arc<dyn TrackLocal + Send + Sync>>>,
    candidate_handler: Mutex<Option<CandidateHandler>>,
}

impl WebRtcPeer {
    /// Erstellt eine neue Peer Connection
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, H264 ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config.clone()).await?);
        Self::setup_state_handlers(&pc);

        Ok(Self {
            api,
            config,
            pc: RwLock::new(pc),
            tracks: Mutex::new(Vec::new()),
            candidate_handler: Mutex::new(None),
        })
    }

    /// Callback für lokal gefundene ICE Candidates; `None` = Gathering fertig
    pub fn on_local_candidate<F>(&self, handler: F)
    where
        F: Fn(Option<IceCandidate>) + Send + Sync + 'static,
    {
        let handler: CandidateHandler = Arc::new(handler);
        *self.candidate_handler.lock() = Some(Arc::clone(&handler));
        Self::install_candidate_handler(&self.current(), handler);
    }

    /// Hängt einen lokalen Track an (vor jeder Negotiation)
    pub async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<(), PeerError> {
        self.current().add_track(Arc::clone(&track)).await?;
        self.tracks.lock().push(track);
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = self.current().close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }

    fn current(&self) -> Arc<RTCPeerConnection> {
        self.pc.read().clone()
    }

    fn install_candidate_handler(pc: &RTCPeerConnection, handler: CandidateHandler) {
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate {
                Some(c) => match c.to_json() {
                    Ok(init) => handler(Some(init.into())),
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                },
                None => handler(None),
            }
            Box::pin(async {})
        }));
    }

    /// Ersetzt die Verbindung durch eine frische im Zustand `stable`
    async fn rebuild(&self) -> Result<(), PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        Self::setup_state_handlers(&pc);

        let handler = self.candidate_handler.lock().clone();
        if let Some(handler) = handler {
            Self::install_candidate_handler(&pc, handler);
        }

        let tracks = self.tracks.lock().clone();
        for track in tracks {
            pc.add_track(track).await?;
        }

        let old = std::mem::replace(&mut *self.pc.write(), pc);

        // Späte Candidates der alten Verbindung nicht mehr melden
        old.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        if let Err(e) = old.close().await {
            tracing::debug!("Failed to close replaced peer connection: {}", e);
        }
        Ok(())
    }

    /// Registriert Logging-Handler für Verbindungs- und ICE-Status
    fn setup_state_handlers(pc: &Arc<RTCPeerConnection>) {
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {}", s);
            Box::pin(async {})
        }));

        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            match s {
                RTCIceConnectionState::Checking => tracing::info!("Checking connection paths..."),
                RTCIceConnectionState::Connected => tracing::info!("ICE connected"),
                RTCIceConnectionState::Failed => {
                    tracing::warn!("ICE connection failed, check firewall/NAT")
                }
                RTCIceConnectionState::Disconnected => tracing::warn!("Peer disconnected"),
                other => tracing::debug!("ICE state: {}", other),
            }
            Box::pin(async {})
        }));

        // Wiedergabe des Remote-Streams übernimmt die Oberfläche
        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!("Remote track received: {} ({})", track.kind(), track.codec().capability.mime_type);
            })
        }));
    }

    fn description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, PeerError> {
        let desc = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        };
        desc.map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        Ok(self.current().create_offer(None).await?.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        Ok(self.current().create_answer(None).await?.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        self.current()
            .set_local_description(Self::description(kind, sdp)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        self.current()
            .set_remote_description(Self::description(kind, sdp)?)
            .await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        match self.current().signaling_state() {
            RTCSignalingState::HaveLocalOffer
            | RTCSignalingState::HaveRemoteOffer
            | RTCSignalingState::HaveLocalPranswer
            | RTCSignalingState::HaveRemotePranswer => {
                tracing::debug!("Rolling back by replacing the peer connection");
                self.rebuild().await
            }
            _ => Err(PeerError::NothingToRollBack),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.current().add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.current().remote_description().await.is_some()
    }

    fn is_stable(&self) -> bool {
        self.current().signaling_state() == RTCSignalingState::Stable
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pc = self.current();
        f.debug_struct("WebRtcPeer")
            .field("signaling_state", &pc.signaling_state())
            .field("connection_state", &pc.connection_state())
            .field("tracks", &self.tracks.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
