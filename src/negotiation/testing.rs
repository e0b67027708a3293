//! Test-Doubles für Peer Connection und Kanal

use super::peer::{PeerConnection, PeerError};
use crate::signaling::{IceCandidate, SdpKind, SignalingMessage, SignalingSender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
struct FakePeerState {
    signaling: FakeSignalingState,
    has_remote: bool,
    offers_created: usize,
    fail_next_remote: bool,
    fail_next_local: bool,
}

/// Minimaler Zustandsautomat nach JSEP, protokolliert alle Aufrufe
#[derive(Debug)]
pub struct FakePeer {
    state: Mutex<FakePeerState>,
    calls: Mutex<Vec<String>>,
    applied: Mutex<Vec<IceCandidate>>,
    remote_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakePeer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakePeerState {
                signaling: FakeSignalingState::Stable,
                has_remote: false,
                offers_created: 0,
                fail_next_remote: false,
                fail_next_local: false,
            }),
            calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            remote_gate: Mutex::new(None),
        }
    }

    pub fn signaling_state(&self) -> FakeSignalingState {
        self.state.lock().signaling
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn applied(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn fail_next_remote_description(&self) {
        self.state.lock().fail_next_remote = true;
    }

    /// Die nächste Remote Description hängt, bis der Notify auslöst
    pub fn hold_next_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.remote_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_next_local_description(&self) {
        self.state.lock().fail_next_local = true;
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        self.record("create_offer");
        let mut state = self.state.lock();
        state.offers_created += 1;
        Ok(format!("offer-sdp-{}", state.offers_created))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.record("create_answer");
        if self.state.lock().signaling != FakeSignalingState::HaveRemoteOffer {
            return Err(PeerError::WebRTC("no remote offer".to_string()));
        }
        Ok("answer-sdp".to_string())
    }

    async fn set_local_description(&self, kind: SdpKind, _sdp: String) -> Result<(), PeerError> {
        self.record(format!("set_local:{:?}", kind));
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_local) {
            return Err(PeerError::WebRTC("local description rejected".to_string()));
        }
        state.signaling = match (state.signaling, kind) {
            (FakeSignalingState::Stable, SdpKind::Offer) => FakeSignalingState::HaveLocalOffer,
            (FakeSignalingState::HaveRemoteOffer, SdpKind::Answer) => FakeSignalingState::Stable,
            (s, k) => return Err(PeerError::WebRTC(format!("cannot set local {:?} in {:?}", k, s))),
        };
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: String) -> Result<(), PeerError> {
        self.record(format!("set_remote:{:?}", kind));
        let gate = self.remote_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_remote) {
            return Err(PeerError::InvalidSdp("remote description rejected".to_string()));
        }
        state.signaling = match (state.signaling, kind) {
            (FakeSignalingState::Stable, SdpKind::Offer) => FakeSignalingState::HaveRemoteOffer,
            (FakeSignalingState::HaveLocalOffer, SdpKind::Answer) => FakeSignalingState::Stable,
            (s, k) => return Err(PeerError::WebRTC(format!("cannot set remote {:?} in {:?}", k, s))),
        };
        state.has_remote = true;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.record("rollback");
        let mut state = self.state.lock();
        if state.signaling == FakeSignalingState::Stable {
            return Err(PeerError::NothingToRollBack);
        }
        // Wie bei einer neu aufgebauten Verbindung
        state.signaling = FakeSignalingState::Stable;
        state.has_remote = false;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record("add_ice_candidate");
        if candidate.candidate.contains("bad") {
            return Err(PeerError::WebRTC("unparseable candidate".to_string()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote
    }

    fn is_stable(&self) -> bool {
        self.state.lock().signaling == FakeSignalingState::Stable
    }
}

/// Kanal, der gesendete Nachrichten nur sammelt
#[derive(Debug)]
pub struct FakeChannel {
    local_id: Mutex<Option<String>>,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl FakeChannel {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: Mutex::new(Some(local_id.to_string())),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            local_id: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<SignalingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SignalingSender for FakeChannel {
    fn send(&self, message: SignalingMessage) {
        self.sent.lock().push(message);
    }

    fn local_id(&self) -> Option<String> {
        self.local_id.lock().clone()
    }
}
