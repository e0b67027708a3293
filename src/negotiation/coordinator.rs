//! Perfect Negotiation
//!
//! Der Coordinator besitzt den Lebenszyklus von lokaler und entfernter
//! Session Description. Bei gleichzeitigen Offers entscheidet die
//! Höflichkeit: der lexikographisch kleinere Teilnehmer gibt nach
//! (Rollback), der größere ignoriert das fremde Offer.
//!
//! Zustand und Reentrancy-Guard liegen hinter einem `parking_lot::Mutex`,
//! der nie über ein `.await` gehalten wird. Konkurrierende Operationen
//! werden verworfen oder umgeleitet, niemals blockiert.

use super::candidates::IceCandidateBuffer;
use super::peer::{PeerConnection, PeerError};
use crate::signaling::{
    CandidateSignal, ChannelStatus, IceCandidate, SdpKind, SessionDescription, SignalingMessage,
    SignalingSender, UserJoined,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),
}

// ============================================================================
// NEGOTIATION STATE
// ============================================================================

/// Negotiation-Zustand einer PeerSession
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Kein Offer ausstehend
    Stable,
    /// Lokales Offer gesendet, wartet auf Answer
    MakingOffer,
    /// Entferntes Offer wird verarbeitet
    HaveRemoteOffer,
}

/// Was mit einem eingehenden Offer passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered,
    /// Kollision auf der unhöflichen Seite
    Ignored,
    /// Protokollfehler oder bereits laufende Remote Description
    Dropped,
}

/// Der lokale Teilnehmer ist höflich, wenn seine Kennung kleiner ist
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

#[derive(Debug)]
struct SessionState {
    state: NegotiationState,
    /// Reentrancy-Guard: Remote Description wird gerade gesetzt
    setting_remote: bool,
    remote_id: Option<String>,
}

// ============================================================================
// NEGOTIATION COORDINATOR
// ============================================================================

pub struct NegotiationCoordinator {
    peer: Arc<dyn PeerConnection>,
    channel: Arc<dyn SignalingSender>,
    session: Mutex<SessionState>,
    candidates: IceCandidateBuffer,
}

impl NegotiationCoordinator {
    pub fn new(peer: Arc<dyn PeerConnection>, channel: Arc<dyn SignalingSender>) -> Self {
        Self {
            peer,
            channel,
            session: Mutex::new(SessionState {
                state: NegotiationState::Stable,
                setting_remote: false,
                remote_id: None,
            }),
            candidates: IceCandidateBuffer::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.session.lock().state
    }

    pub fn remote_id(&self) -> Option<String> {
        self.session.lock().remote_id.clone()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Verarbeitet Nachrichten und Statuswechsel des Kanals in Reihenfolge,
    /// bis der Nachrichtenkanal endet.
    ///
    /// Ein `reset` nach dem Reconnect läuft in derselben Schleife und kann
    /// sich daher nie mit einem laufenden Offer/Answer überschneiden.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
        mut status: watch::Receiver<ChannelStatus>,
    ) {
        let initial = status.borrow_and_update().clone();
        self.handle_status(initial).await;
        let mut status_open = true;

        loop {
            tokio::select! {
                biased;
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let current = status.borrow_and_update().clone();
                    self.handle_status(current).await;
                }
                message = rx.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Negotiation message loop ended");
    }

    /// Nach jedem (Re-)Connect: zurücksetzen und neu beitreten
    pub async fn handle_status(&self, status: ChannelStatus) {
        match status {
            ChannelStatus::Connected { sid } => {
                self.reset().await;
                self.channel.send(SignalingMessage::Join);
                tracing::info!("Joined as {}", sid);
            }
            ChannelStatus::Disconnected => tracing::debug!("Relay disconnected"),
            ChannelStatus::Connecting => {}
        }
    }

    /// Leitet eine eingehende Nachricht an die passende Operation weiter.
    ///
    /// Fehler werden geloggt, nie weitergereicht.
    pub async fn handle_message(&self, message: SignalingMessage) {
        let result = match message {
            SignalingMessage::Offer(offer) => self.handle_remote_offer(offer).await.map(|_| ()),
            SignalingMessage::Answer(answer) => self.handle_remote_answer(answer).await.map(|_| ()),
            SignalingMessage::Candidate(signal) => {
                self.handle_remote_candidate(signal).await;
                Ok(())
            }
            SignalingMessage::UserJoined(event) => self.handle_user_joined(event).await.map(|_| ()),
            other => {
                tracing::debug!("Coordinator ignores '{}'", other.kind());
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!("Negotiation step failed: {}", e);
        }
    }

    /// Startet einen Anruf mit einem lokalen Offer.
    ///
    /// Gibt `Ok(false)` zurück, wenn bereits negotiiert wird.
    pub async fn initiate_call(&self) -> Result<bool, NegotiationError> {
        {
            let mut session = self.session.lock();
            if session.state != NegotiationState::Stable
                || session.setting_remote
                || !self.peer.is_stable()
            {
                tracing::debug!("Negotiation in progress, not making an offer");
                return Ok(false);
            }
            session.state = NegotiationState::MakingOffer;
        }

        tracing::info!("Initiating call");
        let result = async {
            let sdp = self.peer.create_offer().await?;
            self.peer
                .set_local_description(SdpKind::Offer, sdp.clone())
                .await?;
            Ok::<_, PeerError>(sdp)
        }
        .await;

        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                self.session.lock().state = NegotiationState::Stable;
                return Err(e.into());
            }
        };

        // Ein höfliches Rollback kann das Offer inzwischen verdrängt haben
        if self.session.lock().state != NegotiationState::MakingOffer {
            tracing::debug!("Local offer superseded before sending");
            return Ok(false);
        }

        self.channel.send(SignalingMessage::Offer(SessionDescription::offer(
            sdp,
            self.channel.local_id(),
        )));
        Ok(true)
    }

    /// Kollisionsauflösung für eingehende Offers
    pub async fn handle_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<OfferOutcome, NegotiationError> {
        let Some(sender) = offer.sender.clone() else {
            tracing::warn!("Dropping offer without sender id");
            return Ok(OfferOutcome::Dropped);
        };
        let Some(local_id) = self.channel.local_id() else {
            tracing::warn!("Dropping offer from {}: no local id yet", sender);
            return Ok(OfferOutcome::Dropped);
        };

        let polite = is_polite(&local_id, &sender);
        let peer_stable = self.peer.is_stable();

        let collision = {
            let mut session = self.session.lock();
            let collision =
                session.state != NegotiationState::Stable || session.setting_remote || !peer_stable;

            if collision && !polite {
                tracing::info!("Offer collision with {}, ignoring (impolite)", sender);
                return Ok(OfferOutcome::Ignored);
            }
            if session.setting_remote {
                tracing::info!("Remote description already in progress, dropping offer from {}", sender);
                return Ok(OfferOutcome::Dropped);
            }

            // Guard vor dem Rollback setzen, damit nichts dazwischenkommt
            session.setting_remote = true;
            if session.remote_id.as_deref() != Some(sender.as_str()) {
                tracing::info!("Remote participant is now {}", sender);
                session.remote_id = Some(sender.clone());
            }
            collision
        };

        let result = self.answer_remote_offer(offer, collision).await;

        {
            let mut session = self.session.lock();
            session.setting_remote = false;
            session.state = NegotiationState::Stable;
        }

        let answer_sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                self.recover_peer().await;
                return Err(e.into());
            }
        };

        self.channel.send(SignalingMessage::Answer(SessionDescription::answer(
            answer_sdp,
            Some(local_id),
        )));
        self.flush_candidates().await;
        Ok(OfferOutcome::Answered)
    }

    /// Übernimmt das Answer auf unser Offer; sonst No-op
    pub async fn handle_remote_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        {
            let mut session = self.session.lock();
            if session.state != NegotiationState::MakingOffer || session.setting_remote {
                tracing::debug!("Discarding unexpected answer");
                return Ok(false);
            }
            session.setting_remote = true;
        }

        let result = self
            .peer
            .set_remote_description(SdpKind::Answer, answer.sdp)
            .await;

        {
            let mut session = self.session.lock();
            session.setting_remote = false;
            session.state = NegotiationState::Stable;
            if let Some(sender) = answer.sender {
                session.remote_id.get_or_insert(sender);
            }
        }

        if let Err(e) = result {
            self.recover_peer().await;
            return Err(e.into());
        }

        tracing::info!("Answer applied, connecting");
        self.flush_candidates().await;
        Ok(true)
    }

    /// Ein zweiter Teilnehmer ist da: wir rufen an
    pub async fn handle_user_joined(&self, event: UserJoined) -> Result<bool, NegotiationError> {
        tracing::info!("Peer {} joined, calling", event.sid);
        self.session.lock().remote_id = Some(event.sid);
        self.initiate_call().await
    }

    /// Lokale Candidates gehen sofort raus, ohne Puffer
    pub fn on_local_candidate_discovered(&self, candidate: Option<IceCandidate>) {
        let sender = self.channel.local_id();
        let signal = match candidate {
            Some(c) => CandidateSignal {
                candidate: Some(c),
                sender,
            },
            None => CandidateSignal::end_of_candidates(sender),
        };
        self.channel.send(SignalingMessage::Candidate(signal));
    }

    /// Entfernte Candidates anwenden oder puffern
    pub async fn handle_remote_candidate(&self, signal: CandidateSignal) {
        let Some(candidate) = signal.candidate else {
            tracing::debug!("Remote end of candidates");
            return;
        };

        let setting_remote = self.session.lock().setting_remote;
        if setting_remote || !self.peer.has_remote_description().await {
            tracing::debug!("Buffering remote candidate");
            self.candidates.enqueue(candidate);
            return;
        }

        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate: {}", e);
        }
    }

    /// Nach einem Reconnect des Kanals: zurück auf `stable` ohne Altlasten
    pub async fn reset(&self) {
        let had_offer = {
            let mut session = self.session.lock();
            let had_offer = session.state != NegotiationState::Stable;
            session.state = NegotiationState::Stable;
            session.setting_remote = false;
            session.remote_id = None;
            had_offer
        };
        self.candidates.clear();

        if had_offer || !self.peer.is_stable() {
            self.recover_peer().await;
        }
        tracing::debug!("Negotiation state reset");
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn answer_remote_offer(
        &self,
        offer: SessionDescription,
        collision: bool,
    ) -> Result<String, PeerError> {
        if collision {
            tracing::info!("Offer collision, rolling back local offer (polite)");
            // Offer evtl. noch nicht committed
            if !self.peer.is_stable() {
                self.peer.rollback().await?;
            }
            self.session.lock().state = NegotiationState::Stable;
        }

        self.session.lock().state = NegotiationState::HaveRemoteOffer;
        self.peer
            .set_remote_description(SdpKind::Offer, offer.sdp)
            .await?;

        let answer = self.peer.create_answer().await?;
        self.peer
            .set_local_description(SdpKind::Answer, answer.clone())
            .await?;
        Ok(answer)
    }

    /// Bringt die Verbindung nach einem Fehler zurück auf `stable`
    async fn recover_peer(&self) {
        if self.peer.is_stable() {
            return;
        }
        if let Err(e) = self.peer.rollback().await {
            tracing::warn!("Rollback after failed negotiation failed: {}", e);
        }
    }

    async fn flush_candidates(&self) {
        let peer = Arc::clone(&self.peer);
        let report = self
            .candidates
            .flush(|c| {
                let peer = Arc::clone(&peer);
                async move { peer.add_ice_candidate(c).await }
            })
            .await;

        if report.applied + report.failed > 0 {
            tracing::debug!(
                "Flushed candidates: {} applied, {} failed",
                report.applied,
                report.failed
            );
        }
    }
}

impl std::fmt::Debug for NegotiationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationCoordinator")
            .field("session", &*self.session.lock())
            .field("buffered_candidates", &self.candidates.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
