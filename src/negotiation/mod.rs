//! Negotiation Module
//!
//! Perfect Negotiation zwischen zwei Teilnehmern, ICE Candidate Puffer und
//! die Peer Connection selbst.

mod candidates;
mod coordinator;
mod peer;

#[cfg(test)]
pub(crate) mod testing;

pub use candidates::{FlushReport, IceCandidateBuffer};
pub use coordinator::{
    is_polite, NegotiationCoordinator, NegotiationError, NegotiationState, OfferOutcome,
};
pub use peer::{PeerConnection, PeerError, WebRtcPeer};
