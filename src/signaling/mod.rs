//! Signaling Module - WebSocket Client für den Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten typisiert senden
//! - Eingehende Nachrichten parsen und an Subscriber weiterleiten
//!

mod channel;
mod client;
mod messages;

pub use channel::{ChannelStatus, ReconnectPolicy, SignalingSender, Subscriptions};
pub use client::{SignalingClient, SignalingError};
pub use messages::*;
