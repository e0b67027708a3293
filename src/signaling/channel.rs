//! Kanal-Abstraktion zwischen Komponenten und Relay
//!
//! - `SignalingSender`: was Coordinator und Uploader zum Senden brauchen
//! - `Subscriptions`: genau ein Empfänger pro Nachrichtenart
//! - `ReconnectPolicy`: begrenztes exponentielles Backoff

use super::messages::{MessageKind, SignalingMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// SENDER
// ============================================================================

/// Ausgehende Seite des Kanals.
///
/// `send` ist best-effort und at-most-once: ohne Verbindung wird die
/// Nachricht verworfen, nicht gepuffert.
pub trait SignalingSender: Send + Sync {
    fn send(&self, message: SignalingMessage);

    /// Vom Relay beim Verbinden zugewiesene Kennung
    fn local_id(&self) -> Option<String>;
}

// ============================================================================
// CHANNEL STATUS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected { sid: String },
    Disconnected,
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Routing-Tabelle für eingehende Nachrichten.
///
/// Eine neue Registrierung für eine Art ersetzt die vorherige. Mehrere Arten
/// können auf denselben Empfänger zeigen, damit deren Reihenfolge erhalten
/// bleibt.
#[derive(Default)]
pub struct Subscriptions {
    routes: Mutex<HashMap<MessageKind, mpsc::UnboundedSender<SignalingMessage>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert einen Empfänger für alle angegebenen Arten
    pub fn subscribe(&self, kinds: &[MessageKind]) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock();
        for kind in kinds {
            if routes.insert(*kind, tx.clone()).is_some() {
                tracing::debug!("Replacing existing handler for '{}'", kind);
            }
        }
        rx
    }

    /// Leitet eine Nachricht an ihren Empfänger weiter.
    ///
    /// Gibt `false` zurück, wenn niemand zuhört.
    pub fn dispatch(&self, message: SignalingMessage) -> bool {
        let kind = message.kind();
        let mut routes = self.routes.lock();
        let Some(tx) = routes.get(&kind) else {
            tracing::debug!("No handler for '{}', dropping message", kind);
            return false;
        };

        if tx.send(message).is_err() {
            tracing::debug!("Handler for '{}' is gone, removing route", kind);
            routes.remove(&kind);
            return false;
        }
        true
    }
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Backoff für automatische Reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` = unbegrenzt
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Wartezeit vor Versuch `attempt` (1-basiert), `None` wenn aufgegeben wird
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

// ============================================================================
// TESTS
// ============================================================================
