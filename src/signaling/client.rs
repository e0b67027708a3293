//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Automatische Reconnection mit begrenztem Backoff
//! - Typisierte Subscriptions pro Nachrichtenart
//! - Best-effort Versand ohne Nachhol-Queue

use super::channel::{ChannelStatus, ReconnectPolicy, SignalingSender, Subscriptions};
use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Kapazität der Sende-Queue zum Writer-Task
const OUTBOUND_QUEUE_SIZE: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Default)]
struct ClientState {
    is_connected: bool,
    local_id: Option<String>,
    tx: Option<mpsc::Sender<WireFrame>>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Relay
pub struct SignalingClient {
    server_url: Url,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ClientState>>,
    subscriptions: Arc<Subscriptions>,
    status_tx: watch::Sender<ChannelStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient.
    ///
    /// `http(s)://` wird zu `ws(s)://` umgeschrieben.
    pub fn new(server_url: &str, policy: ReconnectPolicy) -> Result<Self, SignalingError> {
        let server_url = normalize_url(server_url)?;
        let (status_tx, _) = watch::channel(ChannelStatus::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            server_url,
            policy,
            state: Arc::new(RwLock::new(ClientState::default())),
            subscriptions: Arc::new(Subscriptions::new()),
            status_tx,
            shutdown_tx,
        })
    }

    /// Registriert einen Empfänger für eine Nachrichtenart (ersetzt den alten)
    pub fn on_message(&self, kind: MessageKind) -> mpsc::UnboundedReceiver<SignalingMessage> {
        self.subscriptions.subscribe(&[kind])
    }

    /// Registriert einen gemeinsamen Empfänger für mehrere Arten
    pub fn subscribe(&self, kinds: &[MessageKind]) -> mpsc::UnboundedReceiver<SignalingMessage> {
        self.subscriptions.subscribe(kinds)
    }

    /// Verbindungsstatus (nur für Logging und `join`)
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    /// Startet den Verbindungs-Task (inkl. Reconnects)
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.connection_loop().await })
    }

    /// Beendet die Verbindung dauerhaft
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn connection_loop(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_status(ChannelStatus::Connecting);
            tracing::info!("Connecting to relay: {}", self.server_url);

            match connect_async(self.server_url.as_str()).await {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    self.run_connection(ws_stream, &mut shutdown_rx).await;
                }
                Err(e) => {
                    tracing::warn!("Relay connection failed: {}", e);
                }
            }

            self.mark_disconnected();
            if *shutdown_rx.borrow() {
                break;
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                tracing::error!("Giving up on relay after {} attempts", attempt - 1);
                break;
            };

            tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.mark_disconnected();
        tracing::info!("Signaling client stopped");
    }

    async fn run_connection<S>(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<WireFrame>(OUTBOUND_QUEUE_SIZE);
        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.tx = Some(tx);
        }

        // Write-Task starten
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let msg = match frame {
                    WireFrame::Text(text) => Message::Text(text),
                    WireFrame::Binary(bytes) => Message::Binary(bytes),
                };
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        loop {
            tokio::select! {
                msg_result = read.next() => {
                    match msg_result {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Binary(_))) => {
                            tracing::debug!("Ignoring binary frame from relay");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("WebSocket closed by relay");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {}", e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("Closing relay connection");
                    break;
                }
            }
        }

        // Sender droppen beendet den Writer
        self.state.write().tx = None;
        let _ = writer.await;
    }

    fn handle_text(&self, text: &str) {
        match parse_server_frame(text) {
            Ok(ServerFrame::Connected { sid }) => {
                tracing::info!("Relay assigned id {}", sid);
                self.state.write().local_id = Some(sid.clone());
                self.set_status(ChannelStatus::Connected { sid });
            }
            Ok(ServerFrame::Message(message)) => {
                tracing::debug!("Received '{}'", message.kind());
                self.subscriptions.dispatch(message);
            }
            Err(e) => {
                tracing::warn!("Dropping malformed signaling frame: {}", e);
            }
        }
    }

    fn mark_disconnected(&self) {
        {
            let mut state = self.state.write();
            state.is_connected = false;
            state.local_id = None;
            state.tx = None;
        }
        self.set_status(ChannelStatus::Disconnected);
    }

    fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

impl SignalingSender for SignalingClient {
    fn send(&self, message: SignalingMessage) {
        let kind = message.kind();
        let state = self.state.read();
        let Some(tx) = state.tx.as_ref().filter(|_| state.is_connected) else {
            tracing::debug!("Not connected, dropping '{}'", kind);
            return;
        };

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to encode '{}': {}", kind, e);
                return;
            }
        };

        // try_send ist non-blocking
        if let Err(e) = tx.try_send(frame) {
            tracing::warn!("Failed to queue '{}': {}", kind, e);
        }
    }

    fn local_id(&self) -> Option<String> {
        self.state.read().local_id.clone()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

fn normalize_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(SignalingError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::UnsupportedScheme(raw.to_string()))?;
    }
    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_rewrites_http() {
        assert_eq!(
            normalize_url("http://localhost:5005/ws").unwrap().as_str(),
            "ws://localhost:5005/ws"
        );
        assert_eq!(
            normalize_url("https://relay.example.org/ws").unwrap().scheme(),
            "wss"
        );
        assert!(matches!(
            normalize_url("ftp://relay.example.org"),
            Err(SignalingError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_send_without_connection_is_silent() {
        let client = SignalingClient::new("ws://localhost:1", ReconnectPolicy::default()).unwrap();
        client.send(SignalingMessage::Join);
        assert!(!client.is_connected());
        assert_eq!(client.local_id(), None);
    }

    #[test]
    fn test_connect_frame_sets_local_id_and_status() {
        let client = SignalingClient::new("ws://localhost:1", ReconnectPolicy::default()).unwrap();
        let status = client.status();

        client.handle_text(r#"{"event":"connect","data":{"sid":"aaa"}}"#);

        assert_eq!(client.local_id().as_deref(), Some("aaa"));
        assert_eq!(
            *status.borrow(),
            ChannelStatus::Connected { sid: "aaa".to_string() }
        );
    }

    #[test]
    fn test_inbound_frames_reach_subscribers() {
        let client = SignalingClient::new("ws://localhost:1", ReconnectPolicy::default()).unwrap();
        let mut rx = client.on_message(MessageKind::UserJoined);

        client.handle_text("garbage");
        client.handle_text(r#"{"event":"user-joined","data":{"sid":"zzz"}}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingMessage::UserJoined(UserJoined { sid: "zzz".to_string() })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_gives_up_after_bounded_attempts() {
        // Port 1 ist nicht erreichbar
        let policy = ReconnectPolicy {
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            max_attempts: Some(2),
        };
        let client = Arc::new(SignalingClient::new("ws://127.0.0.1:1", policy).unwrap());
        let handle = client.start();

        tokio::time::timeout(std::time::Duration::from_secs(10), handle)
            .await
            .expect("connection loop should stop")
            .unwrap();
        assert_eq!(*client.status().borrow(), ChannelStatus::Disconnected);
    }
}
