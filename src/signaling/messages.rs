//! Message Types für das Relay-Protokoll
//!
//! Jede Text-Nachricht auf dem WebSocket ist ein Umschlag der Form
//! `{"event": "<name>", "data": <payload>}`. Audio-Chunks gehen als
//! Binary-Frame ohne Umschlag raus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Malformed '{event}' payload: {reason}")]
    MalformedPayload { event: &'static str, reason: String },

    #[error("Event '{0}' cannot be sent by this client")]
    NotSendable(&'static str),
}

// ============================================================================
// MESSAGE KIND
// ============================================================================

/// Art einer Signaling-Nachricht (Schlüssel für Subscriptions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Offer,
    Answer,
    Candidate,
    UserJoined,
    AudioChunk,
    AiUpdate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Join,
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::Candidate,
        MessageKind::UserJoined,
        MessageKind::AudioChunk,
        MessageKind::AiUpdate,
    ];

    /// Event-Name auf dem Draht
    pub fn event_name(self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::UserJoined => "user-joined",
            MessageKind::AudioChunk => "audio_chunk",
            MessageKind::AiUpdate => "ai_update",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_name() == name)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description (Offer oder Answer) mit vom Relay gesetztem Absender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl SessionDescription {
    pub fn offer(sdp: String, sender: Option<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp,
            sender,
        }
    }

    pub fn answer(sdp: String, sender: Option<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp,
            sender,
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// `candidate`-Event; `candidate: None` markiert das Ende des Gatherings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CandidateSignal {
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl CandidateSignal {
    pub fn end_of_candidates(sender: Option<String>) -> Self {
        Self {
            candidate: None,
            sender,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoined {
    pub sid: String,
}

/// Sprach-Metriken aus der Analyse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceMetrics {
    pub wpm: f64,
    #[serde(default)]
    pub pause_ratio: Option<f64>,
    #[serde(default)]
    pub pitch_std: Option<f64>,
    #[serde(default)]
    pub pitch_var: Option<String>,
}

/// Lesbare Labels zur Sprachanalyse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VoiceLabels {
    pub speed: Option<String>,
    pub tone: Option<String>,
    pub pauses: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlAnalysis {
    pub depression_score: f64,
    pub anxiety_score: f64,
}

/// Empfehlung des KI-Dienstes. Fehlende oder `null`-Felder werden leer angezeigt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AiConsult {
    #[serde(deserialize_with = "null_as_default")]
    pub emotional_state: String,
    #[serde(deserialize_with = "null_as_default")]
    pub key_insight: String,
    #[serde(deserialize_with = "null_as_default")]
    pub motivational_guidance: String,
    #[serde(deserialize_with = "null_as_default")]
    pub suggested_questions: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub cure_steps: Vec<String>,
    pub risk_level: Option<String>,
}

/// `null` wie ein fehlendes Feld behandeln
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AiUpdate {
    pub metrics: Option<VoiceMetrics>,
    pub ai_consult: Option<AiConsult>,
    pub transcript: Option<String>,
    pub voice_analysis: Option<VoiceLabels>,
    pub ml_analysis: Option<MlAnalysis>,
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectPayload {
    sid: String,
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Alle Nachrichten zwischen Client und Relay
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    Join,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(CandidateSignal),
    UserJoined(UserJoined),
    AudioChunk(Vec<u8>),
    AiUpdate(AiUpdate),
}

/// Ein Frame wie er auf den WebSocket geht
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Was aus einem eingehenden Text-Frame werden kann
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Relay hat uns eine Kennung zugewiesen
    Connected { sid: String },
    Message(SignalingMessage),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutgoingEnvelope {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::Join => MessageKind::Join,
            SignalingMessage::Offer(_) => MessageKind::Offer,
            SignalingMessage::Answer(_) => MessageKind::Answer,
            SignalingMessage::Candidate(_) => MessageKind::Candidate,
            SignalingMessage::UserJoined(_) => MessageKind::UserJoined,
            SignalingMessage::AudioChunk(_) => MessageKind::AudioChunk,
            SignalingMessage::AiUpdate(_) => MessageKind::AiUpdate,
        }
    }

    /// Serialisiert die Nachricht für den Versand
    pub fn encode(&self) -> Result<WireFrame, MessageError> {
        let event = self.kind().event_name();
        let data = match self {
            SignalingMessage::Join => None,
            SignalingMessage::Offer(desc) | SignalingMessage::Answer(desc) => {
                Some(serde_json::to_value(desc)?)
            }
            SignalingMessage::Candidate(signal) => Some(serde_json::to_value(signal)?),
            SignalingMessage::AudioChunk(bytes) => return Ok(WireFrame::Binary(bytes.clone())),
            SignalingMessage::UserJoined(_) | SignalingMessage::AiUpdate(_) => {
                return Err(MessageError::NotSendable(event))
            }
        };

        let text = serde_json::to_string(&OutgoingEnvelope { event, data })?;
        Ok(WireFrame::Text(text))
    }
}

/// Parst einen Text-Frame vom Relay
pub fn parse_server_frame(text: &str) -> Result<ServerFrame, MessageError> {
    let envelope: Envelope = serde_json::from_str(text)?;

    if envelope.event == "connect" {
        let payload: ConnectPayload = payload("connect", envelope.data)?;
        return Ok(ServerFrame::Connected { sid: payload.sid });
    }

    let kind = MessageKind::from_event_name(&envelope.event)
        .ok_or_else(|| MessageError::UnknownEvent(envelope.event.clone()))?;

    let message = match kind {
        MessageKind::Offer | MessageKind::Answer => {
            let desc: SessionDescription = payload(kind.event_name(), envelope.data)?;
            let expected = if kind == MessageKind::Offer {
                SdpKind::Offer
            } else {
                SdpKind::Answer
            };
            if desc.kind != expected {
                return Err(MessageError::MalformedPayload {
                    event: kind.event_name(),
                    reason: format!("description type {:?} does not match event", desc.kind),
                });
            }
            if kind == MessageKind::Offer {
                SignalingMessage::Offer(desc)
            } else {
                SignalingMessage::Answer(desc)
            }
        }
        MessageKind::Candidate => {
            if envelope.data.is_null() {
                SignalingMessage::Candidate(CandidateSignal::default())
            } else {
                SignalingMessage::Candidate(payload("candidate", envelope.data)?)
            }
        }
        MessageKind::UserJoined => SignalingMessage::UserJoined(payload("user-joined", envelope.data)?),
        MessageKind::AiUpdate => SignalingMessage::AiUpdate(payload("ai_update", envelope.data)?),
        MessageKind::Join => SignalingMessage::Join,
        MessageKind::AudioChunk => {
            return Err(MessageError::MalformedPayload {
                event: "audio_chunk",
                reason: "audio chunks are binary frames".to_string(),
            })
        }
    };

    Ok(ServerFrame::Message(message))
}

fn payload<T: serde::de::DeserializeOwned>(event: &'static str, data: Value) -> Result<T, MessageError> {
    serde_json::from_value(data).map_err(|e| MessageError::MalformedPayload {
        event,
        reason: e.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================
