//! Media Capture Pipeline
//!
//! Öffnet Mikrofon und Kamera gemeinsam. Schlägt eines davon fehl, gibt es
//! keinen Anruf: es gibt keinen Audio-only-Modus.

use super::audio::{encode_mulaw, to_i16, AudioError, AudioStream, Microphone, SAMPLE_RATE};
use crate::config::CaptureConstraints;
use crate::negotiation::{PeerError, WebRtcPeer};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Paketierungsintervall für den Audio-Track
const AUDIO_PACKET_DURATION: Duration = Duration::from_millis(20);

/// PCMU läuft mit 8 kHz
const PCMU_SAMPLE_RATE: u32 = 8000;

const STREAM_ID: &str = "peerlink";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Microphone unavailable: {0}")]
    Audio(#[from] AudioError),

    #[error("Camera unavailable: {0}")]
    Video(String),

    #[error("Failed to attach track: {0}")]
    Attach(#[from] PeerError),

    #[error("Failed to write media sample: {0}")]
    Write(String),
}

// ============================================================================
// CAPTURE BACKEND
// ============================================================================

/// Quelle für Kamera und Mikrofon
pub trait CaptureBackend: Send {
    /// Startet die Aufnahme und schreibt 16 kHz Mono-Samples in `stream`
    fn open_audio(
        &mut self,
        constraints: &CaptureConstraints,
        stream: AudioStream,
    ) -> Result<(), MediaError>;

    fn open_video(&mut self, constraints: &CaptureConstraints) -> Result<(), MediaError>;

    fn close(&mut self);
}

/// cpal-Mikrofon; Video-Frames liefert die Kamera-Oberfläche über
/// [`VideoTrack::write_frame`].
#[derive(Default)]
pub struct DeviceCapture {
    microphone: Option<Microphone>,
}

impl DeviceCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for DeviceCapture {
    fn open_audio(
        &mut self,
        constraints: &CaptureConstraints,
        stream: AudioStream,
    ) -> Result<(), MediaError> {
        if !constraints.echo_cancellation || !constraints.noise_suppression {
            tracing::debug!("Audio processing constraints are left to the device driver");
        }
        let microphone = Microphone::start(constraints.input_device.as_deref(), stream)?;
        self.microphone = Some(microphone);
        Ok(())
    }

    fn open_video(&mut self, constraints: &CaptureConstraints) -> Result<(), MediaError> {
        if constraints.video_width == 0 || constraints.video_height == 0 {
            return Err(MediaError::Video(format!(
                "invalid resolution {}x{}",
                constraints.video_width, constraints.video_height
            )));
        }
        tracing::info!(
            "Video track ready for {}x{} frames",
            constraints.video_width,
            constraints.video_height
        );
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
    }
}

// ============================================================================
// VIDEO TRACK
// ============================================================================

/// VP8-Track, befüllt von der Kamera-Oberfläche
#[derive(Clone)]
pub struct VideoTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<Mutex<bool>>,
}

impl VideoTrack {
    fn new() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            STREAM_ID.to_string(),
        ));
        Self {
            track,
            enabled: Arc::new(Mutex::new(true)),
        }
    }

    /// Schreibt einen kodierten Frame; deaktiviert wird er verworfen
    pub async fn write_frame(&self, frame: Vec<u8>, duration: Duration) -> Result<bool, MediaError> {
        if !*self.enabled.lock() {
            return Ok(false);
        }
        let sample = Sample {
            data: Bytes::from(frame),
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::Write(e.to_string()))?;
        Ok(true)
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }
}

// ============================================================================
// MEDIA CAPTURE PIPELINE
// ============================================================================

pub struct MediaCapturePipeline {
    audio: AudioStream,
    audio_track: Arc<TrackLocalStaticSample>,
    video: VideoTrack,
    backend: Mutex<Box<dyn CaptureBackend>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MediaCapturePipeline {
    /// Öffnet Audio und Video; jeder Fehler ist fatal
    pub fn acquire(
        mut backend: Box<dyn CaptureBackend>,
        constraints: &CaptureConstraints,
    ) -> Result<Self, MediaError> {
        let audio = AudioStream::new();

        if let Err(e) = backend.open_audio(constraints, audio.clone()) {
            tracing::error!("Media acquisition failed: {}", e);
            audio.deactivate();
            return Err(e);
        }
        if let Err(e) = backend.open_video(constraints) {
            tracing::error!("Media acquisition failed: {}", e);
            backend.close();
            audio.deactivate();
            return Err(e);
        }

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: PCMU_SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));

        tracing::info!("Camera and microphone acquired");
        Ok(Self {
            audio,
            audio_track,
            video: VideoTrack::new(),
            backend: Mutex::new(backend),
            pump: Mutex::new(None),
        })
    }

    /// Hängt beide Tracks an, bevor negotiiert wird
    pub async fn attach_to(&self, peer: &WebRtcPeer) -> Result<(), MediaError> {
        peer.add_track(Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        peer.add_track(Arc::clone(&self.video.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let mut pump = self.pump.lock();
        if pump.is_none() {
            *pump = Some(tokio::spawn(pump_audio(
                self.audio.clone(),
                Arc::clone(&self.audio_track),
            )));
        }
        Ok(())
    }

    /// Audio-Stream für den Uploader
    pub fn audio_stream(&self) -> AudioStream {
        self.audio.clone()
    }

    /// Video-Track für die Kamera-Oberfläche
    pub fn video_track(&self) -> VideoTrack {
        self.video.clone()
    }

    /// Mikrofon stumm schalten; der Track bleibt angehängt
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio.set_enabled(enabled);
    }

    /// Kamera aus; der Track bleibt angehängt
    pub fn set_video_enabled(&self, enabled: bool) {
        *self.video.enabled.lock() = enabled;
        tracing::debug!("Video enabled: {}", enabled);
    }

    pub fn is_active(&self) -> bool {
        self.audio.is_active()
    }

    /// Beendet Aufnahme, Track-Pumpe und damit auch den Uploader
    pub fn stop(&self) {
        self.backend.lock().close();
        self.audio.deactivate();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        tracing::info!("Media capture stopped");
    }
}

impl Drop for MediaCapturePipeline {
    fn drop(&mut self) {
        if self.audio.is_active() {
            self.stop();
        }
    }
}

/// Schiebt Mikrofon-Samples als PCMU-Pakete in den Audio-Track
async fn pump_audio(audio: AudioStream, track: Arc<TrackLocalStaticSample>) {
    let tap = audio.tap();
    let samples_per_packet =
        (SAMPLE_RATE as u64 * AUDIO_PACKET_DURATION.as_millis() as u64 / 1000) as usize;
    let decimation = (SAMPLE_RATE / PCMU_SAMPLE_RATE) as usize;
    let mut interval = tokio::time::interval(AUDIO_PACKET_DURATION);

    while audio.is_active() {
        interval.tick().await;

        while let Some(frame) = tap.read_exact(samples_per_packet) {
            let payload: Vec<u8> = frame
                .iter()
                .step_by(decimation)
                .map(|s| encode_mulaw(to_i16(*s)))
                .collect();
            let sample = Sample {
                data: Bytes::from(payload),
                duration: AUDIO_PACKET_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Dropping audio packet: {}", e);
            }
        }
    }
    tracing::debug!("Audio track pump stopped");
}

// ============================================================================
// TESTS
// ============================================================================
