//! Audio Chunk Uploader
//!
//! Nimmt das Mikrofon in Segmenten von `CHUNK_WINDOW` auf und schickt jedes
//! Segment als `audio_chunk` an den Analyse-Dienst. Die Schleife läuft, bis
//! der Audio-Stream inaktiv wird.

use super::audio::{to_i16, AudioStream, AudioTap, CHANNELS, SAMPLE_RATE};
use crate::signaling::{SignalingMessage, SignalingSender};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Länge eines Segments
pub const CHUNK_WINDOW: Duration = Duration::from_secs(5);

/// Pause zwischen zwei Segmenten
pub const RESTART_DELAY: Duration = Duration::from_millis(200);

/// Wartezeit nach fehlgeschlagenem Start
pub const START_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Kleinere Segmente sind Artefakte und werden verworfen
pub const MIN_CHUNK_BYTES: usize = 200;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Audio stream is not active")]
    StreamInactive,

    #[error("Recorder already running")]
    AlreadyRecording,

    #[error("Recorder not running")]
    NotRecording,

    #[error("Failed to encode WAV: {0}")]
    Encode(#[from] hound::Error),
}

// ============================================================================
// CHUNK RECORDER
// ============================================================================

/// Nimmt ein Segment auf; `stop` liefert die kodierten Bytes
pub trait ChunkRecorder: Send {
    fn start(&mut self) -> Result<(), RecorderError>;

    fn stop(&mut self) -> Result<Vec<u8>, RecorderError>;
}

/// Segmente als 16-bit PCM WAV (16 kHz Mono)
pub struct WavChunkRecorder {
    stream: AudioStream,
    tap: AudioTap,
    recording: bool,
}

impl WavChunkRecorder {
    pub fn new(stream: AudioStream) -> Self {
        let tap = stream.tap();
        Self {
            stream,
            tap,
            recording: false,
        }
    }

    fn encode(samples: &[f32]) -> Result<Vec<u8>, RecorderError> {
        let spec = hound::WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for sample in samples {
                writer.write_sample(to_i16(*sample))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

impl ChunkRecorder for WavChunkRecorder {
    fn start(&mut self) -> Result<(), RecorderError> {
        if !self.stream.is_active() {
            return Err(RecorderError::StreamInactive);
        }
        if self.recording {
            return Err(RecorderError::AlreadyRecording);
        }
        // Nur was ab jetzt kommt gehört zum Segment
        self.tap.clear();
        self.recording = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<u8>, RecorderError> {
        if !self.recording {
            return Err(RecorderError::NotRecording);
        }
        self.recording = false;
        Self::encode(&self.tap.read_all())
    }
}

// ============================================================================
// UPLOADER
// ============================================================================

/// Zähler für Logging und Tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub emitted: usize,
    pub discarded: usize,
    pub start_failures: usize,
}

pub struct AudioChunkUploader {
    channel: Arc<dyn SignalingSender>,
    recorder: Box<dyn ChunkRecorder>,
    active: watch::Receiver<bool>,
}

impl AudioChunkUploader {
    pub fn new(
        channel: Arc<dyn SignalingSender>,
        recorder: Box<dyn ChunkRecorder>,
        active: watch::Receiver<bool>,
    ) -> Self {
        Self {
            channel,
            recorder,
            active,
        }
    }

    /// Uploader für den Mikrofon-Stream mit WAV-Segmenten
    pub fn for_stream(channel: Arc<dyn SignalingSender>, stream: &AudioStream) -> Self {
        Self::new(
            channel,
            Box::new(WavChunkRecorder::new(stream.clone())),
            stream.watch_active(),
        )
    }

    /// Segment-Schleife; endet erst, wenn der Stream inaktiv ist
    pub async fn run(mut self) -> UploadStats {
        let mut stats = UploadStats::default();
        tracing::info!("Audio chunk uploader started");

        while self.is_active() {
            if let Err(e) = self.recorder.start() {
                stats.start_failures += 1;
                tracing::warn!("Failed to start segment: {}, retrying", e);
                self.sleep_while_active(START_RETRY_DELAY).await;
                continue;
            }

            self.sleep_while_active(CHUNK_WINDOW).await;

            match self.recorder.stop() {
                Ok(chunk) if chunk.len() > MIN_CHUNK_BYTES => {
                    tracing::debug!("Sending audio chunk ({} bytes)", chunk.len());
                    self.channel.send(SignalingMessage::AudioChunk(chunk));
                    stats.emitted += 1;
                }
                Ok(chunk) => {
                    tracing::debug!("Discarding short segment ({} bytes)", chunk.len());
                    stats.discarded += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to finish segment: {}", e);
                }
            }

            if !self.is_active() {
                break;
            }
            tokio::time::sleep(RESTART_DELAY).await;
        }

        tracing::info!(
            "Audio chunk uploader stopped: {} sent, {} discarded",
            stats.emitted,
            stats.discarded
        );
        stats
    }

    fn is_active(&self) -> bool {
        // Ohne Sender kann der Stream nicht mehr aktiv werden
        *self.active.borrow() && self.active.has_changed().is_ok()
    }

    /// Schläft `duration` oder bis der Stream inaktiv wird
    async fn sleep_while_active(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.active.wait_for(|active| !*active) => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::testing::FakeChannel;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Liefert ein Byte pro Millisekunde Aufnahmezeit
    struct TimedRecorder {
        started: Option<Instant>,
        fail_starts: usize,
        start_attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl TimedRecorder {
        fn new(fail_starts: usize) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let attempts = Arc::new(Mutex::new(Vec::new()));
            let recorder = Self {
                started: None,
                fail_starts,
                start_attempts: Arc::clone(&attempts),
            };
            (recorder, attempts)
        }
    }

    impl ChunkRecorder for TimedRecorder {
        fn start(&mut self) -> Result<(), RecorderError> {
            self.start_attempts.lock().push(Instant::now());
            if self.fail_starts > 0 {
                self.fail_starts -= 1;
                return Err(RecorderError::StreamInactive);
            }
            self.started = Some(Instant::now());
            Ok(())
        }

        fn stop(&mut self) -> Result<Vec<u8>, RecorderError> {
            let started = self.started.take().ok_or(RecorderError::NotRecording)?;
            Ok(vec![0u8; started.elapsed().as_millis() as usize])
        }
    }

    fn chunks(channel: &FakeChannel) -> Vec<usize> {
        channel
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                SignalingMessage::AudioChunk(bytes) => Some(bytes.len()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_final_segment_is_not_emitted() {
        let channel = Arc::new(FakeChannel::new("aaa"));
        let (recorder, _) = TimedRecorder::new(0);
        let (active_tx, active_rx) = watch::channel(true);
        let uploader = AudioChunkUploader::new(channel.clone(), Box::new(recorder), active_rx);

        let handle = tokio::spawn(uploader.run());

        // Erstes Segment voll, zweites nach 100ms abgebrochen
        let stop_at = CHUNK_WINDOW + RESTART_DELAY + Duration::from_millis(100);
        tokio::time::sleep(stop_at).await;
        active_tx.send_replace(false);

        let stats = handle.await.unwrap();
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.discarded, 1);
        assert!(chunks(&channel).iter().all(|len| *len > MIN_CHUNK_BYTES));
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_follow_window_and_restart_delay() {
        let channel = Arc::new(FakeChannel::new("aaa"));
        let (recorder, attempts) = TimedRecorder::new(0);
        let (active_tx, active_rx) = watch::channel(true);
        let uploader = AudioChunkUploader::new(channel.clone(), Box::new(recorder), active_rx);

        let handle = tokio::spawn(uploader.run());
        tokio::time::sleep(Duration::from_secs(16)).await;
        active_tx.send_replace(false);
        handle.await.unwrap();

        let attempts = attempts.lock().clone();
        assert!(attempts.len() >= 3);
        assert_eq!(attempts[1] - attempts[0], CHUNK_WINDOW + RESTART_DELAY);
        assert_eq!(chunks(&channel), vec![5000, 5000, 5000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_retries_after_delay() {
        let channel = Arc::new(FakeChannel::new("aaa"));
        let (recorder, attempts) = TimedRecorder::new(2);
        let (active_tx, active_rx) = watch::channel(true);
        let uploader = AudioChunkUploader::new(channel.clone(), Box::new(recorder), active_rx);

        let handle = tokio::spawn(uploader.run());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        active_tx.send_replace(false);

        let stats = handle.await.unwrap();
        let attempts = attempts.lock().clone();
        assert_eq!(stats.start_failures, 2);
        assert_eq!(attempts[1] - attempts[0], START_RETRY_DELAY);
        assert_eq!(attempts[2] - attempts[1], START_RETRY_DELAY);
        // Drittes Segment lief nur 500ms
        assert_eq!(chunks(&channel), vec![500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_stream_ends_immediately() {
        let channel = Arc::new(FakeChannel::new("aaa"));
        let (recorder, attempts) = TimedRecorder::new(0);
        let (_active_tx, active_rx) = watch::channel(false);

        let stats = AudioChunkUploader::new(channel.clone(), Box::new(recorder), active_rx)
            .run()
            .await;

        assert_eq!(stats, UploadStats::default());
        assert!(attempts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_ends_loop() {
        let channel = Arc::new(FakeChannel::new("aaa"));
        let (recorder, _) = TimedRecorder::new(0);
        let (active_tx, active_rx) = watch::channel(true);
        let uploader = AudioChunkUploader::new(channel.clone(), Box::new(recorder), active_rx);

        let handle = tokio::spawn(uploader.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(active_tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.emitted, 1);
    }

    #[test]
    fn test_wav_recorder_encodes_captured_samples() {
        let stream = AudioStream::new();
        let mut recorder = WavChunkRecorder::new(stream.clone());

        stream.push_samples(&[0.9; 100]);
        recorder.start().unwrap();
        stream.push_samples(&[0.25; 1600]);
        let bytes = recorder.stop().unwrap();

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 1600);
    }

    #[test]
    fn test_wav_recorder_rejects_inactive_stream() {
        let stream = AudioStream::new();
        let mut recorder = WavChunkRecorder::new(stream.clone());
        stream.deactivate();

        assert!(matches!(recorder.start(), Err(RecorderError::StreamInactive)));
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRecording)));
    }

    #[test]
    fn test_empty_segment_is_below_threshold() {
        let stream = AudioStream::new();
        let mut recorder = WavChunkRecorder::new(stream);
        recorder.start().unwrap();
        let bytes = recorder.stop().unwrap();
        assert!(bytes.len() <= MIN_CHUNK_BYTES);
    }
}
