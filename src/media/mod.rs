//! Media Module - Kamera, Mikrofon und Audio-Upload
//!
//! Dieses Modul verwaltet:
//! - Mikrofon-Capture über cpal (16 kHz Mono)
//! - Audio- und Video-Tracks für die Peer Connection
//! - Segmentierten Audio-Upload zur Analyse

mod audio;
mod pipeline;
mod uploader;

pub use audio::{AudioError, AudioStream, AudioTap, Microphone, SAMPLE_RATE};
pub use pipeline::{CaptureBackend, DeviceCapture, MediaCapturePipeline, MediaError, VideoTrack};
pub use uploader::{
    AudioChunkUploader, ChunkRecorder, RecorderError, UploadStats, WavChunkRecorder, CHUNK_WINDOW,
    MIN_CHUNK_BYTES, RESTART_DELAY, START_RETRY_DELAY,
};
