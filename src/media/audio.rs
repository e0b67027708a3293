//! Mikrofon-Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Aufgenommenes Audio wird
//! auf 16 kHz Mono gebracht und an alle Abnehmer (`AudioTap`) verteilt:
//! den WebRTC-Track und den Chunk-Recorder für die Analyse.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate der verteilten Samples (erwartet vom Analyse-Dienst)
pub const SAMPLE_RATE: u32 = 16000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Bevorzugte Rate des Geräts, danach wird heruntergerechnet
const DEVICE_SAMPLE_RATE: u32 = 48000;

/// Pro Abnehmer gepuffert: 10 Sekunden
const TAP_BUFFER_SIZE: usize = SAMPLE_RATE as usize * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Audio input device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO STREAM
// ============================================================================

type TapBuffer = Arc<Mutex<HeapRb<f32>>>;

struct StreamShared {
    taps: Mutex<Vec<TapBuffer>>,
    enabled: Mutex<bool>,
    level: Mutex<f32>,
    active: watch::Sender<bool>,
}

/// Geteilter Handle auf den lokalen Audio-Stream.
///
/// Solange `is_active()` gilt, laufen Track und Uploader weiter.
#[derive(Clone)]
pub struct AudioStream {
    shared: Arc<StreamShared>,
}

impl AudioStream {
    pub fn new() -> Self {
        let (active, _) = watch::channel(true);
        Self {
            shared: Arc::new(StreamShared {
                taps: Mutex::new(Vec::new()),
                enabled: Mutex::new(true),
                level: Mutex::new(0.0),
                active,
            }),
        }
    }

    /// Neuer Abnehmer, sieht nur Samples ab jetzt
    pub fn tap(&self) -> AudioTap {
        let buffer = Arc::new(Mutex::new(HeapRb::new(TAP_BUFFER_SIZE)));
        self.shared.taps.lock().push(Arc::clone(&buffer));
        AudioTap { buffer }
    }

    /// Verteilt 16 kHz Mono-Samples an alle Abnehmer
    pub fn push_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        // Audio Level berechnen (RMS)
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        *self.shared.level.lock() = rms.min(1.0);

        // Stumm: Stille statt Lücke, damit Timing erhalten bleibt
        let enabled = *self.shared.enabled.lock();
        for tap in self.shared.taps.lock().iter() {
            let mut buffer = tap.lock();
            for sample in samples {
                let _ = buffer.try_push(if enabled { *sample } else { 0.0 });
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.shared.enabled.lock() = enabled;
        tracing::debug!("Audio enabled: {}", enabled);
    }

    pub fn is_enabled(&self) -> bool {
        *self.shared.enabled.lock()
    }

    /// Eingangspegel (0.0 - 1.0)
    pub fn level(&self) -> f32 {
        *self.shared.level.lock()
    }

    pub fn is_active(&self) -> bool {
        *self.shared.active.borrow()
    }

    /// Aktivitäts-Signal für Schleifen, die am Stream hängen
    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.shared.active.subscribe()
    }

    pub fn deactivate(&self) {
        self.shared.active.send_replace(false);
    }
}

impl Default for AudioStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("active", &self.is_active())
            .field("enabled", &self.is_enabled())
            .field("taps", &self.shared.taps.lock().len())
            .finish()
    }
}

/// Lesende Seite eines Abnehmers
pub struct AudioTap {
    buffer: TapBuffer,
}

impl AudioTap {
    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Liest genau `count` Samples, falls schon vorhanden
    pub fn read_exact(&self, count: usize) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < count {
            return None;
        }
        Some((0..count).filter_map(|_| buffer.try_pop()).collect())
    }

    /// Liest alles, was im Puffer liegt
    pub fn read_all(&self) -> Vec<f32> {
        let mut buffer = self.buffer.lock();
        std::iter::from_fn(|| buffer.try_pop()).collect()
    }

    pub fn clear(&self) {
        let mut buffer = self.buffer.lock();
        while buffer.try_pop().is_some() {}
    }
}

// ============================================================================
// MICROPHONE
// ============================================================================

/// Laufende cpal-Aufnahme; Drop beendet sie
pub struct Microphone {
    stream: Option<Stream>,
}

// Stream ist nicht automatisch Send, wird aber nur über &mut angefasst
unsafe impl Send for Microphone {}

impl Microphone {
    /// Öffnet das Eingabegerät und schreibt in `output`
    pub fn start(device_name: Option<&str>, output: AudioStream) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => Self::find_device(&host, name)?,
            None => host.default_input_device().ok_or(AudioError::NoInputDevice)?,
        };

        // Beste Konfiguration finden
        let config = Self::find_best_input_config(&device)?;
        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Starting audio capture on '{}': {} Hz, {} channels",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            source_sample_rate,
            channels
        );

        let mut resampler = Resampler::new(source_sample_rate, SAMPLE_RATE);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    output.push_samples(&resampler.process(&mono));
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
        })
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Audio capture stopped");
        }
    }

    fn find_device(host: &cpal::Host, name: &str) -> Result<Device, AudioError> {
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        devices
            .into_iter()
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
    }

    fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

/// Wählt die beste Konfiguration aus einer Liste.
///
/// Der Callback arbeitet mit f32, daher kommen nur F32-Formate in Frage.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let preferred = [SAMPLE_RATE, DEVICE_SAMPLE_RATE, 44100];
    let f32_configs: Vec<_> = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    for rate in preferred.map(cpal::SampleRate) {
        if let Some(config) = f32_configs
            .iter()
            .find(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        {
            return Ok(config.with_sample_rate(rate).into());
        }
    }

    // Fallback auf beste verfügbare Rate
    f32_configs
        .first()
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No f32 input configuration found".to_string())
        })
}

// ============================================================================
// SAMPLE HELPERS
// ============================================================================

/// Interleaved → Mono durch Mittelwert
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Lineares Resampling, das die Phase über Callback-Grenzen mitnimmt
#[derive(Debug, Clone)]
pub struct Resampler {
    /// Quell-Samples pro Ziel-Sample
    step: f64,
    /// Nächste Ausgabeposition relativ zum Blockanfang; -1 meint `last`
    position: f64,
    last: f32,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            step: source_rate as f64 / target_rate as f64,
            position: 0.0,
            last: 0.0,
        }
    }

    pub fn process(&mut self, data: &[f32]) -> Vec<f32> {
        if self.step == 1.0 || data.is_empty() {
            return data.to_vec();
        }

        let end = (data.len() - 1) as f64;
        let mut out = Vec::with_capacity((data.len() as f64 / self.step) as usize + 1);
        while self.position < end {
            let idx = self.position.floor();
            let frac = (self.position - idx) as f32;
            let i = idx as isize;
            let s1 = if i < 0 { self.last } else { data[i as usize] };
            let s2 = data[(i + 1) as usize];
            out.push(s1 + (s2 - s1) * frac);
            self.position += self.step;
        }

        self.position -= data.len() as f64;
        self.last = data[data.len() - 1];
        out
    }
}

/// f32 → i16 mit Clipping
pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// G.711 µ-law Encoding eines Samples
pub fn encode_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(CLIP) + BIAS;

    let exponent = (7 - ((pcm as u32) << 17).leading_zeros().min(7)) as i32;
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_tap_sees_every_sample() {
        let stream = AudioStream::new();
        let first = stream.tap();
        let second = stream.tap();

        stream.push_samples(&[0.1, 0.2, 0.3]);

        assert_eq!(first.read_all(), vec![0.1, 0.2, 0.3]);
        assert_eq!(second.read_exact(2), Some(vec![0.1, 0.2]));
        assert_eq!(second.read_exact(2), None);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_late_tap_misses_earlier_samples() {
        let stream = AudioStream::new();
        stream.push_samples(&[0.5; 4]);
        let tap = stream.tap();
        assert!(tap.is_empty());
    }

    #[test]
    fn test_disabled_stream_pushes_silence() {
        let stream = AudioStream::new();
        let tap = stream.tap();

        stream.set_enabled(false);
        stream.push_samples(&[0.5, -0.5]);

        assert_eq!(tap.read_all(), vec![0.0, 0.0]);
        assert!(stream.level() > 0.4);
    }

    #[test]
    fn test_deactivate_notifies_watchers() {
        let stream = AudioStream::new();
        let rx = stream.watch_active();
        assert!(*rx.borrow());

        stream.deactivate();

        assert!(!stream.is_active());
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_resample_48k_to_16k() {
        let data: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = Resampler::new(48000, 16000).process(&data);
        assert_eq!(out.len(), 160);
        assert!((out[1] - data[3]).abs() < 1e-6);
    }

    #[test]
    fn test_resample_keeps_phase_across_blocks() {
        let mut resampler = Resampler::new(44100, 16000);
        let block = vec![0.1f32; 512];
        let total: usize = (0..100).map(|_| resampler.process(&block).len()).sum();

        let expected = 512.0 * 100.0 * 16000.0 / 44100.0;
        assert!((total as f64 - expected).abs() <= 1.0, "{} vs {}", total, expected);
    }

    #[test]
    fn test_resample_interpolates_over_block_boundary() {
        let mut resampler = Resampler::new(32000, 16000);
        let ramp: Vec<f32> = (0..9).map(|i| i as f32).collect();

        let mut out = resampler.process(&ramp[..5]);
        out.extend(resampler.process(&ramp[5..]));
        assert_eq!(out, vec![0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_downmix_stereo() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25], 1), vec![0.25]);
    }

    #[test]
    fn test_mulaw_reference_values() {
        assert_eq!(encode_mulaw(0), 0xFF);
        assert_eq!(encode_mulaw(-1), 0x7F);
        assert_eq!(encode_mulaw(i16::MAX), 0x80);
        assert_eq!(encode_mulaw(i16::MIN), 0x00);
    }

    #[test]
    fn test_to_i16_clips() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
    }
}
