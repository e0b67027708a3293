//! Live-Metriken aus der Sprachanalyse
//!
//! Hält die letzten `WINDOW_CAPACITY` Sprechtempo-Werte für das Diagramm
//! und die jeweils neueste Empfehlung des KI-Dienstes.

use crate::signaling::{AiConsult, AiUpdate, MlAnalysis, SignalingMessage, VoiceLabels};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};

/// Anzahl der Werte im Diagramm
pub const WINDOW_CAPACITY: usize = 15;

/// Referenzlinie "normales" Sprechtempo in Wörtern pro Minute
pub const BASELINE_WPM: f64 = 140.0;

// ============================================================================
// SAMPLES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSample {
    pub timestamp: DateTime<Local>,
    /// `HH:MM:SS` für die Achsenbeschriftung
    pub label: String,
    pub wpm: f64,
    pub baseline: f64,
    pub pause_ratio: Option<f64>,
    pub pitch_std: Option<f64>,
}

impl MetricsSample {
    pub fn new(timestamp: DateTime<Local>, wpm: f64) -> Self {
        Self {
            label: timestamp.format("%H:%M:%S").to_string(),
            timestamp,
            wpm,
            baseline: BASELINE_WPM,
            pause_ratio: None,
            pitch_std: None,
        }
    }
}

/// Darstellung der Risikostufe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiskIndicator {
    High,
    Medium,
    #[default]
    Default,
}

impl RiskIndicator {
    /// Teilstring-Vergleich ohne Groß-/Kleinschreibung; fehlend zählt als "low"
    pub fn classify(risk_level: Option<&str>) -> Self {
        let risk = risk_level.unwrap_or("low").to_lowercase();
        if risk.contains("high") {
            RiskIndicator::High
        } else if risk.contains("medium") {
            RiskIndicator::Medium
        } else {
            RiskIndicator::Default
        }
    }
}

/// Neueste Empfehlung samt Begleitdaten
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Advisory {
    pub consult: Option<AiConsult>,
    pub risk: RiskIndicator,
    pub transcript: Option<String>,
    pub voice: Option<VoiceLabels>,
    pub ml: Option<MlAnalysis>,
}

// ============================================================================
// METRICS WINDOW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricsWindow {
    samples: VecDeque<MetricsSample>,
    advisory: Advisory,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> impl Iterator<Item = &MetricsSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.samples.iter().map(|s| s.label.as_str()).collect()
    }

    pub fn advisory(&self) -> &Advisory {
        &self.advisory
    }

    /// Fügt einen Wert an, der älteste fällt bei voller Kapazität heraus
    pub fn push(&mut self, sample: MetricsSample) {
        self.samples.push_back(sample);
        while self.samples.len() > WINDOW_CAPACITY {
            self.samples.pop_front();
        }
    }

    /// Übernimmt ein `ai_update`.
    ///
    /// Ohne `metrics` kommt kein Wert hinzu, eine mitgelieferte Empfehlung
    /// wird trotzdem übernommen. Gibt `true` zurück, wenn sich etwas geändert hat.
    pub fn apply(&mut self, update: AiUpdate, now: DateTime<Local>) -> bool {
        let mut changed = false;

        if let Some(metrics) = update.metrics {
            let mut sample = MetricsSample::new(now, metrics.wpm);
            sample.pause_ratio = metrics.pause_ratio;
            sample.pitch_std = metrics.pitch_std;
            self.push(sample);
            changed = true;
        }

        // Eine neue Empfehlung ersetzt die alte vollständig
        if let Some(consult) = update.ai_consult {
            self.advisory = Advisory {
                risk: RiskIndicator::classify(consult.risk_level.as_deref()),
                consult: Some(consult),
                transcript: update.transcript,
                voice: update.voice_analysis,
                ml: update.ml_analysis,
            };
            changed = true;
        } else if update.transcript.is_some()
            || update.voice_analysis.is_some()
            || update.ml_analysis.is_some()
        {
            if update.transcript.is_some() {
                self.advisory.transcript = update.transcript;
            }
            if update.voice_analysis.is_some() {
                self.advisory.voice = update.voice_analysis;
            }
            if update.ml_analysis.is_some() {
                self.advisory.ml = update.ml_analysis;
            }
            changed = true;
        }

        changed
    }
}

// ============================================================================
// METRICS STREAM CONSUMER
// ============================================================================

/// Verarbeitet `ai_update`-Nachrichten und veröffentlicht Snapshots
pub struct MetricsStreamConsumer {
    window: MetricsWindow,
    snapshot_tx: watch::Sender<MetricsWindow>,
}

impl MetricsStreamConsumer {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(MetricsWindow::new());
        Self {
            window: MetricsWindow::new(),
            snapshot_tx,
        }
    }

    /// Snapshots für die Diagramm-Oberfläche
    pub fn snapshots(&self) -> watch::Receiver<MetricsWindow> {
        self.snapshot_tx.subscribe()
    }

    pub fn window(&self) -> &MetricsWindow {
        &self.window
    }

    pub fn on_update(&mut self, update: AiUpdate) {
        if self.window.apply(update, Local::now()) {
            if let Some(latest) = self.window.samples.back() {
                tracing::debug!("Speech rate {:.0} wpm at {}", latest.wpm, latest.label);
            }
            self.snapshot_tx.send_replace(self.window.clone());
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SignalingMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                SignalingMessage::AiUpdate(update) => self.on_update(update),
                other => tracing::debug!("Metrics consumer ignores '{}'", other.kind()),
            }
        }
        tracing::debug!("Metrics stream ended");
    }
}

impl Default for MetricsStreamConsumer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
