//! Konfiguration
//!
//! Reihenfolge: Defaults → TOML-Datei → `SIGNALING_URL` → CLI-Flags.
//! Die Datei liegt standardmäßig im Konfigurationsverzeichnis:
//! - Linux: `~/.config/peerlink/config.toml`
//! - macOS: `~/Library/Application Support/com.peerlink.peerlink/config.toml`
//! - Windows: `%APPDATA%/peerlink/peerlink/config/config.toml`

use crate::signaling::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Umgebungsvariable für die Relay-URL
pub const SIGNALING_URL_ENV: &str = "SIGNALING_URL";

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5005/ws";
const CONFIG_FILE_NAME: &str = "config.toml";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// CONFIG TYPES
// ============================================================================

/// STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Öffentliche STUN-Server
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
        IceServerConfig::stun("stun:stun2.l.google.com:19302"),
        IceServerConfig::stun("stun:stun3.l.google.com:19302"),
        IceServerConfig::stun("stun:stun.ekiga.net"),
    ]
}

/// Reconnect-Backoff in Millisekunden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `0` = unbegrenzt
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            max_attempts: 10,
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
        }
    }
}

/// Anforderungen an Kamera und Mikrofon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    /// Eingabegerät nach Name, sonst Standardgerät
    pub input_device: Option<String>,
    pub video_width: u32,
    pub video_height: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            input_device: None,
            video_width: 640,
            video_height: 360,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Gesamte Konfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub reconnect: ReconnectSettings,
    pub capture: CaptureConstraints,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            reconnect: ReconnectSettings::default(),
            capture: CaptureConstraints::default(),
        }
    }
}

impl AppConfig {
    /// Lädt die Konfiguration inklusive Umgebungsvariablen.
    ///
    /// Ein explizit angegebener Pfad muss existieren; die Standarddatei ist
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_signaling_url(std::env::var(SIGNALING_URL_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Pfad zur Standard-Konfigurationsdatei
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "peerlink", "peerlink")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Überschreibt die Relay-URL, leere Werte werden ignoriert
    pub fn apply_signaling_url(&mut self, url: Option<String>) {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            tracing::debug!("Signaling URL overridden: {}", url);
            self.signaling_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_url.trim().is_empty() {
            return Err(ConfigError::Invalid("signaling_url is empty".to_string()));
        }
        if let Some(server) = self.ice_servers.iter().find(|s| s.urls.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "ICE server without urls: {:?}",
                server
            )));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.ice_servers.len(), 5);
        assert_eq!(config.capture.video_width, 640);
        assert_eq!(config.reconnect.policy(), ReconnectPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
signaling_url = "wss://relay.example.org/ws"

[reconnect]
max_attempts = 3

[[ice_servers]]
urls = ["turn:turn.example.org:3478"]
username = "user"
credential = "secret"
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.signaling_url, "wss://relay.example.org/ws");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("user"));
        assert_eq!(config.capture, CaptureConstraints::default());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "signaling_url = [").unwrap();

        match AppConfig::from_file(file.path()) {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            AppConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_signaling_url_override_ignores_blank() {
        let mut config = AppConfig::default();
        config.apply_signaling_url(Some("  ".to_string()));
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);

        config.apply_signaling_url(Some("ws://10.0.0.2:5005/ws".to_string()));
        assert_eq!(config.signaling_url, "ws://10.0.0.2:5005/ws");
    }

    #[test]
    fn test_zero_attempts_means_unbounded() {
        let settings = ReconnectSettings {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(settings.policy().max_attempts, None);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = AppConfig::default();
        config.reconnect.initial_delay_ms = 10_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
