//! Session-Konfiguration
//!
//! Reihenfolge: Defaults → `session.json` im App-Konfigurationsverzeichnis
//! → Umgebungsvariablen (`PULSE_*`).

use crate::call_engine::network::{DEFAULT_HIGH_KBPS, DEFAULT_LOW_BASE_KBPS};
use crate::call_engine::QualityTarget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Standard-Ziel, wenn ein Raum nicht existiert
const DEFAULT_NOT_FOUND_URL: &str = "https://pulse.invalid/not-found";

/// Standard-Filter für das Logging
pub const DEFAULT_LOG_FILTER: &str = "call_session_lib=info";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

// ============================================================================
// CONFIG
// ============================================================================

/// Einstellungen einer Call-Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Anzeigename des Raums (nur für die UI)
    pub room_name: Option<String>,
    /// Bitrate bei guter Verbindung (kbps)
    pub high_kbps: u32,
    /// Basis-Bitrate für Low/BandwidthSaver (kbps)
    pub low_base_kbps: u32,
    /// Qualitätsziel zu Beginn der Session
    pub default_target: QualityTarget,
    /// Ziel der Weiterleitung bei unbekanntem Raum (`None`: Standard-Ziel)
    pub not_found_redirect: Option<Url>,
    /// tracing EnvFilter-Direktive
    pub log_filter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_name: None,
            high_kbps: DEFAULT_HIGH_KBPS,
            low_base_kbps: DEFAULT_LOW_BASE_KBPS,
            default_target: QualityTarget::High,
            not_found_redirect: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl SessionConfig {
    /// Ziel der Weiterleitung bei unbekanntem Raum
    pub fn not_found_target(&self) -> Option<Url> {
        self.not_found_redirect
            .clone()
            .or_else(|| Url::parse(DEFAULT_NOT_FOUND_URL).ok())
    }

    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Liest eine JSON-Datei; fehlende Felder behalten ihre Defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading session config from {:?}", path);
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    pub fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("com", "questxen", "pulse")?;
        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push("session.json");
        Some(path)
    }

    /// Überschreibt Werte aus der Umgebung
    ///
    /// `lookup` ist austauschbar, damit Tests keine Prozess-Umgebung brauchen.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PULSE_HIGH_KBPS") {
            self.high_kbps = parse_kbps("PULSE_HIGH_KBPS", &value)?;
        }
        if let Some(value) = lookup("PULSE_LOW_BASE_KBPS") {
            self.low_base_kbps = parse_kbps("PULSE_LOW_BASE_KBPS", &value)?;
        }
        if let Some(value) = lookup("PULSE_DEFAULT_TARGET") {
            self.default_target = value
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "PULSE_DEFAULT_TARGET",
                    message,
                })?;
        }
        if let Some(value) = lookup("PULSE_NOT_FOUND_URL") {
            let url = Url::parse(&value).map_err(|e| ConfigError::InvalidValue {
                key: "PULSE_NOT_FOUND_URL",
                message: e.to_string(),
            })?;
            self.not_found_redirect = Some(url);
        }
        if let Some(value) = lookup("PULSE_ROOM_NAME") {
            self.room_name = Some(value);
        }
        if let Some(value) = lookup("PULSE_LOG") {
            self.log_filter = value;
        }
        Ok(self)
    }
}

fn parse_kbps(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    match value.trim().parse::<u32>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            message: "must be greater than zero".to_string(),
        }),
        Ok(kbps) => Ok(kbps),
        Err(e) => Err(ConfigError::InvalidValue {
            key,
            message: e.to_string(),
        }),
    }
}

// ============================================================================
// TESTS
// ============================================================================
