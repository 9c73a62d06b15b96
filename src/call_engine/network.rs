//! Network Quality Controller
//!
//! Übersetzt die Netzwerk-Schwellen der Engine in Bitrate- und
//! Video-Vorgaben. Die Events müssen pro Session in Reihenfolge ankommen:
//! die "sticky"-Regel für `Low` hängt vom vorherigen Ergebnis ab.

use crate::transport::Topology;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bitrate-Obergrenze bei guter Verbindung (kbps)
pub const DEFAULT_HIGH_KBPS: u32 = 1500;

/// Basis-Bitrate für Low/BandwidthSaver (kbps), wird im Mesh geteilt
pub const DEFAULT_LOW_BASE_KBPS: u32 = 250;

// ============================================================================
// TYPES
// ============================================================================

/// Diskrete Netzwerkqualität, wie sie die Engine meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkThreshold {
    Good,
    Low,
    VeryLow,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown network threshold: {0}")]
pub struct UnknownThreshold(pub String);

impl FromStr for NetworkThreshold {
    type Err = UnknownThreshold;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(NetworkThreshold::Good),
            "low" => Ok(NetworkThreshold::Low),
            "very-low" | "very_low" => Ok(NetworkThreshold::VeryLow),
            other => Err(UnknownThreshold(other.to_string())),
        }
    }
}

impl fmt::Display for NetworkThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkThreshold::Good => "good",
            NetworkThreshold::Low => "low",
            NetworkThreshold::VeryLow => "very-low",
        })
    }
}

/// Vom Aufrufer gewünschte Qualität
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QualityTarget {
    #[default]
    High,
    Low,
    BandwidthSaver,
}

impl FromStr for QualityTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(QualityTarget::High),
            "low" => Ok(QualityTarget::Low),
            "bandwidth-saver" => Ok(QualityTarget::BandwidthSaver),
            other => Err(format!("Unknown quality target: {other}")),
        }
    }
}

/// Befehl an die Transport-Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BitratePolicy {
    /// Stufe, aus der die Vorgabe abgeleitet wurde
    pub level: QualityTarget,
    pub kbps: u32,
    pub video_enabled: bool,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Adaptive Bitrate-Steuerung mit Hysterese
#[derive(Debug, Clone)]
pub struct NetworkQualityController {
    high_kbps: u32,
    low_base_kbps: u32,
    target: QualityTarget,
    threshold: Option<NetworkThreshold>,
    /// Ohne Kontext (Topologie) werden Schwellen ignoriert
    topology: Option<Topology>,
    participant_count: usize,
    policy: Option<BitratePolicy>,
}

impl NetworkQualityController {
    pub fn new(high_kbps: u32, low_base_kbps: u32, target: QualityTarget) -> Self {
        Self {
            high_kbps,
            low_base_kbps,
            target,
            threshold: None,
            topology: None,
            participant_count: 0,
            policy: None,
        }
    }

    /// Stellt den Transport-Kontext her (nach erfolgreichem Join)
    pub fn attach(&mut self, topology: Topology) {
        tracing::debug!(?topology, "Network controller attached");
        self.topology = Some(topology);
    }

    /// Verwirft Kontext und Verlauf (nach Leave)
    pub fn detach(&mut self) {
        self.topology = None;
        self.threshold = None;
        self.policy = None;
    }

    pub fn is_attached(&self) -> bool {
        self.topology.is_some()
    }

    pub fn set_participant_count(&mut self, count: usize) {
        self.participant_count = count;
    }

    pub fn current_threshold(&self) -> Option<NetworkThreshold> {
        self.threshold
    }

    pub fn current_policy(&self) -> Option<BitratePolicy> {
        self.policy
    }

    pub fn target(&self) -> QualityTarget {
        self.target
    }

    /// Neue Schwelle von der Engine
    ///
    /// Liefert einen Befehl bei jedem Schwellenwechsel; eine wiederholte
    /// identische Schwelle ist ein No-Op.
    pub fn on_threshold(&mut self, threshold: NetworkThreshold) -> Option<BitratePolicy> {
        let Some(topology) = self.topology else {
            tracing::trace!(%threshold, "Ignoring threshold without transport context");
            return None;
        };

        if self.threshold == Some(threshold) {
            return None;
        }

        let previous = self.policy.map(|policy| policy.level);
        let level = Self::evaluate(threshold, self.target, previous);

        tracing::info!(%threshold, ?level, "Network threshold changed");
        self.threshold = Some(threshold);
        Some(self.emit(level, topology))
    }

    /// Neue Zielqualität vom Aufrufer
    ///
    /// Bewertet die aktuelle Schwelle ohne Stickiness neu und liefert nur
    /// dann einen Befehl, wenn sich die Stufe ändert.
    pub fn set_target(&mut self, target: QualityTarget) -> Option<BitratePolicy> {
        self.target = target;

        let topology = self.topology?;
        let threshold = self.threshold?;

        let level = Self::evaluate(threshold, target, None);
        if self.policy.map(|policy| policy.level) == Some(level) {
            return None;
        }

        tracing::info!(?target, ?level, "Quality target changed");
        Some(self.emit(level, topology))
    }

    /// Entscheidungstabelle
    fn evaluate(
        threshold: NetworkThreshold,
        target: QualityTarget,
        previous: Option<QualityTarget>,
    ) -> QualityTarget {
        match threshold {
            NetworkThreshold::VeryLow => QualityTarget::BandwidthSaver,
            NetworkThreshold::Low => {
                if target == QualityTarget::BandwidthSaver
                    || previous == Some(QualityTarget::BandwidthSaver)
                {
                    QualityTarget::BandwidthSaver
                } else {
                    QualityTarget::Low
                }
            }
            NetworkThreshold::Good => target,
        }
    }

    fn emit(&mut self, level: QualityTarget, topology: Topology) -> BitratePolicy {
        let policy = BitratePolicy {
            level,
            kbps: self.kbps_for(level, topology),
            video_enabled: level != QualityTarget::BandwidthSaver,
        };
        self.policy = Some(policy);
        policy
    }

    fn kbps_for(&self, level: QualityTarget, topology: Topology) -> u32 {
        match (level, topology) {
            (QualityTarget::High, _) => self.high_kbps,
            (_, Topology::Sfu) => self.low_base_kbps,
            (_, Topology::Mesh) => {
                let peers = self.participant_count.saturating_sub(1).max(1);
                let peers = u32::try_from(peers).unwrap_or(u32::MAX);
                self.low_base_kbps / peers
            }
        }
    }
}

impl Default for NetworkQualityController {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_KBPS, DEFAULT_LOW_BASE_KBPS, QualityTarget::High)
    }
}

// ============================================================================
// TESTS
// ============================================================================
