//! Event-Typen der Transport-Engine
//!
//! Jede Event-Art hat genau einen Konstruktor. Der Engine-Adapter ist dafür
//! zuständig, die Rohdaten der Engine (Strings, dynamische Felder) in diese
//! Varianten zu übersetzen; der Core sieht nur noch getypte Events.

use super::participant::WaitingParticipant;
use super::track::TrackHandle;
use crate::call_engine::{CallState, NetworkThreshold};
use serde::{Deserialize, Serialize};

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Alle Events, die die Transport-Engine an den Core liefert
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Teilnehmer-Map hat sich geändert (neu abfragen)
    ParticipantUpdated,

    /// Ein Track wurde gestartet
    TrackStarted {
        participant_id: String,
        track: TrackHandle,
    },

    /// Ein Track wurde beendet
    TrackEnded {
        participant_id: String,
        track_id: String,
    },

    /// Netzwerkqualität hat eine Schwelle überschritten
    NetworkQualityChange { threshold: NetworkThreshold },

    /// Jemand wartet im Warteraum
    WaitingParticipantAdded(WaitingParticipant),

    /// Daten eines Wartenden haben sich geändert
    WaitingParticipantUpdated(WaitingParticipant),

    /// Wartender wurde eingelassen oder hat aufgegeben
    WaitingParticipantRemoved { id: String },

    /// Anwendungsnachricht eines anderen Teilnehmers
    AppMessage {
        from: String,
        data: serde_json::Value,
    },

    /// Join war erfolgreich
    JoinedMeeting,

    /// Engine meldet, dass wir im Lobby-Zustand sind
    AccessStateLobby,

    /// Join ist mit einem Fehler-Code gescheitert
    JoinFailed { code: String },

    /// Meeting verlassen (lokal ausgelöst)
    LeftMeeting,

    /// Vom Host oder Server entfernt
    Ejected,

    /// Nicht behebbarer Engine-Fehler
    Error { message: String },

    /// Externe Sprechererkennung meldet aktiven Sprecher
    ActiveSpeakerChange { participant_id: String },

    /// Audio-Geräte haben sich geändert
    DeviceChange,
}

impl EngineEvent {
    /// Kurzname für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ParticipantUpdated => "participant-updated",
            EngineEvent::TrackStarted { .. } => "track-started",
            EngineEvent::TrackEnded { .. } => "track-ended",
            EngineEvent::NetworkQualityChange { .. } => "network-quality-change",
            EngineEvent::WaitingParticipantAdded(_) => "waiting-participant-added",
            EngineEvent::WaitingParticipantUpdated(_) => "waiting-participant-updated",
            EngineEvent::WaitingParticipantRemoved { .. } => "waiting-participant-removed",
            EngineEvent::AppMessage { .. } => "app-message",
            EngineEvent::JoinedMeeting => "joined-meeting",
            EngineEvent::AccessStateLobby => "access-state-lobby",
            EngineEvent::JoinFailed { .. } => "join-failed",
            EngineEvent::LeftMeeting => "left-meeting",
            EngineEvent::Ejected => "ejected",
            EngineEvent::Error { .. } => "error",
            EngineEvent::ActiveSpeakerChange { .. } => "active-speaker-change",
            EngineEvent::DeviceChange => "device-change",
        }
    }

    /// `network-quality-change` aus dem Roh-String der Engine
    ///
    /// Unbekannte Schwellen werden geloggt und verworfen.
    pub fn network_quality(raw: &str) -> Option<Self> {
        match raw.parse::<NetworkThreshold>() {
            Ok(threshold) => Some(EngineEvent::NetworkQualityChange { threshold }),
            Err(e) => {
                tracing::warn!("Ignoring network quality change: {}", e);
                None
            }
        }
    }
}

// ============================================================================
// JOIN OUTCOME
// ============================================================================

/// Ergebnis eines Join-Versuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinOutcome {
    Joined,
    Lobby,
    NotFound,
    NotAllowed,
    NotBefore,
    Expired,
}

impl JoinOutcome {
    /// Übersetzt den Ergebnis-Code der Engine
    ///
    /// Unbekannte Codes liefern `None`; der Aufrufer macht daraus `FatalError`.
    pub fn from_code(code: &str) -> Option<Self> {
        let outcome = match code {
            "joined" => JoinOutcome::Joined,
            "lobby" => JoinOutcome::Lobby,
            "not-found" | "no-room" => JoinOutcome::NotFound,
            "not-allowed" => JoinOutcome::NotAllowed,
            "nbf-room" | "not-before" => JoinOutcome::NotBefore,
            "exp-room" | "expired" => JoinOutcome::Expired,
            _ => return None,
        };
        Some(outcome)
    }

    /// Zielzustand der Lifecycle-Machine
    pub fn state(self) -> CallState {
        match self {
            JoinOutcome::Joined => CallState::Joined,
            JoinOutcome::Lobby => CallState::Lobby,
            JoinOutcome::NotFound => CallState::NotFound,
            JoinOutcome::NotAllowed => CallState::NotAllowed,
            JoinOutcome::NotBefore => CallState::NotBefore,
            JoinOutcome::Expired => CallState::Expired,
        }
    }
}
