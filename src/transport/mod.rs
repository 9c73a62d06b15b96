//! Transport Module - Schnittstelle zur externen Media-Engine
//!
//! Dieses Modul beschreibt, was der Core von der Engine konsumiert:
//! - abfragbare Teilnehmer-Map mit Track-Handles
//! - diskreter Event-Stream (getypte `EngineEvent`s)
//! - imperative Befehle (join, leave, Bandbreite, lokale Medien)
//!
//! Signaling, ICE und Codec-Auswahl passieren vollständig in der Engine.

mod events;
mod loopback;
mod observers;
mod participant;
mod track;

pub use events::{EngineEvent, JoinOutcome};
pub use loopback::{JoinResponse, LoopbackTransport, TransportCommand};
pub use observers::{Observers, Subscription};
pub use participant::{Participant, ParticipantMap, Topology, WaitingParticipant};
pub use track::{ListenerId, TrackHandle, TrackKind, TrackState};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Command rejected by transport: {0}")]
    Rejected(String),
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Handler für Engine-Events
pub type EngineEventHandler = Box<dyn Fn(&EngineEvent) + Send + Sync>;

/// Befehle und Abfragen, die jede Transport-Engine unterstützen muss
pub trait Transport: Send + Sync {
    /// Aktueller Snapshot aller bekannten Teilnehmer (inkl. lokal)
    fn participants(&self) -> ParticipantMap;

    /// Mesh oder SFU
    fn topology(&self) -> Topology;

    /// Registriert einen Event-Handler; der Handle meldet ihn beim Drop ab
    fn subscribe(&self, handler: EngineEventHandler) -> Subscription;

    fn join(&self) -> Result<(), TransportError>;

    fn leave(&self) -> Result<(), TransportError>;

    fn set_local_audio(&self, enabled: bool) -> Result<(), TransportError>;

    fn set_local_video(&self, enabled: bool) -> Result<(), TransportError>;

    /// Begrenzt die ausgehende Bitrate
    fn set_bandwidth(&self, kbps: u32) -> Result<(), TransportError>;
}
