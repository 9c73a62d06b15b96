//! Participant Snapshot
//!
//! Rohdaten so, wie die Transport-Engine sie liefert. Diese Strukturen
//! werden nie direkt gerendert, sondern vom Reconciler in `CallItem`s
//! überführt.

use super::track::{TrackHandle, TrackState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Teilnehmer-Map der Engine (ID → Teilnehmer)
pub type ParticipantMap = BTreeMap<String, Participant>;

/// Medien-Topologie der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Jeder sendet an jeden (P2P)
    Mesh,
    /// Server-vermittelt (Selective Forwarding Unit)
    #[default]
    Sfu,
}

/// Ein Teilnehmer, wie ihn die Engine meldet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Participant {
    pub id: String,
    pub display_name: Option<String>,
    pub is_local: bool,
    pub is_owner: bool,
    pub is_recording: bool,
    pub audio_track: Option<TrackHandle>,
    pub video_track: Option<TrackHandle>,
    pub screen_audio_track: Option<TrackHandle>,
    pub screen_video_track: Option<TrackHandle>,
    pub mic_enabled: bool,
    pub cam_enabled: bool,
    pub muted_by_host: bool,
}

impl Participant {
    /// Minimaler Teilnehmer ohne Tracks
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_track.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.video_track.is_some()
    }

    /// Teilt der Teilnehmer gerade einen Bildschirm?
    pub fn is_sharing_screen(&self) -> bool {
        [&self.screen_audio_track, &self.screen_video_track]
            .into_iter()
            .flatten()
            .any(|track| track.state() == TrackState::Live)
    }

    /// Alle vorhandenen Tracks (für Lookups nach Track-ID)
    pub fn tracks(&self) -> impl Iterator<Item = &TrackHandle> {
        [
            &self.audio_track,
            &self.video_track,
            &self.screen_audio_track,
            &self.screen_video_track,
        ]
        .into_iter()
        .flatten()
    }
}

/// Teilnehmer, der im Warteraum auf Einlass wartet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingParticipant {
    pub id: String,
    pub name: Option<String>,
}
