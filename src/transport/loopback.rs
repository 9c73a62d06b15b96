//! Loopback Transport
//!
//! In-Memory-Engine ohne Netzwerk. Teilnehmer und Events werden per API
//! eingespielt, Befehle werden protokolliert. Wird vom Demo-Binary und von
//! den Tests verwendet.

use super::events::EngineEvent;
use super::observers::{Observers, Subscription};
use super::participant::{Participant, ParticipantMap, Topology};
use super::track::{TrackHandle, TrackKind};
use super::{EngineEventHandler, Transport, TransportError};
use parking_lot::Mutex;
use serde::Serialize;

/// ID des lokalen Teilnehmers
pub const LOCAL_PARTICIPANT_ID: &str = "local";

/// Von der Engine empfangener Befehl (für Assertions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TransportCommand {
    Join,
    Leave,
    SetLocalAudio { enabled: bool },
    SetLocalVideo { enabled: bool },
    SetBandwidth { kbps: u32 },
}

/// Wie die Loopback-Engine auf `join()` antwortet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResponse {
    /// Sofort beitreten
    Joined,
    /// In die Lobby schicken
    Lobby,
    /// Mit Fehler-Code scheitern
    Fail(String),
    /// Befehl ablehnen (synchroner Fehler)
    Reject(String),
}

#[derive(Debug)]
struct LoopbackState {
    participants: ParticipantMap,
    commands: Vec<TransportCommand>,
    join_response: JoinResponse,
    connected: bool,
}

/// In-Memory Transport-Engine
pub struct LoopbackTransport {
    topology: Topology,
    state: Mutex<LoopbackState>,
    observers: Observers<EngineEvent>,
}

impl LoopbackTransport {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            state: Mutex::new(LoopbackState {
                participants: ParticipantMap::new(),
                commands: Vec::new(),
                join_response: JoinResponse::Joined,
                connected: false,
            }),
            observers: Observers::new(),
        }
    }

    /// Legt fest, wie der nächste `join()` beantwortet wird
    pub fn set_join_response(&self, response: JoinResponse) {
        self.state.lock().join_response = response;
    }

    /// Liefert ein Event an alle Abonnenten aus
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(kind = event.kind(), "Loopback emitting event");
        self.observers.notify(&event);
    }

    /// Fügt einen Teilnehmer hinzu oder ersetzt ihn
    pub fn upsert_participant(&self, participant: Participant) {
        self.state
            .lock()
            .participants
            .insert(participant.id.clone(), participant);
        self.emit(EngineEvent::ParticipantUpdated);
    }

    /// Ändert einen Teilnehmer in-place
    pub fn update_participant<F>(&self, id: &str, update: F) -> bool
    where
        F: FnOnce(&mut Participant),
    {
        let found = match self.state.lock().participants.get_mut(id) {
            Some(participant) => {
                update(participant);
                true
            }
            None => false,
        };
        if found {
            self.emit(EngineEvent::ParticipantUpdated);
        }
        found
    }

    /// Entfernt einen Teilnehmer und beendet seine Tracks
    pub fn remove_participant(&self, id: &str) -> Option<Participant> {
        let removed = self.state.lock().participants.remove(id);
        if let Some(participant) = &removed {
            for track in participant.tracks() {
                track.end();
            }
            self.emit(EngineEvent::ParticipantUpdated);
        }
        removed
    }

    /// Beendet einen Track und meldet `track-ended`
    pub fn end_track(&self, participant_id: &str, track: &TrackHandle) {
        track.end();
        self.emit(EngineEvent::TrackEnded {
            participant_id: participant_id.to_string(),
            track_id: track.id().to_string(),
        });
    }

    /// Protokoll aller empfangenen Befehle
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.state.lock().commands.clone()
    }

    /// Anzahl aktiver Event-Handler
    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    fn record(&self, command: TransportCommand) {
        self.state.lock().commands.push(command);
    }

    fn local_participant() -> Participant {
        Participant {
            id: LOCAL_PARTICIPANT_ID.to_string(),
            display_name: None,
            is_local: true,
            audio_track: Some(TrackHandle::new("local-audio", TrackKind::Audio)),
            video_track: Some(TrackHandle::new("local-video", TrackKind::Video)),
            mic_enabled: true,
            cam_enabled: true,
            ..Default::default()
        }
    }
}

impl Transport for LoopbackTransport {
    fn participants(&self) -> ParticipantMap {
        self.state.lock().participants.clone()
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    fn subscribe(&self, handler: EngineEventHandler) -> Subscription {
        self.observers.register(move |event| handler(event))
    }

    fn join(&self) -> Result<(), TransportError> {
        self.record(TransportCommand::Join);

        let response = {
            let mut state = self.state.lock();
            let response = state.join_response.clone();
            if let JoinResponse::Reject(reason) = &response {
                return Err(TransportError::Rejected(reason.clone()));
            }
            state.connected = true;
            if matches!(response, JoinResponse::Joined | JoinResponse::Lobby) {
                state
                    .participants
                    .insert(LOCAL_PARTICIPANT_ID.to_string(), Self::local_participant());
            }
            response
        };

        match response {
            JoinResponse::Joined => {
                self.emit(EngineEvent::JoinedMeeting);
                self.emit(EngineEvent::ParticipantUpdated);
            }
            JoinResponse::Lobby => self.emit(EngineEvent::AccessStateLobby),
            JoinResponse::Fail(code) => self.emit(EngineEvent::JoinFailed { code }),
            JoinResponse::Reject(_) => {}
        }
        Ok(())
    }

    fn leave(&self) -> Result<(), TransportError> {
        self.record(TransportCommand::Leave);

        let participants = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.connected = false;
            std::mem::take(&mut state.participants)
        };

        for participant in participants.values() {
            for track in participant.tracks() {
                track.end();
            }
        }

        self.emit(EngineEvent::LeftMeeting);
        Ok(())
    }

    fn set_local_audio(&self, enabled: bool) -> Result<(), TransportError> {
        self.record(TransportCommand::SetLocalAudio { enabled });
        self.update_participant(LOCAL_PARTICIPANT_ID, |local| local.mic_enabled = enabled);
        Ok(())
    }

    fn set_local_video(&self, enabled: bool) -> Result<(), TransportError> {
        self.record(TransportCommand::SetLocalVideo { enabled });
        self.update_participant(LOCAL_PARTICIPANT_ID, |local| local.cam_enabled = enabled);
        Ok(())
    }

    fn set_bandwidth(&self, kbps: u32) -> Result<(), TransportError> {
        self.record(TransportCommand::SetBandwidth { kbps });
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackTransport")
            .field("topology", &self.topology)
            .field("participants", &state.participants.len())
            .field("connected", &state.connected)
            .finish()
    }
}
