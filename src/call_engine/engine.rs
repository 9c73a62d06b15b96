//! Call Engine - Root-Controller einer Session
//!
//! Besitzt Reconciler-Zustand, Lifecycle-Machine, Network-Controller und
//! Audio-Compositor einer einzigen Session. Es gibt keinen globalen
//! Zustand: mehrere Engines können parallel existieren.
//!
//! Events der Transport-Engine landen über eine Subscription in einer
//! Inbox und werden strikt nacheinander verarbeitet (`pump`/`run`).

use super::audio::{AudioCompositor, AudioSink};
use super::lifecycle::{
    CallState, LifecycleEvent, LifecycleMachine, Navigator, RenderContext, ViewDescriptor,
};
use super::network::{BitratePolicy, NetworkQualityController, NetworkThreshold, QualityTarget};
use super::reconciler::{self, CallItem, CallItems};
use crate::config::SessionConfig;
use crate::transport::{
    EngineEvent, JoinOutcome, Subscription, Transport, TransportError, WaitingParticipant,
};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use url::Url;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No active call")]
    NoActiveCall,
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Events für die UI-Schicht
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    StateChanged { state: CallState },
    /// Item-IDs in Anzeigereihenfolge; Details über `CallEngine::items()`
    ItemsChanged { ids: Vec<String> },
    ThresholdChanged { threshold: NetworkThreshold },
    PolicyApplied { policy: BitratePolicy },
    WaitingListChanged { waiting: Vec<WaitingParticipant> },
    AppMessage { from: String, data: serde_json::Value },
    Navigated { to: Url },
}

/// Stream von Session-Events
pub type SessionEventStream = BoxStream<'static, SessionEvent>;

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Session-Controller
pub struct CallEngine {
    session_id: Uuid,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    navigator: Arc<dyn Navigator>,
    lifecycle: LifecycleMachine,
    items: CallItems,
    waiting: BTreeMap<String, WaitingParticipant>,
    participant_count: usize,
    network: NetworkQualityController,
    audio: AudioCompositor,
    /// Lokales Video wurde vom Network-Controller abgeschaltet
    video_suppressed: bool,
    event_tx: broadcast::Sender<SessionEvent>,
    inbox: mpsc::UnboundedReceiver<EngineEvent>,
    _subscription: Subscription,
}

impl CallEngine {
    /// Erstellt eine neue Engine und registriert sich bei der Transport-Engine
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        let subscription = transport.subscribe(Box::new(move |event: &EngineEvent| {
            let _ = inbox_tx.send(event.clone());
        }));

        let network = NetworkQualityController::new(
            config.high_kbps,
            config.low_base_kbps,
            config.default_target,
        );

        let session_id = Uuid::new_v4();
        tracing::info!(%session_id, "Call session created");

        Self {
            session_id,
            config,
            transport,
            navigator,
            lifecycle: LifecycleMachine::new(),
            items: CallItems::new(),
            waiting: BTreeMap::new(),
            participant_count: 0,
            network,
            audio: AudioCompositor::new(sink),
            video_suppressed: false,
            event_tx,
            inbox,
            _subscription: subscription,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Session-Events als Stream (verpasste Events werden übersprungen)
    pub fn event_stream(&self) -> SessionEventStream {
        stream::unfold(self.event_tx.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    // ========================================================================
    // READ-ONLY PROJECTIONS
    // ========================================================================

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.lifecycle.state()
    }

    pub fn items(&self) -> &CallItems {
        &self.items
    }

    pub fn ordered_items(&self) -> Vec<&CallItem> {
        reconciler::display_order(&self.items)
    }

    pub fn threshold(&self) -> Option<NetworkThreshold> {
        self.network.current_threshold()
    }

    pub fn policy(&self) -> Option<BitratePolicy> {
        self.network.current_policy()
    }

    pub fn target(&self) -> QualityTarget {
        self.network.target()
    }

    pub fn waiting_participants(&self) -> Vec<WaitingParticipant> {
        self.waiting.values().cloned().collect()
    }

    /// IDs der Tracks im Audio-Ausgabe-Stream
    pub fn audio_track_ids(&self) -> Vec<String> {
        self.audio.track_ids()
    }

    pub fn render_context(&self) -> RenderContext {
        RenderContext {
            room_name: self.config.room_name.clone(),
            participant_count: self.participant_count,
            waiting_count: self.waiting.len(),
            not_found_redirect: self.config.not_found_target(),
        }
    }

    /// Rendert den aktuellen Zustand (löst ggf. den Redirect aus)
    pub fn view(&mut self) -> ViewDescriptor {
        let ctx = self.render_context();
        self.lifecycle.render(&ctx, self.navigator.as_ref())
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Call-Objekt vorbereitet (Prejoin)
    pub fn prepare(&mut self) -> CallState {
        self.apply_lifecycle(LifecycleEvent::Prepare)
    }

    /// Startet den Beitritt
    pub fn join(&mut self) -> CallState {
        let before = self.state();
        let after = self.apply_lifecycle(LifecycleEvent::JoinRequested);
        if after == before || after != CallState::Joining {
            return after;
        }

        match self.transport.join() {
            Ok(()) => after,
            Err(e) => {
                tracing::error!("Failed to join: {}", e);
                self.apply_lifecycle(LifecycleEvent::Fatal {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Lobby verlassen, Geräte-Check bestanden
    pub fn proceed(&mut self) -> CallState {
        self.apply_lifecycle(LifecycleEvent::Proceed)
    }

    /// Verlässt den Call
    pub fn leave(&mut self) -> CallState {
        if !self.in_session() {
            return self.state();
        }
        if let Err(e) = self.transport.leave() {
            tracing::warn!("Transport leave failed: {}", e);
        }
        self.apply_lifecycle(LifecycleEvent::Leave)
    }

    /// Zurück in den Ausgangszustand (nach Ende oder Fehler)
    pub fn reset(&mut self) -> CallState {
        self.apply_lifecycle(LifecycleEvent::Reset)
    }

    /// Verlässt die Session in Richtung einer externen Seite
    pub fn redirect(&mut self, to: Url) -> CallState {
        self.apply_lifecycle(LifecycleEvent::Redirect { to })
    }

    /// Setzt die gewünschte Qualität
    pub fn set_target(&mut self, target: QualityTarget) {
        if let Some(policy) = self.network.set_target(target) {
            self.apply_policy(policy);
        }
    }

    /// Mikrofon an/aus
    pub fn set_local_audio(&mut self, enabled: bool) -> Result<(), CallEngineError> {
        if !self.in_session() {
            return Err(CallEngineError::NoActiveCall);
        }
        self.transport.set_local_audio(enabled)?;
        Ok(())
    }

    /// Kamera an/aus; eine manuelle Wahl hebt die automatische Abschaltung auf
    pub fn set_local_video(&mut self, enabled: bool) -> Result<(), CallEngineError> {
        if !self.in_session() {
            return Err(CallEngineError::NoActiveCall);
        }
        self.transport.set_local_video(enabled)?;
        self.video_suppressed = false;
        Ok(())
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    /// Verarbeitet alle bereits eingegangenen Engine-Events
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Verarbeitet Events, bis die Session einen Endzustand erreicht
    pub async fn run(&mut self) -> CallState {
        while let Some(event) = self.inbox.recv().await {
            self.handle_event(event);
            if self.state().is_terminal() {
                break;
            }
        }
        self.state()
    }

    /// Verarbeitet ein einzelnes Engine-Event
    pub fn handle_event(&mut self, event: EngineEvent) {
        tracing::debug!(session_id = %self.session_id, kind = event.kind(), "Engine event");

        match event {
            EngineEvent::ParticipantUpdated => self.refresh_participants(),

            EngineEvent::TrackStarted {
                participant_id,
                track,
            } => {
                tracing::debug!(%participant_id, track_id = %track.id(), "Track started");
                self.refresh_participants();
            }

            EngineEvent::TrackEnded {
                participant_id,
                track_id,
            } => {
                tracing::debug!(%participant_id, %track_id, "Track ended");
                self.audio.on_track_ended(&track_id);
                self.refresh_participants();
            }

            EngineEvent::NetworkQualityChange { threshold } => self.on_threshold(threshold),

            EngineEvent::WaitingParticipantAdded(participant)
            | EngineEvent::WaitingParticipantUpdated(participant) => {
                if !self.in_session() {
                    tracing::debug!(id = %participant.id, "Ignoring waiting participant outside session");
                    return;
                }
                self.waiting.insert(participant.id.clone(), participant);
                self.emit_waiting();
            }

            EngineEvent::WaitingParticipantRemoved { id } => {
                if self.waiting.remove(&id).is_some() {
                    self.emit_waiting();
                }
            }

            EngineEvent::AppMessage { from, data } => {
                self.emit(SessionEvent::AppMessage { from, data });
            }

            EngineEvent::JoinedMeeting => {
                self.apply_lifecycle(LifecycleEvent::JoinCompleted(JoinOutcome::Joined));
            }

            EngineEvent::AccessStateLobby => {
                self.apply_lifecycle(LifecycleEvent::JoinCompleted(JoinOutcome::Lobby));
            }

            EngineEvent::JoinFailed { code } => match JoinOutcome::from_code(&code) {
                Some(outcome) => {
                    self.apply_lifecycle(LifecycleEvent::JoinCompleted(outcome));
                }
                None => {
                    tracing::error!(%code, "Unknown join result");
                    self.apply_lifecycle(LifecycleEvent::Fatal {
                        reason: format!("unknown join result: {code}"),
                    });
                }
            },

            EngineEvent::LeftMeeting => {
                if self.in_session() {
                    self.apply_lifecycle(LifecycleEvent::Leave);
                }
            }

            EngineEvent::Ejected => {
                self.apply_lifecycle(LifecycleEvent::Evicted);
            }

            EngineEvent::Error { message } => {
                tracing::error!("Transport engine error: {}", message);
                self.apply_lifecycle(LifecycleEvent::Fatal { reason: message });
            }

            EngineEvent::ActiveSpeakerChange { participant_id } => {
                if !self.in_session() {
                    tracing::debug!(%participant_id, "Ignoring active speaker outside session");
                    return;
                }
                self.items = reconciler::apply_active_speaker(&self.items, &participant_id, Utc::now());
                self.emit_items();
            }

            EngineEvent::DeviceChange => self.audio.on_device_change(),
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn in_session(&self) -> bool {
        matches!(
            self.state(),
            CallState::Joining | CallState::Lobby | CallState::Joined
        )
    }

    /// Wendet ein Lifecycle-Event an und verarbeitet den Zustandseintritt
    fn apply_lifecycle(&mut self, event: LifecycleEvent) -> CallState {
        let before = self.state();
        let after = self.lifecycle.apply(event);
        if after != before {
            self.on_state_entered(before, after);
        }
        after
    }

    fn on_state_entered(&mut self, before: CallState, after: CallState) {
        self.emit(SessionEvent::StateChanged { state: after });

        match after {
            CallState::Joining | CallState::Lobby => {}
            CallState::Joined => {
                self.network.attach(self.transport.topology());
                self.refresh_participants();
            }
            CallState::Redirecting => {
                if matches!(before, CallState::Joining | CallState::Lobby | CallState::Joined) {
                    if let Err(e) = self.transport.leave() {
                        tracing::debug!("Leave before redirect failed: {}", e);
                    }
                }
                self.release_media();
                if let Some(to) = self.lifecycle.take_entry_navigation() {
                    self.navigator.navigate(&to);
                    self.emit(SessionEvent::Navigated { to });
                }
            }
            _ => self.release_media(),
        }
    }

    /// Gibt alle sessiongebundenen Ressourcen frei
    fn release_media(&mut self) {
        self.audio.clear();
        self.network.detach();
        self.video_suppressed = false;
        self.participant_count = 0;
        if !self.items.is_empty() {
            self.items.clear();
            self.emit_items();
        }
        if !self.waiting.is_empty() {
            self.waiting.clear();
            self.emit_waiting();
        }
    }

    /// Neu-Abgleich nach Änderungen an der Teilnehmer-Map
    ///
    /// Außerhalb einer Session bleiben Items und Ausgabe-Stream leer.
    fn refresh_participants(&mut self) {
        if !self.in_session() {
            tracing::debug!(state = %self.state(), "Ignoring participant update outside session");
            return;
        }

        let participants = self.transport.participants();
        self.items = reconciler::reconcile(&participants, &self.items, Utc::now());
        self.participant_count = participants.len();
        self.network.set_participant_count(participants.len());

        let tracks = reconciler::remote_audio_tracks(&self.items);
        self.audio.sync(&tracks);

        let referenced: HashSet<&str> = tracks.iter().map(|track| track.id()).collect();
        self.audio.retain(|track_id| referenced.contains(track_id));

        self.emit_items();
    }

    fn on_threshold(&mut self, threshold: NetworkThreshold) {
        let before = self.network.current_threshold();
        let policy = self.network.on_threshold(threshold);

        if self.network.current_threshold() != before {
            self.emit(SessionEvent::ThresholdChanged { threshold });
        }
        if let Some(policy) = policy {
            self.apply_policy(policy);
        }
    }

    /// Setzt eine Bitrate-Vorgabe bei der Transport-Engine um
    fn apply_policy(&mut self, policy: BitratePolicy) {
        if let Err(e) = self.transport.set_bandwidth(policy.kbps) {
            tracing::warn!("Failed to set bandwidth: {}", e);
        }

        if !policy.video_enabled && !self.video_suppressed && self.local_camera_on() {
            match self.transport.set_local_video(false) {
                Ok(()) => self.video_suppressed = true,
                Err(e) => tracing::warn!("Failed to disable local video: {}", e),
            }
        } else if policy.video_enabled && self.video_suppressed {
            match self.transport.set_local_video(true) {
                Ok(()) => self.video_suppressed = false,
                Err(e) => tracing::warn!("Failed to restore local video: {}", e),
            }
        }

        self.emit(SessionEvent::PolicyApplied { policy });
    }

    fn local_camera_on(&self) -> bool {
        self.items
            .values()
            .any(|item| item.is_local && !item.is_screenshare && !item.is_cam_muted)
    }

    fn emit_items(&self) {
        let ids = reconciler::display_order(&self.items)
            .into_iter()
            .map(|item| item.id.clone())
            .collect();
        self.emit(SessionEvent::ItemsChanged { ids });
    }

    fn emit_waiting(&self) {
        self.emit(SessionEvent::WaitingListChanged {
            waiting: self.waiting_participants(),
        });
    }

    /// Sendet ein Event an alle UI-Abonnenten (ohne Abonnenten: verworfen)
    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("items", &self.items.len())
            .field("threshold", &self.threshold())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::audio::tests::TestSink;
    use super::super::lifecycle::View;
    use super::*;
    use crate::transport::{
        JoinResponse, LoopbackTransport, Participant, Topology, TrackHandle, TrackKind,
        TransportCommand,
    };
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNavigator {
        visited: Mutex<Vec<Url>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, to: &Url) {
            self.visited.lock().push(to.clone());
        }
    }

    struct Harness {
        engine: CallEngine,
        transport: Arc<LoopbackTransport>,
        navigator: Arc<RecordingNavigator>,
        sink: TestSink,
    }

    fn harness(topology: Topology) -> Harness {
        let transport = Arc::new(LoopbackTransport::new(topology));
        let navigator = Arc::new(RecordingNavigator::default());
        let sink = TestSink::default();
        let config = SessionConfig {
            room_name: Some("standup".into()),
            ..SessionConfig::default()
        };
        let engine = CallEngine::new(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&navigator) as Arc<dyn Navigator>,
            Box::new(sink.clone()),
        );
        Harness {
            engine,
            transport,
            navigator,
            sink,
        }
    }

    fn joined(topology: Topology) -> Harness {
        let mut h = harness(topology);
        h.engine.join();
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::Joined);
        h
    }

    fn remote_with_audio(id: &str) -> (Participant, TrackHandle) {
        let audio = TrackHandle::new(format!("{id}-audio"), TrackKind::Audio);
        let participant = Participant {
            id: id.to_string(),
            display_name: Some(id.to_string()),
            audio_track: Some(audio.clone()),
            mic_enabled: true,
            ..Default::default()
        };
        (participant, audio)
    }

    fn bandwidth_commands(transport: &LoopbackTransport) -> Vec<TransportCommand> {
        transport
            .commands()
            .into_iter()
            .filter(|command| {
                matches!(
                    command,
                    TransportCommand::SetBandwidth { .. } | TransportCommand::SetLocalVideo { .. }
                )
            })
            .collect()
    }

    #[test]
    fn test_join_flow() {
        let mut h = harness(Topology::Sfu);
        let mut events = h.engine.subscribe();

        assert_eq!(h.engine.join(), CallState::Joining);
        h.engine.pump();

        assert_eq!(h.engine.state(), CallState::Joined);
        assert!(h.engine.items().contains_key("local"));
        assert_eq!(h.transport.commands(), vec![TransportCommand::Join]);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::StateChanged { state: CallState::Joining })
        ));
    }

    #[test]
    fn test_lobby_then_proceed() {
        let mut h = harness(Topology::Sfu);
        h.transport.set_join_response(JoinResponse::Lobby);

        h.engine.join();
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::Lobby);
        assert_eq!(h.engine.view().view, View::Lobby);

        assert_eq!(h.engine.proceed(), CallState::Joined);
    }

    #[test]
    fn test_remote_audio_is_composited_and_released() {
        let mut h = joined(Topology::Sfu);
        let (bob, bob_audio) = remote_with_audio("bob");

        h.transport.upsert_participant(bob);
        h.engine.pump();

        assert_eq!(h.engine.audio_track_ids(), vec!["bob-audio".to_string()]);
        assert!(h.sink.state.lock().playing);

        h.transport.end_track("bob", &bob_audio);
        assert!(h.engine.audio_track_ids().is_empty());
        h.engine.pump();

        assert!(h.engine.audio_track_ids().is_empty());
        assert_eq!(bob_audio.listener_count(), 0);
    }

    #[test]
    fn test_local_audio_not_composited() {
        let mut h = joined(Topology::Sfu);
        h.engine.pump();
        assert!(h.engine.audio_track_ids().is_empty());
        assert_eq!(h.sink.state.lock().attempts, 0);
    }

    #[test]
    fn test_departed_participant_track_is_pruned() {
        let mut h = joined(Topology::Sfu);
        let (bob, bob_audio) = remote_with_audio("bob");
        h.transport.upsert_participant(bob);
        h.engine.pump();

        // Track läuft weiter, wird aber nicht mehr referenziert
        h.transport.update_participant("bob", |bob| bob.audio_track = None);
        h.engine.pump();

        assert!(bob_audio.is_live());
        assert!(h.engine.audio_track_ids().is_empty());
        assert_eq!(bob_audio.listener_count(), 0);
        assert_eq!(bob_audio.ref_count(), 1);
    }

    #[test]
    fn test_threshold_before_join_is_ignored() {
        let mut h = harness(Topology::Sfu);
        h.engine.handle_event(EngineEvent::NetworkQualityChange {
            threshold: NetworkThreshold::VeryLow,
        });
        assert!(h.transport.commands().is_empty());
        assert_eq!(h.engine.threshold(), None);
    }

    #[test]
    fn test_network_policy_drives_transport() {
        let mut h = joined(Topology::Sfu);

        for threshold in [
            NetworkThreshold::Good,
            NetworkThreshold::VeryLow,
            NetworkThreshold::VeryLow,
            NetworkThreshold::Low,
            NetworkThreshold::Good,
        ] {
            h.engine
                .handle_event(EngineEvent::NetworkQualityChange { threshold });
            h.engine.pump();
        }

        assert_eq!(
            bandwidth_commands(&h.transport),
            vec![
                TransportCommand::SetBandwidth { kbps: 1500 },
                TransportCommand::SetBandwidth { kbps: 250 },
                TransportCommand::SetLocalVideo { enabled: false },
                TransportCommand::SetBandwidth { kbps: 250 },
                TransportCommand::SetBandwidth { kbps: 1500 },
                TransportCommand::SetLocalVideo { enabled: true },
            ]
        );
        assert_eq!(h.engine.threshold(), Some(NetworkThreshold::Good));
    }

    #[test]
    fn test_camera_turned_off_by_user_stays_off() {
        let mut h = joined(Topology::Sfu);
        h.engine.set_local_video(false).unwrap();
        h.engine.pump();

        h.engine.handle_event(EngineEvent::NetworkQualityChange {
            threshold: NetworkThreshold::VeryLow,
        });
        h.engine.handle_event(EngineEvent::NetworkQualityChange {
            threshold: NetworkThreshold::Good,
        });

        let video: Vec<_> = bandwidth_commands(&h.transport)
            .into_iter()
            .filter(|command| matches!(command, TransportCommand::SetLocalVideo { .. }))
            .collect();
        assert_eq!(video, vec![TransportCommand::SetLocalVideo { enabled: false }]);
    }

    #[test]
    fn test_mesh_bitrate_uses_participant_count() {
        let mut h = joined(Topology::Mesh);
        for id in ["a", "b", "c", "d"] {
            h.transport.upsert_participant(remote_with_audio(id).0);
        }
        h.engine.pump();

        h.engine.handle_event(EngineEvent::NetworkQualityChange {
            threshold: NetworkThreshold::Low,
        });
        assert_eq!(h.engine.policy().map(|p| p.kbps), Some(250 / 4));
    }

    #[test]
    fn test_set_target_reissues_policy() {
        let mut h = joined(Topology::Sfu);
        h.engine.handle_event(EngineEvent::NetworkQualityChange {
            threshold: NetworkThreshold::Good,
        });
        h.engine.set_target(QualityTarget::BandwidthSaver);

        assert_eq!(h.engine.target(), QualityTarget::BandwidthSaver);
        assert_eq!(
            h.engine.policy().map(|p| (p.level, p.video_enabled)),
            Some((QualityTarget::BandwidthSaver, false))
        );
    }

    #[test]
    fn test_not_found_redirects_once() {
        let mut h = harness(Topology::Sfu);
        h.transport
            .set_join_response(JoinResponse::Fail("not-found".into()));

        h.engine.join();
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::NotFound);

        h.engine.view();
        h.engine.view();
        h.engine.view();
        assert_eq!(h.navigator.visited.lock().len(), 1);
    }

    #[test]
    fn test_unknown_join_code_is_fatal() {
        let mut h = harness(Topology::Sfu);
        h.transport.set_join_response(JoinResponse::Fail("teapot".into()));

        h.engine.join();
        h.engine.pump();

        assert_eq!(h.engine.state(), CallState::FatalError);
        assert_eq!(h.engine.view().view, View::Error);
    }

    #[test]
    fn test_rejected_join_is_fatal() {
        let mut h = harness(Topology::Sfu);
        h.transport
            .set_join_response(JoinResponse::Reject("bad token".into()));
        assert_eq!(h.engine.join(), CallState::FatalError);
    }

    #[test]
    fn test_redirect_navigates_once_and_leaves() {
        let mut h = joined(Topology::Sfu);
        let target = Url::parse("https://example.com/survey").unwrap();

        h.engine.redirect(target.clone());
        h.engine.redirect(target.clone());
        h.engine.pump();
        h.engine.view();

        assert_eq!(h.engine.state(), CallState::Redirecting);
        assert_eq!(*h.navigator.visited.lock(), vec![target]);
        assert!(h.transport.commands().contains(&TransportCommand::Leave));
        assert!(h.engine.items().is_empty());
    }

    #[test]
    fn test_leave_clears_session_state() {
        let mut h = joined(Topology::Sfu);
        let (bob, bob_audio) = remote_with_audio("bob");
        h.transport.upsert_participant(bob);
        h.engine.pump();

        assert_eq!(h.engine.leave(), CallState::Ended);
        h.engine.pump();

        assert_eq!(h.engine.state(), CallState::Ended);
        assert!(h.engine.items().is_empty());
        assert!(h.engine.audio_track_ids().is_empty());
        assert_eq!(bob_audio.listener_count(), 0);
        assert!(matches!(
            h.engine.set_local_audio(true),
            Err(CallEngineError::NoActiveCall)
        ));
    }

    #[test]
    fn test_terminal_state_stays_released() {
        let mut h = joined(Topology::Sfu);
        h.transport.upsert_participant(remote_with_audio("bob").0);
        h.engine.pump();
        let attempts = h.sink.state.lock().attempts;

        h.transport.emit(EngineEvent::Error {
            message: "media server gone".into(),
        });
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::FatalError);

        h.transport
            .update_participant("bob", |bob| bob.mic_enabled = false);
        h.transport.emit(EngineEvent::ActiveSpeakerChange {
            participant_id: "bob".into(),
        });
        h.transport
            .emit(EngineEvent::WaitingParticipantAdded(WaitingParticipant {
                id: "w1".into(),
                name: None,
            }));
        h.engine.pump();

        assert_eq!(h.engine.state(), CallState::FatalError);
        assert!(h.engine.items().is_empty());
        assert!(h.engine.audio_track_ids().is_empty());
        assert!(h.engine.waiting_participants().is_empty());
        assert_eq!(h.sink.state.lock().attempts, attempts);
    }

    #[test]
    fn test_updates_before_join_are_ignored() {
        let mut h = harness(Topology::Sfu);
        h.transport.upsert_participant(remote_with_audio("bob").0);
        h.engine.pump();

        assert_eq!(h.engine.state(), CallState::Idle);
        assert!(h.engine.items().is_empty());
        assert!(h.engine.audio_track_ids().is_empty());
        assert_eq!(h.sink.state.lock().attempts, 0);
    }

    #[test]
    fn test_ejected_from_lobby_ends_call() {
        let mut h = harness(Topology::Sfu);
        h.transport.set_join_response(JoinResponse::Lobby);
        h.engine.join();
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::Lobby);

        h.transport.emit(EngineEvent::Ejected);
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::Ended);
    }

    #[test]
    fn test_ejected_ends_call() {
        let mut h = joined(Topology::Sfu);
        h.transport.emit(EngineEvent::Ejected);
        h.engine.pump();
        assert_eq!(h.engine.state(), CallState::Ended);
    }

    #[test]
    fn test_waiting_room_and_app_messages() {
        let mut h = joined(Topology::Sfu);
        let mut events = h.engine.subscribe();

        h.transport
            .emit(EngineEvent::WaitingParticipantAdded(WaitingParticipant {
                id: "w1".into(),
                name: Some("Wanda".into()),
            }));
        h.transport.emit(EngineEvent::AppMessage {
            from: "bob".into(),
            data: serde_json::json!({ "emoji": "👋" }),
        });
        h.engine.pump();

        assert_eq!(h.engine.waiting_participants().len(), 1);
        assert_eq!(h.engine.render_context().waiting_count, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::WaitingListChanged { .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::AppMessage { ref from, .. }) if from == "bob"
        ));

        h.transport
            .emit(EngineEvent::WaitingParticipantRemoved { id: "w1".into() });
        h.engine.pump();
        assert!(h.engine.waiting_participants().is_empty());
    }

    #[test]
    fn test_active_speaker_flag_survives_updates() {
        let mut h = joined(Topology::Sfu);
        h.transport.upsert_participant(remote_with_audio("bob").0);
        h.engine.pump();

        h.transport.emit(EngineEvent::ActiveSpeakerChange {
            participant_id: "bob".into(),
        });
        h.transport
            .update_participant("bob", |bob| bob.mic_enabled = false);
        h.engine.pump();

        let bob = &h.engine.items()["bob"];
        assert!(bob.is_active_speaker);
        assert!(bob.is_mic_muted);
        assert!(bob.last_active_date.is_some());
    }

    #[test]
    fn test_device_change_retries_playback() {
        let mut h = joined(Topology::Sfu);
        h.sink.state.lock().reject = true;
        h.transport.upsert_participant(remote_with_audio("bob").0);
        h.engine.pump();
        assert!(!h.sink.state.lock().playing);

        h.sink.state.lock().reject = false;
        h.transport.emit(EngineEvent::DeviceChange);
        h.engine.pump();
        assert!(h.sink.state.lock().playing);
    }

    #[test]
    fn test_drop_unsubscribes_from_transport() {
        let h = harness(Topology::Sfu);
        assert_eq!(h.transport.subscriber_count(), 1);
        drop(h.engine);
        assert_eq!(h.transport.subscriber_count(), 0);
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut a = joined(Topology::Sfu);
        let b = harness(Topology::Sfu);

        a.transport.upsert_participant(remote_with_audio("bob").0);
        a.engine.pump();

        assert_ne!(a.engine.session_id(), b.engine.session_id());
        assert!(a.engine.items().contains_key("bob"));
        assert!(b.engine.items().is_empty());
        assert_eq!(b.engine.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_run_until_call_ends() {
        let mut h = joined(Topology::Sfu);
        let mut stream = h.engine.event_stream();

        let transport = Arc::clone(&h.transport);
        tokio::spawn(async move {
            transport.upsert_participant(remote_with_audio("bob").0);
            transport.emit(EngineEvent::Ejected);
        });

        assert_eq!(h.engine.run().await, CallState::Ended);

        let first = stream.next().await;
        assert!(matches!(first, Some(SessionEvent::ItemsChanged { .. })));
    }
}
