//! Demo: eine Session gegen die Loopback-Engine
//!
//! Spielt einen kompletten Ablauf durch (Join, Remote-Teilnehmer,
//! Screenshare, schlechte Verbindung, Leave) und gibt Ansicht und Items
//! als JSON aus.

use anyhow::{Context, Result};
use call_session_lib::call_engine::{AudioSink, Navigator, PlaybackError, SessionEvent};
use call_session_lib::transport::{EngineEvent, Participant, Topology, TrackHandle, TrackKind};
use call_session_lib::{init_logging, CallEngine, LoopbackTransport, SessionConfig, Transport};
use std::sync::Arc;
use url::Url;

/// Navigator, der nur loggt
struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, to: &Url) {
        tracing::info!(%to, "Navigating away from session");
    }
}

/// Sink ohne Ausgabegerät: merkt sich nur, ob abgespielt wird
#[derive(Default)]
struct LogSink {
    playing: bool,
}

impl AudioSink for LogSink {
    fn is_paused(&self) -> bool {
        !self.playing
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        tracing::info!("Audio output started");
        self.playing = true;
        Ok(())
    }
}

fn remote(id: &str, name: &str) -> Participant {
    Participant {
        id: id.to_string(),
        display_name: Some(name.to_string()),
        audio_track: Some(TrackHandle::new(format!("{id}-audio"), TrackKind::Audio)),
        video_track: Some(TrackHandle::new(format!("{id}-video"), TrackKind::Video)),
        mic_enabled: true,
        cam_enabled: true,
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = SessionConfig::load().context("Failed to load session config")?;
    init_logging(&config.log_filter);

    let transport = Arc::new(LoopbackTransport::new(Topology::Mesh));
    let mut engine = CallEngine::new(
        config,
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::new(LogNavigator),
        Box::new(LogSink::default()),
    );

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::PolicyApplied { policy } = &event {
                tracing::info!(level = ?policy.level, kbps = policy.kbps, "Bitrate policy applied");
            }
        }
    });

    engine.prepare();
    engine.join();
    engine.pump();

    transport.upsert_participant(remote("alice", "Alice"));
    let mut bob = remote("bob", "Bob");
    bob.screen_video_track = Some(TrackHandle::new("bob-screen", TrackKind::ScreenVideo));
    transport.upsert_participant(bob);
    transport.emit(EngineEvent::ActiveSpeakerChange {
        participant_id: "alice".to_string(),
    });

    ["good", "low", "very-low", "low", "good"]
        .into_iter()
        .filter_map(EngineEvent::network_quality)
        .for_each(|event| transport.emit(event));
    engine.pump();

    println!("{}", serde_json::to_string_pretty(&engine.view())?);
    println!("{}", serde_json::to_string_pretty(&engine.ordered_items())?);
    tracing::info!(tracks = ?engine.audio_track_ids(), "Audio output stream");

    engine.leave();
    engine.pump();
    println!("{}", serde_json::to_string_pretty(&engine.view())?);

    Ok(())
}
