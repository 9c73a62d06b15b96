//! Audio Compositor - mehrere Remote-Tracks in einen Ausgabe-Stream
//!
//! Hält genau einen logischen Ausgabe-Stream. Tracks werden bei jedem
//! Reconciliation-Durchlauf und zusätzlich reaktiv beim Track-Ende
//! hinzugefügt bzw. entfernt. Beide Wege dürfen redundant feuern: jede
//! Operation ist idempotent.

use crate::transport::{ListenerId, TrackHandle, TrackState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Playback rejected by autoplay policy")]
    AutoplayRejected,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Failed to start audio sink: {0}")]
    SinkError(String),
}

// ============================================================================
// AUDIO SINK
// ============================================================================

/// Abspielbares Ziel des Ausgabe-Streams (z.B. Audio-Element der UI)
pub trait AudioSink: Send {
    fn is_paused(&self) -> bool;

    /// Startet die Wiedergabe. Fehler sind erwartet (Autoplay-Policy).
    fn play(&mut self) -> Result<(), PlaybackError>;
}

// ============================================================================
// OUTPUT STREAM
// ============================================================================

#[derive(Debug)]
struct Attached {
    track: TrackHandle,
    listener: ListenerId,
}

/// Der logische Ausgabe-Stream (Track-ID → Track)
#[derive(Debug, Default)]
struct OutputStream {
    tracks: BTreeMap<String, Attached>,
}

// ============================================================================
// COMPOSITOR
// ============================================================================

/// Führt alle Remote-Audio-Tracks in einem Stream zusammen
pub struct AudioCompositor {
    stream: Arc<Mutex<OutputStream>>,
    sink: Box<dyn AudioSink>,
}

impl AudioCompositor {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            stream: Arc::new(Mutex::new(OutputStream::default())),
            sink,
        }
    }

    /// Gleicht den Stream mit den aktuell referenzierten Tracks ab
    ///
    /// Beendete Tracks werden entfernt, laufende hinzugefügt. Danach wird
    /// (falls nötig) die Wiedergabe gestartet.
    pub fn sync<'a, I>(&mut self, tracks: I)
    where
        I: IntoIterator<Item = &'a TrackHandle>,
    {
        for track in tracks {
            match track.state() {
                TrackState::Ended => {
                    self.remove(track.id());
                }
                TrackState::Live => {
                    self.add(track);
                }
            }
        }
        self.try_play();
    }

    /// Fügt einen laufenden Track hinzu
    ///
    /// No-Op für beendete oder bereits enthaltene Tracks. Registriert einen
    /// einmaligen End-Listener, der den Track reaktiv wieder entfernt.
    pub fn add(&mut self, track: &TrackHandle) -> bool {
        if track.state() == TrackState::Ended {
            return false;
        }

        let mut stream = self.stream.lock();
        if stream.tracks.contains_key(track.id()) {
            return false;
        }

        let weak: Weak<Mutex<OutputStream>> = Arc::downgrade(&self.stream);
        let track_id = track.id().to_string();
        let listener = track.on_ended(move || {
            if let Some(stream) = weak.upgrade() {
                if stream.lock().tracks.remove(&track_id).is_some() {
                    tracing::debug!(%track_id, "Removed ended track from output stream");
                }
            }
        });

        tracing::debug!(track_id = %track.id(), "Added track to output stream");
        stream.tracks.insert(
            track.id().to_string(),
            Attached {
                track: track.clone(),
                listener,
            },
        );
        true
    }

    /// Entfernt einen Track (No-Op, wenn nicht enthalten)
    pub fn remove(&mut self, track_id: &str) -> bool {
        let removed = self.stream.lock().tracks.remove(track_id);
        match removed {
            Some(attached) => {
                attached.track.remove_listener(attached.listener);
                tracing::debug!(%track_id, "Removed track from output stream");
                true
            }
            None => false,
        }
    }

    /// `track-ended` von der Engine
    pub fn on_track_ended(&mut self, track_id: &str) {
        self.remove(track_id);
    }

    /// Entfernt alle Tracks, für die `keep` false liefert
    ///
    /// Räumt Tracks ab, die noch laufen, aber von keinem Item mehr
    /// referenziert werden.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        let stale: Vec<String> = self
            .stream
            .lock()
            .tracks
            .keys()
            .filter(|track_id| !keep(track_id))
            .cloned()
            .collect();
        for track_id in stale {
            self.remove(&track_id);
        }
    }

    /// Geräteänderung: einziger Anlass für einen erneuten Play-Versuch
    pub fn on_device_change(&mut self) {
        tracing::debug!("Audio device change, retrying playback");
        self.try_play();
    }

    /// Leert den Stream und löst alle Listener (Leave/Teardown)
    pub fn clear(&mut self) {
        let drained = std::mem::take(&mut self.stream.lock().tracks);
        for (_, attached) in drained {
            attached.track.remove_listener(attached.listener);
        }
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.stream.lock().tracks.contains_key(track_id)
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.stream.lock().tracks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stream.lock().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Startet die Wiedergabe, wenn etwas Hörbares da ist und der Sink pausiert
    fn try_play(&mut self) {
        let audible = self
            .stream
            .lock()
            .tracks
            .values()
            .any(|attached| attached.track.is_live() && attached.track.is_enabled());

        if !audible || !self.sink.is_paused() {
            return;
        }

        match self.sink.play() {
            Ok(()) => tracing::debug!("Audio playback started"),
            Err(e) => tracing::debug!("Audio playback not started: {}", e),
        }
    }
}

impl Drop for AudioCompositor {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for AudioCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCompositor")
            .field("tracks", &self.track_ids())
            .field("paused", &self.sink.is_paused())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
