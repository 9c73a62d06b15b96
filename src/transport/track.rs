//! Track Handles
//!
//! Opake Referenz auf einen Media-Track der externen Transport-Engine.
//! Der Adapter zur Engine erzeugt pro Track genau einen Handle und ruft
//! `end()` auf, sobald die Engine den Track beendet.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// TRACK TYPES
// ============================================================================

/// Art des Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackKind {
    Audio,
    Video,
    ScreenAudio,
    ScreenVideo,
}

impl TrackKind {
    /// Audio-Tracks landen im Compositor, Video-Tracks nicht
    pub fn is_audio(self) -> bool {
        matches!(self, TrackKind::Audio | TrackKind::ScreenAudio)
    }
}

/// Lebenszyklus eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackState {
    Live,
    Ended,
}

/// Kennung eines registrierten End-Listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type EndedListener = Box<dyn FnOnce() + Send>;

// ============================================================================
// TRACK HANDLE
// ============================================================================

struct TrackShared {
    state: TrackState,
    enabled: bool,
    next_listener: u64,
    listeners: Vec<(ListenerId, EndedListener)>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    shared: Mutex<TrackShared>,
}

/// Geteilter Handle auf einen externen Track
///
/// Klone zeigen auf denselben Track. Gleichheit ist Identität, nicht
/// Inhalt: zwei Handles mit gleicher ID aber unterschiedlichem Ursprung
/// sind verschieden.
#[derive(Clone)]
pub struct TrackHandle {
    inner: Arc<TrackInner>,
}

impl TrackHandle {
    /// Erstellt einen neuen, laufenden und aktivierten Track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                shared: Mutex::new(TrackShared {
                    state: TrackState::Live,
                    enabled: true,
                    next_listener: 0,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn state(&self) -> TrackState {
        self.inner.shared.lock().state
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.shared.lock().enabled
    }

    /// Aktiviert/deaktiviert den Track (z.B. remote stummgeschaltet)
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.shared.lock().enabled = enabled;
    }

    /// Registriert einen Listener, der genau einmal beim Track-Ende feuert
    ///
    /// Ist der Track bereits beendet, wird nichts registriert.
    pub fn on_ended<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut shared = self.inner.shared.lock();
        let id = ListenerId(shared.next_listener);
        shared.next_listener += 1;
        if shared.state == TrackState::Live {
            shared.listeners.push((id, Box::new(listener)));
        }
        id
    }

    /// Entfernt einen Listener. Gibt `false` zurück, wenn er nicht (mehr) existiert.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut shared = self.inner.shared.lock();
        let before = shared.listeners.len();
        shared.listeners.retain(|(listener_id, _)| *listener_id != id);
        shared.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.shared.lock().listeners.len()
    }

    /// Beendet den Track und feuert alle Listener (außerhalb des Locks)
    pub fn end(&self) {
        let listeners = {
            let mut shared = self.inner.shared.lock();
            if shared.state == TrackState::Ended {
                return;
            }
            shared.state = TrackState::Ended;
            std::mem::take(&mut shared.listeners)
        };

        tracing::debug!(track_id = %self.inner.id, listeners = listeners.len(), "Track ended");

        for (_, listener) in listeners {
            listener();
        }
    }

    /// Anzahl der Handles, die auf diesen Track zeigen
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for TrackHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TrackHandle {}

impl fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("TrackHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &shared.state)
            .field("enabled", &shared.enabled)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listener_fires_once() {
        let track = TrackHandle::new("a1", TrackKind::Audio);
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        track.on_ended(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        track.end();
        track.end();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(track.listener_count(), 0);
        assert_eq!(track.state(), TrackState::Ended);
    }

    #[test]
    fn test_removed_listener_does_not_fire() {
        let track = TrackHandle::new("a1", TrackKind::Audio);
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let id = track.on_ended(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(track.remove_listener(id));
        assert!(!track.remove_listener(id));
        track.end();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_listener_on_ended_track() {
        let track = TrackHandle::new("v1", TrackKind::Video);
        track.end();
        track.on_ended(|| panic!("must not be stored"));
        assert_eq!(track.listener_count(), 0);
    }

    #[test]
    fn test_equality_is_identity() {
        let a = TrackHandle::new("same", TrackKind::Audio);
        let b = TrackHandle::new("same", TrackKind::Audio);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
