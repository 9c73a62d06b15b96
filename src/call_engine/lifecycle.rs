//! Call Lifecycle State Machine
//!
//! Reine Übergangsfunktion plus ein dünner Wrapper, der den aktuellen
//! Zustand hält und Navigations-Seiteneffekte genau einmal pro Übergang
//! auslöst.

use crate::transport::JoinOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

// ============================================================================
// CALL STATE
// ============================================================================

/// Zustand der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Idle,
    Ready,
    Joining,
    Lobby,
    Joined,
    NotFound,
    NotAllowed,
    NotBefore,
    Expired,
    Redirecting,
    Ended,
    FatalError,
}

impl CallState {
    /// Übersetzt einen rohen Zustandswert
    ///
    /// Alles außerhalb der bekannten Menge wird zu `FatalError`.
    pub fn parse(raw: &str) -> CallState {
        match raw {
            "idle" => CallState::Idle,
            "ready" => CallState::Ready,
            "joining" => CallState::Joining,
            "lobby" => CallState::Lobby,
            "joined" => CallState::Joined,
            "not-found" => CallState::NotFound,
            "not-allowed" => CallState::NotAllowed,
            "not-before" => CallState::NotBefore,
            "expired" => CallState::Expired,
            "redirecting" => CallState::Redirecting,
            "ended" => CallState::Ended,
            "fatal-error" => CallState::FatalError,
            other => {
                tracing::warn!(state = other, "Unrecognized call state, treating as fatal");
                CallState::FatalError
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Ready => "ready",
            CallState::Joining => "joining",
            CallState::Lobby => "lobby",
            CallState::Joined => "joined",
            CallState::NotFound => "not-found",
            CallState::NotAllowed => "not-allowed",
            CallState::NotBefore => "not-before",
            CallState::Expired => "expired",
            CallState::Redirecting => "redirecting",
            CallState::Ended => "ended",
            CallState::FatalError => "fatal-error",
        }
    }

    /// Zustände, aus denen nur noch `Reset` (oder nichts) herausführt
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::NotFound
                | CallState::NotAllowed
                | CallState::NotBefore
                | CallState::Expired
                | CallState::Redirecting
                | CallState::Ended
                | CallState::FatalError
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// EVENTS & TRANSITIONS
// ============================================================================

/// Eingaben der Lifecycle-Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Call-Objekt ist erstellt (Prejoin)
    Prepare,
    JoinRequested,
    JoinCompleted(JoinOutcome),
    /// Geräte-Check bestanden, Lobby verlassen
    Proceed,
    Leave,
    /// Vom Host/Server entfernt
    Evicted,
    Redirect { to: Url },
    Fatal { reason: String },
    /// Zurück in den Ausgangszustand
    Reset,
}

/// Reine Übergangsfunktion
///
/// `None` heißt: Event ist im aktuellen Zustand nicht anwendbar.
pub fn transition(state: CallState, event: &LifecycleEvent) -> Option<CallState> {
    use CallState::*;

    if state == Redirecting {
        return None;
    }

    let next = match (state, event) {
        (_, LifecycleEvent::Redirect { .. }) => Redirecting,
        (_, LifecycleEvent::Fatal { .. }) => FatalError,

        (Idle, LifecycleEvent::Prepare) => Ready,
        (Idle | Ready | Ended, LifecycleEvent::JoinRequested) => Joining,

        (Joining, LifecycleEvent::JoinCompleted(outcome)) => outcome.state(),
        (Lobby, LifecycleEvent::JoinCompleted(JoinOutcome::Joined)) => Joined,
        (Lobby, LifecycleEvent::JoinCompleted(JoinOutcome::NotAllowed)) => NotAllowed,
        (Lobby, LifecycleEvent::Proceed) => Joined,

        (Joining | Lobby | Joined, LifecycleEvent::Leave) => Ended,
        (Lobby | Joined, LifecycleEvent::Evicted) => Ended,

        (Ended | NotFound | NotAllowed | NotBefore | Expired | FatalError, LifecycleEvent::Reset) => {
            Idle
        }

        _ => return None,
    };

    Some(next)
}

// ============================================================================
// VIEW DESCRIPTOR
// ============================================================================

/// Welche Ansicht die UI zeigen soll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum View {
    Home,
    Prejoin,
    Loading,
    Lobby,
    Call,
    Message,
    Error,
}

/// Render-Beschreibung eines Zustands
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDescriptor {
    pub state: CallState,
    pub view: View,
    pub title: String,
    pub message: Option<String>,
    /// Navigation, die beim Rendern ausgelöst werden soll
    pub redirect: Option<Url>,
}

/// Abhängigkeiten des Renderings neben dem Zustand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub room_name: Option<String>,
    pub participant_count: usize,
    pub waiting_count: usize,
    /// Ohne Ziel zeigt `NotFound` nur die Meldung
    pub not_found_redirect: Option<Url>,
}

/// Reine Abbildung Zustand → Ansicht
///
/// Wird bei jedem Aufruf neu berechnet, nie zwischengespeichert.
pub fn render(state: CallState, ctx: &RenderContext) -> ViewDescriptor {
    let room = ctx.room_name.as_deref().unwrap_or("this room");

    let (view, title, message, redirect) = match state {
        CallState::Idle => (View::Home, "Start a call".to_string(), None, None),
        CallState::Ready => (View::Prejoin, format!("Ready to join {room}"), None, None),
        CallState::Joining => (View::Loading, "Joining…".to_string(), None, None),
        CallState::Lobby => (
            View::Lobby,
            format!("Check your devices before joining {room}"),
            (ctx.waiting_count > 0).then(|| format!("{} waiting to join", ctx.waiting_count)),
            None,
        ),
        CallState::Joined => (
            View::Call,
            room.to_string(),
            Some(match ctx.participant_count {
                1 => "1 participant".to_string(),
                n => format!("{n} participants"),
            }),
            None,
        ),
        CallState::NotFound => (
            View::Message,
            "Room not found".to_string(),
            Some(format!("{room} does not exist")),
            ctx.not_found_redirect.clone(),
        ),
        CallState::NotAllowed => (
            View::Message,
            "Access denied".to_string(),
            Some(format!("You are not allowed to join {room}")),
            None,
        ),
        CallState::NotBefore => (
            View::Message,
            "Too early".to_string(),
            Some(format!("{room} is not open yet")),
            None,
        ),
        CallState::Expired => (
            View::Message,
            "Room expired".to_string(),
            Some(format!("{room} is no longer available")),
            None,
        ),
        CallState::Redirecting => (View::Loading, "Redirecting…".to_string(), None, None),
        CallState::Ended => (View::Message, "You left the call".to_string(), None, None),
        CallState::FatalError => (
            View::Error,
            "Something went wrong".to_string(),
            Some("Please reload and try again".to_string()),
            None,
        ),
    };

    ViewDescriptor {
        state,
        view,
        title,
        message,
        redirect,
    }
}

// ============================================================================
// NAVIGATOR
// ============================================================================

/// Externe Navigation (Router der Anwendung)
pub trait Navigator: Send + Sync {
    fn navigate(&self, to: &Url);
}

// ============================================================================
// MACHINE
// ============================================================================

/// Hält den aktuellen Zustand und entprellt Render-Seiteneffekte
#[derive(Debug)]
pub struct LifecycleMachine {
    state: CallState,
    /// Zählt echte Zustandswechsel
    epoch: u64,
    /// Epoche, in der der Render-Redirect zuletzt ausgelöst wurde
    redirected_epoch: Option<u64>,
    /// Beim Eintritt in `Redirecting` vorgemerkte Navigation
    entry_navigation: Option<Url>,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            epoch: 0,
            redirected_epoch: None,
            entry_navigation: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Wendet ein Event an und liefert den (evtl. unveränderten) Zustand
    pub fn apply(&mut self, event: LifecycleEvent) -> CallState {
        match transition(self.state, &event) {
            Some(next) if next != self.state => {
                tracing::info!(from = %self.state, to = %next, "Call state transition");
                if let LifecycleEvent::Redirect { to } = event {
                    self.entry_navigation = Some(to);
                }
                self.state = next;
                self.epoch += 1;
            }
            Some(_) => {}
            None => {
                tracing::warn!(state = %self.state, event = ?event, "Ignoring lifecycle event");
            }
        }
        self.state
    }

    /// Navigation beim Eintritt in `Redirecting` (genau einmal)
    pub fn take_entry_navigation(&mut self) -> Option<Url> {
        self.entry_navigation.take()
    }

    /// Rendert den aktuellen Zustand und feuert den Redirect höchstens
    /// einmal pro Zustandswechsel
    pub fn render(&mut self, ctx: &RenderContext, navigator: &dyn Navigator) -> ViewDescriptor {
        let descriptor = render(self.state, ctx);
        if let Some(target) = &descriptor.redirect {
            if self.redirected_epoch != Some(self.epoch) {
                self.redirected_epoch = Some(self.epoch);
                tracing::info!(%target, "Redirecting after render");
                navigator.navigate(target);
            }
        }
        descriptor
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
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

    fn ctx() -> RenderContext {
        RenderContext {
            room_name: Some("standup".into()),
            participant_count: 2,
            waiting_count: 0,
            not_found_redirect: Some(Url::parse("https://example.com/not-found").unwrap()),
        }
    }

    fn machine_in(events: Vec<LifecycleEvent>) -> LifecycleMachine {
        let mut machine = LifecycleMachine::new();
        for event in events {
            machine.apply(event);
        }
        machine
    }

    #[test]
    fn test_join_outcomes() {
        for (outcome, expected) in [
            (JoinOutcome::Lobby, CallState::Lobby),
            (JoinOutcome::Joined, CallState::Joined),
            (JoinOutcome::NotFound, CallState::NotFound),
            (JoinOutcome::NotAllowed, CallState::NotAllowed),
            (JoinOutcome::NotBefore, CallState::NotBefore),
            (JoinOutcome::Expired, CallState::Expired),
        ] {
            let machine = machine_in(vec![
                LifecycleEvent::JoinRequested,
                LifecycleEvent::JoinCompleted(outcome),
            ]);
            assert_eq!(machine.state(), expected);
        }
    }

    #[test]
    fn test_lobby_proceed_then_leave() {
        let mut machine = machine_in(vec![
            LifecycleEvent::Prepare,
            LifecycleEvent::JoinRequested,
            LifecycleEvent::JoinCompleted(JoinOutcome::Lobby),
        ]);
        assert_eq!(machine.apply(LifecycleEvent::Proceed), CallState::Joined);
        assert_eq!(machine.apply(LifecycleEvent::Evicted), CallState::Ended);
        assert_eq!(machine.apply(LifecycleEvent::JoinRequested), CallState::Joining);
    }

    #[test]
    fn test_evicted_from_lobby_ends_call() {
        let mut machine = machine_in(vec![
            LifecycleEvent::JoinRequested,
            LifecycleEvent::JoinCompleted(JoinOutcome::Lobby),
        ]);
        assert_eq!(machine.apply(LifecycleEvent::Evicted), CallState::Ended);
    }

    #[test]
    fn test_not_found_without_target_only_shows_message() {
        let navigator = RecordingNavigator::default();
        let mut machine = machine_in(vec![
            LifecycleEvent::JoinRequested,
            LifecycleEvent::JoinCompleted(JoinOutcome::NotFound),
        ]);
        let context = RenderContext {
            not_found_redirect: None,
            ..ctx()
        };

        let view = machine.render(&context, &navigator);
        assert_eq!(view.view, View::Message);
        assert_eq!(view.redirect, None);
        assert!(navigator.visited.lock().is_empty());
    }

    #[test]
    fn test_inapplicable_event_is_ignored() {
        let mut machine = LifecycleMachine::new();
        assert_eq!(machine.apply(LifecycleEvent::Proceed), CallState::Idle);
        assert_eq!(machine.apply(LifecycleEvent::Evicted), CallState::Idle);
        assert_eq!(machine.epoch(), 0);
    }

    #[test]
    fn test_unknown_state_is_fatal() {
        assert_eq!(CallState::parse("joined"), CallState::Joined);
        assert_eq!(CallState::parse("left-meeting"), CallState::FatalError);
        assert_eq!(CallState::parse(""), CallState::FatalError);
        assert_eq!(render(CallState::parse("???"), &ctx()).view, View::Error);
    }

    #[test]
    fn test_state_round_trips_through_str() {
        let state = CallState::NotBefore;
        assert_eq!(CallState::parse(state.as_str()), state);
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"not-before\"");
    }

    #[test]
    fn test_not_found_redirects_once_per_transition() {
        let navigator = RecordingNavigator::default();
        let mut machine = machine_in(vec![
            LifecycleEvent::JoinRequested,
            LifecycleEvent::JoinCompleted(JoinOutcome::NotFound),
        ]);

        for _ in 0..3 {
            let view = machine.render(&ctx(), &navigator);
            assert_eq!(view.state, CallState::NotFound);
        }
        assert_eq!(navigator.visited.lock().len(), 1);

        machine.apply(LifecycleEvent::Reset);
        machine.apply(LifecycleEvent::JoinRequested);
        machine.apply(LifecycleEvent::JoinCompleted(JoinOutcome::NotFound));
        machine.render(&ctx(), &navigator);
        machine.render(&ctx(), &navigator);

        assert_eq!(navigator.visited.lock().len(), 2);
    }

    #[test]
    fn test_render_follows_dependencies() {
        let machine = machine_in(vec![
            LifecycleEvent::JoinRequested,
            LifecycleEvent::JoinCompleted(JoinOutcome::Joined),
        ]);
        let mut context = ctx();
        assert_eq!(render(machine.state(), &context).message.as_deref(), Some("2 participants"));

        context.participant_count = 1;
        assert_eq!(render(machine.state(), &context).message.as_deref(), Some("1 participant"));
    }

    #[test]
    fn test_redirecting_is_terminal_and_navigates_once() {
        let target = Url::parse("https://example.com/elsewhere").unwrap();
        let mut machine = machine_in(vec![LifecycleEvent::JoinRequested]);

        machine.apply(LifecycleEvent::Redirect { to: target.clone() });
        assert_eq!(machine.state(), CallState::Redirecting);
        assert_eq!(machine.take_entry_navigation(), Some(target.clone()));
        assert_eq!(machine.take_entry_navigation(), None);

        machine.apply(LifecycleEvent::Redirect { to: target });
        machine.apply(LifecycleEvent::Reset);
        machine.apply(LifecycleEvent::Fatal { reason: "late".into() });
        assert_eq!(machine.state(), CallState::Redirecting);
        assert_eq!(machine.take_entry_navigation(), None);
    }

    #[test]
    fn test_fatal_from_any_live_state() {
        let mut machine = machine_in(vec![
            LifecycleEvent::JoinRequested,
            LifecycleEvent::JoinCompleted(JoinOutcome::Joined),
        ]);
        machine.apply(LifecycleEvent::Fatal { reason: "engine crashed".into() });
        assert_eq!(machine.state(), CallState::FatalError);
        assert_eq!(machine.apply(LifecycleEvent::Reset), CallState::Idle);
    }
}
