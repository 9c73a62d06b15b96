//! Call Engine Module - Session-Core
//!
//! Dieses Modul verwaltet:
//! - Abgleich Teilnehmer/Tracks → stabile Call-Items
//! - Call-Lifecycle (Zustände, Übergänge, Rendering)
//! - Adaptive Bitrate bei schlechter Verbindung
//! - Zusammenführung der Remote-Audio-Tracks

mod audio;
mod engine;
mod lifecycle;
pub mod network;
mod reconciler;

pub use audio::{AudioCompositor, AudioSink, PlaybackError};
pub use engine::{CallEngine, CallEngineError, SessionEvent, SessionEventStream};
pub use lifecycle::{
    render, transition, CallState, LifecycleEvent, LifecycleMachine, Navigator, RenderContext,
    View, ViewDescriptor,
};
pub use network::{
    BitratePolicy, NetworkQualityController, NetworkThreshold, QualityTarget, UnknownThreshold,
};
pub use reconciler::{
    apply_active_speaker, display_order, reconcile, remote_audio_tracks, screen_item_id, CallItem,
    CallItems, DEFAULT_NAME,
};
