//! Pulse Session - Core einer Video-Call-Session
//!
//! Sitzt zwischen einer externen Media-Engine (Transport) und der UI:
//! - Teilnehmer/Tracks → stabile, sortierbare Call-Items
//! - Call-Lifecycle inkl. Lobby, Fehlerzuständen und Redirects
//! - Adaptive Bitrate anhand der Netzwerkqualität
//! - Ein gemeinsamer Audio-Ausgabe-Stream für alle Remote-Tracks
//!
//! Es gibt keinen globalen Zustand: jede `CallEngine` ist eine eigene Session.

pub mod call_engine;
pub mod config;
pub mod transport;

pub use call_engine::{CallEngine, CallEngineError, CallState, SessionEvent};
pub use config::{ConfigError, SessionConfig};
pub use transport::{LoopbackTransport, Transport, TransportError};

use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang vor `filter`. Ungültige Direktiven fallen auf
/// `info` zurück; ein bereits gesetzter Subscriber wird nicht ersetzt.
pub fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}
