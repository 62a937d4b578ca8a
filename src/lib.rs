//! live-session-core - SFU media session core
//!
//! Client side of SFU media negotiation: WebSocket signaling, capability
//! loading, send/receive transports, producer health and consumer retry,
//! for one broadcaster or viewer session at a time.

pub mod config;
pub mod engine;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use engine::{EngineError, MediaKind};
pub use webrtc::{ConnectionState, MediaContext, Role, SessionError, SessionStatus, SessionSupervisor};
