//! Media session core
//!
//! This module provides the client side of SFU media negotiation with:
//! - Signaling protocol messages
//! - Capability loading and transport management
//! - Producer management with health monitoring (broadcaster)
//! - Consumer management with retry (viewer)
//! - Session supervision, reconnection and teardown

pub mod signaling;
pub mod media_track;
pub mod pending;
pub mod capabilities;
pub mod transport;
pub mod producer;
pub mod consumer;
pub mod retry;
pub mod session;
pub mod supervisor;

pub use signaling::{ClientMessage, ServerMessage, SignalingParser};
pub use session::{ConnectionState, SessionStatus};
pub use supervisor::{MediaContext, SessionSupervisor};

use crate::engine::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Session-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Sending while the signaling socket is not open
    #[error("Signaling channel is not open")]
    ChannelNotOpen,

    /// Malformed or unexpected signaling frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A session is already connecting or connected
    #[error("A {role} session for stream {stream_id} is already active")]
    AlreadyActive { role: Role, stream_id: String },

    /// No session is running
    #[error("No active session")]
    NotActive,

    /// Request not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Error bubbled up from the media engine
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Which side of the stream a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Broadcaster => "broadcaster",
            Role::Viewer => "viewer",
        }
    }

    /// Transport role requested from the server
    pub fn transport_role(&self) -> signaling::TransportRole {
        match self {
            Role::Broadcaster => signaling::TransportRole::Producer,
            Role::Viewer => signaling::TransportRole::Consumer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
