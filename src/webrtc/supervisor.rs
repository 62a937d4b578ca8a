//! Session supervisor
//!
//! Single entry and exit point for media sessions. Holds at most one live
//! session and rejects a second start until the first one is stopped.

use super::session::{self, ConnectionState, SessionCommand, SessionHandle, SessionStatus};
use super::{Role, SessionError};
use crate::config::Config;
use crate::engine::{DeviceFactory, MediaCapture, PlaybackSink};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Role-specific media endpoints handed to `start`
#[derive(Clone)]
pub enum MediaContext {
    /// Local capture feeding the producers
    Broadcast { capture: Arc<dyn MediaCapture> },
    /// Rendering element fed by the consumers
    View { sink: Arc<dyn PlaybackSink> },
}

impl MediaContext {
    pub fn role(&self) -> Role {
        match self {
            MediaContext::Broadcast { .. } => Role::Broadcaster,
            MediaContext::View { .. } => Role::Viewer,
        }
    }
}

pub struct SessionSupervisor {
    config: Arc<Config>,
    devices: Arc<dyn DeviceFactory>,
    session: Mutex<Option<SessionHandle>>,
}

impl SessionSupervisor {
    pub fn new(config: Config, devices: Arc<dyn DeviceFactory>) -> Self {
        Self {
            config: Arc::new(config),
            devices,
            session: Mutex::new(None),
        }
    }

    /// Start a session and return its status feed.
    ///
    /// Fails with `AlreadyActive` while another session is running; the
    /// caller must `stop` it first.
    pub fn start(
        &self,
        role: Role,
        stream_id: &str,
        media: MediaContext,
    ) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        let stream_id = stream_id.trim();
        if stream_id.is_empty() {
            return Err(SessionError::InvalidState("stream id must not be empty".to_string()));
        }
        if media.role() != role {
            return Err(SessionError::InvalidState(format!(
                "{} session started with {} media",
                role,
                media.role()
            )));
        }

        let mut slot = self.session.lock();
        if let Some(current) = slot.as_ref() {
            if current.is_running() {
                warn!(
                    "Ignoring start of {} session for {}: {} session for {} is active",
                    role, stream_id, current.role, current.stream_id
                );
                return Err(SessionError::AlreadyActive {
                    role: current.role,
                    stream_id: current.stream_id.clone(),
                });
            }
        }

        info!("Starting {} session for stream {}", role, stream_id);
        let handle = session::spawn(
            stream_id.to_string(),
            self.config.clone(),
            self.devices.clone(),
            media,
        );
        let status = handle.subscribe();
        *slot = Some(handle);
        Ok(status)
    }

    /// Tear the session down. Safe to call repeatedly.
    pub async fn stop(&self) {
        let handle = self.session.lock().take();
        match handle {
            Some(handle) => handle.stop().await,
            None => info!("Stop requested with no active session"),
        }
    }

    /// Tear down and reconnect immediately, bypassing backoff
    pub fn force_reconnect(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::ForceReconnect)
    }

    /// Re-enable local tracks after the page becomes visible again
    pub fn visibility_changed(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::VisibilityChanged)
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        let slot = self.session.lock();
        match slot.as_ref() {
            Some(handle) if handle.is_running() => {
                if handle.command(command) {
                    Ok(())
                } else {
                    Err(SessionError::NotActive)
                }
            }
            _ => Err(SessionError::NotActive),
        }
    }

    /// Latest status of the current session
    pub fn status(&self) -> Option<SessionStatus> {
        self.session.lock().as_ref().map(SessionHandle::status)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status().map(|s| s.state).unwrap_or(ConnectionState::Idle)
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<SessionStatus>> {
        self.session.lock().as_ref().map(SessionHandle::subscribe)
    }

    /// Whether leaving now would cut a live broadcast
    pub fn unload_warning(&self) -> bool {
        self.status().map(|s| s.unload_warning).unwrap_or(false)
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().take() {
            let (reply, _) = oneshot::channel();
            handle.command(SessionCommand::Stop(reply));
        }
    }
}
