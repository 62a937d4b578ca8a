//! Media engine seam
//!
//! The WebRTC engine and the media-negotiation client library are external
//! collaborators. This module names the surface the session core drives:
//! - Device capability loading and transport creation
//! - Producing local tracks and consuming remote ones
//! - Transport negotiation events (connect, produce) with typed completions
//! - Local capture and output playback

pub mod synthetic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Router/device RTP capabilities, opaque to the session core
pub type RtpCapabilities = serde_json::Value;
/// RTP parameters of a produced or consumed track
pub type RtpParameters = serde_json::Value;
/// DTLS parameters exchanged on transport connect
pub type DtlsParameters = serde_json::Value;

/// Errors raised by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Device load failed: {0}")]
    DeviceLoad(String),

    #[error("Device not loaded")]
    DeviceNotLoaded,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Media capture failed: {0}")]
    Capture(String),

    #[error("Autoplay rejected: {0}")]
    AutoplayRejected(String),

    #[error("Signaling failed: {0}")]
    Signaling(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Media kind of a track, producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ready state of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackReadyState {
    /// Delivering media
    Live,
    /// Temporarily not delivering media (device muted, source suspended)
    Interrupted,
    /// Permanently finished
    Ended,
}

/// Direction of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Why a producer closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCloseReason {
    /// Closed locally or by the application
    Closed,
    /// Closed because its transport closed
    TransportClosed,
}

/// Server-issued parameters for a new transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: serde_json::Value,
    #[serde(default)]
    pub ice_candidates: Vec<serde_json::Value>,
    pub dtls_parameters: DtlsParameters,
}

/// Parameters for creating a consumer from a `consumeResult`
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Typed continuation handed out with a negotiation event.
///
/// The engine blocks on the paired receiver until the session either
/// succeeds or fails the completion. Dropping it fails the request with
/// `EngineError::Cancelled`.
pub struct Completion<T> {
    tx: oneshot::Sender<Result<T, EngineError>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, oneshot::Receiver<Result<T, EngineError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn succeed(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, error: EngineError) {
        let _ = self.tx.send(Err(error));
    }

    /// True when the waiting side has gone away
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Await a completion receiver, mapping a dropped sender to `Cancelled`
pub async fn await_completion<T>(
    rx: oneshot::Receiver<Result<T, EngineError>>,
) -> Result<T, EngineError> {
    rx.await.unwrap_or(Err(EngineError::Cancelled))
}

/// Negotiation events raised by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// Local DTLS parameters are ready; the remote side must be told
    Connect {
        transport_id: String,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        reply: Completion<()>,
    },
    /// A track is being produced; the reply carries the server producer id
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        reply: Completion<String>,
    },
    /// ICE/DTLS connection state changed
    ConnectionStateChange {
        transport_id: String,
        direction: TransportDirection,
        state: TransportConnectionState,
    },
}

/// Callback receiving transport negotiation events
pub type TransportEventCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// A local or remote media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn ready_state(&self) -> TrackReadyState;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Stop the track; its ready state becomes `Ended`
    fn stop(&self);
    fn watch_ready_state(&self) -> watch::Receiver<TrackReadyState>;
}

/// Client-side handle of one outbound track
pub trait Producer: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn closed(&self) -> bool;
    fn paused(&self) -> bool;
    fn close(&self);
    /// Resolves to `Some(reason)` once the producer closes
    fn watch_closed(&self) -> watch::Receiver<Option<ProducerCloseReason>>;
}

/// Client-side handle of one inbound track
pub trait Consumer: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> Arc<dyn MediaTrack>;
    fn paused(&self) -> bool;
    fn resume(&self);
    fn closed(&self) -> bool;
    fn close(&self);
}

/// Common transport surface
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;
    fn direction(&self) -> TransportDirection;
    fn closed(&self) -> bool;
    fn close(&self);
    fn connection_state(&self) -> TransportConnectionState;
}

#[async_trait]
pub trait SendTransport: Transport {
    /// Produce a track. Raises `Connect` on first use and `Produce`, and
    /// waits for both completions.
    async fn produce(&self, track: Arc<dyn MediaTrack>) -> Result<Arc<dyn Producer>, EngineError>;
}

#[async_trait]
pub trait RecvTransport: Transport {
    /// Create a consumer. Raises `Connect` on first use and waits for it.
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>, EngineError>;
}

/// Negotiation-capable device
#[async_trait]
pub trait Device: Send + Sync {
    fn loaded(&self) -> bool;
    async fn load(&self, router_rtp_capabilities: RtpCapabilities) -> Result<(), EngineError>;
    /// Receive capabilities, available once loaded
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;
    fn can_produce(&self, kind: MediaKind) -> bool;
    fn create_send_transport(
        &self,
        options: TransportOptions,
        events: TransportEventCallback,
    ) -> Result<Arc<dyn SendTransport>, EngineError>;
    fn create_recv_transport(
        &self,
        options: TransportOptions,
        events: TransportEventCallback,
    ) -> Result<Arc<dyn RecvTransport>, EngineError>;
}

/// Creates one fresh device per session
pub trait DeviceFactory: Send + Sync {
    fn create_device(&self) -> Result<Arc<dyn Device>, EngineError>;
}

/// Audio capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u16,
    pub sample_rate: u32,
}

/// Video capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
    pub facing_mode: String,
}

/// One combined local capture request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

/// Local media acquisition (getUserMedia equivalent)
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, EngineError>;
}

/// Rendering element fed by the viewer output stream
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    fn attach(&self, stream: Arc<crate::webrtc::media_track::OutputStream>);
    fn set_muted(&self, muted: bool);
    fn set_plays_inline(&self, inline: bool);
    async fn play(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        let kind: MediaKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_dropped_completion_is_cancelled() {
        let (completion, rx) = Completion::<String>::new();
        drop(completion);
        assert_eq!(await_completion(rx).await, Err(EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_completion_success() {
        let (completion, rx) = Completion::<String>::new();
        completion.succeed("p1".to_string());
        assert_eq!(await_completion(rx).await, Ok("p1".to_string()));
    }
}
