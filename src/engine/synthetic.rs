//! Synthetic media engine
//!
//! An in-process engine that fabricates negotiation parameters instead of
//! touching real media. It raises the same transport events a browser
//! negotiation library would, which makes it suitable for probing an SFU's
//! signaling endpoint and for driving the session core in tests.

use super::{
    await_completion, CaptureConstraints, Completion, ConsumeOptions, Consumer, Device,
    DeviceFactory, EngineError, MediaCapture, MediaKind, MediaTrack, PlaybackSink, Producer,
    ProducerCloseReason, RecvTransport, RtpCapabilities, SendTransport, TrackReadyState,
    Transport, TransportConnectionState, TransportDirection, TransportEvent,
    TransportEventCallback, TransportOptions,
};
use crate::webrtc::media_track::OutputStream;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

fn synthetic_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// A fabricated media track with externally controllable state
#[derive(Debug)]
pub struct SyntheticTrack {
    id: String,
    kind: MediaKind,
    state: watch::Sender<TrackReadyState>,
    enabled: AtomicBool,
}

impl SyntheticTrack {
    pub fn new(kind: MediaKind) -> Arc<Self> {
        let (state, _) = watch::channel(TrackReadyState::Live);
        Arc::new(Self {
            id: synthetic_id(kind.as_str()),
            kind,
            state,
            enabled: AtomicBool::new(true),
        })
    }

    /// Change the ready state, as a source device would
    pub fn set_ready_state(&self, state: TrackReadyState) {
        self.state.send_replace(state);
    }
}

impl MediaTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn ready_state(&self) -> TrackReadyState {
        *self.state.borrow()
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.state.send_replace(TrackReadyState::Ended);
    }

    fn watch_ready_state(&self) -> watch::Receiver<TrackReadyState> {
        self.state.subscribe()
    }
}

/// A fabricated producer
#[derive(Debug)]
pub struct SyntheticProducer {
    id: String,
    kind: MediaKind,
    closed: watch::Sender<Option<ProducerCloseReason>>,
    paused: AtomicBool,
}

impl SyntheticProducer {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        let (closed, _) = watch::channel(None);
        Arc::new(Self {
            id: id.into(),
            kind,
            closed,
            paused: AtomicBool::new(false),
        })
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn close_with(&self, reason: ProducerCloseReason) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

impl Producer for SyntheticProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.close_with(ProducerCloseReason::Closed);
    }

    fn watch_closed(&self) -> watch::Receiver<Option<ProducerCloseReason>> {
        self.closed.subscribe()
    }
}

/// A fabricated consumer; created paused, as SFUs usually deliver them
#[derive(Debug)]
pub struct SyntheticConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: Arc<SyntheticTrack>,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl Consumer for SyntheticConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.track.stop();
        }
    }
}

/// State shared by both transport directions
struct TransportCore {
    id: String,
    direction: TransportDirection,
    events: TransportEventCallback,
    state: Mutex<TransportConnectionState>,
    closed: AtomicBool,
    /// Serializes the one-time connect handshake; true once connected
    connect_gate: tokio::sync::Mutex<bool>,
}

impl TransportCore {
    fn new(options: &TransportOptions, direction: TransportDirection, events: TransportEventCallback) -> Self {
        Self {
            id: options.id.clone(),
            direction,
            events,
            state: Mutex::new(TransportConnectionState::New),
            closed: AtomicBool::new(false),
            connect_gate: tokio::sync::Mutex::new(false),
        }
    }

    fn set_state(&self, state: TransportConnectionState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        (self.events)(TransportEvent::ConnectionStateChange {
            transport_id: self.id.clone(),
            direction: self.direction,
            state,
        });
    }

    async fn ensure_connected(&self) -> Result<(), EngineError> {
        let mut connected = self.connect_gate.lock().await;
        if *connected {
            return Ok(());
        }
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::TransportClosed);
        }

        self.set_state(TransportConnectionState::Connecting);
        let (reply, rx) = Completion::new();
        (self.events)(TransportEvent::Connect {
            transport_id: self.id.clone(),
            direction: self.direction,
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": synthetic_id("fp") }],
            }),
            reply,
        });

        match await_completion(rx).await {
            Ok(()) => {
                *connected = true;
                self.set_state(TransportConnectionState::Connected);
                debug!("Synthetic {:?} transport {} connected", self.direction, self.id);
                Ok(())
            }
            Err(e) => {
                self.set_state(TransportConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::Relaxed) {
            return false;
        }
        self.set_state(TransportConnectionState::Closed);
        true
    }
}

/// Send transport of the synthetic engine
pub struct SyntheticSendTransport {
    core: TransportCore,
    producers: Mutex<Vec<Arc<SyntheticProducer>>>,
    ssrc: AtomicU32,
}

impl SyntheticSendTransport {
    /// Producers created on this transport, in creation order
    pub fn producers(&self) -> Vec<Arc<SyntheticProducer>> {
        self.producers.lock().clone()
    }
}

impl Transport for SyntheticSendTransport {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn direction(&self) -> TransportDirection {
        TransportDirection::Send
    }

    fn closed(&self) -> bool {
        self.core.closed.load(Ordering::Relaxed)
    }

    fn close(&self) {
        if self.core.close() {
            for producer in self.producers.lock().iter() {
                producer.close_with(ProducerCloseReason::TransportClosed);
            }
        }
    }

    fn connection_state(&self) -> TransportConnectionState {
        *self.core.state.lock()
    }
}

#[async_trait]
impl SendTransport for SyntheticSendTransport {
    async fn produce(&self, track: Arc<dyn MediaTrack>) -> Result<Arc<dyn Producer>, EngineError> {
        if track.ready_state() == TrackReadyState::Ended {
            return Err(EngineError::Produce(format!("track {} has ended", track.id())));
        }
        self.core.ensure_connected().await?;

        let kind = track.kind();
        let ssrc = self.ssrc.fetch_add(1, Ordering::Relaxed);
        let (mime_type, clock_rate) = match kind {
            MediaKind::Audio => ("audio/opus", 48000),
            MediaKind::Video => ("video/VP8", 90000),
        };
        let (reply, rx) = Completion::new();
        (self.core.events)(TransportEvent::Produce {
            transport_id: self.core.id.clone(),
            kind,
            rtp_parameters: json!({
                "mid": ssrc.to_string(),
                "codecs": [{ "mimeType": mime_type, "clockRate": clock_rate, "payloadType": 100 + ssrc % 27 }],
                "encodings": [{ "ssrc": ssrc }],
            }),
            reply,
        });

        let id = await_completion(rx).await?;
        if id.is_empty() {
            return Err(EngineError::Cancelled);
        }
        if self.closed() {
            return Err(EngineError::TransportClosed);
        }

        let producer = SyntheticProducer::new(id, kind);
        self.producers.lock().push(producer.clone());
        Ok(producer)
    }
}

/// Receive transport of the synthetic engine
pub struct SyntheticRecvTransport {
    core: TransportCore,
    consumers: Mutex<Vec<Arc<SyntheticConsumer>>>,
}

impl SyntheticRecvTransport {
    /// Consumers created on this transport, in creation order
    pub fn consumers(&self) -> Vec<Arc<SyntheticConsumer>> {
        self.consumers.lock().clone()
    }
}

impl Transport for SyntheticRecvTransport {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn direction(&self) -> TransportDirection {
        TransportDirection::Recv
    }

    fn closed(&self) -> bool {
        self.core.closed.load(Ordering::Relaxed)
    }

    fn close(&self) {
        if self.core.close() {
            for consumer in self.consumers.lock().iter() {
                consumer.close();
            }
        }
    }

    fn connection_state(&self) -> TransportConnectionState {
        *self.core.state.lock()
    }
}

#[async_trait]
impl RecvTransport for SyntheticRecvTransport {
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn Consumer>, EngineError> {
        self.core.ensure_connected().await?;
        if self.closed() {
            return Err(EngineError::TransportClosed);
        }

        let consumer = Arc::new(SyntheticConsumer {
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            track: SyntheticTrack::new(options.kind),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }
}

/// Device of the synthetic engine
pub struct SyntheticDevice {
    loaded: AtomicBool,
    load_count: AtomicUsize,
    capabilities: Mutex<Option<RtpCapabilities>>,
    send_transports: Mutex<Vec<Arc<SyntheticSendTransport>>>,
    recv_transports: Mutex<Vec<Arc<SyntheticRecvTransport>>>,
    refused: Mutex<Vec<MediaKind>>,
}

impl SyntheticDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loaded: AtomicBool::new(false),
            load_count: AtomicUsize::new(0),
            capabilities: Mutex::new(None),
            send_transports: Mutex::new(Vec::new()),
            recv_transports: Mutex::new(Vec::new()),
            refused: Mutex::new(Vec::new()),
        })
    }

    /// Report `kind` as unsupported by the router
    pub fn refuse_kind(&self, kind: MediaKind) {
        self.refused.lock().push(kind);
    }

    /// Number of effective loads performed
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::Relaxed)
    }

    pub fn send_transports(&self) -> Vec<Arc<SyntheticSendTransport>> {
        self.send_transports.lock().clone()
    }

    pub fn recv_transports(&self) -> Vec<Arc<SyntheticRecvTransport>> {
        self.recv_transports.lock().clone()
    }
}

#[async_trait]
impl Device for SyntheticDevice {
    fn loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    async fn load(&self, router_rtp_capabilities: RtpCapabilities) -> Result<(), EngineError> {
        if self.loaded() {
            return Ok(());
        }
        if !router_rtp_capabilities.is_object() {
            return Err(EngineError::DeviceLoad(
                "router RTP capabilities must be an object".to_string(),
            ));
        }
        *self.capabilities.lock() = Some(router_rtp_capabilities);
        self.loaded.store(true, Ordering::Relaxed);
        self.load_count.fetch_add(1, Ordering::Relaxed);
        info!("Synthetic device loaded");
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.capabilities.lock().clone()
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.loaded() && !self.refused.lock().contains(&kind)
    }

    fn create_send_transport(
        &self,
        options: TransportOptions,
        events: TransportEventCallback,
    ) -> Result<Arc<dyn SendTransport>, EngineError> {
        if !self.loaded() {
            return Err(EngineError::DeviceNotLoaded);
        }
        let transport = Arc::new(SyntheticSendTransport {
            core: TransportCore::new(&options, TransportDirection::Send, events),
            producers: Mutex::new(Vec::new()),
            ssrc: AtomicU32::new(1000),
        });
        self.send_transports.lock().push(transport.clone());
        Ok(transport)
    }

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        events: TransportEventCallback,
    ) -> Result<Arc<dyn RecvTransport>, EngineError> {
        if !self.loaded() {
            return Err(EngineError::DeviceNotLoaded);
        }
        let transport = Arc::new(SyntheticRecvTransport {
            core: TransportCore::new(&options, TransportDirection::Recv, events),
            consumers: Mutex::new(Vec::new()),
        });
        self.recv_transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Factory handing out synthetic devices and remembering them
#[derive(Default)]
pub struct SyntheticDeviceFactory {
    devices: Mutex<Vec<Arc<SyntheticDevice>>>,
}

impl SyntheticDeviceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Devices created so far, in creation order
    pub fn devices(&self) -> Vec<Arc<SyntheticDevice>> {
        self.devices.lock().clone()
    }
}

impl DeviceFactory for SyntheticDeviceFactory {
    fn create_device(&self) -> Result<Arc<dyn Device>, EngineError> {
        let device = SyntheticDevice::new();
        self.devices.lock().push(device.clone());
        Ok(device)
    }
}

/// Capture source producing one audio and one video track per request
#[derive(Default)]
pub struct SyntheticCapture {
    start_disabled: bool,
    captured: Mutex<Vec<Arc<SyntheticTrack>>>,
}

impl SyntheticCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tracks start disabled, like some mobile platforms deliver them
    pub fn starting_disabled() -> Arc<Self> {
        Arc::new(Self {
            start_disabled: true,
            captured: Mutex::new(Vec::new()),
        })
    }

    /// Every track handed out so far
    pub fn captured(&self) -> Vec<Arc<SyntheticTrack>> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, EngineError> {
        debug!(
            "Synthetic capture: audio {} Hz x{}, video {}x{} @{}fps",
            constraints.audio.sample_rate,
            constraints.audio.channel_count,
            constraints.video.ideal_width,
            constraints.video.ideal_height,
            constraints.video.max_frame_rate
        );
        let audio = SyntheticTrack::new(MediaKind::Audio);
        let video = SyntheticTrack::new(MediaKind::Video);
        for track in [&audio, &video] {
            track.set_enabled(!self.start_disabled);
        }
        self.captured.lock().extend([audio.clone(), video.clone()]);
        Ok(vec![audio as Arc<dyn MediaTrack>, video as Arc<dyn MediaTrack>])
    }
}

/// Playback sink recording what the session asked of it
#[derive(Default)]
pub struct SyntheticSink {
    reject_autoplay: bool,
    stream: Mutex<Option<Arc<OutputStream>>>,
    muted: AtomicBool,
    plays_inline: AtomicBool,
    play_calls: AtomicUsize,
}

impl SyntheticSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink whose `play` fails like a browser autoplay policy would
    pub fn rejecting_autoplay() -> Arc<Self> {
        Arc::new(Self {
            reject_autoplay: true,
            ..Self::default()
        })
    }

    pub fn stream(&self) -> Option<Arc<OutputStream>> {
        self.stream.lock().clone()
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn plays_inline(&self) -> bool {
        self.plays_inline.load(Ordering::Relaxed)
    }

    pub fn play_calls(&self) -> usize {
        self.play_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PlaybackSink for SyntheticSink {
    fn attach(&self, stream: Arc<OutputStream>) {
        *self.stream.lock() = Some(stream);
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn set_plays_inline(&self, inline: bool) {
        self.plays_inline.store(inline, Ordering::Relaxed);
    }

    async fn play(&self) -> Result<(), EngineError> {
        self.play_calls.fetch_add(1, Ordering::Relaxed);
        if self.reject_autoplay {
            return Err(EngineError::AutoplayRejected(
                "play() requires a user gesture".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn options() -> TransportOptions {
        TransportOptions {
            id: "t1".to_string(),
            ice_parameters: json!({}),
            ice_candidates: vec![],
            dtls_parameters: json!({}),
        }
    }

    #[tokio::test]
    async fn test_device_rejects_non_object_capabilities() {
        let device = SyntheticDevice::new();
        assert!(device.load(json!(null)).await.is_err());
        assert!(!device.loaded());
        device.load(json!({ "codecs": [] })).await.unwrap();
        device.load(json!({ "codecs": [] })).await.unwrap();
        assert_eq!(device.load_count(), 1);
    }

    #[tokio::test]
    async fn test_produce_connects_once_then_requests_id() {
        let device = SyntheticDevice::new();
        device.load(json!({})).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<TransportEvent>();
        let callback: TransportEventCallback = Arc::new(move |event: TransportEvent| {
            let _ = tx.send(event);
        });
        let transport = device.create_send_transport(options(), callback).unwrap();

        let responder = tokio::spawn(async move {
            let mut connects = 0;
            let mut produced = 0;
            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::Connect { reply, .. } => {
                        connects += 1;
                        reply.succeed(());
                    }
                    TransportEvent::Produce { reply, kind, .. } => {
                        produced += 1;
                        reply.succeed(format!("server-{}", kind));
                        if produced == 2 {
                            break;
                        }
                    }
                    TransportEvent::ConnectionStateChange { .. } => {}
                }
            }
            connects
        });

        let video = transport.produce(SyntheticTrack::new(MediaKind::Video)).await.unwrap();
        let audio = transport.produce(SyntheticTrack::new(MediaKind::Audio)).await.unwrap();
        assert_eq!(video.id(), "server-video");
        assert_eq!(audio.id(), "server-audio");
        assert_eq!(responder.await.unwrap(), 1);
        assert_eq!(transport.connection_state(), TransportConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_transport_close_closes_producers() {
        let device = SyntheticDevice::new();
        device.load(json!({})).await.unwrap();
        let callback: TransportEventCallback = Arc::new(|event: TransportEvent| match event {
            TransportEvent::Connect { reply, .. } => reply.succeed(()),
            TransportEvent::Produce { reply, .. } => reply.succeed("p".to_string()),
            TransportEvent::ConnectionStateChange { .. } => {}
        });
        let transport = device.create_send_transport(options(), callback).unwrap();
        let producer = transport.produce(SyntheticTrack::new(MediaKind::Audio)).await.unwrap();
        let closed = producer.watch_closed();

        transport.close();
        assert!(producer.closed());
        assert_eq!(*closed.borrow(), Some(ProducerCloseReason::TransportClosed));
    }
}
