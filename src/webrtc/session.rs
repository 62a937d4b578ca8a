//! Media Session
//!
//! A session is one task owning all negotiation state for one role and one
//! stream. Everything that can suspend (device load, produce, consume,
//! capture, playback) runs in a spawned task and reports back as an event,
//! so the loop is always free to service the signaling round trips those
//! tasks wait on.
//!
//! Each connection attempt gets a new generation. Events carry the
//! generation they were raised for and are dropped once it is gone.

use super::capabilities::{CapabilityNegotiator, LoadStep};
use super::consumer::{self, ConsumerManager, ErrorOutcome};
use super::producer::{self, ProducerManager, RecordSignal};
use super::retry::{Backoff, ReconnectPolicy};
use super::signaling::{ClientMessage, ConsumeResult, ServerMessage};
use super::supervisor::MediaContext;
use super::transport::{CreateOutcome, EventOutcome, TransportManager};
use super::Role;
use crate::config::Config;
use crate::engine::{
    ConsumeOptions, Consumer, DeviceFactory, EngineError, MediaCapture, MediaKind, MediaTrack,
    PlaybackSink, Producer, RecvTransport, RtpCapabilities, TrackReadyState,
    TransportConnectionState, TransportEvent, TransportEventCallback, TransportOptions,
};
use crate::transport::websocket::{ChannelEvent, ChannelEventCallback, SignalingChannel, CLOSE_NORMAL};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, not yet connecting
    Idle,
    /// Signaling and negotiation in progress
    Connecting,
    /// Transport created
    Connected,
    /// At least one producer or consumer is live
    Streaming,
    /// Fatal error; waits for a forced reconnect, a reconnect or stop
    Failed,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
    /// Stopped
    Closed,
}

/// Read-only snapshot of a session for status display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub role: Role,
    pub stream_id: String,
    pub state: ConnectionState,
    pub transport_state: TransportConnectionState,
    pub device_loaded: bool,
    pub producer_kinds: Vec<MediaKind>,
    pub consumed_kinds: Vec<MediaKind>,
    pub track_count: usize,
    pub reconnect_attempts: u32,
    /// A broadcast is live; leaving now would cut it
    pub unload_warning: bool,
}

impl SessionStatus {
    pub fn idle(role: Role, stream_id: &str) -> Self {
        Self {
            role,
            stream_id: stream_id.to_string(),
            state: ConnectionState::Idle,
            transport_state: TransportConnectionState::New,
            device_loaded: false,
            producer_kinds: Vec::new(),
            consumed_kinds: Vec::new(),
            track_count: 0,
            reconnect_attempts: 0,
            unload_warning: false,
        }
    }
}

/// Requests from the supervisor
pub(crate) enum SessionCommand {
    Stop(oneshot::Sender<()>),
    ForceReconnect,
    VisibilityChanged,
}

pub(crate) enum SessionEvent {
    Channel {
        generation: u64,
        event: ChannelEvent,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    DeviceLoaded {
        generation: u64,
        result: Result<(), EngineError>,
    },
    /// Local capture finished; valid for any generation
    Captured {
        result: Result<Vec<Arc<dyn MediaTrack>>, EngineError>,
    },
    Produced {
        generation: u64,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
        result: Result<Arc<dyn Producer>, EngineError>,
    },
    ProducerSignal {
        generation: u64,
        kind: MediaKind,
        signal: RecordSignal,
    },
    HealthTick {
        generation: u64,
    },
    Consumed {
        generation: u64,
        kind: MediaKind,
        result: Result<Arc<dyn Consumer>, EngineError>,
    },
    RemoteTrackEnded {
        generation: u64,
        consumer_id: String,
    },
    RetryConsume {
        generation: u64,
        kind: MediaKind,
        attempt: u32,
    },
    ConsumerConnectTimeout {
        generation: u64,
    },
    /// Backoff elapsed for the attempt after `generation`
    Reconnect {
        generation: u64,
    },
    Command(SessionCommand),
}

impl SessionEvent {
    fn generation(&self) -> Option<u64> {
        match self {
            SessionEvent::Channel { generation, .. }
            | SessionEvent::Transport { generation, .. }
            | SessionEvent::DeviceLoaded { generation, .. }
            | SessionEvent::Produced { generation, .. }
            | SessionEvent::ProducerSignal { generation, .. }
            | SessionEvent::HealthTick { generation }
            | SessionEvent::Consumed { generation, .. }
            | SessionEvent::RemoteTrackEnded { generation, .. }
            | SessionEvent::RetryConsume { generation, .. }
            | SessionEvent::ConsumerConnectTimeout { generation }
            | SessionEvent::Reconnect { generation } => Some(*generation),
            SessionEvent::Captured { .. } | SessionEvent::Command(_) => None,
        }
    }
}

/// Cloneable sender into a session loop
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    /// False once the session is gone
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn emit_after(&self, delay: Duration, event: SessionEvent) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            sink.emit(event);
        })
    }
}

/// Supervisor-side handle of a running session
pub(crate) struct SessionHandle {
    pub role: Role,
    pub stream_id: String,
    events: EventSink,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn command(&self, command: SessionCommand) -> bool {
        self.events.emit(SessionEvent::Command(command))
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Ask the session to tear down and wait for its task to end
    pub async fn stop(self) {
        let (reply, done) = oneshot::channel();
        if self.command(SessionCommand::Stop(reply)) {
            let _ = done.await;
        }
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Session task for {} ended abnormally: {}", self.stream_id, e);
            }
        }
    }
}

/// Start a session task
pub(crate) fn spawn(
    stream_id: String,
    config: Arc<Config>,
    devices: Arc<dyn DeviceFactory>,
    media: MediaContext,
) -> SessionHandle {
    let role = media.role();
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus::idle(role, &stream_id));
    let events = EventSink { tx };

    let reconnect = ReconnectPolicy::new(Backoff::new(
        config.session.reconnect_base_delay(),
        config.session.max_reconnect_attempts,
    ));
    let media = match media {
        MediaContext::Broadcast { capture } => RoleState::Broadcast {
            capture,
            producers: ProducerManager::new(),
            capture_in_flight: false,
        },
        MediaContext::View { sink } => RoleState::View {
            playback: sink,
            consumers: ConsumerManager::new(
                stream_id.clone(),
                Backoff::new(config.consumer.retry_base_delay(), config.consumer.retry_max_attempts),
                config.consumer.no_producer_retry_delay(),
            ),
        },
    };

    let session = Session {
        role,
        stream_id: stream_id.clone(),
        config,
        devices,
        events: events.clone(),
        status: status_tx,
        state: ConnectionState::Idle,
        generation: 0,
        connection: None,
        media,
        reconnect,
        reconnect_timer: None,
    };
    let task = tokio::spawn(session.run(rx));

    SessionHandle {
        role,
        stream_id,
        events,
        status: status_rx,
        task,
    }
}

enum RoleState {
    Broadcast {
        capture: Arc<dyn MediaCapture>,
        producers: ProducerManager,
        capture_in_flight: bool,
    },
    View {
        playback: Arc<dyn PlaybackSink>,
        consumers: ConsumerManager,
    },
}

/// Everything tied to one signaling connection
struct Connection {
    generation: u64,
    channel: SignalingChannel,
    negotiator: CapabilityNegotiator,
    transport: TransportManager,
    production_started: bool,
    consume_queue: Option<mpsc::UnboundedSender<ConsumeOptions>>,
    health_timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn stop_health_timer(&mut self) {
        if let Some(timer) = self.health_timer.take() {
            timer.abort();
        }
    }

    fn abort_tasks(&mut self) {
        self.stop_health_timer();
        self.consume_queue = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Session {
    role: Role,
    stream_id: String,
    config: Arc<Config>,
    devices: Arc<dyn DeviceFactory>,
    events: EventSink,
    status: watch::Sender<SessionStatus>,
    state: ConnectionState,
    generation: u64,
    connection: Option<Connection>,
    media: RoleState,
    reconnect: ReconnectPolicy,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl Session {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("Starting {} session for stream {}", self.role, self.stream_id);
        self.connect();
        self.publish();

        while let Some(event) = rx.recv().await {
            if self.handle(event) == Flow::Exit {
                break;
            }
            self.refresh_streaming();
            self.publish();
        }

        self.publish();
        info!("{} session for stream {} ended", self.role, self.stream_id);
    }

    fn handle(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Command(command) => return self.handle_command(command),
            SessionEvent::Captured { result } => {
                self.on_captured(result);
                return Flow::Continue;
            }
            SessionEvent::Reconnect { generation } => {
                if generation == self.generation
                    && self.connection.is_none()
                    && self.state == ConnectionState::Reconnecting
                {
                    self.reconnect_timer = None;
                    self.connect();
                }
                return Flow::Continue;
            }
            _ => {}
        }

        if !self.is_current(event.generation()) {
            discard(event);
            return Flow::Continue;
        }

        match event {
            SessionEvent::Channel { event, .. } => return self.on_channel_event(event),
            SessionEvent::Transport { event, .. } => self.on_transport_event(event),
            SessionEvent::DeviceLoaded { result, .. } => self.on_device_loaded(result),
            SessionEvent::Produced {
                kind, track, result, ..
            } => self.on_produced(kind, track, result),
            SessionEvent::ProducerSignal { kind, signal, .. } => {
                if let RoleState::Broadcast { producers, .. } = &mut self.media {
                    producers.apply_signal(kind, signal);
                }
            }
            SessionEvent::HealthTick { .. } => self.on_health_tick(),
            SessionEvent::Consumed { kind, result, .. } => self.on_consumed(kind, result),
            SessionEvent::RemoteTrackEnded { consumer_id, .. } => self.on_remote_track_ended(&consumer_id),
            SessionEvent::RetryConsume { kind, attempt, .. } => self.on_retry_consume(kind, attempt),
            SessionEvent::ConsumerConnectTimeout { .. } => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.transport.consumer_connect_timed_out();
                }
            }
            SessionEvent::Captured { .. } | SessionEvent::Reconnect { .. } | SessionEvent::Command(_) => {}
        }
        Flow::Continue
    }

    fn is_current(&self, generation: Option<u64>) -> bool {
        match (generation, &self.connection) {
            (Some(generation), Some(conn)) => conn.generation == generation,
            _ => false,
        }
    }

    // -- commands --

    fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Stop(reply) => {
                info!("Stopping {} session for stream {}", self.role, self.stream_id);
                self.shutdown();
                self.set_state(ConnectionState::Closed);
                self.publish();
                let _ = reply.send(());
                Flow::Exit
            }
            SessionCommand::ForceReconnect => {
                info!("Forced reconnect of stream {}", self.stream_id);
                self.cancel_reconnect_timer();
                self.close_connection();
                self.reconnect.reset();
                self.connect();
                Flow::Continue
            }
            SessionCommand::VisibilityChanged => {
                if let RoleState::Broadcast { producers, .. } = &self.media {
                    let enabled = producers.enable_all_tracks();
                    if enabled > 0 {
                        info!("Re-enabled {} local tracks after visibility change", enabled);
                    }
                }
                Flow::Continue
            }
        }
    }

    // -- connection lifecycle --

    fn connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);

        let events = self.events.clone();
        let on_event: ChannelEventCallback = Arc::new(move |event: ChannelEvent| {
            events.emit(SessionEvent::Channel { generation, event });
        });
        let channel = SignalingChannel::open(
            &self.config.signaling.url,
            self.config.signaling.connect_timeout(),
            on_event,
        );
        debug!("Connection {} opening {}", generation, self.config.signaling.url);

        self.connection = Some(Connection {
            generation,
            channel,
            negotiator: CapabilityNegotiator::new(),
            transport: TransportManager::new(self.role, self.stream_id.clone())
                .with_consumer_ack(self.config.session.await_consumer_ack),
            production_started: false,
            consume_queue: None,
            health_timer: None,
            tasks: Vec::new(),
        });

        self.ensure_capture();
    }

    /// Tear down the current connection, keeping session-level media
    fn close_connection(&mut self) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };
        conn.abort_tasks();
        match &mut self.media {
            RoleState::Broadcast { producers, .. } => producers.close_all(),
            RoleState::View { consumers, .. } => consumers.close_all(),
        }
        conn.transport.close();
        conn.negotiator.reset();
        conn.channel.close(CLOSE_NORMAL, "session teardown");
        debug!("Connection {} torn down", conn.generation);
    }

    /// Full teardown: connection, timers and local media
    fn shutdown(&mut self) {
        self.cancel_reconnect_timer();
        self.close_connection();
        match &mut self.media {
            RoleState::Broadcast { producers, .. } => producers.stop_local_tracks(),
            RoleState::View { consumers, .. } => consumers.reset(),
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_delay() {
            Some(delay) => {
                info!(
                    "Reconnecting stream {} in {:?} (attempt {})",
                    self.stream_id,
                    delay,
                    self.reconnect.attempts()
                );
                self.set_state(ConnectionState::Reconnecting);
                let timer = self.events.emit_after(
                    delay,
                    SessionEvent::Reconnect {
                        generation: self.generation,
                    },
                );
                self.reconnect_timer = Some(timer);
            }
            None => {
                error!(
                    "Giving up on stream {} after {} reconnect attempts",
                    self.stream_id,
                    self.reconnect.attempts()
                );
                self.set_state(ConnectionState::Failed);
            }
        }
    }

    fn fail(&mut self, reason: &str) {
        error!("{} session for stream {} failed: {}", self.role, self.stream_id, reason);
        if let Some(conn) = self.connection.as_mut() {
            conn.stop_health_timer();
        }
        self.set_state(ConnectionState::Failed);
    }

    // -- signaling --

    fn on_channel_event(&mut self, event: ChannelEvent) -> Flow {
        match event {
            ChannelEvent::Open => {
                info!("Signaling open, requesting router capabilities");
                let Some(conn) = self.connection.as_ref() else {
                    return Flow::Continue;
                };
                let request = ClientMessage::GetRouterRtpCapabilities {
                    regime_id: self.stream_id.clone(),
                };
                if let Err(e) = conn.channel.send(&request) {
                    warn!("Failed to request router capabilities: {}", e);
                }
            }
            ChannelEvent::Message { action, message } => self.on_message(&action, message),
            ChannelEvent::Error(e) => warn!("Signaling error: {}", e),
            ChannelEvent::Closed { code, reason } => {
                self.close_connection();
                if code == CLOSE_NORMAL {
                    info!("Server closed stream {} normally", self.stream_id);
                    self.shutdown();
                    self.set_state(ConnectionState::Closed);
                    return Flow::Exit;
                }
                warn!("Signaling closed unexpectedly ({}) {}", code, reason);
                self.schedule_reconnect();
            }
        }
        Flow::Continue
    }

    fn on_message(&mut self, action: &str, message: ServerMessage) {
        match message {
            ServerMessage::RouterRtpCapabilities { data } => self.on_capabilities(data),
            ServerMessage::CreateWebRtcTransportResult { data } => self.on_transport_options(data),
            ServerMessage::ProducerTransportConnected { .. } => {
                debug!("Producer transport connect acknowledged");
            }
            ServerMessage::ConsumerTransportConnected { .. } => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.transport.consumer_transport_connected();
                }
            }
            ServerMessage::ProduceResult { data } => {
                if let Some(conn) = self.connection.as_mut() {
                    conn.transport.resolve_produce(data.id);
                }
            }
            ServerMessage::ConsumeResult { data } => self.on_consume_result(data),
            ServerMessage::Error { message, kind } => self.on_server_error(kind, &message),
            ServerMessage::Unknown => debug!("Ignoring signaling action {}", action),
        }
    }

    fn on_server_error(&mut self, kind: Option<MediaKind>, message: &str) {
        warn!("Server error{}: {}", kind.map(|k| format!(" ({})", k)).unwrap_or_default(), message);
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        match &mut self.media {
            RoleState::Broadcast { .. } => {
                if let Some(kind) = kind {
                    if conn.transport.reject_produce(kind, message) {
                        info!("Failed pending {} produce", kind);
                    }
                }
            }
            RoleState::View { consumers, .. } => {
                if let ErrorOutcome::RetryLater(kinds) = consumers.on_error(kind, message) {
                    let delay = consumers.no_producer_delay();
                    for kind in kinds {
                        let timer = self.events.emit_after(
                            delay,
                            SessionEvent::RetryConsume {
                                generation: conn.generation,
                                kind,
                                attempt: 0,
                            },
                        );
                        conn.track(timer);
                    }
                }
            }
        }
    }

    // -- capabilities and transport --

    fn on_capabilities(&mut self, capabilities: RtpCapabilities) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        match conn.negotiator.begin_load(self.devices.as_ref(), capabilities) {
            Ok(LoadStep::Load { device, capabilities }) => {
                let events = self.events.clone();
                let generation = conn.generation;
                conn.track(tokio::spawn(async move {
                    let result = device.load(capabilities).await;
                    events.emit(SessionEvent::DeviceLoaded { generation, result });
                }));
            }
            Ok(LoadStep::InProgress) => {}
            Ok(LoadStep::AlreadyLoaded) => {
                if !conn.transport.has_live_transport() {
                    if let Err(e) = conn.transport.request(&conn.channel) {
                        warn!("Failed to request transport: {}", e);
                    }
                }
            }
            Err(e) => self.fail(&format!("device creation failed: {}", e)),
        }
    }

    fn on_device_loaded(&mut self, result: Result<(), EngineError>) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        match conn.negotiator.finish_load(result) {
            Ok(()) => {
                if !conn.transport.has_live_transport() {
                    if let Err(e) = conn.transport.request(&conn.channel) {
                        warn!("Failed to request transport: {}", e);
                    }
                }
            }
            Err(e) => self.fail(&format!("device load failed: {}", e)),
        }
    }

    fn on_transport_options(&mut self, options: TransportOptions) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let Some(device) = conn.negotiator.device() else {
            warn!("Transport {} arrived before the device loaded, ignoring", options.id);
            return;
        };

        let events = self.events.clone();
        let generation = conn.generation;
        let callback: TransportEventCallback = Arc::new(move |event: TransportEvent| {
            events.emit(SessionEvent::Transport { generation, event });
        });

        match conn.transport.create(device.as_ref(), options, callback) {
            Ok(CreateOutcome::Duplicate) => {}
            Ok(CreateOutcome::Created) => {
                self.reconnect.reset();
                if self.state != ConnectionState::Failed {
                    self.set_state(ConnectionState::Connected);
                }
                self.after_transport_created();
            }
            Err(e) => self.fail(&format!("transport creation failed: {}", e)),
        }
    }

    fn after_transport_created(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if self.role == Role::Broadcaster {
            let period = self.config.session.health_check_interval();
            conn.health_timer = Some(spawn_health_timer(self.events.clone(), conn.generation, period));
            self.start_production();
        } else {
            if let Some(transport) = conn.transport.recv_transport() {
                let (queue, worker) = spawn_consume_worker(transport, self.events.clone(), conn.generation);
                conn.consume_queue = Some(queue);
                conn.track(worker);
            }
            self.dispatch_consumers();
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        match conn.transport.handle_event(event, &conn.channel) {
            EventOutcome::Handled => {}
            EventOutcome::AwaitingConsumerAck => {
                let timer = self.events.emit_after(
                    self.config.session.consumer_connect_timeout(),
                    SessionEvent::ConsumerConnectTimeout {
                        generation: conn.generation,
                    },
                );
                conn.track(timer);
            }
            EventOutcome::StateChanged(TransportConnectionState::Connected) => {
                self.dispatch_consumers();
            }
            EventOutcome::StateChanged(TransportConnectionState::Failed) => {
                self.fail("transport connection failed");
            }
            EventOutcome::StateChanged(_) => {}
        }
    }

    // -- broadcaster --

    fn ensure_capture(&mut self) {
        let RoleState::Broadcast {
            capture,
            producers,
            capture_in_flight,
        } = &mut self.media
        else {
            return;
        };
        if producers.capture_reusable() || *capture_in_flight {
            return;
        }

        *capture_in_flight = true;
        let capture = capture.clone();
        let constraints = self.config.capture.clone();
        let events = self.events.clone();
        info!("Capturing local audio and video");
        tokio::spawn(async move {
            let result = capture.get_user_media(&constraints).await;
            events.emit(SessionEvent::Captured { result });
        });
    }

    fn on_captured(&mut self, result: Result<Vec<Arc<dyn MediaTrack>>, EngineError>) {
        let RoleState::Broadcast {
            producers,
            capture_in_flight,
            ..
        } = &mut self.media
        else {
            return;
        };
        *capture_in_flight = false;

        match result {
            Ok(tracks) => {
                info!("Captured {} local tracks", tracks.len());
                producers.set_local_tracks(tracks);
                self.start_production();
            }
            Err(e) => self.fail(&format!("media capture failed: {}", e)),
        }
    }

    /// Produce the captured tracks once both they and the send transport exist
    fn start_production(&mut self) {
        let (Some(conn), RoleState::Broadcast { producers, .. }) = (self.connection.as_mut(), &self.media) else {
            return;
        };
        if conn.production_started {
            return;
        }
        let (Some(transport), Some(device)) = (conn.transport.send_transport(), conn.negotiator.device()) else {
            return;
        };
        let plan = producers.production_plan(device.as_ref());
        if plan.is_empty() {
            return;
        }

        conn.production_started = true;
        let events = self.events.clone();
        let generation = conn.generation;
        conn.track(tokio::spawn(async move {
            for track in plan {
                let kind = track.kind();
                let result = transport.produce(track.clone()).await;
                if !events.emit(SessionEvent::Produced {
                    generation,
                    kind,
                    track,
                    result,
                }) {
                    return;
                }
            }
        }));
    }

    fn on_produced(
        &mut self,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
        result: Result<Arc<dyn Producer>, EngineError>,
    ) {
        let (Some(conn), RoleState::Broadcast { producers, .. }) = (self.connection.as_ref(), &mut self.media) else {
            if let Ok(producer) = result {
                producer.close();
            }
            return;
        };
        match result {
            Ok(producer) => {
                let events = self.events.clone();
                let generation = conn.generation;
                let watcher = producer::watch_record(&producer, &track, move |signal: RecordSignal| {
                    events.emit(SessionEvent::ProducerSignal {
                        generation,
                        kind,
                        signal,
                    });
                });
                producers.install(producer, track, watcher);
            }
            Err(e) => producers.produce_failed(kind, &e),
        }
    }

    fn on_health_tick(&mut self) {
        if self.state == ConnectionState::Failed {
            return;
        }
        let (Some(conn), RoleState::Broadcast { producers, .. }) = (self.connection.as_mut(), &mut self.media) else {
            return;
        };
        let jobs = producers.health_check(std::time::Instant::now());
        if jobs.is_empty() {
            return;
        }

        let Some(transport) = conn.transport.send_transport() else {
            for job in jobs {
                producers.produce_failed(job.kind, &EngineError::TransportClosed);
            }
            return;
        };

        for job in jobs {
            info!("Recreating {} producer from track {}", job.kind, job.track.id());
            let transport = transport.clone();
            let events = self.events.clone();
            let generation = conn.generation;
            conn.track(tokio::spawn(async move {
                let result = transport.produce(job.track.clone()).await;
                events.emit(SessionEvent::Produced {
                    generation,
                    kind: job.kind,
                    track: job.track,
                    result,
                });
            }));
        }
    }

    // -- viewer --

    /// Send the first consume batch; the transport latch lets this run once
    fn dispatch_consumers(&mut self) {
        let (Some(conn), RoleState::View { consumers, .. }) = (self.connection.as_mut(), &mut self.media) else {
            return;
        };
        let Some(capabilities) = conn.negotiator.rtp_capabilities() else {
            return;
        };
        if !conn.transport.try_dispatch_consumers() {
            return;
        }

        let failures = consumers.request_all(&conn.channel, &capabilities);
        for (kind, _) in failures {
            if let Some(delay) = consumers.retry_delay(0) {
                let timer = self.events.emit_after(
                    delay,
                    SessionEvent::RetryConsume {
                        generation: conn.generation,
                        kind,
                        attempt: 1,
                    },
                );
                conn.track(timer);
            }
        }
    }

    fn on_consume_result(&mut self, result: ConsumeResult) {
        let (Some(conn), RoleState::View { consumers, .. }) = (self.connection.as_mut(), &mut self.media) else {
            debug!("Ignoring consumeResult {}", result.id);
            return;
        };
        let kind = result.kind;
        let Some(options) = consumers.accept_result(result) else {
            return;
        };
        let queued = conn
            .consume_queue
            .as_ref()
            .map(|queue| queue.send(options).is_ok())
            .unwrap_or(false);
        if !queued {
            warn!("No receive transport for {} consumer", kind);
            consumers.consume_failed(kind);
        }
    }

    fn on_consumed(&mut self, kind: MediaKind, result: Result<Arc<dyn Consumer>, EngineError>) {
        let (Some(conn), RoleState::View { consumers, playback }) = (self.connection.as_ref(), &mut self.media) else {
            if let Ok(consumer) = result {
                consumer.close();
            }
            return;
        };
        let consumer = match result {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!("Failed to consume {}: {}", kind, e);
                consumers.consume_failed(kind);
                return;
            }
        };

        if kind == MediaKind::Video {
            // Autoplay policies only allow muted inline playback
            playback.set_muted(true);
            playback.set_plays_inline(true);
        }

        let events = self.events.clone();
        let generation = conn.generation;
        let consumer_id = consumer.id().to_string();
        let watcher = consumer::watch_track(&consumer.track(), move || {
            events.emit(SessionEvent::RemoteTrackEnded {
                generation,
                consumer_id,
            });
        });

        let outcome = consumers.attach(consumer, watcher);
        if outcome.created_output {
            if let Some(output) = consumers.output() {
                playback.attach(output);
            }
        }
        if outcome.kind == MediaKind::Video {
            let playback = playback.clone();
            tokio::spawn(async move {
                match playback.play().await {
                    Ok(()) => debug!("Playback started"),
                    Err(EngineError::AutoplayRejected(reason)) => {
                        info!("Autoplay blocked pending a user gesture: {}", reason);
                    }
                    Err(e) => warn!("Playback failed: {}", e),
                }
            });
        }
    }

    fn on_remote_track_ended(&mut self, consumer_id: &str) {
        let (Some(conn), RoleState::View { consumers, .. }) = (self.connection.as_mut(), &mut self.media) else {
            return;
        };
        if let Some(kind) = consumers.on_track_ended(consumer_id) {
            let timer = self.events.emit_after(
                consumers.no_producer_delay(),
                SessionEvent::RetryConsume {
                    generation: conn.generation,
                    kind,
                    attempt: 0,
                },
            );
            conn.track(timer);
        }
    }

    /// Re-request a kind. A missing producer keeps polling for the life of
    /// the connection; only requests that cannot be sent count against the
    /// backoff attempts.
    fn on_retry_consume(&mut self, kind: MediaKind, attempt: u32) {
        let (Some(conn), RoleState::View { consumers, .. }) = (self.connection.as_mut(), &mut self.media) else {
            return;
        };
        if conn.transport.recv_transport().is_none() {
            return;
        }
        let Some(capabilities) = conn.negotiator.rtp_capabilities() else {
            return;
        };

        match consumers.request(kind, &conn.channel, &capabilities) {
            Ok(_) => {}
            Err(e) => match consumers.retry_delay(attempt) {
                Some(delay) => {
                    debug!("Retrying {} consume in {:?}: {}", kind, delay, e);
                    let timer = self.events.emit_after(
                        delay,
                        SessionEvent::RetryConsume {
                            generation: conn.generation,
                            kind,
                            attempt: attempt + 1,
                        },
                    );
                    conn.track(timer);
                }
                None => warn!("Giving up on {} consumer: {}", kind, e),
            },
        }
    }

    // -- state --

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("{} session {}: {:?} -> {:?}", self.role, self.stream_id, self.state, state);
            self.state = state;
        }
    }

    fn refresh_streaming(&mut self) {
        let active = match &self.media {
            RoleState::Broadcast { producers, .. } => producers.has_active(),
            RoleState::View { consumers, .. } => consumers.consumer_count() > 0,
        };
        match (self.state, active) {
            (ConnectionState::Connected, true) => self.set_state(ConnectionState::Streaming),
            (ConnectionState::Streaming, false) => self.set_state(ConnectionState::Connected),
            _ => {}
        }
    }

    fn snapshot(&self) -> SessionStatus {
        let conn = self.connection.as_ref();
        let mut status = SessionStatus {
            role: self.role,
            stream_id: self.stream_id.clone(),
            state: self.state,
            transport_state: conn.map(|c| c.transport.connection_state()).unwrap_or_default(),
            device_loaded: conn.map(|c| c.negotiator.loaded()).unwrap_or(false),
            producer_kinds: Vec::new(),
            consumed_kinds: Vec::new(),
            track_count: 0,
            reconnect_attempts: self.reconnect.attempts(),
            unload_warning: false,
        };
        match &self.media {
            RoleState::Broadcast { producers, .. } => {
                status.producer_kinds = producers.active_kinds();
                status.unload_warning = producers.has_active();
                status.track_count = producers
                    .local_tracks()
                    .iter()
                    .filter(|t| t.ready_state() == TrackReadyState::Live)
                    .count();
            }
            RoleState::View { consumers, .. } => {
                status.consumed_kinds = consumers.consumed_kinds();
                status.track_count = consumers.track_count();
            }
        }
        status
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.status.send_if_modified(move |current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

/// Close engine handles carried by an event for a connection that is gone
fn discard(event: SessionEvent) {
    match event {
        SessionEvent::Produced {
            result: Ok(producer), ..
        } => producer.close(),
        SessionEvent::Consumed {
            result: Ok(consumer), ..
        } => consumer.close(),
        _ => {}
    }
}

fn spawn_health_timer(events: EventSink, generation: u64, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !events.emit(SessionEvent::HealthTick { generation }) {
                break;
            }
        }
    })
}

/// Create consumers one at a time, in arrival order
fn spawn_consume_worker(
    transport: Arc<dyn RecvTransport>,
    events: EventSink,
    generation: u64,
) -> (mpsc::UnboundedSender<ConsumeOptions>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConsumeOptions>();
    let worker = tokio::spawn(async move {
        while let Some(options) = rx.recv().await {
            let kind = options.kind;
            let result = transport.consume(options).await;
            if !events.emit(SessionEvent::Consumed {
                generation,
                kind,
                result,
            }) {
                break;
            }
        }
    });
    (tx, worker)
}
