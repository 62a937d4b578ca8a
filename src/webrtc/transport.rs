//! Transport management
//!
//! Creates the one send (broadcaster) or receive (viewer) transport of a
//! connection and bridges its negotiation events onto the signaling channel.

use super::pending::PendingProduceQueue;
use super::signaling::ClientMessage;
use super::{Role, SessionError};
use crate::engine::{
    Completion, Device, EngineError, MediaKind, RecvTransport, SendTransport,
    TransportConnectionState, TransportDirection, TransportEvent, TransportEventCallback,
    TransportOptions,
};
use crate::transport::SignalingChannel;
use log::{debug, info, warn};
use std::sync::Arc;

/// The live transport of a connection
#[derive(Clone)]
pub enum ActiveTransport {
    Send(Arc<dyn SendTransport>),
    Recv(Arc<dyn RecvTransport>),
}

impl ActiveTransport {
    fn id(&self) -> &str {
        match self {
            ActiveTransport::Send(t) => t.id(),
            ActiveTransport::Recv(t) => t.id(),
        }
    }

    fn closed(&self) -> bool {
        match self {
            ActiveTransport::Send(t) => t.closed(),
            ActiveTransport::Recv(t) => t.closed(),
        }
    }

    fn close(&self) {
        match self {
            ActiveTransport::Send(t) => t.close(),
            ActiveTransport::Recv(t) => t.close(),
        }
    }
}

/// Latch for the viewer's first consume batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerDispatch {
    #[default]
    Waiting,
    Dispatched,
}

/// Result of handling a `createWebRtcTransportResult`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A live transport exists; the message was ignored
    Duplicate,
}

/// Result of handling a transport negotiation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,
    /// The receive connect is waiting for `consumerTransportConnected`
    AwaitingConsumerAck,
    StateChanged(TransportConnectionState),
}

pub struct TransportManager {
    role: Role,
    stream_id: String,
    active: Option<ActiveTransport>,
    pending: PendingProduceQueue,
    consumer_connect: Option<Completion<()>>,
    await_consumer_ack: bool,
    state: TransportConnectionState,
    dispatch: ConsumerDispatch,
}

impl TransportManager {
    pub fn new(role: Role, stream_id: impl Into<String>) -> Self {
        Self {
            role,
            stream_id: stream_id.into(),
            active: None,
            pending: PendingProduceQueue::new(),
            consumer_connect: None,
            await_consumer_ack: false,
            state: TransportConnectionState::New,
            dispatch: ConsumerDispatch::Waiting,
        }
    }

    /// Hold receive connects until `consumerTransportConnected` arrives
    pub fn with_consumer_ack(mut self, await_ack: bool) -> Self {
        self.await_consumer_ack = await_ack;
        self
    }

    /// Ask the server for a transport of this session's role
    pub fn request(&self, channel: &SignalingChannel) -> Result<(), SessionError> {
        channel.send(&ClientMessage::CreateWebRtcTransport {
            role: self.role.transport_role(),
        })
    }

    pub fn has_live_transport(&self) -> bool {
        self.active.as_ref().map(|t| !t.closed()).unwrap_or(false)
    }

    /// Create the transport from server-issued options
    pub fn create(
        &mut self,
        device: &dyn Device,
        options: TransportOptions,
        events: TransportEventCallback,
    ) -> Result<CreateOutcome, EngineError> {
        if let Some(active) = &self.active {
            if !active.closed() {
                warn!(
                    "Ignoring transport {}: transport {} is still open",
                    options.id,
                    active.id()
                );
                return Ok(CreateOutcome::Duplicate);
            }
        }

        let id = options.id.clone();
        let active = match self.role {
            Role::Broadcaster => ActiveTransport::Send(device.create_send_transport(options, events)?),
            Role::Viewer => ActiveTransport::Recv(device.create_recv_transport(options, events)?),
        };
        info!("Created {} transport {}", self.role.transport_role_name(), id);

        self.active = Some(active);
        self.state = TransportConnectionState::New;
        self.dispatch = ConsumerDispatch::Waiting;
        Ok(CreateOutcome::Created)
    }

    pub fn send_transport(&self) -> Option<Arc<dyn SendTransport>> {
        match &self.active {
            Some(ActiveTransport::Send(t)) if !t.closed() => Some(t.clone()),
            _ => None,
        }
    }

    pub fn recv_transport(&self) -> Option<Arc<dyn RecvTransport>> {
        match &self.active {
            Some(ActiveTransport::Recv(t)) if !t.closed() => Some(t.clone()),
            _ => None,
        }
    }

    pub fn connection_state(&self) -> TransportConnectionState {
        self.state
    }

    pub fn pending_produces(&self) -> usize {
        self.pending.len()
    }

    /// Bridge one negotiation event onto the channel
    pub fn handle_event(&mut self, event: TransportEvent, channel: &SignalingChannel) -> EventOutcome {
        match event {
            TransportEvent::Connect {
                transport_id,
                direction: TransportDirection::Send,
                dtls_parameters,
                reply,
            } => {
                let sent = channel.send(&ClientMessage::ConnectProducerTransport {
                    transport_id: transport_id.clone(),
                    dtls_parameters,
                });
                // The producer side does not wait for the server ack
                match sent {
                    Ok(()) => {
                        debug!("Producer transport {} connect sent", transport_id);
                        reply.succeed(());
                    }
                    Err(e) => {
                        warn!("Producer transport {} connect failed: {}", transport_id, e);
                        reply.fail(EngineError::Signaling(e.to_string()));
                    }
                }
                EventOutcome::Handled
            }

            TransportEvent::Connect {
                transport_id,
                direction: TransportDirection::Recv,
                dtls_parameters,
                reply,
            } => match channel.send(&ClientMessage::ConnectConsumerTransport { dtls_parameters }) {
                Ok(()) if self.await_consumer_ack => {
                    debug!("Consumer transport {} connect sent, awaiting ack", transport_id);
                    if let Some(previous) = self.consumer_connect.replace(reply) {
                        previous.fail(EngineError::Cancelled);
                    }
                    EventOutcome::AwaitingConsumerAck
                }
                Ok(()) => {
                    debug!("Consumer transport {} connect sent", transport_id);
                    reply.succeed(());
                    EventOutcome::Handled
                }
                Err(e) => {
                    warn!("Consumer transport {} connect failed: {}", transport_id, e);
                    reply.fail(EngineError::Signaling(e.to_string()));
                    EventOutcome::Handled
                }
            },

            TransportEvent::Produce {
                transport_id,
                kind,
                rtp_parameters,
                reply,
            } => {
                // Queue first: the result may arrive before send() returns
                self.pending.push(kind, reply);
                let sent = channel.send(&ClientMessage::Produce {
                    transport_id,
                    kind,
                    rtp_parameters,
                    producer_id: self.stream_id.clone(),
                });
                if let Err(e) = sent {
                    warn!("Failed to send produce for {}: {}", kind, e);
                    if let Some(pending) = self.pending.pop_latest() {
                        pending.reply.fail(EngineError::Signaling(e.to_string()));
                    }
                }
                EventOutcome::Handled
            }

            TransportEvent::ConnectionStateChange {
                transport_id,
                direction,
                state,
            } => {
                let current = self.active.as_ref().map(|t| t.id() == transport_id).unwrap_or(false);
                if !current {
                    debug!("Ignoring state {:?} of stale transport {}", state, transport_id);
                    return EventOutcome::Handled;
                }
                if self.state != state {
                    info!("{:?} transport {} state: {:?} -> {:?}", direction, transport_id, self.state, state);
                    self.state = state;
                }
                EventOutcome::StateChanged(state)
            }
        }
    }

    /// `produceResult`: the oldest pending produce owns this id
    pub fn resolve_produce(&mut self, producer_id: String) -> Option<MediaKind> {
        let kind = self.pending.resolve_oldest(producer_id.clone());
        match kind {
            Some(kind) => debug!("Producer {} assigned to {}", producer_id, kind),
            None => warn!("produceResult {} without a pending produce", producer_id),
        }
        kind
    }

    /// Server error naming a kind: fail the queue head if it is that kind
    pub fn reject_produce(&mut self, kind: MediaKind, message: &str) -> bool {
        self.pending
            .reject_oldest_of(kind, EngineError::Produce(message.to_string()))
    }

    /// `consumerTransportConnected`: complete the receive connect
    pub fn consumer_transport_connected(&mut self) {
        match self.consumer_connect.take() {
            Some(reply) => reply.succeed(()),
            None => debug!("consumerTransportConnected without a pending connect"),
        }
    }

    /// The server never acked the receive connect
    pub fn consumer_connect_timed_out(&mut self) {
        if let Some(reply) = self.consumer_connect.take() {
            warn!("No consumerTransportConnected ack, failing the receive connect");
            reply.fail(EngineError::Transport("consumer transport connect was not acknowledged".to_string()));
        }
    }

    /// Take the dispatch latch; true only for the first caller
    pub fn try_dispatch_consumers(&mut self) -> bool {
        if self.role != Role::Viewer || self.recv_transport().is_none() {
            return false;
        }
        match self.dispatch {
            ConsumerDispatch::Waiting => {
                self.dispatch = ConsumerDispatch::Dispatched;
                true
            }
            ConsumerDispatch::Dispatched => false,
        }
    }

    /// Release every waiter and close the transport
    pub fn close(&mut self) {
        let flushed = self.pending.flush();
        if flushed > 0 {
            debug!("Flushed {} pending produce requests", flushed);
        }
        if let Some(reply) = self.consumer_connect.take() {
            reply.fail(EngineError::Cancelled);
        }
        if let Some(active) = self.active.take() {
            if !active.closed() {
                active.close();
            }
        }
        self.state = TransportConnectionState::New;
        self.dispatch = ConsumerDispatch::Waiting;
    }
}

impl Role {
    fn transport_role_name(&self) -> &'static str {
        match self {
            Role::Broadcaster => "send",
            Role::Viewer => "receive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::await_completion;
    use crate::engine::synthetic::{SyntheticDevice, SyntheticTrack};
    use crate::engine::Transport;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn options(id: &str) -> TransportOptions {
        TransportOptions {
            id: id.to_string(),
            ice_parameters: json!({}),
            ice_candidates: vec![],
            dtls_parameters: json!({}),
        }
    }

    async fn loaded_device() -> Arc<SyntheticDevice> {
        let device = SyntheticDevice::new();
        device.load(json!({ "codecs": [] })).await.unwrap();
        device
    }

    fn event_channel() -> (TransportEventCallback, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel::<TransportEvent>();
        let callback: TransportEventCallback = Arc::new(move |event: TransportEvent| {
            let _ = tx.send(event);
        });
        (callback, rx)
    }

    fn sent_actions(outbound: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = outbound.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_concurrent_produces_resolve_in_send_order() {
        let device = loaded_device().await;
        let (channel, mut outbound) = SignalingChannel::loopback();
        let (callback, mut events) = event_channel();
        let mut manager = TransportManager::new(Role::Broadcaster, "stream-42");
        assert_eq!(
            manager.create(&*device, options("send-1"), callback).unwrap(),
            CreateOutcome::Created
        );
        let transport = manager.send_transport().unwrap();

        let video_task = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.produce(SyntheticTrack::new(MediaKind::Video)).await })
        };
        while manager.pending_produces() < 1 {
            let event = events.recv().await.unwrap();
            manager.handle_event(event, &channel);
        }
        let audio_task = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.produce(SyntheticTrack::new(MediaKind::Audio)).await })
        };
        while manager.pending_produces() < 2 {
            let event = events.recv().await.unwrap();
            manager.handle_event(event, &channel);
        }

        assert_eq!(manager.resolve_produce("srv-0".to_string()), Some(MediaKind::Video));
        assert_eq!(manager.resolve_produce("srv-1".to_string()), Some(MediaKind::Audio));

        let video = video_task.await.unwrap().unwrap();
        let audio = audio_task.await.unwrap().unwrap();
        assert_eq!(video.id(), "srv-0");
        assert_eq!(audio.id(), "srv-1");

        let frames = sent_actions(&mut outbound);
        let actions: Vec<_> = frames.iter().map(|f| f["action"].as_str().unwrap().to_string()).collect();
        assert_eq!(actions, vec!["connectProducerTransport", "produce", "produce"]);
        assert_eq!(frames[1]["producerId"], "stream-42");
        assert_eq!(frames[1]["kind"], "video");
        assert_eq!(frames[0]["transportId"], "send-1");
    }

    #[tokio::test]
    async fn test_failed_produce_send_is_not_left_queued() {
        let (channel, _outbound) = SignalingChannel::loopback();
        channel.close(1000, "gone");
        let mut manager = TransportManager::new(Role::Broadcaster, "stream-42");

        let (reply, rx) = Completion::new();
        manager.handle_event(
            TransportEvent::Produce {
                transport_id: "send-1".to_string(),
                kind: MediaKind::Video,
                rtp_parameters: json!({}),
                reply,
            },
            &channel,
        );

        assert_eq!(manager.pending_produces(), 0);
        assert!(matches!(await_completion(rx).await, Err(EngineError::Signaling(_))));
    }

    fn recv_connect(reply: Completion<()>) -> TransportEvent {
        TransportEvent::Connect {
            transport_id: "recv-1".to_string(),
            direction: TransportDirection::Recv,
            dtls_parameters: json!({ "role": "client" }),
            reply,
        }
    }

    #[tokio::test]
    async fn test_receive_connect_completes_once_sent() {
        let (channel, mut outbound) = SignalingChannel::loopback();
        let mut manager = TransportManager::new(Role::Viewer, "stream-42");

        let (reply, rx) = Completion::new();
        let outcome = manager.handle_event(recv_connect(reply), &channel);
        assert_eq!(outcome, EventOutcome::Handled);
        assert_eq!(await_completion(rx).await, Ok(()));

        let frames = sent_actions(&mut outbound);
        assert_eq!(frames[0]["action"], "connectConsumerTransport");
        assert_eq!(frames[0]["dtlsParameters"]["role"], "client");
    }

    #[tokio::test]
    async fn test_receive_connect_fails_when_channel_closed() {
        let (channel, _outbound) = SignalingChannel::loopback();
        channel.close(1000, "gone");
        let mut manager = TransportManager::new(Role::Viewer, "stream-42");

        let (reply, rx) = Completion::new();
        manager.handle_event(recv_connect(reply), &channel);
        assert!(matches!(await_completion(rx).await, Err(EngineError::Signaling(_))));
    }

    #[tokio::test]
    async fn test_unacked_receive_connect_fails_on_timeout() {
        let (channel, _outbound) = SignalingChannel::loopback();
        let mut manager = TransportManager::new(Role::Viewer, "stream-42").with_consumer_ack(true);

        let (reply, rx) = Completion::new();
        let outcome = manager.handle_event(recv_connect(reply), &channel);
        assert_eq!(outcome, EventOutcome::AwaitingConsumerAck);

        manager.consumer_connect_timed_out();
        assert!(matches!(await_completion(rx).await, Err(EngineError::Transport(_))));
    }

    #[tokio::test]
    async fn test_receive_connect_waits_for_ack() {
        let (channel, mut outbound) = SignalingChannel::loopback();
        let mut manager = TransportManager::new(Role::Viewer, "stream-42").with_consumer_ack(true);

        let (reply, mut rx) = Completion::new();
        let outcome = manager.handle_event(
            TransportEvent::Connect {
                transport_id: "recv-1".to_string(),
                direction: TransportDirection::Recv,
                dtls_parameters: json!({ "role": "client" }),
                reply,
            },
            &channel,
        );
        assert_eq!(outcome, EventOutcome::AwaitingConsumerAck);
        assert!(rx.try_recv().is_err());

        let frames = sent_actions(&mut outbound);
        assert_eq!(frames[0]["action"], "connectConsumerTransport");
        assert_eq!(frames[0]["dtlsParameters"]["role"], "client");

        manager.consumer_transport_connected();
        assert_eq!(await_completion(rx).await, Ok(()));
    }

    #[tokio::test]
    async fn test_duplicate_transport_result_is_ignored() {
        let device = loaded_device().await;
        let (callback, _events) = event_channel();
        let mut manager = TransportManager::new(Role::Viewer, "stream-42");

        manager.create(&*device, options("recv-1"), callback.clone()).unwrap();
        let outcome = manager.create(&*device, options("recv-2"), callback).unwrap();
        assert_eq!(outcome, CreateOutcome::Duplicate);
        assert_eq!(device.recv_transports().len(), 1);
        assert_eq!(manager.recv_transport().unwrap().id(), "recv-1");
    }

    #[tokio::test]
    async fn test_dispatch_latch_fires_once() {
        let device = loaded_device().await;
        let (callback, _events) = event_channel();
        let mut manager = TransportManager::new(Role::Viewer, "stream-42");
        assert!(!manager.try_dispatch_consumers());

        manager.create(&*device, options("recv-1"), callback).unwrap();
        assert!(manager.try_dispatch_consumers());
        assert!(!manager.try_dispatch_consumers());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let device = loaded_device().await;
        let (channel, _outbound) = SignalingChannel::loopback();
        let (callback, _events) = event_channel();
        let mut manager = TransportManager::new(Role::Broadcaster, "stream-42");
        manager.create(&*device, options("send-1"), callback).unwrap();

        let (reply, rx) = Completion::new();
        manager.handle_event(
            TransportEvent::Produce {
                transport_id: "send-1".to_string(),
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
                reply,
            },
            &channel,
        );
        assert_eq!(manager.pending_produces(), 1);

        manager.close();
        manager.close();
        assert_eq!(await_completion(rx).await, Ok(String::new()));
        assert!(!manager.has_live_transport());
        assert!(device.send_transports()[0].closed());
    }
}
