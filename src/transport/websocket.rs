//! WebSocket signaling channel
//!
//! One client connection per session attempt. Outbound frames go through an
//! unbounded queue drained by a writer task; the reader task parses inbound
//! frames and reports them to the owner through a callback.

use crate::webrtc::signaling::{ClientMessage, ServerMessage, SignalingParser};
use crate::webrtc::SessionError;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

/// Normal closure; the only code that never triggers a reconnect
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame received without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection lost without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Time given to the server to answer our close frame
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection state of the signaling socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events raised by a signaling channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message { action: String, message: ServerMessage },
    Error(String),
    Closed { code: u16, reason: String },
}

/// Callback receiving channel events
pub type ChannelEventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

struct ChannelInner {
    state: Mutex<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one signaling connection
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    /// Start connecting to `url`; progress is reported through `on_event`
    pub fn open(url: &str, connect_timeout: Duration, on_event: ChannelEventCallback) -> Self {
        let channel = Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState::Connecting),
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        };

        let driver = tokio::spawn(drive(channel.clone(), url.to_string(), connect_timeout, on_event));
        *channel.inner.driver.lock() = Some(driver);
        channel
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queue a message; fails with `ChannelNotOpen` unless the socket is open
    pub fn send(&self, message: &ClientMessage) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::ChannelNotOpen);
        }
        let text = SignalingParser::format(message)?;
        let outbound = self.inner.outbound.lock();
        let sender = outbound.as_ref().ok_or(SessionError::ChannelNotOpen)?;
        sender
            .send(Message::Text(text))
            .map_err(|_| SessionError::ChannelNotOpen)?;
        debug!("Sent signaling action {}", message.action());
        Ok(())
    }

    /// Close the connection. Safe to call repeatedly and in any state.
    pub fn close(&self, code: u16, reason: &str) {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            if matches!(previous, ChannelState::Closing | ChannelState::Closed) {
                return;
            }
            *state = ChannelState::Closing;
            previous
        };

        if previous == ChannelState::Connecting {
            // Nothing to say goodbye to yet
            self.abort_driver();
            *self.inner.state.lock() = ChannelState::Closed;
            return;
        }

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let queued = self
            .inner
            .outbound
            .lock()
            .take()
            .map(|sender| sender.send(Message::Close(Some(frame))).is_ok())
            .unwrap_or(false);

        if !queued {
            self.abort_driver();
            *self.inner.state.lock() = ChannelState::Closed;
            return;
        }

        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            tokio::spawn(async move {
                let abort = driver.abort_handle();
                if time::timeout(CLOSE_GRACE, driver).await.is_err() {
                    debug!("Signaling close handshake timed out");
                    abort.abort();
                }
            });
        }
    }

    fn abort_driver(&self) {
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
        self.inner.outbound.lock().take();
    }

    /// An already-open channel whose outbound frames land in the returned receiver
    #[cfg(test)]
    pub(crate) fn loopback() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(ChannelInner {
                state: Mutex::new(ChannelState::Open),
                outbound: Mutex::new(Some(tx)),
                driver: Mutex::new(None),
            }),
        };
        (channel, rx)
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("state", &self.state())
            .finish()
    }
}

/// Connect, then pump frames until the socket goes away
async fn drive(
    channel: SignalingChannel,
    url: String,
    connect_timeout: Duration,
    on_event: ChannelEventCallback,
) {
    let connected = time::timeout(connect_timeout, tokio_tungstenite::connect_async(url.as_str())).await;
    let ws_stream = match connected {
        Ok(Ok((ws_stream, _response))) => ws_stream,
        Ok(Err(e)) => {
            warn!("Signaling connection to {} failed: {}", url, e);
            finish(&channel, &on_event, CLOSE_ABNORMAL, e.to_string());
            return;
        }
        Err(_) => {
            warn!("Signaling connection to {} timed out", url);
            finish(&channel, &on_event, CLOSE_ABNORMAL, "connect timeout".to_string());
            return;
        }
    };

    info!("Signaling channel connected to {}", url);

    let (write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let writer_handle = tokio::spawn(async move {
        let mut write = write;
        while let Some(msg) = outbound_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    {
        let mut state = channel.inner.state.lock();
        if *state != ChannelState::Connecting {
            // Closed while the handshake was in flight
            writer_handle.abort();
            return;
        }
        *state = ChannelState::Open;
        *channel.inner.outbound.lock() = Some(outbound_tx.clone());
    }
    on_event(ChannelEvent::Open);

    let mut code = CLOSE_ABNORMAL;
    let mut reason = String::new();

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match SignalingParser::parse(&text) {
                Ok((action, message)) => on_event(ChannelEvent::Message { action, message }),
                Err(e) => warn!("Dropping signaling frame: {}", e),
            },
            Ok(Message::Binary(data)) => {
                debug!("Ignoring binary signaling frame: {} bytes", data.len());
            }
            Ok(Message::Ping(ping)) => {
                let _ = outbound_tx.send(Message::Pong(ping));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                match frame {
                    Some(frame) => {
                        code = u16::from(frame.code);
                        reason = frame.reason.into_owned();
                    }
                    None => code = CLOSE_NO_STATUS,
                }
                break;
            }
            Err(e) => {
                error!("Signaling socket error: {}", e);
                on_event(ChannelEvent::Error(e.to_string()));
                break;
            }
        }
    }

    drop(outbound_tx);
    let _ = time::timeout(CLOSE_GRACE, writer_handle).await;
    finish(&channel, &on_event, code, reason);
}

fn finish(channel: &SignalingChannel, on_event: &ChannelEventCallback, code: u16, reason: String) {
    *channel.inner.state.lock() = ChannelState::Closed;
    channel.inner.outbound.lock().take();
    info!("Signaling channel closed ({}) {}", code, reason);
    on_event(ChannelEvent::Closed { code, reason });
}
