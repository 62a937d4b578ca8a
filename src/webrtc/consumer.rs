//! Consumer management (viewer)
//!
//! Requests one consumer per kind, feeds the resulting tracks into the
//! session's output stream and re-requests kinds whose producer is missing.

use super::media_track::OutputStream;
use super::retry::Backoff;
use super::signaling::{is_no_producer_message, ClientMessage, ConsumeResult};
use super::SessionError;
use crate::engine::{ConsumeOptions, Consumer, MediaKind, MediaTrack, RtpCapabilities, TrackReadyState};
use crate::transport::SignalingChannel;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Kinds requested by a viewer, in request order
pub const REQUEST_ORDER: [MediaKind; 2] = [MediaKind::Video, MediaKind::Audio];

/// Request state of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindRequest {
    #[default]
    Idle,
    /// `consume` sent, awaiting the result
    InFlight,
    /// A live consumer exists
    Consumed,
}

/// One consumer and the watcher of its track
pub struct ConsumerRecord {
    pub consumer: Arc<dyn Consumer>,
    watcher: Option<JoinHandle<()>>,
}

impl Drop for ConsumerRecord {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// What attaching a consumer did to the output stream
#[derive(Debug)]
pub struct AttachOutcome {
    pub kind: MediaKind,
    /// The output stream was created by this attach
    pub created_output: bool,
    /// Track of the same kind that was replaced and stopped
    pub replaced: Option<Arc<dyn MediaTrack>>,
}

/// How to react to a server `error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// Re-request these kinds after the no-producer delay
    RetryLater(Vec<MediaKind>),
    /// The request for this kind is over
    Abandoned(MediaKind),
    Ignored,
}

pub struct ConsumerManager {
    stream_id: String,
    kinds: BTreeMap<MediaKind, KindRequest>,
    consumers: HashMap<String, ConsumerRecord>,
    output: Option<Arc<OutputStream>>,
    retry: Backoff,
    no_producer_delay: Duration,
}

impl ConsumerManager {
    pub fn new(stream_id: impl Into<String>, retry: Backoff, no_producer_delay: Duration) -> Self {
        Self {
            stream_id: stream_id.into(),
            kinds: BTreeMap::new(),
            consumers: HashMap::new(),
            output: None,
            retry,
            no_producer_delay,
        }
    }

    pub fn kind_state(&self, kind: MediaKind) -> KindRequest {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }

    /// Send `consume` for `kind` unless it is in flight or consumed.
    /// Returns whether a request went out.
    pub fn request(
        &mut self,
        kind: MediaKind,
        channel: &SignalingChannel,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, SessionError> {
        match self.kind_state(kind) {
            KindRequest::InFlight => {
                debug!("{} consume already in flight", kind);
                return Ok(false);
            }
            KindRequest::Consumed => {
                debug!("{} already consumed", kind);
                return Ok(false);
            }
            KindRequest::Idle => {}
        }

        channel.send(&ClientMessage::Consume {
            rtp_capabilities: rtp_capabilities.clone(),
            producer_id: self.stream_id.clone(),
            kind,
        })?;
        self.kinds.insert(kind, KindRequest::InFlight);
        info!("Requested {} consumer for stream {}", kind, self.stream_id);
        Ok(true)
    }

    /// Request every idle kind, video first
    pub fn request_all(
        &mut self,
        channel: &SignalingChannel,
        rtp_capabilities: &RtpCapabilities,
    ) -> Vec<(MediaKind, SessionError)> {
        let mut failures = Vec::new();
        for kind in REQUEST_ORDER {
            if let Err(e) = self.request(kind, channel, rtp_capabilities) {
                warn!("Failed to request {} consumer: {}", kind, e);
                failures.push((kind, e));
            }
        }
        failures
    }

    /// Turn a `consumeResult` into engine consume options
    pub fn accept_result(&self, result: ConsumeResult) -> Option<ConsumeOptions> {
        if let Some(regime_id) = &result.regime_id {
            if regime_id != &self.stream_id {
                warn!("Ignoring consumeResult {} for stream {}", result.id, regime_id);
                return None;
            }
        }
        if self.consumers.contains_key(&result.id) {
            debug!("Duplicate consumeResult {}", result.id);
            return None;
        }
        Some(ConsumeOptions {
            id: result.id,
            producer_id: result.producer_id,
            kind: result.kind,
            rtp_parameters: result.rtp_parameters,
        })
    }

    /// Store a new consumer and put its track on the output stream
    pub fn attach(&mut self, consumer: Arc<dyn Consumer>, watcher: JoinHandle<()>) -> AttachOutcome {
        let kind = consumer.kind();
        let track = consumer.track();

        let created_output = self.output.is_none();
        let output = self.output.get_or_insert_with(|| Arc::new(OutputStream::new())).clone();

        let replaced = output.replace_track(track.clone());
        if let Some(old) = &replaced {
            info!("Replacing {} track {} with {}", kind, old.id(), track.id());
            old.stop();
            self.consumers.retain(|_, record| {
                let stale = record.consumer.track().id() == old.id();
                if stale && !record.consumer.closed() {
                    record.consumer.close();
                }
                !stale
            });
        }

        if consumer.paused() {
            consumer.resume();
        }

        info!("Consuming {} ({}) from producer {}", kind, consumer.id(), consumer.producer_id());
        self.consumers.insert(
            consumer.id().to_string(),
            ConsumerRecord {
                consumer,
                watcher: Some(watcher),
            },
        );
        self.kinds.insert(kind, KindRequest::Consumed);

        AttachOutcome {
            kind,
            created_output,
            replaced,
        }
    }

    /// The engine could not create a consumer for `kind`
    pub fn consume_failed(&mut self, kind: MediaKind) {
        if self.kind_state(kind) == KindRequest::InFlight {
            self.kinds.insert(kind, KindRequest::Idle);
        }
    }

    /// React to a server `error`
    pub fn on_error(&mut self, kind: Option<MediaKind>, message: &str) -> ErrorOutcome {
        let no_producer = is_no_producer_message(message);
        let affected: Vec<MediaKind> = match kind {
            Some(kind) if self.kind_state(kind) == KindRequest::InFlight => vec![kind],
            Some(_) => return ErrorOutcome::Ignored,
            // Without a kind only a no-producer error can be attributed
            None if no_producer => REQUEST_ORDER
                .into_iter()
                .filter(|k| self.kind_state(*k) == KindRequest::InFlight)
                .collect(),
            None => return ErrorOutcome::Ignored,
        };
        if affected.is_empty() {
            return ErrorOutcome::Ignored;
        }

        for kind in &affected {
            self.kinds.insert(*kind, KindRequest::Idle);
        }

        if no_producer {
            info!("No producer yet for {:?}, retrying in {:?}", affected, self.no_producer_delay);
            ErrorOutcome::RetryLater(affected)
        } else {
            warn!("Consume for {} failed: {}", affected[0], message);
            ErrorOutcome::Abandoned(affected[0])
        }
    }

    /// A consumed track ended; release its kind so it can be requested again
    pub fn on_track_ended(&mut self, consumer_id: &str) -> Option<MediaKind> {
        let ended = self
            .consumers
            .get(consumer_id)
            .map(|record| record.consumer.track().ready_state() == TrackReadyState::Ended)
            .unwrap_or(false);
        if !ended {
            return None;
        }
        let record = self.consumers.remove(consumer_id)?;
        let kind = record.consumer.kind();
        let track = record.consumer.track();
        if let Some(output) = &self.output {
            output.remove_track(track.id());
        }
        if !record.consumer.closed() {
            record.consumer.close();
        }
        self.kinds.insert(kind, KindRequest::Idle);
        info!("{} track of consumer {} ended", kind, consumer_id);
        Some(kind)
    }

    pub fn no_producer_delay(&self) -> Duration {
        self.no_producer_delay
    }

    /// Backoff delay for retry `attempt`, `None` once exhausted
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        self.retry.delay(attempt)
    }

    /// Consumed kinds in request order
    pub fn consumed_kinds(&self) -> Vec<MediaKind> {
        REQUEST_ORDER
            .into_iter()
            .filter(|kind| self.kind_state(*kind) == KindRequest::Consumed)
            .collect()
    }

    pub fn output(&self) -> Option<Arc<OutputStream>> {
        self.output.clone()
    }

    pub fn track_count(&self) -> usize {
        self.output.as_ref().map(|o| o.track_count()).unwrap_or(0)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Close every consumer and reset all kinds; the output stream is kept
    pub fn close_all(&mut self) {
        for (_, record) in self.consumers.drain() {
            if !record.consumer.closed() {
                record.consumer.close();
            }
        }
        if let Some(output) = &self.output {
            output.clear();
        }
        self.kinds.clear();
    }

    /// Drop the output stream as well
    pub fn reset(&mut self) {
        self.close_all();
        self.output = None;
    }
}

/// Report when a consumed track ends
pub fn watch_track<F>(track: &Arc<dyn MediaTrack>, notify: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let mut ready = track.watch_ready_state();
    tokio::spawn(async move {
        loop {
            if *ready.borrow_and_update() == TrackReadyState::Ended {
                notify();
                return;
            }
            if ready.changed().await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::synthetic::SyntheticDevice;
    use crate::engine::{Device, RecvTransport, TransportEvent, TransportEventCallback, TransportOptions};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message;

    fn manager() -> ConsumerManager {
        ConsumerManager::new(
            "stream-42",
            Backoff::new(Duration::from_secs(1), 5),
            Duration::from_secs(2),
        )
    }

    async fn recv_transport() -> Arc<dyn RecvTransport> {
        let device = SyntheticDevice::new();
        device.load(json!({})).await.unwrap();
        let callback: TransportEventCallback = Arc::new(|event: TransportEvent| {
            if let TransportEvent::Connect { reply, .. } = event {
                reply.succeed(());
            }
        });
        device
            .create_recv_transport(
                TransportOptions {
                    id: "recv-1".to_string(),
                    ice_parameters: json!({}),
                    ice_candidates: vec![],
                    dtls_parameters: json!({}),
                },
                callback,
            )
            .unwrap()
    }

    async fn consumer(transport: &Arc<dyn RecvTransport>, id: &str, kind: MediaKind) -> Arc<dyn Consumer> {
        transport
            .consume(ConsumeOptions {
                id: id.to_string(),
                producer_id: format!("p-{}", kind),
                kind,
                rtp_parameters: json!({}),
            })
            .await
            .unwrap()
    }

    fn idle_watcher() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    fn sent(outbound: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Message::Text(text)) = outbound.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_requests_video_then_audio_once() {
        let (channel, mut outbound) = SignalingChannel::loopback();
        let mut manager = manager();
        let caps = json!({ "codecs": [] });

        assert!(manager.request_all(&channel, &caps).is_empty());
        assert!(manager.request_all(&channel, &caps).is_empty());

        let frames = sent(&mut outbound);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["kind"], "video");
        assert_eq!(frames[1]["kind"], "audio");
        assert_eq!(frames[0]["producerId"], "stream-42");
        assert_eq!(frames[0]["rtpCapabilities"], caps);
    }

    #[tokio::test]
    async fn test_output_keeps_latest_track_per_kind() {
        let transport = recv_transport().await;
        let mut manager = manager();

        let first = consumer(&transport, "c1", MediaKind::Video).await;
        let audio = consumer(&transport, "c2", MediaKind::Audio).await;
        let second = consumer(&transport, "c3", MediaKind::Video).await;

        assert!(manager.attach(first.clone(), idle_watcher()).created_output);
        manager.attach(audio.clone(), idle_watcher());
        let outcome = manager.attach(second.clone(), idle_watcher());

        assert!(!outcome.created_output);
        assert_eq!(outcome.replaced.unwrap().id(), first.track().id());
        assert_eq!(first.track().ready_state(), TrackReadyState::Ended);
        assert!(first.closed());

        let output = manager.output().unwrap();
        assert_eq!(output.kind_count(MediaKind::Video), 1);
        assert_eq!(output.kind_count(MediaKind::Audio), 1);
        assert_eq!(output.track(MediaKind::Video).unwrap().id(), second.track().id());
        assert_eq!(manager.consumer_count(), 2);
        assert_eq!(manager.consumed_kinds(), vec![MediaKind::Video, MediaKind::Audio]);
    }

    #[tokio::test]
    async fn test_paused_consumer_is_resumed() {
        let transport = recv_transport().await;
        let mut manager = manager();
        let video = consumer(&transport, "c1", MediaKind::Video).await;
        assert!(video.paused());
        manager.attach(video.clone(), idle_watcher());
        assert!(!video.paused());
    }

    #[tokio::test]
    async fn test_no_producer_error_releases_kind_for_retry() {
        let (channel, mut outbound) = SignalingChannel::loopback();
        let mut manager = manager();
        let caps = json!({});
        manager.request_all(&channel, &caps);

        let outcome = manager.on_error(Some(MediaKind::Video), "No producer found for video");
        assert_eq!(outcome, ErrorOutcome::RetryLater(vec![MediaKind::Video]));
        assert_eq!(manager.kind_state(MediaKind::Video), KindRequest::Idle);
        assert_eq!(manager.kind_state(MediaKind::Audio), KindRequest::InFlight);

        sent(&mut outbound);
        assert!(manager.request(MediaKind::Video, &channel, &caps).unwrap());
        assert_eq!(sent(&mut outbound)[0]["kind"], "video");

        assert_eq!(manager.retry_delay(0), Some(Duration::from_secs(1)));
        assert_eq!(manager.retry_delay(5), None);
    }

    #[tokio::test]
    async fn test_unrelated_error_is_ignored() {
        let mut manager = manager();
        assert_eq!(manager.on_error(None, "router closed"), ErrorOutcome::Ignored);
        assert_eq!(
            manager.on_error(Some(MediaKind::Audio), "No producer"),
            ErrorOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_send_failure_leaves_kind_idle() {
        let (channel, _outbound) = SignalingChannel::loopback();
        channel.close(1000, "gone");
        let mut manager = manager();
        let failures = manager.request_all(&channel, &json!({}));
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].1, SessionError::ChannelNotOpen);
        assert_eq!(manager.kind_state(MediaKind::Video), KindRequest::Idle);
    }

    #[tokio::test]
    async fn test_ended_track_releases_kind() {
        let transport = recv_transport().await;
        let mut manager = manager();
        let video = consumer(&transport, "c1", MediaKind::Video).await;
        manager.attach(video.clone(), idle_watcher());

        video.track().stop();
        assert_eq!(manager.on_track_ended("c1"), Some(MediaKind::Video));
        assert_eq!(manager.kind_state(MediaKind::Video), KindRequest::Idle);
        assert_eq!(manager.track_count(), 0);
        assert!(manager.consumed_kinds().is_empty());
    }

    #[tokio::test]
    async fn test_result_for_other_stream_is_dropped() {
        let manager = manager();
        let result = ConsumeResult {
            id: "c1".to_string(),
            producer_id: "p1".to_string(),
            kind: MediaKind::Video,
            rtp_parameters: json!({}),
            regime_id: Some("stream-7".to_string()),
        };
        assert!(manager.accept_result(result).is_none());
    }

    #[tokio::test]
    async fn test_watch_track_fires_on_end() {
        let transport = recv_transport().await;
        let video = consumer(&transport, "c1", MediaKind::Video).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = watch_track(&video.track(), move || {
            let _ = tx.send(());
        });
        video.close();
        assert_eq!(rx.recv().await, Some(()));
        watcher.await.unwrap();
    }
}
