//! Producer management (broadcaster)
//!
//! Keeps one producer per media kind alive:
//! - Local capture tracks, forced enabled
//! - Producer records keyed by kind
//! - Health checks and in-place recreation
//! - Close/ended signals forwarded from per-record watchers

use super::media_track::{force_enable, is_live, production_order};
use crate::engine::{
    Device, EngineError, MediaKind, MediaTrack, Producer, ProducerCloseReason, TrackReadyState,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Health of a producer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerHealth {
    Healthy,
    Unhealthy,
    /// A replacement produce is in flight
    Recreating,
}

/// Signals raised by a record's watcher task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSignal {
    ProducerClosed {
        producer_id: String,
        reason: ProducerCloseReason,
    },
    TrackEnded {
        track_id: String,
    },
}

/// One negotiated producer and the track feeding it
pub struct ProducerRecord {
    pub producer: Arc<dyn Producer>,
    pub track: Arc<dyn MediaTrack>,
    pub health: ProducerHealth,
    pub last_health_check_at: Option<Instant>,
    watcher: Option<JoinHandle<()>>,
}

impl ProducerRecord {
    /// Producer open and unpaused, track live and enabled
    pub fn is_healthy(&self) -> bool {
        !self.producer.closed()
            && !self.producer.paused()
            && is_live(self.track.as_ref())
            && self.track.enabled()
    }

    fn stop_watching(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for ProducerRecord {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

/// A produce the session should start
#[derive(Debug)]
pub struct RecreationJob {
    pub kind: MediaKind,
    pub track: Arc<dyn MediaTrack>,
}

#[derive(Default)]
pub struct ProducerManager {
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    records: BTreeMap<MediaKind, ProducerRecord>,
}

impl ProducerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a fresh capture, forcing every track enabled
    pub fn set_local_tracks(&mut self, tracks: Vec<Arc<dyn MediaTrack>>) {
        let flipped = force_enable(&tracks);
        if flipped > 0 {
            info!("Enabled {} captured tracks that started disabled", flipped);
        }
        for old in self.local_tracks.drain(..) {
            if !tracks.iter().any(|t| t.id() == old.id()) {
                old.stop();
            }
        }
        self.local_tracks = tracks;
    }

    pub fn local_tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.local_tracks
    }

    /// True when a previous capture can be produced again as-is
    pub fn capture_reusable(&self) -> bool {
        !self.local_tracks.is_empty() && self.local_tracks.iter().all(|t| is_live(t.as_ref()))
    }

    /// Live local tracks the device can send, in production order (video first)
    pub fn production_plan(&self, device: &dyn Device) -> Vec<Arc<dyn MediaTrack>> {
        production_order(&self.local_tracks)
            .into_iter()
            .filter(|track| {
                let kind = track.kind();
                let supported = device.can_produce(kind);
                if !supported {
                    warn!("Device cannot produce {kind:?}, skipping its track");
                }
                supported
            })
            .collect()
    }

    /// Store a negotiated producer, replacing the record of its kind
    pub fn install(
        &mut self,
        producer: Arc<dyn Producer>,
        track: Arc<dyn MediaTrack>,
        watcher: JoinHandle<()>,
    ) {
        let kind = producer.kind();
        let record = ProducerRecord {
            producer: producer.clone(),
            track,
            health: ProducerHealth::Healthy,
            last_health_check_at: None,
            watcher: Some(watcher),
        };
        if let Some(previous) = self.records.insert(kind, record) {
            if previous.producer.id() != producer.id() && !previous.producer.closed() {
                previous.producer.close();
            }
        }
        info!("Producing {} as {}", kind, producer.id());
    }

    /// A produce for `kind` failed
    pub fn produce_failed(&mut self, kind: MediaKind, error: &EngineError) {
        warn!("Failed to produce {}: {}", kind, error);
        if let Some(record) = self.records.get_mut(&kind) {
            if record.health == ProducerHealth::Recreating {
                record.health = ProducerHealth::Unhealthy;
            }
        }
    }

    /// Apply a watcher signal; returns true if the records changed
    pub fn apply_signal(&mut self, kind: MediaKind, signal: RecordSignal) -> bool {
        match signal {
            RecordSignal::ProducerClosed { producer_id, reason } => {
                self.on_producer_closed(kind, &producer_id, reason)
            }
            RecordSignal::TrackEnded { track_id } => self.on_track_ended(kind, &track_id),
        }
    }

    fn on_producer_closed(&mut self, kind: MediaKind, producer_id: &str, reason: ProducerCloseReason) -> bool {
        let Some(record) = self.records.get_mut(&kind) else {
            return false;
        };
        if record.producer.id() != producer_id || record.health == ProducerHealth::Recreating {
            return false;
        }

        if reason == ProducerCloseReason::Closed && is_live(record.track.as_ref()) {
            // Track still usable: let the health monitor recreate it
            info!("{} producer {} closed with a live track, marking unhealthy", kind, producer_id);
            record.health = ProducerHealth::Unhealthy;
            record.stop_watching();
            return true;
        }

        info!("{} producer {} closed ({:?})", kind, producer_id, reason);
        self.records.remove(&kind);
        true
    }

    fn on_track_ended(&mut self, kind: MediaKind, track_id: &str) -> bool {
        let matches = self
            .records
            .get(&kind)
            .map(|record| record.track.id() == track_id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(record) = self.records.remove(&kind) {
            info!("{} track {} ended, closing producer {}", kind, track_id, record.producer.id());
            if !record.producer.closed() {
                record.producer.close();
            }
        }
        true
    }

    /// Run one health check and pick the kinds to recreate.
    ///
    /// Each unhealthy kind yields at most one job; kinds already recreating
    /// are skipped.
    pub fn health_check(&mut self, now: Instant) -> Vec<RecreationJob> {
        let mut jobs = Vec::new();
        for (kind, record) in self.records.iter_mut() {
            record.last_health_check_at = Some(now);
            if record.health == ProducerHealth::Recreating {
                continue;
            }

            if record.is_healthy() {
                record.health = ProducerHealth::Healthy;
                continue;
            }

            if record.health == ProducerHealth::Healthy {
                warn!(
                    "{} producer {} unhealthy (closed: {}, paused: {}, track: {:?}, enabled: {})",
                    kind,
                    record.producer.id(),
                    record.producer.closed(),
                    record.producer.paused(),
                    record.track.ready_state(),
                    record.track.enabled()
                );
                record.health = ProducerHealth::Unhealthy;
            }

            let replacement = self
                .local_tracks
                .iter()
                .find(|t| t.kind() == *kind && t.ready_state() == TrackReadyState::Live)
                .cloned();
            match replacement {
                Some(track) => {
                    track.set_enabled(true);
                    record.health = ProducerHealth::Recreating;
                    jobs.push(RecreationJob { kind: *kind, track });
                }
                None => debug!("No live {} track to recreate from", kind),
            }
        }
        jobs
    }

    pub fn health(&self, kind: MediaKind) -> Option<ProducerHealth> {
        self.records.get(&kind).map(|record| record.health)
    }

    pub fn producer(&self, kind: MediaKind) -> Option<Arc<dyn Producer>> {
        self.records.get(&kind).map(|record| record.producer.clone())
    }

    /// Kinds with an open producer, in production order
    pub fn active_kinds(&self) -> Vec<MediaKind> {
        [MediaKind::Video, MediaKind::Audio]
            .into_iter()
            .filter(|kind| {
                self.records
                    .get(kind)
                    .map(|record| !record.producer.closed())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Whether leaving the page would cut a live broadcast
    pub fn has_active(&self) -> bool {
        !self.active_kinds().is_empty()
    }

    /// Re-enable local tracks after a visibility change
    pub fn enable_all_tracks(&self) -> usize {
        force_enable(&self.local_tracks)
    }

    /// Close every producer and forget the records
    pub fn close_all(&mut self) {
        for (_, record) in std::mem::take(&mut self.records) {
            if !record.producer.closed() {
                record.producer.close();
            }
        }
    }

    /// Stop the captured tracks
    pub fn stop_local_tracks(&mut self) {
        for track in self.local_tracks.drain(..) {
            track.stop();
        }
    }
}

/// Forward a record's producer-close and track-end signals to `notify`
pub fn watch_record<F>(producer: &Arc<dyn Producer>, track: &Arc<dyn MediaTrack>, notify: F) -> JoinHandle<()>
where
    F: Fn(RecordSignal) + Send + 'static,
{
    let producer_id = producer.id().to_string();
    let track_id = track.id().to_string();
    let mut closed = producer.watch_closed();
    let mut ready = track.watch_ready_state();

    tokio::spawn(async move {
        let mut producer_open = true;
        let mut track_open = true;
        loop {
            if let Some(reason) = *closed.borrow_and_update() {
                notify(RecordSignal::ProducerClosed {
                    producer_id: producer_id.clone(),
                    reason,
                });
                return;
            }
            if *ready.borrow_and_update() == TrackReadyState::Ended {
                notify(RecordSignal::TrackEnded {
                    track_id: track_id.clone(),
                });
                return;
            }
            if !producer_open && !track_open {
                return;
            }

            tokio::select! {
                changed = closed.changed(), if producer_open => {
                    producer_open = changed.is_ok();
                }
                changed = ready.changed(), if track_open => {
                    track_open = changed.is_ok();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::synthetic::{SyntheticDevice, SyntheticProducer, SyntheticTrack};
    use tokio::sync::mpsc;

    fn record_for(
        manager: &mut ProducerManager,
        kind: MediaKind,
        id: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Arc<SyntheticProducer> {
        let producer = SyntheticProducer::new(id, kind);
        let watcher = tokio::spawn(async {});
        manager.install(producer.clone(), track, watcher);
        producer
    }

    #[tokio::test]
    async fn test_production_plan_skips_kinds_the_device_cannot_send() {
        let mut manager = ProducerManager::new();
        let audio = SyntheticTrack::new(MediaKind::Audio);
        let video = SyntheticTrack::new(MediaKind::Video);
        manager.set_local_tracks(vec![audio.clone(), video.clone()]);

        let device = SyntheticDevice::new();
        assert!(manager.production_plan(device.as_ref()).is_empty());

        device.load(serde_json::json!({ "codecs": [] })).await.unwrap();
        let kinds: Vec<_> = manager
            .production_plan(device.as_ref())
            .iter()
            .map(|t| t.kind())
            .collect();
        assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);

        device.refuse_kind(MediaKind::Video);
        let plan = manager.production_plan(device.as_ref());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].id(), audio.id());
    }

    #[tokio::test]
    async fn test_interrupted_track_triggers_one_recreation() {
        let mut manager = ProducerManager::new();
        let video = SyntheticTrack::new(MediaKind::Video);
        let spare = SyntheticTrack::new(MediaKind::Video);
        let audio = SyntheticTrack::new(MediaKind::Audio);
        manager.set_local_tracks(vec![video.clone(), audio.clone(), spare.clone()]);
        record_for(&mut manager, MediaKind::Video, "pv", video.clone());
        record_for(&mut manager, MediaKind::Audio, "pa", audio.clone());

        assert!(manager.health_check(Instant::now()).is_empty());

        video.set_ready_state(TrackReadyState::Interrupted);
        let jobs = manager.health_check(Instant::now());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, MediaKind::Video);
        assert_eq!(jobs[0].track.id(), spare.id());
        assert_eq!(manager.health(MediaKind::Video), Some(ProducerHealth::Recreating));

        // In flight: no second attempt
        assert!(manager.health_check(Instant::now()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_recreation_is_retried_next_tick() {
        let mut manager = ProducerManager::new();
        let video = SyntheticTrack::new(MediaKind::Video);
        manager.set_local_tracks(vec![video.clone()]);
        let producer = record_for(&mut manager, MediaKind::Video, "pv", video.clone());
        producer.set_paused(true);

        assert_eq!(manager.health_check(Instant::now()).len(), 1);
        manager.produce_failed(MediaKind::Video, &EngineError::Produce("boom".to_string()));
        assert_eq!(manager.health(MediaKind::Video), Some(ProducerHealth::Unhealthy));
        assert_eq!(manager.health_check(Instant::now()).len(), 1);
    }

    #[tokio::test]
    async fn test_recreation_replaces_record_in_place() {
        let mut manager = ProducerManager::new();
        let video = SyntheticTrack::new(MediaKind::Video);
        manager.set_local_tracks(vec![video.clone()]);
        let old = record_for(&mut manager, MediaKind::Video, "pv-1", video.clone());
        old.set_paused(true);
        manager.health_check(Instant::now());

        record_for(&mut manager, MediaKind::Video, "pv-2", video.clone());
        assert!(old.closed());
        assert_eq!(manager.producer(MediaKind::Video).unwrap().id(), "pv-2");
        assert_eq!(manager.health(MediaKind::Video), Some(ProducerHealth::Healthy));
    }

    #[tokio::test]
    async fn test_closed_producer_with_live_track_is_kept_for_recreation() {
        let mut manager = ProducerManager::new();
        let audio = SyntheticTrack::new(MediaKind::Audio);
        manager.set_local_tracks(vec![audio.clone()]);
        let producer = record_for(&mut manager, MediaKind::Audio, "pa", audio.clone());

        producer.close();
        let changed = manager.apply_signal(
            MediaKind::Audio,
            RecordSignal::ProducerClosed {
                producer_id: "pa".to_string(),
                reason: ProducerCloseReason::Closed,
            },
        );
        assert!(changed);
        assert_eq!(manager.health(MediaKind::Audio), Some(ProducerHealth::Unhealthy));
        assert!(!manager.has_active());
        assert_eq!(manager.health_check(Instant::now()).len(), 1);
    }

    #[tokio::test]
    async fn test_transport_close_and_track_end_remove_records() {
        let mut manager = ProducerManager::new();
        let audio = SyntheticTrack::new(MediaKind::Audio);
        let video = SyntheticTrack::new(MediaKind::Video);
        manager.set_local_tracks(vec![audio.clone(), video.clone()]);
        record_for(&mut manager, MediaKind::Audio, "pa", audio.clone());
        let pv = record_for(&mut manager, MediaKind::Video, "pv", video.clone());

        manager.apply_signal(
            MediaKind::Audio,
            RecordSignal::ProducerClosed {
                producer_id: "pa".to_string(),
                reason: ProducerCloseReason::TransportClosed,
            },
        );
        video.stop();
        manager.apply_signal(
            MediaKind::Video,
            RecordSignal::TrackEnded {
                track_id: video.id().to_string(),
            },
        );

        assert!(pv.closed());
        assert!(manager.active_kinds().is_empty());
        // Ended tracks are gone for good
        assert!(manager.health_check(Instant::now()).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_track_end() {
        let producer: Arc<dyn Producer> = SyntheticProducer::new("pv", MediaKind::Video);
        let track = SyntheticTrack::new(MediaKind::Video);
        let dyn_track: Arc<dyn MediaTrack> = track.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watcher = watch_record(&producer, &dyn_track, move |signal: RecordSignal| {
            let _ = tx.send(signal);
        });
        track.set_ready_state(TrackReadyState::Interrupted);
        track.stop();

        assert_eq!(
            rx.recv().await,
            Some(RecordSignal::TrackEnded {
                track_id: track.id().to_string()
            })
        );
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_visibility_change_re_enables_tracks() {
        let mut manager = ProducerManager::new();
        let audio = SyntheticTrack::new(MediaKind::Audio);
        manager.set_local_tracks(vec![audio.clone()]);
        audio.set_enabled(false);
        assert_eq!(manager.enable_all_tracks(), 1);
        assert!(audio.enabled());
    }
}
