//! Media track utilities
//!
//! The viewer's shared output stream and small helpers over local tracks.

use crate::engine::{MediaKind, MediaTrack, TrackReadyState};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// The single output stream of a viewer session.
///
/// Holds at most one track per kind; adding a track of a kind already
/// present replaces the old one.
pub struct OutputStream {
    id: String,
    tracks: Mutex<Vec<Arc<dyn MediaTrack>>>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self {
            id: format!("output-{}", uuid::Uuid::new_v4()),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track, returning the track of the same kind it displaced
    pub fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Option<Arc<dyn MediaTrack>> {
        let mut tracks = self.tracks.lock();
        let previous = tracks
            .iter()
            .position(|t| t.kind() == track.kind())
            .map(|index| tracks.remove(index));
        tracks.push(track);
        previous
    }

    /// Remove a track by id
    pub fn remove_track(&self, track_id: &str) -> Option<Arc<dyn MediaTrack>> {
        let mut tracks = self.tracks.lock();
        let index = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(index))
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<dyn MediaTrack>> {
        self.tracks.lock().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.lock().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn kind_count(&self, kind: MediaKind) -> usize {
        self.tracks.lock().iter().filter(|t| t.kind() == kind).count()
    }

    /// Stop and drop every track
    pub fn clear(&self) {
        let drained: Vec<_> = self.tracks.lock().drain(..).collect();
        for track in drained {
            track.stop();
        }
    }
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("id", &self.id)
            .field("tracks", &self.track_count())
            .finish()
    }
}

pub fn is_live(track: &dyn MediaTrack) -> bool {
    track.ready_state() == TrackReadyState::Live
}

/// Force `enabled` on every track, returning how many were flipped
pub fn force_enable(tracks: &[Arc<dyn MediaTrack>]) -> usize {
    let mut flipped = 0;
    for track in tracks {
        if !track.enabled() {
            track.set_enabled(true);
            flipped += 1;
        }
    }
    flipped
}

/// Order tracks for production: video first, then audio
pub fn production_order(tracks: &[Arc<dyn MediaTrack>]) -> Vec<Arc<dyn MediaTrack>> {
    let mut ordered: Vec<_> = tracks.iter().filter(|t| is_live(t.as_ref())).cloned().collect();
    ordered.sort_by_key(|t| match t.kind() {
        MediaKind::Video => 0,
        MediaKind::Audio => 1,
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::synthetic::SyntheticTrack;

    #[test]
    fn test_replace_keeps_one_track_per_kind() {
        let stream = OutputStream::new();
        let first = SyntheticTrack::new(MediaKind::Video);
        let audio = SyntheticTrack::new(MediaKind::Audio);
        let second = SyntheticTrack::new(MediaKind::Video);

        assert!(stream.replace_track(first.clone()).is_none());
        assert!(stream.replace_track(audio).is_none());
        let displaced = stream.replace_track(second.clone()).unwrap();

        assert_eq!(displaced.id(), first.id());
        assert_eq!(stream.kind_count(MediaKind::Video), 1);
        assert_eq!(stream.kind_count(MediaKind::Audio), 1);
        assert_eq!(stream.track(MediaKind::Video).unwrap().id(), second.id());
    }

    #[test]
    fn test_production_order_puts_video_first_and_skips_ended() {
        let audio = SyntheticTrack::new(MediaKind::Audio);
        let video = SyntheticTrack::new(MediaKind::Video);
        let ended = SyntheticTrack::new(MediaKind::Video);
        ended.stop();

        let tracks: Vec<Arc<dyn MediaTrack>> = vec![audio, ended, video.clone()];
        let ordered = production_order(&tracks);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id(), video.id());
        assert_eq!(ordered[1].kind(), MediaKind::Audio);
    }

    #[test]
    fn test_force_enable() {
        let track = SyntheticTrack::new(MediaKind::Audio);
        track.set_enabled(false);
        let tracks: Vec<Arc<dyn MediaTrack>> = vec![track.clone()];
        assert_eq!(force_enable(&tracks), 1);
        assert!(track.enabled());
        assert_eq!(force_enable(&tracks), 0);
    }

    #[test]
    fn test_clear_stops_tracks() {
        let stream = OutputStream::new();
        let track = SyntheticTrack::new(MediaKind::Video);
        stream.replace_track(track.clone());
        stream.clear();
        assert_eq!(stream.track_count(), 0);
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
    }
}
