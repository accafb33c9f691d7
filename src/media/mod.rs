use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

pub mod render;
pub mod stream;

pub use render::MemoryRenderTarget;
pub use stream::{MediaStreamEvent, RemoteMediaStream, RemoteMediaStreamBuilder};

pub type TrackId = String;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn audio(id: impl Into<TrackId>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }

    pub fn video(id: impl Into<TrackId>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
        }
    }
}

/// Change notifications of a live track set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    Added(MediaTrack),
    Removed(TrackId),
}

/// A negotiated remote stream as exposed by the signaling engine.
pub trait MediaSource: Send + Sync {
    fn id(&self) -> &str;
    fn tracks(&self) -> Vec<MediaTrack>;
    fn subscribe(&self) -> broadcast::Receiver<TrackEvent>;
}

/// Where remote media is rendered, e.g. an audio sink or a video element.
pub trait RenderTarget: Send + Sync {
    fn name(&self) -> &str;
    fn attach(&self, track: &MediaTrack);
    fn detach(&self, track_id: &TrackId);
    fn play(&self) -> Result<()>;
    /// Detaches every track and stops playback.
    fn clear(&self);
}

/// Broadcast backed [`MediaSource`] a transport fills as tracks arrive.
pub struct TrackSet {
    id: String,
    tracks: Mutex<HashMap<TrackId, MediaTrack>>,
    sender: broadcast::Sender<TrackEvent>,
}

impl TrackSet {
    pub fn new(id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            id: id.into(),
            tracks: Mutex::new(HashMap::new()),
            sender,
        }
    }

    fn lock_tracks(&self) -> MutexGuard<'_, HashMap<TrackId, MediaTrack>> {
        match self.tracks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_track(&self, track: MediaTrack) {
        self.lock_tracks().insert(track.id.clone(), track.clone());
        self.sender.send(TrackEvent::Added(track)).ok();
    }

    pub fn remove_track(&self, track_id: &TrackId) {
        if self.lock_tracks().remove(track_id).is_some() {
            self.sender.send(TrackEvent::Removed(track_id.clone())).ok();
        }
    }
}

impl MediaSource for TrackSet {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<MediaTrack> {
        let mut tracks: Vec<_> = self.lock_tracks().values().cloned().collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));
        tracks
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.sender.subscribe()
    }
}
