use super::{MediaSource, MediaTrack, RenderTarget, TrackEvent, TrackId};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::{
    select,
    sync::{broadcast, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type EventSender = broadcast::Sender<MediaStreamEvent>;
pub type EventReceiver = broadcast::Receiver<MediaStreamEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStreamEvent {
    TrackStart(TrackId),
    TrackStop(TrackId),
}

/// Remote stream of an established call bound to a render target.
pub struct RemoteMediaStream {
    id: String,
    cancel_token: CancellationToken,
    source: Arc<dyn MediaSource>,
    binding: TrackBinding,
}

pub struct RemoteMediaStreamBuilder {
    cancel_token: Option<CancellationToken>,
    event_buf_size: usize,
    id: Option<String>,
}

#[derive(Clone)]
struct TrackBinding {
    tracks: Arc<Mutex<HashMap<TrackId, MediaTrack>>>,
    target: Arc<dyn RenderTarget>,
    event_sender: EventSender,
}

impl TrackBinding {
    async fn attach(&self, track: MediaTrack) {
        let mut tracks = self.tracks.lock().await;
        if tracks.contains_key(&track.id) {
            return;
        }
        self.target.attach(&track);
        let track_id = track.id.clone();
        tracks.insert(track_id.clone(), track);
        self.event_sender
            .send(MediaStreamEvent::TrackStart(track_id))
            .ok();
    }

    async fn detach(&self, track_id: &TrackId) {
        if self.tracks.lock().await.remove(track_id).is_some() {
            self.target.detach(track_id);
            self.event_sender
                .send(MediaStreamEvent::TrackStop(track_id.clone()))
                .ok();
        }
    }
}

impl RemoteMediaStreamBuilder {
    pub fn new() -> Self {
        Self {
            id: None,
            cancel_token: None,
            event_buf_size: 16,
        }
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.id = Some(id);
        self
    }

    pub fn event_buf_size(mut self, event_buf_size: usize) -> Self {
        self.event_buf_size = event_buf_size;
        self
    }

    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(
        self,
        source: Arc<dyn MediaSource>,
        target: Arc<dyn RenderTarget>,
    ) -> RemoteMediaStream {
        // own child token, clearing the stream must not cancel the parent
        let cancel_token = self
            .cancel_token
            .map(|token| token.child_token())
            .unwrap_or_default();
        let (event_sender, _) = broadcast::channel(self.event_buf_size);
        let id = self
            .id
            .unwrap_or_else(|| format!("rms:{}", source.id()));

        RemoteMediaStream {
            id,
            cancel_token,
            source,
            binding: TrackBinding {
                tracks: Arc::new(Mutex::new(HashMap::new())),
                target,
                event_sender,
            },
        }
    }
}

impl Default for RemoteMediaStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteMediaStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.binding.event_sender.subscribe()
    }

    pub async fn tracks(&self) -> Vec<MediaTrack> {
        let mut tracks: Vec<_> = self.binding.tracks.lock().await.values().cloned().collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));
        tracks
    }

    /// Attaches the current tracks, starts watching for track changes and
    /// starts playback.
    pub async fn start(&self) -> Result<()> {
        // subscribe first so tracks added during the snapshot are not lost
        let receiver = self.source.subscribe();
        for track in self.source.tracks() {
            self.binding.attach(track).await;
        }

        let binding = self.binding.clone();
        let token = self.cancel_token.child_token();
        let id = self.id.clone();
        tokio::spawn(async move {
            select! {
                biased;
                _ = token.cancelled() => {}
                _ = Self::observe_tracks(binding, receiver) => {
                    debug!(stream = %id, "track source closed");
                }
            }
        });

        if let Err(e) = self.binding.target.play() {
            warn!(stream = %self.id, "failed to start playback: {}", e);
            self.clear().await;
            return Err(e);
        }
        info!(
            stream = %self.id,
            target_name = self.binding.target.name(),
            "remote media attached"
        );
        Ok(())
    }

    /// Stops observing, detaches all tracks and stops playback.
    pub async fn clear(&self) {
        self.cancel_token.cancel();
        let track_ids: Vec<TrackId> = self.binding.tracks.lock().await.keys().cloned().collect();
        for track_id in track_ids.iter() {
            self.binding.detach(track_id).await;
        }
        self.binding.target.clear();
        info!(stream = %self.id, "remote media cleared");
    }

    pub fn is_cleared(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn observe_tracks(binding: TrackBinding, mut receiver: broadcast::Receiver<TrackEvent>) {
        loop {
            match receiver.recv().await {
                Ok(TrackEvent::Added(track)) => binding.attach(track).await,
                Ok(TrackEvent::Removed(track_id)) => binding.detach(&track_id).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "track observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Drop for RemoteMediaStream {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
