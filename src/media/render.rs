use super::{MediaTrack, RenderTarget, TrackId};
use anyhow::Result;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct RenderState {
    tracks: Vec<MediaTrack>,
    playing: bool,
}

/// Headless render target that only keeps track of what it was given.
pub struct MemoryRenderTarget {
    name: String,
    state: Mutex<RenderState>,
}

impl MemoryRenderTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RenderState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RenderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.lock_state().tracks.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.lock_state().playing
    }
}

impl RenderTarget for MemoryRenderTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, track: &MediaTrack) {
        let mut state = self.lock_state();
        if !state.tracks.iter().any(|t| t.id == track.id) {
            debug!(target_name = %self.name, track = %track.id, "track attached");
            state.tracks.push(track.clone());
        }
    }

    fn detach(&self, track_id: &TrackId) {
        debug!(target_name = %self.name, track = %track_id, "track detached");
        self.lock_state().tracks.retain(|t| &t.id != track_id);
    }

    fn play(&self) -> Result<()> {
        self.lock_state().playing = true;
        Ok(())
    }

    fn clear(&self) {
        let mut state = self.lock_state();
        state.tracks.clear();
        state.playing = false;
    }
}
