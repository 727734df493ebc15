use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::MediaConstraints;
use crate::error::SessionError;
use crate::peer::{MediaCapturePrimitive, MediaTrack, PeerSessionPrimitive, TrackKind};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// The tracks produced by one `acquire` call.
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    id: u64,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStreamHandle {
    fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            tracks,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Owns local capture for a session.
pub struct MediaPipeline {
    capture: Arc<dyn MediaCapturePrimitive>,
    constraints: MediaConstraints,
    handles: Vec<MediaStreamHandle>,
    attached: HashSet<String>,
}

impl MediaPipeline {
    pub fn new(capture: Arc<dyn MediaCapturePrimitive>, constraints: MediaConstraints) -> Self {
        Self {
            capture,
            constraints,
            handles: Vec::new(),
            attached: HashSet::new(),
        }
    }

    /// Requests camera and/or microphone. Denied permission or a missing
    /// device is a [`SessionError::MediaAccess`]; nothing is substituted.
    pub async fn acquire(
        &mut self,
        video: bool,
        audio: bool,
    ) -> Result<MediaStreamHandle, SessionError> {
        let constraints = self.constraints.select(video, audio);
        if constraints.is_empty() {
            return Ok(MediaStreamHandle::new(Vec::new()));
        }
        let tracks = self.capture.capture(&constraints).await?;
        let handle = MediaStreamHandle::new(tracks);
        tracing::debug!(
            target: "fieldcall::media",
            handle = handle.id(),
            tracks = handle.tracks().len(),
            video,
            audio,
            "local media acquired"
        );
        self.handles.push(handle.clone());
        Ok(handle)
    }

    /// Adds the handle's tracks to the peer connection, skipping any track
    /// already attached. Returns how many were added.
    pub async fn attach_to_session(
        &mut self,
        peer: &dyn PeerSessionPrimitive,
        handle: &MediaStreamHandle,
    ) -> Result<usize, SessionError> {
        let mut added = 0;
        for track in handle.tracks() {
            if track.is_stopped() || self.attached.contains(track.id()) {
                continue;
            }
            peer.add_track(Arc::clone(track)).await?;
            self.attached.insert(track.id().to_string());
            added += 1;
        }
        Ok(added)
    }

    /// Flips the local video track and returns its new state, or `None`
    /// when no live video track exists.
    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(TrackKind::Video)
    }

    pub fn toggle_audio(&self) -> Option<bool> {
        self.toggle(TrackKind::Audio)
    }

    fn toggle(&self, kind: TrackKind) -> Option<bool> {
        let track = self
            .handles
            .iter()
            .flat_map(|handle| handle.tracks())
            .find(|track| track.kind() == kind && !track.is_stopped())?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(
            target: "fieldcall::media",
            kind = kind.as_str(),
            enabled,
            "track toggled"
        );
        Some(enabled)
    }

    /// Stops every track of `handle`. Safe to repeat; returns how many
    /// tracks this call actually stopped.
    pub fn release(&mut self, handle: &MediaStreamHandle) -> usize {
        let stopped = handle.tracks().iter().filter(|track| track.stop()).count();
        for track in handle.tracks() {
            self.attached.remove(track.id());
        }
        self.handles.retain(|held| held.id != handle.id);
        stopped
    }

    pub fn release_all(&mut self) -> usize {
        let handles = std::mem::take(&mut self.handles);
        let stopped: usize = handles.iter().map(|handle| self.release(handle)).sum();
        self.attached.clear();
        stopped
    }

    pub fn active_handles(&self) -> usize {
        self.handles.len()
    }
}
