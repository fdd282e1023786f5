//! Local media controller.
//!
//! Owns the captured camera/microphone source and every runtime-mutable
//! property of it. Sessions only attach references to the processed tracks;
//! the controller is the only place that enables, disables or stops them.
//!
//! Mute is written to three layers on every call:
//! - the gain stage (0 or the stored volume)
//! - the raw and processed audio tracks
//! - the audio sender of every peer session
//!
//! No single layer is trusted to silence the microphone on its own.

use crate::error::MediaAccessError;
use crate::session::PeerSessionTable;
use async_trait::async_trait;
use huddle_common::protocol::{MediaKind, TrackPurpose};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub type TrackHandle = Arc<MediaTrack>;

/// A captured or derived media track, shared by reference.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> TrackHandle {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// `false` once the track has been stopped. Stopping is permanent.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Audio gain applied between the raw microphone and the processed output.
#[derive(Debug)]
pub struct GainStage {
    bits: AtomicU32,
}

impl GainStage {
    pub fn new(gain: f32) -> Self {
        Self {
            bits: AtomicU32::new(gain.to_bits()),
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::SeqCst))
    }

    pub fn set(&self, gain: f32) {
        self.bits.store(gain.to_bits(), Ordering::SeqCst);
    }
}

impl Default for GainStage {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Frequency-domain view of an audio track, used for voice-activity detection.
pub trait AudioAnalyser: Send + Sync {
    /// Fill `bins` with byte magnitudes, one per frequency bin.
    fn frequency_data(&self, bins: &mut [u8]);
}

/// Platform capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request camera and microphone. Returns the raw tracks.
    async fn user_media(&self) -> Result<Vec<TrackHandle>, MediaAccessError>;

    /// Request a display-capture video track.
    async fn display_media(&self) -> Result<TrackHandle, MediaAccessError>;

    /// Analyser attached to an audio track.
    fn analyser(&self, track: &TrackHandle) -> Result<Arc<dyn AudioAnalyser>, MediaAccessError>;
}

/// A track offered to peer sessions, with its declared purpose.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub track: TrackHandle,
    pub purpose: TrackPurpose,
}

struct LocalSource {
    raw: Vec<TrackHandle>,
    /// Video passes through; audio is a separate track behind the gain stage.
    processed: Vec<TrackHandle>,
}

pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    source: Option<LocalSource>,
    screen: Option<TrackHandle>,
    gain: GainStage,
    /// Volume restored on unmute.
    volume: f32,
    muted: watch::Sender<bool>,
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        let (muted, _) = watch::channel(false);
        Self {
            devices,
            source: None,
            screen: None,
            gain: GainStage::default(),
            volume: 1.0,
            muted,
        }
    }

    /// Capture camera and microphone once. Later calls are no-ops.
    ///
    /// On failure nothing is retained: any raw track already handed out by
    /// the backend is stopped before the error is returned.
    pub async fn acquire(&mut self) -> Result<(), MediaAccessError> {
        if self.source.is_some() {
            return Ok(());
        }

        let raw = self.devices.user_media().await?;
        if raw.is_empty() {
            return Err(MediaAccessError::NoDevice {
                kind: MediaKind::Audio,
            });
        }
        if let Some(dead) = raw.iter().find(|t| !t.is_live()) {
            let err = MediaAccessError::Device(format!("track {} ended during capture", dead.id()));
            raw.iter().for_each(|t| t.stop());
            return Err(err);
        }

        let muted = self.is_muted();
        let processed = raw
            .iter()
            .map(|track| match track.kind() {
                MediaKind::Video => Arc::clone(track),
                MediaKind::Audio => {
                    let out = MediaTrack::new(format!("{}-processed", track.id()), MediaKind::Audio);
                    out.set_enabled(!muted);
                    track.set_enabled(!muted);
                    out
                }
            })
            .collect();

        tracing::info!(tracks = raw.len(), "Local media acquired");
        self.source = Some(LocalSource { raw, processed });
        Ok(())
    }

    pub fn is_acquired(&self) -> bool {
        self.source.is_some()
    }

    pub fn raw_tracks(&self) -> &[TrackHandle] {
        self.source.as_ref().map(|s| s.raw.as_slice()).unwrap_or_default()
    }

    pub fn processed_tracks(&self) -> &[TrackHandle] {
        self.source
            .as_ref()
            .map(|s| s.processed.as_slice())
            .unwrap_or_default()
    }

    /// Processed tracks tagged for announcement to peers.
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.processed_tracks()
            .iter()
            .map(|track| LocalTrack {
                track: Arc::clone(track),
                purpose: match track.kind() {
                    MediaKind::Audio => TrackPurpose::Microphone,
                    MediaKind::Video => TrackPurpose::Camera,
                },
            })
            .collect()
    }

    /// Raw microphone track, the input of voice-activity detection.
    pub fn microphone(&self) -> Option<&TrackHandle> {
        self.raw_tracks().iter().find(|t| t.kind() == MediaKind::Audio)
    }

    pub fn analyser(&self) -> Option<Arc<dyn AudioAnalyser>> {
        let mic = self.microphone()?;
        match self.devices.analyser(mic) {
            Ok(analyser) => Some(analyser),
            Err(e) => {
                tracing::warn!(error = %e, "Voice activity analyser unavailable");
                None
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    /// Mute state feed for the voice-activity loop.
    pub fn subscribe_muted(&self) -> watch::Receiver<bool> {
        self.muted.subscribe()
    }

    /// Apply mute to the gain stage, both audio track layers and every
    /// session's audio sender. Synchronous: there is no await point between
    /// the first and the last write.
    pub fn set_muted(&mut self, muted: bool, sessions: &PeerSessionTable) {
        self.gain.set(if muted { 0.0 } else { self.volume });

        let enabled = !muted;
        if let Some(source) = &self.source {
            source
                .raw
                .iter()
                .chain(source.processed.iter())
                .filter(|t| t.kind() == MediaKind::Audio)
                .for_each(|t| t.set_enabled(enabled));
        }

        for session in sessions.iter() {
            for sender in session.connection.senders() {
                if sender.kind() == MediaKind::Audio {
                    sender.set_enabled(enabled);
                }
            }
        }

        self.muted.send_replace(muted);
        tracing::debug!(muted, sessions = sessions.len(), "Mute applied");
    }

    /// Update the stored volume. While muted the gain stays at zero and the
    /// new volume only takes effect on unmute.
    pub fn set_gain(&mut self, value: f32) {
        self.volume = value.max(0.0);
        if !self.is_muted() {
            self.gain.set(self.volume);
        }
    }

    /// Gain currently applied to the processed output.
    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Start display capture, or return the running one.
    pub async fn start_screen_share(&mut self) -> Result<TrackHandle, MediaAccessError> {
        if let Some(track) = &self.screen {
            return Ok(Arc::clone(track));
        }
        let track = self.devices.display_media().await?;
        tracing::info!(track = track.id(), "Screen capture started");
        self.screen = Some(Arc::clone(&track));
        Ok(track)
    }

    /// Stop display capture. Returns the stopped track, if any was running.
    pub fn stop_screen_share(&mut self) -> Option<TrackHandle> {
        let track = self.screen.take()?;
        track.stop();
        tracing::info!(track = track.id(), "Screen capture stopped");
        Some(track)
    }

    pub fn screen_track(&self) -> Option<&TrackHandle> {
        self.screen.as_ref()
    }

    /// Stop every local track. Hang-up is the only caller.
    pub fn release(&mut self) {
        self.stop_screen_share();
        if let Some(source) = self.source.take() {
            source
                .raw
                .iter()
                .chain(source.processed.iter())
                .for_each(|t| t.stop());
            tracing::info!("Local media released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDevices;

    fn controller() -> (LocalMediaController, Arc<MemoryDevices>) {
        let devices = Arc::new(MemoryDevices::new());
        (LocalMediaController::new(devices.clone()), devices)
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let (mut media, devices) = controller();
        media.acquire().await.unwrap();
        media.acquire().await.unwrap();
        assert_eq!(devices.user_media_calls(), 1);
        assert_eq!(media.processed_tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_processed_audio_is_derived_and_video_passes_through() {
        let (mut media, _) = controller();
        media.acquire().await.unwrap();

        let raw_video = media.raw_tracks().iter().find(|t| t.kind() == MediaKind::Video).unwrap();
        let out_video = media.processed_tracks().iter().find(|t| t.kind() == MediaKind::Video).unwrap();
        assert!(Arc::ptr_eq(raw_video, out_video));

        let out_audio = media.processed_tracks().iter().find(|t| t.kind() == MediaKind::Audio).unwrap();
        assert_eq!(out_audio.id(), "mic-processed");
    }

    #[tokio::test]
    async fn test_denied_capture_leaves_nothing_behind() {
        let mut media = LocalMediaController::new(Arc::new(MemoryDevices::denying()));
        assert_eq!(media.acquire().await, Err(MediaAccessError::PermissionDenied));
        assert!(!media.is_acquired());
        assert!(media.processed_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_mute_writes_gain_and_both_track_layers() {
        let (mut media, _) = controller();
        media.acquire().await.unwrap();
        let sessions = PeerSessionTable::default();

        media.set_muted(true, &sessions);
        assert_eq!(media.gain(), 0.0);
        assert!(media
            .raw_tracks()
            .iter()
            .chain(media.processed_tracks())
            .filter(|t| t.kind() == MediaKind::Audio)
            .all(|t| !t.is_enabled()));
        // Video is untouched by mute.
        assert!(media.processed_tracks().iter().any(|t| t.kind() == MediaKind::Video && t.is_enabled()));
    }

    #[tokio::test]
    async fn test_gain_while_muted_restores_on_unmute() {
        let (mut media, _) = controller();
        media.acquire().await.unwrap();
        let sessions = PeerSessionTable::default();

        media.set_gain(0.4);
        media.set_muted(true, &sessions);
        media.set_gain(0.7);
        assert_eq!(media.gain(), 0.0);

        media.set_muted(false, &sessions);
        assert_eq!(media.gain(), 0.7);
    }

    #[tokio::test]
    async fn test_acquire_while_muted_starts_disabled() {
        let (mut media, _) = controller();
        media.set_muted(true, &PeerSessionTable::default());
        media.acquire().await.unwrap();
        assert!(media
            .processed_tracks()
            .iter()
            .filter(|t| t.kind() == MediaKind::Audio)
            .all(|t| !t.is_enabled()));
    }

    #[tokio::test]
    async fn test_release_stops_everything() {
        let (mut media, _) = controller();
        media.acquire().await.unwrap();
        let screen = media.start_screen_share().await.unwrap();
        let tracks: Vec<_> = media.processed_tracks().to_vec();

        media.release();
        assert!(!screen.is_live());
        assert!(tracks.iter().all(|t| !t.is_live()));
        assert!(!media.is_acquired());
    }

    #[test]
    fn test_mute_feed_follows_state() {
        let (mut media, _) = controller();
        let rx = media.subscribe_muted();
        media.set_muted(true, &PeerSessionTable::default());
        assert!(*rx.borrow());
    }
}
