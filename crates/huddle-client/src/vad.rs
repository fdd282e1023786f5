//! Voice-activity detection.
//!
//! Averages the byte magnitude of every frequency bin of the microphone.
//! The average maps to a [0, 1] level for meters; crossing the threshold
//! yields a speaking transition. Transitions are reported on change only.

use crate::media::AudioAnalyser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const FFT_SIZE: usize = 512;
pub const FREQUENCY_BINS: usize = FFT_SIZE / 2;
/// Average magnitude above which the source counts as speaking.
pub const SPEAKING_THRESHOLD: f32 = 40.0;
/// Average magnitude shown as a full meter.
pub const FULL_SCALE: f32 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSample {
    pub level: f32,
    /// `Some` only when the speaking state flipped on this sample.
    pub transition: Option<bool>,
}

#[derive(Debug, Default)]
pub struct VoiceActivityDetector {
    speaking: bool,
}

impl VoiceActivityDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Evaluate one frame. A muted source reads as silence whatever its energy.
    pub fn sample(&mut self, bins: &[u8], muted: bool) -> VoiceSample {
        let (level, speaking) = if muted || bins.is_empty() {
            (0.0, false)
        } else {
            let sum: u32 = bins.iter().map(|&b| u32::from(b)).sum();
            let average = sum as f32 / bins.len() as f32;
            ((average / FULL_SCALE).min(1.0), average > SPEAKING_THRESHOLD)
        };

        let transition = (speaking != self.speaking).then_some(speaking);
        self.speaking = speaking;
        VoiceSample { level, transition }
    }
}

/// Sample `analyser` every `interval` until `samples` is closed.
pub fn spawn_detector(
    analyser: Arc<dyn AudioAnalyser>,
    muted: watch::Receiver<bool>,
    interval: Duration,
    samples: mpsc::UnboundedSender<VoiceSample>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut detector = VoiceActivityDetector::new();
        let mut bins = vec![0u8; FREQUENCY_BINS];
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            analyser.frequency_data(&mut bins);
            let sample = detector.sample(&bins, *muted.borrow());
            if samples.send(sample).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_is_normalised_and_clamped() {
        let mut vad = VoiceActivityDetector::new();
        assert_eq!(vad.sample(&[40; FREQUENCY_BINS], false).level, 0.5);
        assert_eq!(vad.sample(&[200; FREQUENCY_BINS], false).level, 1.0);
    }

    #[test]
    fn test_transitions_only_on_change() {
        let mut vad = VoiceActivityDetector::new();
        assert_eq!(vad.sample(&[10; FREQUENCY_BINS], false).transition, None);
        assert_eq!(vad.sample(&[60; FREQUENCY_BINS], false).transition, Some(true));
        assert_eq!(vad.sample(&[70; FREQUENCY_BINS], false).transition, None);
        assert_eq!(vad.sample(&[5; FREQUENCY_BINS], false).transition, Some(false));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut vad = VoiceActivityDetector::new();
        assert_eq!(vad.sample(&[40; FREQUENCY_BINS], false).transition, None);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_mute_forces_silence() {
        let mut vad = VoiceActivityDetector::new();
        vad.sample(&[90; FREQUENCY_BINS], false);
        let muted = vad.sample(&[90; FREQUENCY_BINS], true);
        assert_eq!(muted.level, 0.0);
        assert_eq!(muted.transition, Some(false));
        assert_eq!(vad.sample(&[90; FREQUENCY_BINS], true).transition, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_reports_until_receiver_dropped() {
        let devices = crate::memory::MemoryDevices::new();
        devices.set_level(100);
        let mic = crate::media::MediaTrack::new("mic", huddle_common::protocol::MediaKind::Audio);
        let analyser = crate::media::MediaDevices::analyser(&devices, &mic).unwrap();
        let (_mute_tx, mute_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = spawn_detector(analyser, mute_rx, Duration::from_millis(50), tx);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.transition, Some(true));
        assert_eq!(rx.recv().await.unwrap().transition, None);

        drop(rx);
        task.await.unwrap();
    }
}
