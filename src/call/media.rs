//! Local media management — capture tracks for the peer connection.
//!
//! `MediaSource` owns the local tracks and their feed tasks. Capture
//! backends are feature-gated the same way the build is: microphone via cpal
//! (`audio`, with a generated tone as the default feed), camera and screen
//! via V4L2 + openh264 (`video-capture`; without it the video track
//! negotiates but carries no samples).
//!
//! Enable/disable is local-only: a disabled kind stops writing samples, the
//! tracks stay attached and nothing renegotiates. Replacing the video
//! sender's track (screen share) is the session's job; this module only
//! hands out tracks and reports when a share feed ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_PCMU};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::tone;

/// Stream id shared by all local tracks.
const STREAM_ID: &str = "fitcall";

/// Capture device settings, from config.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// V4L2 camera device path; backend default when None.
    pub camera_device: Option<String>,
    /// V4L2 device exposing the desktop (e.g. a v4l2loopback fed by the
    /// compositor). Screen share is unavailable without one.
    pub screen_device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            camera_device: None,
            screen_device: None,
            width: 320,
            height: 240,
            fps: 15,
        }
    }
}

/// Notifications from feed tasks to the session loop.
#[derive(Debug, PartialEq, Eq)]
pub enum MediaEvent {
    /// The screen-capture source went away (device closed, stream ended).
    /// The session reverts to the camera track.
    ScreenShareEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local track plus its feed task.
struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    feed: Option<tokio::task::JoinHandle<()>>,
}

impl LocalTrack {
    fn stop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct MediaSource {
    /// Capture device selection (`video-capture` builds).
    #[cfg_attr(not(feature = "video-capture"), allow(dead_code))]
    settings: CaptureSettings,
    /// Screen-share feed end notifications (`video-capture` builds).
    #[cfg_attr(not(feature = "video-capture"), allow(dead_code))]
    events: mpsc::UnboundedSender<MediaEvent>,
    /// Kind-level enable flags, shared with every feed of that kind.
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    audio: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

impl MediaSource {
    pub fn new(settings: CaptureSettings, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            settings,
            events,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            video_enabled: Arc::new(AtomicBool::new(true)),
            audio: None,
            camera: None,
            screen: None,
        }
    }

    /// Acquire microphone and camera once. A second call while already
    /// acquired is a no-op. Failure is reported to the caller and never
    /// retried from here.
    pub fn acquire_camera_and_mic(&mut self) -> Result<()> {
        if self.audio.is_some() {
            tracing::debug!("Local media already acquired");
            return Ok(());
        }

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let audio_feed = spawn_audio_feed(audio_track.clone(), self.audio_enabled.clone())?;

        let camera_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "camera".to_owned(),
            STREAM_ID.to_owned(),
        ));
        #[cfg(feature = "video-capture")]
        let camera_feed = Some(spawn_camera_feed(
            camera_track.clone(),
            self.video_enabled.clone(),
            &self.settings,
        )?);
        #[cfg(not(feature = "video-capture"))]
        let camera_feed = None;

        self.audio = Some(LocalTrack {
            track: audio_track,
            feed: Some(audio_feed),
        });
        self.camera = Some(LocalTrack {
            track: camera_track,
            feed: camera_feed,
        });
        tracing::info!("Local media acquired");
        Ok(())
    }

    /// Flip the enabled flag for every local track of `kind`. Returns the
    /// new state. Local mute/pause only — nothing renegotiates.
    pub fn toggle_enabled(&self, kind: TrackKind) -> bool {
        let flag = match kind {
            TrackKind::Audio => &self.audio_enabled,
            TrackKind::Video => &self.video_enabled,
        };
        let enabled = !flag.load(Ordering::Relaxed);
        flag.store(enabled, Ordering::Relaxed);
        tracing::info!(
            "{} {}",
            match kind {
                TrackKind::Audio => "Microphone",
                TrackKind::Video => "Video",
            },
            if enabled { "enabled" } else { "disabled" }
        );
        enabled
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled.load(Ordering::Relaxed),
            TrackKind::Video => self.video_enabled.load(Ordering::Relaxed),
        }
    }

    /// Start display capture and return its track for the caller to swap
    /// into the live connection. The share's end is reported via
    /// `MediaEvent::ScreenShareEnded`, driven by the capture stream itself.
    #[cfg(feature = "video-capture")]
    pub fn acquire_screen_share(&mut self) -> Result<Arc<TrackLocalStaticSample>> {
        use anyhow::Context;

        if let Some(screen) = &self.screen {
            tracing::debug!("Screen share already active");
            return Ok(screen.track.clone());
        }
        let device = self
            .settings
            .screen_device
            .clone()
            .context("no screen capture device configured (set screen_device in config)")?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "screen".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let feed = spawn_screen_feed(
            track.clone(),
            self.video_enabled.clone(),
            device,
            &self.settings,
            self.events.clone(),
        )?;
        self.screen = Some(LocalTrack {
            track: track.clone(),
            feed: Some(feed),
        });
        tracing::info!("Screen share started");
        Ok(track)
    }

    #[cfg(not(feature = "video-capture"))]
    pub fn acquire_screen_share(&mut self) -> Result<Arc<TrackLocalStaticSample>> {
        anyhow::bail!("screen capture requires the video-capture feature")
    }

    /// Stop the screen-share feed and drop its track. Used both for the
    /// user toggling share off and for reverting after the source ended.
    pub fn stop_screen_share(&mut self) {
        if let Some(mut screen) = self.screen.take() {
            screen.stop();
            tracing::info!("Screen share stopped");
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio.as_ref().map(|t| t.track.clone())
    }

    pub fn camera_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.camera.as_ref().map(|t| t.track.clone())
    }

    /// The video track a new peer connection should send: the screen while
    /// sharing, the camera otherwise.
    pub fn active_video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.screen
            .as_ref()
            .or(self.camera.as_ref())
            .map(|t| t.track.clone())
    }

    /// Stop every feed and drop every track.
    pub fn stop_all(&mut self) {
        for slot in [&mut self.audio, &mut self.camera, &mut self.screen] {
            if let Some(mut local) = slot.take() {
                local.stop();
            }
        }
        tracing::info!("Local media stopped");
    }
}

/// Microphone feed: 20ms PCMU frames from cpal capture.
#[cfg(feature = "audio")]
fn spawn_audio_feed(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) -> Result<tokio::task::JoinHandle<()>> {
    use anyhow::Context;

    let (capture, frames) =
        super::audio::AudioCapture::start().context("microphone unavailable")?;
    Ok(tokio::spawn(async move {
        let _capture = capture; // keeps the cpal stream alive
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            // Take the freshest captured frame; drop any backlog.
            let mut frame = None;
            while let Ok(f) = frames.try_recv() {
                frame = Some(f);
            }
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            let payload = match frame {
                Some(samples) => tone::encode_frame(&samples),
                None => vec![0xFF; tone::FRAME_SAMPLES], // mu-law silence
            };
            let sample = Sample {
                data: Bytes::from(payload),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                tracing::debug!("Audio track unbound, feed exiting");
                return;
            }
        }
    }))
}

/// Tone feed: without a microphone backend the audio track carries a
/// generated tone so the media path stays verifiable end to end.
#[cfg(not(feature = "audio"))]
fn spawn_audio_feed(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        let mut gen = tone::ToneGenerator::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        loop {
            ticker.tick().await;
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            let payload = tone::encode_frame(&gen.next_frame());
            let sample = Sample {
                data: Bytes::from(payload),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                tracing::debug!("Audio track unbound, feed exiting");
                return;
            }
        }
    }))
}

/// Camera feed: V4L2 frames, H.264-encoded, one sample per frame.
#[cfg(feature = "video-capture")]
fn spawn_camera_feed(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    settings: &CaptureSettings,
) -> Result<tokio::task::JoinHandle<()>> {
    let (capture, frames, width, height) = super::camera::CameraCapture::start(
        settings.camera_device.as_deref(),
        settings.width,
        settings.height,
        settings.fps,
    )?;
    Ok(spawn_encode_feed(
        track, enabled, capture, frames, width, height, settings.fps, None,
    ))
}

/// Screen feed: same shape as the camera feed, plus an end notification
/// when the capture source goes away.
#[cfg(feature = "video-capture")]
fn spawn_screen_feed(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    device: String,
    settings: &CaptureSettings,
    events: mpsc::UnboundedSender<MediaEvent>,
) -> Result<tokio::task::JoinHandle<()>> {
    let (capture, frames, width, height) =
        super::screen::ScreenCapture::start(&device, settings.fps)?;
    Ok(spawn_encode_feed(
        track,
        enabled,
        capture,
        frames,
        width,
        height,
        settings.fps,
        Some(events),
    ))
}

#[cfg(feature = "video-capture")]
#[allow(clippy::too_many_arguments)]
fn spawn_encode_feed<C: Send + 'static>(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    capture: C,
    mut frames: mpsc::Receiver<super::camera::YuvFrame>,
    width: u32,
    height: u32,
    fps: u32,
    on_end: Option<mpsc::UnboundedSender<MediaEvent>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _capture = capture; // keeps the capture thread alive
        let mut encoder = match super::codec::H264Encoder::new(width, height, fps as f32, 600) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!("Video encoder init failed: {:#}", e);
                if let Some(events) = on_end {
                    let _ = events.send(MediaEvent::ScreenShareEnded);
                }
                return;
            }
        };
        let frame_duration = Duration::from_millis(1000 / fps.max(1) as u64);
        while let Some(frame) = frames.recv().await {
            if !enabled.load(Ordering::Relaxed) {
                continue;
            }
            match encoder.encode(&frame.data) {
                Ok(annexb) if !annexb.is_empty() => {
                    let sample = Sample {
                        data: Bytes::from(annexb),
                        duration: frame_duration,
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        tracing::debug!("Video track unbound, feed exiting");
                        break;
                    }
                }
                Ok(_) => {} // encoder produced nothing for this frame
                Err(e) => tracing::warn!("Video encode failed: {:#}", e),
            }
        }
        if let Some(events) = on_end {
            let _ = events.send(MediaEvent::ScreenShareEnded);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> (MediaSource, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MediaSource::new(CaptureSettings::default(), tx), rx)
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let (mut media, _rx) = source();
        media.acquire_camera_and_mic().unwrap();
        let audio = media.audio_track().unwrap();
        let camera = media.camera_track().unwrap();
        media.acquire_camera_and_mic().unwrap();
        // Same tracks, not rebuilt ones.
        assert!(Arc::ptr_eq(&audio, &media.audio_track().unwrap()));
        assert!(Arc::ptr_eq(&camera, &media.camera_track().unwrap()));
        media.stop_all();
    }

    #[tokio::test]
    async fn test_toggle_flips_only_its_kind() {
        let (media, _rx) = source();
        assert!(media.is_enabled(TrackKind::Audio));
        assert!(media.is_enabled(TrackKind::Video));

        assert!(!media.toggle_enabled(TrackKind::Audio));
        assert!(!media.is_enabled(TrackKind::Audio));
        assert!(media.is_enabled(TrackKind::Video));

        assert!(media.toggle_enabled(TrackKind::Audio));
        assert!(media.is_enabled(TrackKind::Audio));
    }

    #[tokio::test]
    async fn test_active_video_track_is_camera_without_share() {
        let (mut media, _rx) = source();
        media.acquire_camera_and_mic().unwrap();
        let active = media.active_video_track().unwrap();
        assert!(Arc::ptr_eq(&active, &media.camera_track().unwrap()));
        assert!(!media.is_screen_sharing());
        media.stop_all();
    }

    #[cfg(not(feature = "video-capture"))]
    #[tokio::test]
    async fn test_screen_share_requires_capture_feature() {
        let (mut media, _rx) = source();
        assert!(media.acquire_screen_share().is_err());
    }

    #[tokio::test]
    async fn test_stop_all_drops_tracks() {
        let (mut media, _rx) = source();
        media.acquire_camera_and_mic().unwrap();
        media.stop_all();
        assert!(media.audio_track().is_none());
        assert!(media.camera_track().is_none());
        assert!(media.active_video_track().is_none());
    }
}
