//! Display capture from a V4L2 loopback device.
//!
//! There is no portable "grab the desktop" API at this layer; the supported
//! setup is a v4l2loopback device fed by the compositor or by ffmpeg
//! (`screen_device` in the config). The capture itself is the same mmap
//! stream the camera uses — only the format negotiation differs: the
//! loopback decides the geometry, we take what it serves.
//!
//! When the producer stops feeding the device the stream errors out, the
//! capture thread exits, and the frame channel closes — that close is the
//! "share ended" signal the session reacts to.

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::camera::{capture_loop, YuvFrame};

/// Screen capture handle. Same lifetime contract as `CameraCapture`.
pub struct ScreenCapture {
    _handle: std::thread::JoinHandle<()>,
}

impl ScreenCapture {
    /// Open the configured loopback device and start capturing.
    ///
    /// Returns the handle, the frame receiver, and the device's geometry.
    pub fn start(
        device_path: &str,
        fps: u32,
    ) -> Result<(Self, mpsc::Receiver<YuvFrame>, u32, u32)> {
        let dev = Device::with_path(device_path)
            .with_context(|| format!("Failed to open screen device at {}", device_path))?;

        // The loopback's producer owns the format; we only check we can
        // consume it.
        let fmt = dev.format().context("Failed to get screen device format")?;
        let yuyv = FourCC::new(b"YUYV");
        let yu12 = FourCC::new(b"YU12");
        if fmt.fourcc != yuyv && fmt.fourcc != yu12 {
            bail!(
                "Unsupported screen device format {} (need YUYV or YU12)",
                fmt.fourcc
            );
        }

        if let Ok(mut params) = dev.params() {
            params.interval = v4l::Fraction::new(1, fps);
            let _ = dev.set_params(&params);
        }

        tracing::info!(
            "Screen device opened: {}x{} fourcc={}",
            fmt.width,
            fmt.height,
            fmt.fourcc,
        );

        let (tx, rx) = mpsc::channel::<YuvFrame>(2);
        let (width, height, fourcc) = (fmt.width, fmt.height, fmt.fourcc);

        let handle = std::thread::spawn(move || {
            if let Err(e) = capture_loop(dev, width, height, fourcc, tx) {
                tracing::info!("Screen capture ended: {:#}", e);
            }
        });

        Ok((ScreenCapture { _handle: handle }, rx, width, height))
    }
}
