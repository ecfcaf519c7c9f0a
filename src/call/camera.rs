//! V4L2 camera capture — reads YUV420 (or YUYV) frames from /dev/video0.
//!
//! Uses the `v4l` crate with mmap streaming, converting YUYV to I420 when
//! needed. A dedicated capture thread pushes raw frames into a small channel;
//! the encode feed drops behind-schedule frames rather than buffering them.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// A captured YUV420 (I420) frame.
pub struct YuvFrame {
    pub width: u32,
    pub height: u32,
    /// Planar I420: Y plane (w*h), U plane (w*h/4), V plane (w*h/4).
    pub data: Vec<u8>,
}

/// Camera capture handle. Keeps the capture thread alive; dropping the
/// receiver ends it.
pub struct CameraCapture {
    _handle: std::thread::JoinHandle<()>,
}

impl CameraCapture {
    /// Open the camera and start capturing frames.
    ///
    /// Returns the handle, the frame receiver, and the resolution the device
    /// actually agreed to (which may differ from the request).
    /// `device_path` defaults to "/dev/video0" if None.
    pub fn start(
        device_path: Option<&str>,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<(Self, mpsc::Receiver<YuvFrame>, u32, u32)> {
        let path = device_path.unwrap_or("/dev/video0");
        let dev = Device::with_path(path)
            .with_context(|| format!("Failed to open camera at {}", path))?;
        let (actual_w, actual_h, fourcc) = configure(&dev, width, height, fps)
            .with_context(|| format!("Failed to configure camera at {}", path))?;

        tracing::info!(
            "Camera opened: {}x{} fourcc={} (requested {}x{} @ {}fps)",
            actual_w,
            actual_h,
            fourcc,
            width,
            height,
            fps,
        );

        let (tx, rx) = mpsc::channel::<YuvFrame>(2); // small buffer, drop old frames

        let handle = std::thread::spawn(move || {
            if let Err(e) = capture_loop(dev, actual_w, actual_h, fourcc, tx) {
                tracing::error!("Camera capture loop exited: {:#}", e);
            }
        });

        Ok((CameraCapture { _handle: handle }, rx, actual_w, actual_h))
    }
}

/// Negotiate format and frame rate with the device. Prefers YUYV (most USB
/// cameras), falls back to MJPG just to have a working stream.
fn configure(dev: &Device, width: u32, height: u32, fps: u32) -> Result<(u32, u32, FourCC)> {
    let mut fmt = dev.format().context("Failed to get camera format")?;
    fmt.width = width;
    fmt.height = height;

    fmt.fourcc = FourCC::new(b"YUYV");
    let actual_fmt = match dev.set_format(&fmt) {
        Ok(f) => f,
        Err(_) => {
            fmt.fourcc = FourCC::new(b"MJPG");
            dev.set_format(&fmt)
                .context("Failed to set camera format (tried YUYV and MJPG)")?
        }
    };

    if let Ok(mut params) = dev.params() {
        params.interval = v4l::Fraction::new(1, fps);
        let _ = dev.set_params(&params);
    }

    Ok((actual_fmt.width, actual_fmt.height, actual_fmt.fourcc))
}

/// Main capture loop — runs on a dedicated thread.
pub(super) fn capture_loop(
    dev: Device,
    width: u32,
    height: u32,
    fourcc: FourCC,
    tx: mpsc::Sender<YuvFrame>,
) -> Result<()> {
    let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
        .context("Failed to start V4L2 mmap stream")?;

    loop {
        let (buf, _meta) = stream.next().context("Failed to read camera frame")?;

        let yuv_data = if fourcc == FourCC::new(b"YUYV") {
            yuyv_to_i420(buf, width, height)
        } else {
            // If format is already I420/YU12, use as-is
            buf.to_vec()
        };

        let frame = YuvFrame {
            width,
            height,
            data: yuv_data,
        };

        // Non-blocking send — drop the frame if the encoder is behind.
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => break, // feed gone, exit
        }
    }

    Ok(())
}

/// Capture ~3s from the camera and report the achieved frame rate.
pub async fn cam_test(device_path: Option<&str>) -> Result<()> {
    use anyhow::bail;

    println!("=== Camera Test ===");
    println!("Capturing 3 seconds of video...\n");

    let (capture, mut rx, w, h) =
        CameraCapture::start(device_path, 320, 240, 15).context("Failed to start camera")?;
    println!("  Device format: {}x{}", w, h);

    let mut count = 0usize;
    let start = std::time::Instant::now();
    let duration = std::time::Duration::from_secs(3);

    while start.elapsed() < duration {
        match tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await {
            Ok(Some(frame)) => {
                if count == 0 {
                    println!(
                        "  First frame: {}x{} ({} bytes)",
                        frame.width,
                        frame.height,
                        frame.data.len()
                    );
                }
                count += 1;
            }
            Ok(None) => bail!("Camera disconnected during capture"),
            Err(_) => continue, // no frame yet
        }
    }
    drop(capture);

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nCaptured {} frames in {:.3}s ({:.1} fps)",
        count,
        elapsed,
        count as f64 / elapsed,
    );
    if count == 0 {
        bail!("No frames captured");
    }
    Ok(())
}

/// Convert YUYV (YUV 4:2:2 packed) to I420 (YUV 4:2:0 planar).
fn yuyv_to_i420(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut out = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for row in 0..h {
        for col in (0..w).step_by(2) {
            let yuyv_offset = (row * w + col) * 2;
            if yuyv_offset + 3 >= yuyv.len() {
                break;
            }
            let y0 = yuyv[yuyv_offset];
            let u = yuyv[yuyv_offset + 1];
            let y1 = yuyv[yuyv_offset + 2];
            let v = yuyv[yuyv_offset + 3];

            y_plane[row * w + col] = y0;
            y_plane[row * w + col + 1] = y1;

            // Subsample U/V by 2x2
            if row % 2 == 0 {
                let uv_row = row / 2;
                let uv_col = col / 2;
                u_plane[uv_row * (w / 2) + uv_col] = u;
                v_plane[uv_row * (w / 2) + uv_col] = v;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_i420_plane_sizes() {
        let w = 4u32;
        let h = 2u32;
        let yuyv = vec![0x80u8; (w * h * 2) as usize];
        let i420 = yuyv_to_i420(&yuyv, w, h);
        assert_eq!(i420.len(), (w * h + (w / 2) * (h / 2) * 2) as usize);
    }

    #[test]
    fn test_yuyv_to_i420_sample_placement() {
        // One 2x2 block: pixels (Y0 U Y1 V) per pair.
        let w = 2u32;
        let h = 2u32;
        #[rustfmt::skip]
        let yuyv = vec![
            10, 90, 20, 110, // row 0: Y0=10 U=90 Y1=20 V=110
            30, 91, 40, 111, // row 1: Y0=30 U=91 Y1=40 V=111
        ];
        let i420 = yuyv_to_i420(&yuyv, w, h);
        assert_eq!(&i420[..4], &[10, 20, 30, 40]); // Y plane row-major
        assert_eq!(i420[4], 90); // U from even row
        assert_eq!(i420[5], 110); // V from even row
    }
}
