//! H.264 encoding via the `openh264` crate (v0.5 API).
//!
//! Takes I420 YUV frames, produces Annex-B bitstream (start codes kept —
//! the track's RTP payloader splits NAL units itself). Decode has no user
//! here: received video is not rendered.

use anyhow::{Context, Result};
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;

/// Wrapper to pass raw I420 data directly to the openh264 encoder.
struct RawI420<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
}

impl<'a> YUVSource for RawI420<'a> {
    fn width(&self) -> i32 {
        self.width as i32
    }
    fn height(&self) -> i32 {
        self.height as i32
    }
    fn y(&self) -> &[u8] {
        &self.data[..self.width * self.height]
    }
    fn u(&self) -> &[u8] {
        let y_size = self.width * self.height;
        let uv_size = (self.width / 2) * (self.height / 2);
        &self.data[y_size..y_size + uv_size]
    }
    fn v(&self) -> &[u8] {
        let y_size = self.width * self.height;
        let uv_size = (self.width / 2) * (self.height / 2);
        &self.data[y_size + uv_size..y_size + uv_size * 2]
    }
    fn y_stride(&self) -> i32 {
        self.width as i32
    }
    fn u_stride(&self) -> i32 {
        (self.width / 2) as i32
    }
    fn v_stride(&self) -> i32 {
        (self.width / 2) as i32
    }
}

/// H.264 encoder wrapper.
pub struct H264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
}

impl H264Encoder {
    /// Create a new encoder for the given resolution.
    pub fn new(width: u32, height: u32, fps: f32, bitrate_kbps: u32) -> Result<Self> {
        let api = OpenH264API::from_source();
        let config = EncoderConfig::new(width, height)
            .max_frame_rate(fps)
            .set_bitrate_bps(bitrate_kbps * 1000);

        let encoder =
            Encoder::with_config(api, config).context("Failed to create openh264 encoder")?;

        Ok(Self {
            encoder,
            width,
            height,
        })
    }

    /// Encode one raw I420 frame into an Annex-B access unit.
    ///
    /// Returns an empty buffer when the encoder produces nothing for the
    /// frame (e.g. skipped frames under bitrate pressure).
    pub fn encode(&mut self, yuv_data: &[u8]) -> Result<Vec<u8>> {
        let expected_size = (self.width * self.height * 3 / 2) as usize;
        if yuv_data.len() < expected_size {
            anyhow::bail!(
                "YUV frame too small: {} bytes, expected {}",
                yuv_data.len(),
                expected_size
            );
        }

        let yuv = RawI420 {
            data: yuv_data,
            width: self.width as usize,
            height: self.height as usize,
        };

        let bitstream = self.encoder.encode(&yuv).context("openh264 encode failed")?;

        // openh264 emits NAL units with start codes; concatenated they are
        // exactly the Annex-B access unit the payloader expects.
        let mut annexb = Vec::new();
        for layer_idx in 0..bitstream.num_layers() {
            if let Some(layer) = bitstream.layer(layer_idx) {
                for nal_idx in 0..layer.nal_count() {
                    if let Some(nal_data) = layer.nal_unit(nal_idx) {
                        annexb.extend_from_slice(nal_data);
                    }
                }
            }
        }

        Ok(annexb)
    }
}
