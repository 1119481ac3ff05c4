//! VP8 encoding and RTP packetization for the video track.
//!
//! The encoder itself sits behind [`VideoEncoder`] so the FFmpeg-backed
//! implementation (feature `hwenc`) can be swapped for hardware H.264 later
//! without touching the session code. [`Vp8RtpAdapter`] owns the RTP
//! bookkeeping: 90 kHz clock at 30 fps (3000 ticks per frame), a wrapping
//! sequence counter across fragments, marker bit mirroring the keyframe flag,
//! and a random SSRC until the track binding overrides it.

use crate::capture::CapturedFrame;
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use webrtc::rtp::codecs::vp8::Vp8Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;

pub const CLOCK_RATE: u32 = 90_000;
pub const TARGET_FPS: u32 = 30;
pub const TIMESTAMP_STEP: u32 = CLOCK_RATE / TARGET_FPS;

const RTP_MTU: usize = 1200;
const VP8_PAYLOAD_TYPE: u8 = 96;

/// One encoded bitstream chunk. An encoder may emit several per input frame.
pub struct EncodedChunk {
    pub data: Bytes,
    pub keyframe: bool,
}

pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &CapturedFrame) -> Result<Vec<EncodedChunk>>;
}

pub type EncoderFactory = Box<dyn Fn(u32, u32) -> Result<Box<dyn VideoEncoder>> + Send>;

/// The production encoder factory, when one is compiled in.
pub fn platform_encoder_factory() -> Option<EncoderFactory> {
    #[cfg(feature = "hwenc")]
    {
        Some(Box::new(|width, height| {
            hw::Vp8HwEncoder::new(width, height).map(|e| Box::new(e) as Box<dyn VideoEncoder>)
        }))
    }
    #[cfg(not(feature = "hwenc"))]
    {
        None
    }
}

pub struct Vp8RtpAdapter {
    factory: Option<EncoderFactory>,
    encoder: Option<Box<dyn VideoEncoder>>,
    last_dims: Option<(u32, u32)>,
    timestamp: u32,
    sequence: u16,
    ssrc: u32,
    payloader: Vp8Payloader,
}

impl Vp8RtpAdapter {
    pub fn new(factory: Option<EncoderFactory>) -> Self {
        Self {
            factory,
            encoder: None,
            last_dims: None,
            timestamp: rand::random(),
            sequence: rand::random(),
            ssrc: rand::random(),
            payloader: Vp8Payloader::default(),
        }
    }

    /// Encode one captured frame into RTP packets ready for the video track.
    /// Errors surface as "encoder unavailable" to the caller, which then
    /// falls back to the still-image path; the adapter stays usable.
    pub fn packets_for(&mut self, frame: &CapturedFrame) -> Result<Vec<Packet>> {
        let dims = (frame.width, frame.height);
        if self.encoder.is_none() || self.last_dims != Some(dims) {
            let factory = self
                .factory
                .as_ref()
                .context("No VP8 encoder compiled in")?;
            self.encoder = None;
            self.encoder = Some(
                factory(frame.width, frame.height)
                    .with_context(|| format!("VP8 encoder init failed at {dims:?}"))?,
            );
            self.last_dims = Some(dims);
        }

        let Some(encoder) = self.encoder.as_mut() else {
            bail!("VP8 encoder missing");
        };
        let chunks = encoder.encode(frame)?;
        if chunks.is_empty() {
            bail!("VP8 encoder produced no output");
        }

        let timestamp = self.timestamp;
        self.timestamp = self.timestamp.wrapping_add(TIMESTAMP_STEP);

        let mut packets = Vec::new();
        for chunk in &chunks {
            let payloads = self
                .payloader
                .payload(RTP_MTU, &chunk.data)
                .context("VP8 payloading failed")?;
            for payload in payloads {
                let header = Header {
                    version: 2,
                    payload_type: VP8_PAYLOAD_TYPE,
                    sequence_number: self.sequence,
                    timestamp,
                    ssrc: self.ssrc,
                    marker: chunk.keyframe,
                    ..Default::default()
                };
                self.sequence = self.sequence.wrapping_add(1);
                packets.push(Packet { header, payload });
            }
        }
        Ok(packets)
    }

    /// Drop the encoder so the next frame reinitializes it (used after a
    /// connection reset to force a fresh keyframe).
    pub fn reset(&mut self) {
        self.encoder = None;
        self.last_dims = None;
    }
}

/// BGRA8 to planar I420, BT.601 limited range. The hwenc encoder consumes
/// this; kept unconditional so the conversion stays covered by tests.
pub fn bgra_to_i420(width: u32, height: u32, bgra: &[u8]) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut out = vec![0u8; w * h + 2 * w.div_ceil(2) * h.div_ceil(2)];
    let (y_plane, uv) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = uv.split_at_mut(w.div_ceil(2) * h.div_ceil(2));

    for row in 0..h {
        for col in 0..w {
            let i = (row * w + col) * 4;
            let (b, g, r) = (bgra[i] as i32, bgra[i + 1] as i32, bgra[i + 2] as i32);
            let y = (66 * r + 129 * g + 25 * b + 128 >> 8) + 16;
            y_plane[row * w + col] = y.clamp(16, 235) as u8;
            if row % 2 == 0 && col % 2 == 0 {
                let u = (-38 * r - 74 * g + 112 * b + 128 >> 8) + 128;
                let v = (112 * r - 94 * g - 18 * b + 128 >> 8) + 128;
                let ci = (row / 2) * w.div_ceil(2) + col / 2;
                u_plane[ci] = u.clamp(16, 240) as u8;
                v_plane[ci] = v.clamp(16, 240) as u8;
            }
        }
    }
    out
}

#[cfg(feature = "hwenc")]
mod hw {
    use super::*;
    use hwcodec::common::{DataFormat, Quality, RateControl};
    use hwcodec::ffmpeg::AVPixelFormat;
    use hwcodec::ffmpeg_ram::CodecInfo;
    use hwcodec::ffmpeg_ram::encode::{EncodeContext, Encoder as FfmpegEncoder};
    use tracing::info;

    /// VP8 via FFmpeg (VAAPI when present, libvpx otherwise).
    pub struct Vp8HwEncoder {
        inner: FfmpegEncoder,
        width: u32,
        height: u32,
        pts_ms: i64,
    }

    // The FFmpeg context carries raw pointers; encoding is serialized behind
    // the adapter, which is itself single-owner.
    unsafe impl Send for Vp8HwEncoder {}

    impl Vp8HwEncoder {
        pub fn new(width: u32, height: u32) -> Result<Self> {
            let probe = EncodeContext {
                name: String::new(),
                mc_name: None,
                width: width as i32,
                height: height as i32,
                pixfmt: AVPixelFormat::AV_PIX_FMT_YUV420P,
                align: 1,
                fps: TARGET_FPS as i32,
                gop: TARGET_FPS as i32,
                rc: RateControl::RC_CBR,
                quality: Quality::Quality_Default,
                kbs: 4000,
                q: 23,
                thread_count: 1,
            };
            let available: Vec<CodecInfo> = FfmpegEncoder::available_encoders(probe.clone(), None)
                .into_iter()
                .filter(|c| c.format == DataFormat::VP8)
                .collect();
            let codec = available
                .iter()
                .find(|c| c.name.contains("vaapi"))
                .or_else(|| available.first())
                .context("No VP8 encoder available")?;
            info!(codec = %codec.name, width, height, "Creating VP8 encoder");

            let ctx = EncodeContext {
                name: codec.name.clone(),
                ..probe
            };
            let inner = FfmpegEncoder::new(ctx)
                .map_err(|_| anyhow::anyhow!("FFmpeg VP8 encoder init failed"))?;
            Ok(Self {
                inner,
                width,
                height,
                pts_ms: 0,
            })
        }
    }

    impl VideoEncoder for Vp8HwEncoder {
        fn encode(&mut self, frame: &CapturedFrame) -> Result<Vec<EncodedChunk>> {
            let i420 = bgra_to_i420(self.width, self.height, &frame.pixels);
            let pts = self.pts_ms;
            self.pts_ms += 1000 / TARGET_FPS as i64;
            let frames = self
                .inner
                .encode(&i420, pts)
                .map_err(|_| anyhow::anyhow!("VP8 encode failed"))?;
            Ok(frames
                .drain(..)
                .map(|f| EncodedChunk {
                    data: Bytes::from(f.data),
                    keyframe: f.key == 1,
                })
                .collect())
        }
    }
}
