//! Per-source image filters.

use bytes::Bytes;

use crate::error::FilterError;
use crate::pipeline::types::{BYTES_PER_PIXEL, VideoFrame};

/// An image operation applied to a source's frames before they are composited.
///
/// Filters run on the mixer's job queue, never on the producer's thread and
/// never on the mix thread.
pub trait VideoFilter: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, frame: &VideoFrame) -> Result<VideoFrame, FilterError>;
}

fn map_pixels(frame: &VideoFrame, mut f: impl FnMut(&mut [u8])) -> VideoFrame {
    let len = frame.width as usize * frame.height as usize * BYTES_PER_PIXEL;
    let mut out = frame.pixels[..len].to_vec();
    for px in out.chunks_exact_mut(BYTES_PER_PIXEL) {
        f(px);
    }
    VideoFrame {
        width: frame.width,
        height: frame.height,
        pixels: Bytes::from(out),
    }
}

/// Rec. 601 luma, alpha untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct Grayscale;

impl VideoFilter for Grayscale {
    fn name(&self) -> &str {
        "grayscale"
    }

    fn apply(&self, frame: &VideoFrame) -> Result<VideoFrame, FilterError> {
        Ok(map_pixels(frame, |px| {
            let y = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
            px[0] = y as u8;
            px[1] = y as u8;
            px[2] = y as u8;
        }))
    }
}

/// Scales alpha by a constant factor
#[derive(Debug, Clone, Copy)]
pub struct Opacity {
    factor: f32,
}

impl Opacity {
    pub fn new(factor: f32) -> Self {
        Self {
            factor: factor.clamp(0.0, 1.0),
        }
    }
}

impl VideoFilter for Opacity {
    fn name(&self) -> &str {
        "opacity"
    }

    fn apply(&self, frame: &VideoFrame) -> Result<VideoFrame, FilterError> {
        let factor = self.factor;
        Ok(map_pixels(frame, |px| {
            px[3] = (px[3] as f32 * factor).round() as u8;
        }))
    }
}
