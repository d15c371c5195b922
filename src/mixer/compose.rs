//! Software compositor.
//!
//! Each layer's image spans [-1, 1]² in its own normalized space and is placed
//! into the output's normalized space by its transform. Output pixels covered
//! by a layer are inverse-mapped back into the layer's image and
//! nearest-sampled.

use crate::mixer::transform::Mat4;
use crate::pipeline::types::{BYTES_PER_PIXEL, VideoFrame};

/// One source's contribution to a mix pass
#[derive(Debug, Clone)]
pub struct Layer {
    pub frame: VideoFrame,
    /// Placement already combined with the source's orientation
    pub transform: Mat4,
    pub blends: bool,
}

/// RGBA8 working buffer geometry
#[derive(Debug, Clone, Copy)]
pub struct Canvas {
    width: u32,
    height: u32,
}

const BACKGROUND: [u8; 4] = [0, 0, 0, 255];

const UNIT_SQUARE: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Fill with opaque black
    pub fn clear(&self, buf: &mut [u8]) {
        for px in buf[..self.frame_len()].chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&BACKGROUND);
        }
    }

    /// Clear, then paint `layers` in the order given
    pub fn compose(&self, buf: &mut [u8], layers: &[Layer]) {
        self.clear(buf);
        for layer in layers {
            self.draw(buf, layer);
        }
    }

    /// Pixel-space bounding box `(x0, y0, x1, y1)`, end-exclusive, of the
    /// area a transform can touch. `None` if it misses the canvas.
    fn coverage(&self, transform: &Mat4) -> Option<(u32, u32, u32, u32)> {
        let (w, h) = (self.width as f32, self.height as f32);
        let mut min = (f32::INFINITY, f32::INFINITY);
        let mut max = (f32::NEG_INFINITY, f32::NEG_INFINITY);

        for (x, y) in UNIT_SQUARE {
            // A corner at infinity: the image may cover anything
            let Some((px, py)) = transform.transform_point(x, y) else {
                return Some((0, 0, self.width, self.height));
            };
            min = (min.0.min(px), min.1.min(py));
            max = (max.0.max(px), max.1.max(py));
        }

        let x0 = ((min.0 + 1.0) * 0.5 * w).floor().clamp(0.0, w);
        let y0 = ((min.1 + 1.0) * 0.5 * h).floor().clamp(0.0, h);
        let x1 = ((max.0 + 1.0) * 0.5 * w).ceil().clamp(0.0, w);
        let y1 = ((max.1 + 1.0) * 0.5 * h).ceil().clamp(0.0, h);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }

    pub fn draw(&self, buf: &mut [u8], layer: &Layer) {
        let Some(inverse) = layer.transform.planar_inverse() else {
            return;
        };
        let Some((x0, y0, x1, y1)) = self.coverage(&layer.transform) else {
            return;
        };

        let frame = &layer.frame;
        if !frame.is_well_formed() {
            return;
        }
        let (fw, fh) = (frame.width as f32, frame.height as f32);
        let (w, h) = (self.width as f32, self.height as f32);

        for y in y0..y1 {
            let ny = (y as f32 + 0.5) / h * 2.0 - 1.0;
            let row = y as usize * self.width as usize;
            for x in x0..x1 {
                let nx = (x as f32 + 0.5) / w * 2.0 - 1.0;
                let Some((sx, sy)) = inverse.apply(nx, ny) else {
                    continue;
                };
                if !(-1.0..=1.0).contains(&sx) || !(-1.0..=1.0).contains(&sy) {
                    continue;
                }
                let u = (((sx + 1.0) * 0.5 * fw) as u32).min(frame.width - 1);
                let v = (((sy + 1.0) * 0.5 * fh) as u32).min(frame.height - 1);
                let src = frame.pixel(u, v);

                let i = (row + x as usize) * BYTES_PER_PIXEL;
                let dst = &mut buf[i..i + BYTES_PER_PIXEL];
                if layer.blends {
                    blend_over(dst, src);
                } else {
                    dst.copy_from_slice(&src);
                }
            }
        }
    }
}

/// Straight-alpha source-over
#[inline]
fn blend_over(dst: &mut [u8], src: [u8; 4]) {
    let sa = src[3] as u32;
    if sa == 255 {
        dst.copy_from_slice(&src);
        return;
    }
    if sa == 0 {
        return;
    }
    let inv = 255 - sa;
    for c in 0..3 {
        dst[c] = ((src[c] as u32 * sa + dst[c] as u32 * inv + 127) / 255) as u8;
    }
    dst[3] = (sa + (dst[3] as u32 * inv + 127) / 255) as u8;
}
