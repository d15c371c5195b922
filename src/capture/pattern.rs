//! Synthetic capture sources
//!
//! Stand-ins for real devices: a moving test card and a silent AAC stream.
//! Both run as tokio tasks and stop when their token is cancelled.

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assets::AAC_SAMPLES_PER_FRAME;
use crate::pipeline::types::VideoFrame;

/// Raw AAC-LC access units that decode to silence
const SILENT_AAC_STEREO: &[u8] = &[0x21, 0x00, 0x49, 0x90, 0x02, 0x19, 0x00, 0x23, 0x80];
const SILENT_AAC_MONO: &[u8] = &[0x01, 0x40, 0x20, 0x07];

/// Vertical color bars with a white bar sweeping across them
#[derive(Debug, Clone)]
pub struct TestPattern {
    width: u32,
    height: u32,
    fps: u32,
    tint: [u8; 4],
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            fps: fps.max(1),
            tint: [255, 255, 255, 255],
        }
    }

    /// Multiply every bar by this color; alpha below 255 makes the card
    /// translucent
    pub fn with_tint(mut self, tint: [u8; 4]) -> Self {
        self.tint = tint;
        self
    }

    pub fn frame(&self, index: u64) -> VideoFrame {
        const BARS: [[u8; 3]; 7] = [
            [192, 192, 192],
            [192, 192, 0],
            [0, 192, 192],
            [0, 192, 0],
            [192, 0, 192],
            [192, 0, 0],
            [0, 0, 192],
        ];
        let sweep = (index % self.width as u64) as u32;
        let mut pixels = BytesMut::with_capacity(self.width as usize * self.height as usize * 4);
        for _ in 0..self.height {
            for x in 0..self.width {
                let rgb = if x == sweep {
                    [255, 255, 255]
                } else {
                    BARS[(x as usize * BARS.len()) / self.width as usize]
                };
                for (c, t) in rgb.iter().zip(self.tint) {
                    pixels.put_u8(((*c as u16 * t as u16) / 255) as u8);
                }
                pixels.put_u8(self.tint[3]);
            }
        }
        VideoFrame {
            width: self.width,
            height: self.height,
            pixels: pixels.freeze(),
        }
    }

    /// Generate frames at the pattern's rate until `cancel` fires
    pub fn spawn<F>(self, cancel: CancellationToken, mut push: F) -> JoinHandle<u64>
    where
        F: FnMut(VideoFrame) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1) / self.fps);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut index = 0u64;
            info!("Test pattern {}x{} @ {} fps started", self.width, self.height, self.fps);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        push(self.frame(index));
                        index += 1;
                    }
                }
            }
            debug!("Test pattern stopped after {} frames", index);
            index
        })
    }
}

/// Silent AAC stream at real-time pace
#[derive(Debug, Clone, Copy)]
pub struct SilentAudio {
    sample_rate: u32,
    channels: u8,
}

impl SilentAudio {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels,
        }
    }

    /// Playback length of one access unit
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(AAC_SAMPLES_PER_FRAME as u64) / self.sample_rate
    }

    pub fn access_unit(&self) -> Bytes {
        if self.channels > 1 {
            Bytes::from_static(SILENT_AAC_STEREO)
        } else {
            Bytes::from_static(SILENT_AAC_MONO)
        }
    }

    pub fn spawn<F>(self, cancel: CancellationToken, mut push: F) -> JoinHandle<u64>
    where
        F: FnMut(Bytes, Duration) + Send + 'static,
    {
        tokio::spawn(async move {
            let duration = self.frame_duration();
            let mut interval = tokio::time::interval(duration);
            let mut sent = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        push(self.access_unit(), duration);
                        sent += 1;
                    }
                }
            }
            sent
        })
    }
}
