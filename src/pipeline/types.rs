//! Core types carried between pipeline stages

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::mixer::transform::Mat4;

/// Bytes per pixel of every video buffer moving through the pipeline (RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

/// Opaque identity of a live source.
///
/// Allocated from a process-wide counter, so two sources alive at the same
/// time never share an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

impl SourceId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value (tests, foreign handles)
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Timestamp representation for framed packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since the track started
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from duration since track start
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Convert to duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Milliseconds, as used by FLV tag timestamps
    pub fn as_millis(&self) -> u32 {
        (self.micros / 1000).clamp(0, u32::MAX as i64) as u32
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Kind of media a buffer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackType::Video => write!(f, "Video"),
            TrackType::Audio => write!(f, "Audio"),
        }
    }
}

/// Dimensions and placement of a video buffer
///
/// Placement fields left as `None` keep whatever the receiving compositor
/// already has for the source (identity transform, its registration layer,
/// opaque drawing).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoAttributes {
    /// Width of the buffer in pixels
    pub width: u32,
    /// Height of the buffer in pixels
    pub height: u32,
    /// Homogeneous transform from source space into output space
    pub transform: Option<Mat4>,
    /// Draw order key, lower layers are drawn first
    pub layer: Option<i32>,
    /// Composite alpha over existing content instead of overwriting it
    pub blends: Option<bool>,
}

impl VideoAttributes {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            transform: None,
            layer: None,
            blends: None,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_layer(mut self, layer: i32) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn with_blends(mut self, blends: bool) -> Self {
        self.blends = Some(blends);
        self
    }

    /// Byte length of a tightly packed buffer with these dimensions
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Envelope accompanying every buffer handed from one stage to the next
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferMetadata {
    /// Time since the previous buffer on this track
    pub timestamp_delta: Duration,
    /// Track the buffer belongs to
    pub track: TrackType,
    /// Producing source
    pub source: SourceId,
    /// Placement, video buffers only
    pub video: Option<VideoAttributes>,
}

impl BufferMetadata {
    /// Metadata for a video buffer
    pub fn video(source: SourceId, timestamp_delta: Duration, attributes: VideoAttributes) -> Self {
        Self {
            timestamp_delta,
            track: TrackType::Video,
            source,
            video: Some(attributes),
        }
    }

    /// Metadata for an audio buffer
    pub fn audio(source: SourceId, timestamp_delta: Duration) -> Self {
        Self {
            timestamp_delta,
            track: TrackType::Audio,
            source,
            video: None,
        }
    }
}

/// Envelope of a framed, transport-ready packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMetadata {
    /// Track-local timestamp of the packet
    pub timestamp: Timestamp,
    /// Size of the framed packet in bytes
    pub size: usize,
    /// Track the packet belongs to
    pub track: TrackType,
    /// Transport stream identifier of the track
    pub stream_id: u32,
}

/// A raw RGBA8 video buffer (straight alpha, tightly packed rows)
///
/// Pixels are reference counted: cloning is cheap and dropping the last
/// handle releases the allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl VideoFrame {
    /// Wrap pixel data, returns `None` if the data is shorter than the dimensions need
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Option<Self> {
        let frame = Self {
            width,
            height,
            pixels,
        };
        frame.is_well_formed().then_some(frame)
    }

    /// Non-empty, with enough pixel data for its dimensions
    pub fn is_well_formed(&self) -> bool {
        let needed = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        self.width != 0 && self.height != 0 && self.pixels.len() >= needed
    }

    /// A frame filled with a single RGBA colour
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * BYTES_PER_PIXEL)
            .collect();
        Self {
            width,
            height,
            pixels: Bytes::from(pixels),
        }
    }

    /// Build a frame from a buffer and the dimensions carried in its metadata
    pub fn from_metadata(data: Bytes, metadata: &BufferMetadata) -> Option<Self> {
        let video = metadata.video.as_ref()?;
        Self::new(video.width, video.height, data)
    }

    /// RGBA value at (x, y)
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_are_unique() {
        let a = SourceId::next();
        let b = SourceId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let meta = BufferMetadata::video(
            SourceId::next(),
            Duration::ZERO,
            VideoAttributes::new(4, 4),
        );
        assert!(VideoFrame::from_metadata(Bytes::from(vec![0u8; 63]), &meta).is_none());
        assert!(VideoFrame::from_metadata(Bytes::from(vec![0u8; 64]), &meta).is_some());
    }

    #[test]
    fn audio_metadata_has_no_frame() {
        let meta = BufferMetadata::audio(SourceId::next(), Duration::from_millis(23));
        assert!(VideoFrame::from_metadata(Bytes::from_static(&[1, 2, 3]), &meta).is_none());
    }

    #[test]
    fn hand_built_frames_can_be_checked() {
        let short = VideoFrame {
            width: 8,
            height: 8,
            pixels: Bytes::from(vec![0u8; 16]),
        };
        assert!(!short.is_well_formed());
        assert!(VideoFrame::solid(2, 2, [0; 4]).is_well_formed());
    }

    #[test]
    fn solid_frame_pixels() {
        let frame = VideoFrame::solid(3, 2, [1, 2, 3, 4]);
        assert_eq!(frame.size(), 24);
        assert_eq!(frame.pixel(2, 1), [1, 2, 3, 4]);
    }

    #[test]
    fn timestamp_millis() {
        let ts = Timestamp::from_duration(Duration::from_millis(1500)).add(Duration::from_micros(999));
        assert_eq!(ts.as_millis(), 1500);
        assert_eq!(Timestamp::from_micros(-5).as_millis(), 0);
    }
}
