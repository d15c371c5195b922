//! Capture entry stage for the sender pipeline
//!
//! Platform capture lives outside this crate; whatever produces raw frames or
//! audio hands them to a [`CaptureSource`], which stamps them with its identity,
//! placement and timing before pushing them downstream.

use bytes::Bytes;
use log::trace;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::mixer::transform::Mat4;
use crate::pipeline::stage::{Output, OutputSlot, Source};
use crate::pipeline::types::{BufferMetadata, SourceId, VideoAttributes, VideoFrame};

#[derive(Debug, Clone, Copy)]
struct Placement {
    transform: Option<Mat4>,
    layer: Option<i32>,
    blends: Option<bool>,
}

/// Entry stage for one capture device or generator
pub struct CaptureSource {
    id: SourceId,
    name: String,
    output: OutputSlot<BufferMetadata>,
    placement: Mutex<Placement>,
    last_push: Mutex<Option<Instant>>,
}

impl CaptureSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SourceId::next(),
            name: name.into(),
            output: OutputSlot::new(),
            placement: Mutex::new(Placement {
                transform: None,
                layer: None,
                blends: None,
            }),
            last_push: Mutex::new(None),
        }
    }

    pub fn with_transform(self, transform: Mat4) -> Self {
        self.set_transform(transform);
        self
    }

    pub fn with_layer(self, layer: i32) -> Self {
        self.set_layer(layer);
        self
    }

    pub fn with_blends(self, blends: bool) -> Self {
        self.set_blends(blends);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placement carried with every following frame
    pub fn set_transform(&self, transform: Mat4) {
        self.placement.lock().transform = Some(transform);
    }

    pub fn set_layer(&self, layer: i32) {
        self.placement.lock().layer = Some(layer);
    }

    pub fn set_blends(&self, blends: bool) {
        self.placement.lock().blends = Some(blends);
    }

    /// Time since the previous push; zero for the first one
    fn next_delta(&self) -> Duration {
        let now = Instant::now();
        let mut last = self.last_push.lock();
        let delta = last.map_or(Duration::ZERO, |prev| now.saturating_duration_since(prev));
        *last = Some(now);
        delta
    }

    /// Push a raw frame. Returns `false` when no consumer is bound.
    pub fn push_video(&self, frame: VideoFrame) -> bool {
        let placement = *self.placement.lock();
        let mut attrs = VideoAttributes::new(frame.width, frame.height);
        attrs.transform = placement.transform;
        attrs.layer = placement.layer;
        attrs.blends = placement.blends;

        let metadata = BufferMetadata::video(self.id, self.next_delta(), attrs);
        trace!("[{}] video {}x{}", self.name, frame.width, frame.height);
        self.output.forward(frame.pixels, &metadata)
    }

    /// Push an encoded audio frame of known duration
    pub fn push_audio(&self, data: Bytes, duration: Duration) -> bool {
        let metadata = BufferMetadata::audio(self.id, duration);
        self.output.forward(data, &metadata)
    }
}

impl Source for CaptureSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn set_output(&self, output: &Arc<dyn Output>) {
        self.output.bind(output);
    }
}
