use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Initial pool capacity. Unbounded pools keep at most twice this many idle frames.
const INITIAL_POOL_SIZE: usize = 4;

/// Pool of output frame allocations.
///
/// Emitted frames are handed back with [`FramePool::put`] while downstream may
/// still hold them; [`FramePool::take`] reclaims a frame once every other
/// handle is gone. Shareable between mixers of the same frame size.
pub struct FramePool {
    inner: Mutex<PoolInner>,
    frame_len: usize,
    max_outstanding: Option<usize>,
}

struct PoolInner {
    frames: VecDeque<Bytes>,
    allocated: usize,
}

impl FramePool {
    pub fn new(frame_len: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                frames: VecDeque::with_capacity(INITIAL_POOL_SIZE),
                allocated: 0,
            }),
            frame_len,
            max_outstanding: None,
        }
    }

    /// Cap the number of frames alive at once (pooled or held downstream)
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = Some(max);
        self
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Put a frame back after it was emitted. Downstream may still hold it.
    pub fn put(&self, frame: Bytes) {
        let mut inner = self.inner.lock();
        if frame.len() != self.frame_len {
            inner.allocated = inner.allocated.saturating_sub(1);
            return;
        }
        inner.frames.push_back(frame);
    }

    /// Forget a frame taken from the pool that will never be put back
    pub fn discard(&self) {
        let mut inner = self.inner.lock();
        inner.allocated = inner.allocated.saturating_sub(1);
    }

    /// Take a writable frame, reusing a released one when possible.
    ///
    /// Returns `None` when the outstanding bound is reached and every pooled
    /// frame is still referenced downstream.
    pub fn take(&self) -> Option<BytesMut> {
        let mut inner = self.inner.lock();

        // Scan each pooled frame at most once
        let available = inner.frames.len();
        for _ in 0..available {
            let Some(frame) = inner.frames.pop_front() else {
                break;
            };
            match frame.try_into_mut() {
                Ok(frame) => return Some(frame),
                Err(frame) => inner.frames.push_back(frame),
            }
        }

        if let Some(max) = self.max_outstanding
            && inner.allocated >= max
        {
            return None;
        }

        // Without a bound, keep the pool from growing without limit
        if self.max_outstanding.is_none() && inner.frames.len() >= INITIAL_POOL_SIZE * 2 {
            inner.frames.pop_front();
            inner.allocated = inner.allocated.saturating_sub(1);
        }

        inner.allocated += 1;
        Some(BytesMut::zeroed(self.frame_len))
    }

    /// Frames currently allocated through this pool
    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated
    }
}
