//! Real-time multi-source video compositor
//!
//! # Threads
//!
//! - Producer threads call [`Output::accept_buffer`]; the call only swaps the
//!   source's latest frame under the state lock, or hands it to the filter
//!   queue when the source has a filter.
//! - The mix thread wakes on its own clock, snapshots the table under the same
//!   lock, then composites and emits with the lock released.
//! - The job queue runs per-source filters.
//!
//! # Timing
//!
//! The mix thread never waits on a source. A source without a fresh frame is
//! simply left out of the pass. When the thread falls more than
//! `max_lag_frames` behind (a slow host, or a resume after a long pause) the
//! clock skips to the next tick at or after "now"; missed ticks are dropped,
//! not replayed.

use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::assets::{FRAME_HEIGHT, FRAME_RATE, FRAME_WIDTH, MAX_LAG_FRAMES, STALE_AFTER};
use crate::error::{FilterError, MixerError};
use crate::mixer::compose::Canvas;
use crate::mixer::filter::VideoFilter;
use crate::mixer::frame_pool::FramePool;
use crate::mixer::job_queue::JobQueue;
use crate::mixer::source_table::{SourceRecord, SourceTable};
use crate::mixer::transform::{Mat4, Orientation};
use crate::pipeline::clock::MixClock;
use crate::pipeline::events::{EventSender, SessionEvent};
use crate::pipeline::health::MixerHealth;
use crate::pipeline::stage::{Output, OutputSlot, Source, Transform};
use crate::pipeline::state::MixerState;
use crate::pipeline::types::{BufferMetadata, SourceId, VideoAttributes, VideoFrame};

/// Constructor-time mixer configuration
#[derive(Clone)]
pub struct MixerConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    /// Time between two composited frames
    pub frame_duration: Duration,
    /// A source frame older than this is left out of the mix
    pub stale_after: Duration,
    /// Lag, in frames, beyond which the clock skips ahead instead of catching up
    pub max_lag_frames: u32,
    /// Shared output pool; the mixer creates an unbounded one when `None`
    pub pool: Option<Arc<FramePool>>,
}

impl MixerConfig {
    pub fn new(frame_width: u32, frame_height: u32, frame_duration: Duration) -> Self {
        Self {
            frame_width,
            frame_height,
            frame_duration,
            stale_after: STALE_AFTER,
            max_lag_frames: MAX_LAG_FRAMES,
            pool: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_max_lag_frames(mut self, frames: u32) -> Self {
        self.max_lag_frames = frames;
        self
    }

    pub fn with_pool(mut self, pool: Arc<FramePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn frame_len(&self) -> usize {
        Canvas::new(self.frame_width, self.frame_height).frame_len()
    }

    fn validate(&self) -> Result<(), MixerError> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(MixerError::InvalidConfig(format!(
                "frame size {}x{}",
                self.frame_width, self.frame_height
            )));
        }
        if self.frame_duration.is_zero() {
            return Err(MixerError::InvalidConfig("zero frame duration".into()));
        }
        if self.max_lag_frames == 0 {
            return Err(MixerError::InvalidConfig("max_lag_frames must be at least 1".into()));
        }
        if let Some(pool) = &self.pool
            && pool.frame_len() != self.frame_len()
        {
            return Err(MixerError::InvalidConfig(format!(
                "pool frames are {} bytes, mixer needs {}",
                pool.frame_len(),
                self.frame_len()
            )));
        }
        Ok(())
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self::new(
            FRAME_WIDTH,
            FRAME_HEIGHT,
            Duration::from_secs(1) / FRAME_RATE,
        )
    }
}

/// State guarded by the mixer's lock
struct Shared {
    table: SourceTable,
    clock: MixClock,
    /// `set_epoch` was called before `start`
    epoch_pinned: bool,
    state: MixerState,
    /// Set on resume; the next pass realigns with the wall clock first
    catching_up: bool,
}

struct Inner {
    id: SourceId,
    config: MixerConfig,
    pool: Arc<FramePool>,
    shared: Mutex<Shared>,
    wake: Condvar,
    exiting: AtomicBool,
    /// Held while emitting, so no frame leaves after `stop` or a pause
    /// returns from it
    emit: Mutex<()>,
    mix_thread: Mutex<Option<ThreadId>>,
    output: OutputSlot<BufferMetadata>,
    jobs: JobQueue,
    events: EventSender,
    health: Arc<MixerHealth>,
}

/// Composites registered sources into one frame per tick.
///
/// Implements [`Output`] (sources push into it), [`Source`] (it pushes
/// composited frames downstream) and [`Transform`].
pub struct VideoMixer {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoMixer {
    pub fn new(config: MixerConfig, events: EventSender) -> Result<Self, MixerError> {
        config.validate()?;

        let pool = config
            .pool
            .clone()
            .unwrap_or_else(|| Arc::new(FramePool::new(config.frame_len())));
        let jobs = JobQueue::new("castmix-filters")?;

        let inner = Inner {
            id: SourceId::next(),
            shared: Mutex::new(Shared {
                table: SourceTable::new(),
                clock: MixClock::new(Instant::now(), config.frame_duration),
                epoch_pinned: false,
                state: MixerState::Idle,
                catching_up: false,
            }),
            config,
            pool,
            wake: Condvar::new(),
            exiting: AtomicBool::new(false),
            emit: Mutex::new(()),
            mix_thread: Mutex::new(None),
            output: OutputSlot::new(),
            jobs,
            events,
            health: Arc::new(MixerHealth::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
            thread: Mutex::new(None),
        })
    }

    /// Add a source on top of the current layers.
    ///
    /// `buffer_size` is the expected byte size of the source's frames; it is
    /// only used to flag mismatching buffers in the logs.
    pub fn register_source(&self, source: &Arc<dyn Source>, buffer_size: usize) -> Result<(), MixerError> {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_shutting_down() {
            return Ok(());
        }
        shared.table.register(source, buffer_size)?;
        debug!(
            "[mixer] registered source {} ({} sources)",
            source.id(),
            shared.table.len()
        );
        Ok(())
    }

    /// Remove a source and release its frame. Returns `false` if it was not
    /// registered.
    pub fn unregister_source(&self, id: SourceId) -> bool {
        let mut shared = self.inner.shared.lock();
        let removed = shared.table.unregister(id);
        if removed {
            debug!("[mixer] unregistered source {}", id);
        }
        removed
    }

    /// Attach a filter to a source, or clear it with `None`.
    /// The mixer keeps only a weak reference.
    pub fn set_source_filter(&self, id: SourceId, filter: Option<&Arc<dyn VideoFilter>>) -> Result<(), MixerError> {
        self.with_record(id, |record| {
            record.filter = filter.map(Arc::downgrade);
        })
    }

    pub fn set_source_orientation(&self, id: SourceId, orientation: Orientation) -> Result<(), MixerError> {
        self.with_record(id, |record| record.orientation = orientation)
    }

    pub fn set_source_transform(&self, id: SourceId, transform: Mat4) -> Result<(), MixerError> {
        self.with_record(id, |record| record.transform = transform)
    }

    pub fn set_source_blends(&self, id: SourceId, blends: bool) -> Result<(), MixerError> {
        self.with_record(id, |record| record.blends = blends)
    }

    pub fn set_source_layer(&self, id: SourceId, layer: i32) -> Result<(), MixerError> {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_shutting_down() {
            return Ok(());
        }
        shared.table.set_layer(id, layer)
    }

    fn with_record(
        &self,
        id: SourceId,
        f: impl FnOnce(&mut SourceRecord),
    ) -> Result<(), MixerError> {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_shutting_down() {
            return Ok(());
        }
        let record = shared
            .table
            .get_mut(id)
            .ok_or(MixerError::UnknownSource(id))?;
        f(record);
        Ok(())
    }

    /// Spawn the mix thread. The first tick is due immediately, or at the
    /// epoch given to [`Transform::set_epoch`].
    pub fn start(&self) -> Result<(), MixerError> {
        let mut thread_slot = self.thread.lock();
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != MixerState::Idle {
                return Ok(());
            }
            if !shared.epoch_pinned {
                shared.clock.set_epoch(Instant::now());
            }
            shared.state = MixerState::Running {
                started_at: Instant::now(),
            };
        }

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("castmix-mixer".into())
            .spawn(move || mix_loop(inner));

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                info!(
                    "[mixer] started {}x{} @ {:?}",
                    self.inner.config.frame_width,
                    self.inner.config.frame_height,
                    self.inner.config.frame_duration
                );
                Ok(())
            }
            Err(e) => {
                self.inner.shared.lock().state = MixerState::Idle;
                Err(e.into())
            }
        }
    }

    /// Pause or resume emission. Producers may keep pushing while paused.
    ///
    /// Once a pause returns, no further frame is emitted until the resume.
    pub fn mix_paused(&self, paused: bool) {
        let _emit = (!self.inner.on_mix_thread()).then(|| self.inner.emit.lock());
        let mut shared = self.inner.shared.lock();
        let now = Instant::now();
        let target = if paused {
            MixerState::Paused { paused_at: now }
        } else {
            MixerState::Running { started_at: now }
        };
        if paused == shared.state.is_paused() || !shared.state.can_transition_to(&target) {
            return;
        }
        shared.state = target;
        if !paused {
            shared.catching_up = true;
        }
        debug!("[mixer] {}", shared.state);
        self.inner.wake.notify_all();
    }

    /// Realign the next mix time with the wall clock
    pub fn sync(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_shutting_down() {
            return;
        }
        let skipped = shared.clock.resync(Instant::now());
        if skipped > 0 {
            debug!("[mixer] sync skipped {} ticks", skipped);
        }
        self.inner.wake.notify_all();
    }

    /// Stop the mix thread and wait for it. Idempotent.
    pub fn stop(&self) {
        let mut thread_slot = self.thread.lock();
        let on_mix_thread = thread_slot
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id());

        {
            // Emission in progress finishes first, none starts afterwards
            let _emit = (!on_mix_thread).then(|| self.inner.emit.lock());
            let mut shared = self.inner.shared.lock();
            if shared.state == MixerState::Stopped {
                return;
            }
            if shared.state != MixerState::Exiting {
                shared.state = MixerState::Exiting;
            }
            self.inner.exiting.store(true, Ordering::Release);
            self.inner.wake.notify_all();
        }

        if on_mix_thread {
            return;
        }
        if let Some(handle) = thread_slot.take()
            && handle.join().is_err()
        {
            error!("[mixer] mix thread panicked");
        }
        self.inner.jobs.shutdown();
        self.inner.shared.lock().state = MixerState::Stopped;
        info!("[mixer] stopped");
    }

    pub fn state(&self) -> MixerState {
        self.inner.shared.lock().state
    }

    pub fn health(&self) -> Arc<MixerHealth> {
        self.inner.health.clone()
    }

    pub fn source_count(&self) -> usize {
        self.inner.shared.lock().table.len()
    }

    /// Registered sources in draw order
    pub fn layer_order(&self) -> Vec<SourceId> {
        self.inner.shared.lock().table.draw_order()
    }

    /// Latest stored frame of a source
    pub fn source_frame(&self, id: SourceId) -> Option<VideoFrame> {
        let shared = self.inner.shared.lock();
        shared.table.get(id).and_then(|r| r.frame().cloned())
    }

    #[cfg(test)]
    fn corrupt_layer_map(&self, id: SourceId) {
        self.inner.shared.lock().table.corrupt_for_test(id);
    }
}

impl Drop for VideoMixer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Output for VideoMixer {
    fn accept_buffer(&self, data: Bytes, metadata: &BufferMetadata) {
        self.inner.accept(data, metadata);
    }
}

impl Source for VideoMixer {
    fn id(&self) -> SourceId {
        self.inner.id
    }

    fn set_output(&self, output: &Arc<dyn Output>) {
        let _shared = self.inner.shared.lock();
        self.inner.output.bind(output);
    }
}

impl Transform for VideoMixer {
    fn set_epoch(&self, epoch: Instant) {
        let mut shared = self.inner.shared.lock();
        shared.clock.set_epoch(epoch);
        shared.epoch_pinned = true;
        self.inner.wake.notify_all();
    }
}

impl Inner {
    fn accept(self: &Arc<Self>, data: Bytes, metadata: &BufferMetadata) {
        if self.exiting.load(Ordering::Acquire) {
            return;
        }
        let (Some(attrs), Some(frame)) = (metadata.video, VideoFrame::from_metadata(data, metadata)) else {
            self.health.record_rejected();
            return;
        };

        let now = Instant::now();
        let pending = {
            let mut shared = self.shared.lock();
            if shared.state.is_shutting_down() {
                return;
            }
            let Some(record) = shared.table.get_mut(metadata.source) else {
                self.health.record_rejected();
                return;
            };

            if let Some(transform) = attrs.transform {
                record.transform = transform;
            }
            if let Some(blends) = attrs.blends {
                record.blends = blends;
            }
            if record.size_hint != 0 && record.size_hint != frame.size() {
                debug!(
                    "[mixer] source {} pushed {} bytes, registered for {}",
                    metadata.source,
                    frame.size(),
                    record.size_hint
                );
                record.size_hint = frame.size();
            }
            record.push_seq += 1;
            let seq = record.push_seq;
            let generation = record.generation;

            let pending = match record.filter() {
                Some(filter) => Some((filter, generation, seq, frame)),
                None => {
                    record.store(seq, frame, now);
                    None
                }
            };

            if let Some(layer) = attrs.layer {
                // record exists, cannot fail
                let _ = shared.table.set_layer(metadata.source, layer);
            }
            pending
        };
        self.health.record_accepted();

        if let Some((filter, generation, seq, frame)) = pending {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let source = metadata.source;
            let unfiltered = frame.clone();
            let queued = self.jobs.enqueue(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_filter(source, generation, seq, filter, frame);
                }
            });
            if !queued {
                warn!("[mixer] filter queue closed, keeping source {} unfiltered", source);
                self.store_frame(source, generation, seq, unfiltered);
            }
        }
    }

    fn on_mix_thread(&self) -> bool {
        self.mix_thread
            .lock()
            .is_some_and(|id| id == thread::current().id())
    }

    fn store_frame(&self, source: SourceId, generation: u64, seq: u64, frame: VideoFrame) {
        let mut shared = self.shared.lock();
        if let Some(record) = shared.table.get_mut(source)
            && record.generation == generation
        {
            record.store(seq, frame, Instant::now());
        }
    }

    /// Runs on the job queue
    fn apply_filter(&self, source: SourceId, generation: u64, seq: u64, filter: Arc<dyn VideoFilter>, frame: VideoFrame) {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| filter.apply(&frame))) {
            Ok(Ok(filtered)) if !filtered.is_well_formed() => Err(FilterError::Unsupported {
                width: filtered.width,
                height: filtered.height,
                reason: format!("filter returned {} bytes of pixels", filtered.pixels.len()),
            }),
            Ok(result) => result,
            Err(_) => Err(FilterError::Backend("filter panicked".into())),
        };

        let mut shared = self.shared.lock();
        let Some(record) = shared.table.get_mut(source) else {
            return;
        };
        // re-registered since the job was queued
        if record.generation != generation {
            return;
        }

        match result {
            Ok(filtered) => {
                record.store(seq, filtered, Instant::now());
            }
            Err(e) => {
                drop(shared);
                warn!("[mixer] filter '{}' failed on source {}: {}", filter.name(), source, e);
                self.events.send(SessionEvent::FilterFailed {
                    source,
                    filter: filter.name().to_string(),
                    reason: e.to_string(),
                });
                self.health.record_filter_failure();
            }
        }
    }

    fn metadata(&self, delta: Duration) -> BufferMetadata {
        BufferMetadata::video(
            self.id,
            delta,
            VideoAttributes::new(self.config.frame_width, self.config.frame_height),
        )
    }
}

fn mix_loop(inner: Arc<Inner>) {
    *inner.mix_thread.lock() = Some(thread::current().id());
    info!("[mixer] mix thread running");
    let canvas = Canvas::new(inner.config.frame_width, inner.config.frame_height);

    loop {
        let (layers, mut buffer, delta, output) = {
            let mut shared = inner.shared.lock();

            // Wait for the next due tick
            loop {
                if inner.exiting.load(Ordering::Acquire) {
                    info!("[mixer] mix thread exiting");
                    return;
                }
                if shared.state.is_paused() {
                    inner.wake.wait(&mut shared);
                    continue;
                }

                let now = Instant::now();
                let lagging = shared.clock.is_behind(now, inner.config.max_lag_frames);
                if shared.catching_up || lagging {
                    let skipped = shared.clock.resync(now);
                    if skipped > 0 {
                        inner.health.record_catch_up();
                        debug!("[mixer] catch-up skipped {} ticks", skipped);
                    }
                    shared.catching_up = false;
                }

                let next = shared.clock.next_mix_time();
                if now >= next {
                    break;
                }
                inner.wake.wait_until(&mut shared, next);
            }

            for id in shared.table.reap_dead() {
                debug!("[mixer] source {} went away", id);
            }
            if let Err(e) = shared.table.check_consistency() {
                error!("[mixer] {}; aborting mix loop", e);
                shared.state = MixerState::Exiting;
                inner.exiting.store(true, Ordering::Release);
                drop(shared);
                inner.events.send(SessionEvent::Fatal {
                    reason: e.to_string(),
                });
                return;
            }

            // Nothing bound: keep time, skip the work
            let Some(output) = inner.output.get() else {
                shared.clock.skip();
                continue;
            };

            let Some(buffer) = inner.pool.take() else {
                shared.clock.skip();
                drop(shared);
                warn!("[mixer] output pool exhausted, skipping frame");
                inner.health.record_pool_exhausted();
                inner.events.send(SessionEvent::PoolExhausted { source: None });
                continue;
            };

            let snapshot = shared
                .table
                .snapshot(Instant::now(), inner.config.stale_after);
            for _ in 0..snapshot.skipped {
                inner.health.record_stale_skip();
            }
            let delta = shared.clock.advance();
            (snapshot.layers, buffer, delta, output)
        };

        canvas.compose(&mut buffer, &layers);
        drop(layers);

        let frame = buffer.freeze();
        let _emit = inner.emit.lock();
        if inner.exiting.load(Ordering::Acquire) {
            inner.pool.put(frame);
            continue;
        }
        {
            let mut shared = inner.shared.lock();
            // paused while compositing
            if shared.state.is_paused() {
                shared.clock.retract();
                drop(shared);
                inner.pool.put(frame);
                continue;
            }
        }
        inner.pool.put(frame.clone());
        output.accept_buffer(frame, &inner.metadata(delta));
        inner.health.record_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::filter::Grayscale;
    use crate::pipeline::events::SessionEvent;

    const W: u32 = 16;
    const H: u32 = 16;
    const FRAME: Duration = Duration::from_millis(10);

    struct TestSource(SourceId);

    impl TestSource {
        fn new() -> Arc<dyn Source> {
            Arc::new(TestSource(SourceId::next()))
        }
    }

    impl Source for TestSource {
        fn id(&self) -> SourceId {
            self.0
        }

        fn set_output(&self, _output: &Arc<dyn Output>) {}
    }

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<(Bytes, BufferMetadata, Instant)>>,
    }

    impl Collector {
        fn len(&self) -> usize {
            self.frames.lock().len()
        }
    }

    impl Output for Collector {
        fn accept_buffer(&self, data: Bytes, metadata: &BufferMetadata) {
            self.frames.lock().push((data, *metadata, Instant::now()));
        }
    }

    struct Failing;

    impl VideoFilter for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn apply(&self, frame: &VideoFrame) -> Result<VideoFrame, FilterError> {
            Err(FilterError::Unsupported {
                width: frame.width,
                height: frame.height,
                reason: "test".into(),
            })
        }
    }

    /// Claims a frame eight times larger than the pixels it carries
    struct Oversized;

    impl VideoFilter for Oversized {
        fn name(&self) -> &str {
            "oversized"
        }

        fn apply(&self, frame: &VideoFrame) -> Result<VideoFrame, FilterError> {
            Ok(VideoFrame {
                width: frame.width * 8,
                height: frame.height * 8,
                pixels: frame.pixels.clone(),
            })
        }
    }

    struct Panicky;

    impl VideoFilter for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn apply(&self, _frame: &VideoFrame) -> Result<VideoFrame, FilterError> {
            panic!("filter bug")
        }
    }

    fn mixer() -> (VideoMixer, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = EventSender::channel();
        let config = MixerConfig::new(W, H, FRAME).with_stale_after(Duration::from_secs(5));
        (VideoMixer::new(config, events).unwrap(), rx)
    }

    fn bind(mixer: &VideoMixer) -> Arc<Collector> {
        let collector = Arc::new(Collector::default());
        let output: Arc<dyn Output> = collector.clone();
        mixer.set_output(&output);
        collector
    }

    fn push(mixer: &VideoMixer, source: SourceId, rgba: [u8; 4], attrs: VideoAttributes) {
        let frame = VideoFrame::solid(attrs.width, attrs.height, rgba);
        mixer.accept_buffer(frame.pixels, &BufferMetadata::video(source, FRAME, attrs));
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn center(data: &Bytes) -> [u8; 4] {
        let i = ((H / 2) as usize * W as usize + (W / 2) as usize) * 4;
        [data[i], data[i + 1], data[i + 2], data[i + 3]]
    }

    #[test]
    fn rejects_invalid_config() {
        let zero = MixerConfig::new(0, 10, FRAME);
        assert!(matches!(
            VideoMixer::new(zero, EventSender::disabled()),
            Err(MixerError::InvalidConfig(_))
        ));
        let pool = Arc::new(FramePool::new(3));
        let mismatched = MixerConfig::new(W, H, FRAME).with_pool(pool);
        assert!(VideoMixer::new(mismatched, EventSender::disabled()).is_err());
        let no_lag = MixerConfig::new(W, H, FRAME).with_max_lag_frames(0);
        assert!(matches!(
            VideoMixer::new(no_lag, EventSender::disabled()),
            Err(MixerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cadence_follows_frame_duration() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        let epoch = Instant::now();
        mixer.set_epoch(epoch);
        mixer.start().unwrap();

        assert!(wait_for(|| collector.len() >= 20));
        mixer.stop();

        let frames = collector.frames.lock();
        let mut elapsed = Duration::ZERO;
        for (i, (_, meta, at)) in frames.iter().enumerate() {
            elapsed += meta.timestamp_delta;
            // whole ticks only
            assert_eq!(elapsed.as_nanos() % FRAME.as_nanos(), 0);
            // never emitted before its tick
            assert!(*at >= epoch + elapsed, "frame {} early", i);
        }
        // first frame carries its offset from the epoch
        assert_eq!(frames[0].1.timestamp_delta.as_nanos() % FRAME.as_nanos(), 0);
    }

    #[test]
    fn paused_mixer_emits_nothing_and_resumes_after_pause_start() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        let epoch = Instant::now();
        mixer.set_epoch(epoch);
        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 3));

        mixer.mix_paused(true);
        assert!(mixer.state().is_paused());
        let paused_at = Instant::now();
        // nothing leaves once the pause has returned
        let count = collector.len();
        thread::sleep(FRAME * 30);
        assert_eq!(collector.len(), count);

        mixer.mix_paused(false);
        assert!(wait_for(|| collector.len() >= count + 5));
        mixer.stop();

        let frames = collector.frames.lock();
        let mut ts = Duration::ZERO;
        for (i, (_, meta, at)) in frames.iter().enumerate() {
            ts += meta.timestamp_delta;
            if i < count {
                continue;
            }
            // timestamps resume after the pause, not inside it
            assert!(epoch + ts >= paused_at, "frame {} stamped inside the pause", i);
            // no backlog burst: every frame goes out close to its own tick
            assert!(*at - (epoch + ts) < FRAME * 15, "frame {} replayed late", i);
        }
    }

    #[test]
    fn pause_holds_back_frames_in_flight() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();
        push(&mixer, a.id(), [9, 9, 9, 255], VideoAttributes::new(W, H));
        let epoch = Instant::now();
        mixer.set_epoch(epoch);
        mixer.start().unwrap();

        for _ in 0..10 {
            assert!(wait_for(|| collector.len() >= 1));
            thread::sleep(FRAME / 2);
            mixer.mix_paused(true);
            let count = collector.len();
            thread::sleep(FRAME * 3);
            assert_eq!(collector.len(), count);
            mixer.mix_paused(false);
        }
        mixer.stop();

        // withdrawn ticks still add up: timestamps stay on whole ticks
        let mut ts = Duration::ZERO;
        for (i, (_, meta, at)) in collector.frames.lock().iter().enumerate() {
            ts += meta.timestamp_delta;
            assert_eq!(ts.as_nanos() % FRAME.as_nanos(), 0);
            assert!(*at >= epoch + ts, "frame {} early", i);
        }
    }

    #[test]
    fn sync_skips_to_now_and_first_delta_spans_the_gap() {
        let config = MixerConfig::new(W, H, FRAME).with_max_lag_frames(1000);
        let mixer = VideoMixer::new(config, EventSender::disabled()).unwrap();
        let collector = bind(&mixer);

        // fifty ticks behind, well under the lag bound
        let epoch = Instant::now().checked_sub(FRAME * 50).unwrap();
        mixer.set_epoch(epoch);
        let before_sync = Instant::now();
        mixer.sync();
        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 3));
        mixer.stop();

        let frames = collector.frames.lock();
        let first = frames[0].1.timestamp_delta;
        assert!(first >= FRAME * 50, "first delta {:?}", first);
        assert_eq!(first.as_nanos() % FRAME.as_nanos(), 0);
        assert!(epoch + first >= before_sync);
        assert!(frames[0].2 >= epoch + first);
        assert_eq!(frames[1].1.timestamp_delta, FRAME);
    }

    #[test]
    fn without_sync_small_lag_is_replayed() {
        let config = MixerConfig::new(W, H, FRAME).with_max_lag_frames(1000);
        let mixer = VideoMixer::new(config, EventSender::disabled()).unwrap();
        let collector = bind(&mixer);

        mixer.set_epoch(Instant::now().checked_sub(FRAME * 50).unwrap());
        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 3));
        mixer.stop();

        assert_eq!(collector.frames.lock()[0].1.timestamp_delta, Duration::ZERO);
    }

    #[test]
    fn set_epoch_restarts_a_running_timeline() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 3));

        let restart = Instant::now() + FRAME * 5;
        mixer.set_epoch(restart);
        let mark = collector.len();
        assert!(wait_for(|| collector.len() >= mark + 5));
        mixer.stop();

        let frames = collector.frames.lock();
        let after = &frames[mark..];
        // at most the pass already in flight goes out before the new epoch
        assert!(after.iter().filter(|(_, _, at)| *at < restart).count() <= 1);

        let (_, meta, at) = after
            .iter()
            .find(|(_, _, at)| *at >= restart)
            .unwrap();
        assert_eq!(meta.timestamp_delta.as_nanos() % FRAME.as_nanos(), 0);
        assert!(*at >= restart + meta.timestamp_delta);
    }

    #[test]
    fn higher_layer_covers_overlap() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        let low = TestSource::new();
        let high = TestSource::new();
        mixer.register_source(&low, 0).unwrap();
        mixer.register_source(&high, 0).unwrap();

        // pushed in reverse order to show order comes from layers
        push(&mixer, high.id(), [0, 255, 0, 255], VideoAttributes::new(4, 4).with_layer(1));
        push(&mixer, low.id(), [255, 0, 0, 255], VideoAttributes::new(4, 4).with_layer(0));
        assert_eq!(mixer.layer_order(), vec![low.id(), high.id()]);

        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 2));
        mixer.stop();

        for (data, _, _) in collector.frames.lock().iter() {
            assert_eq!(center(data), [0, 255, 0, 255]);
        }
    }

    #[test]
    fn sources_without_frames_leave_background() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        let silent = TestSource::new();
        mixer.register_source(&silent, 0).unwrap();
        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 2));
        mixer.stop();

        assert_eq!(center(&collector.frames.lock()[0].0), [0, 0, 0, 255]);
        assert!(mixer.health().stale_skips() >= 2);
    }

    #[test]
    fn registration_errors_and_idempotent_unregister() {
        let (mixer, _rx) = mixer();
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();
        assert!(matches!(
            mixer.register_source(&a, 0),
            Err(MixerError::DuplicateSource(_))
        ));
        assert!(matches!(
            mixer.set_source_layer(SourceId::from_raw(0), 2),
            Err(MixerError::UnknownSource(_))
        ));

        assert!(mixer.unregister_source(a.id()));
        assert!(!mixer.unregister_source(a.id()));
        assert_eq!(mixer.source_count(), 0);
    }

    #[test]
    fn latest_push_wins() {
        let (mixer, _rx) = mixer();
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();
        for i in 0..50u8 {
            push(&mixer, a.id(), [i, i, i, 255], VideoAttributes::new(2, 2));
        }
        assert_eq!(mixer.source_frame(a.id()).unwrap().pixel(0, 0), [49, 49, 49, 255]);
    }

    #[test]
    fn unregistered_and_malformed_buffers_are_rejected() {
        let (mixer, _rx) = mixer();
        push(&mixer, SourceId::from_raw(0), [1, 1, 1, 1], VideoAttributes::new(2, 2));
        mixer.accept_buffer(
            Bytes::from_static(&[0; 3]),
            &BufferMetadata::audio(SourceId::from_raw(0), FRAME),
        );
        assert_eq!(mixer.health().rejected_buffers(), 2);
    }

    #[test]
    fn filter_runs_off_thread_and_failures_keep_previous_frame() {
        let (mixer, mut rx) = mixer();
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();

        let gray: Arc<dyn VideoFilter> = Arc::new(Grayscale);
        mixer.set_source_filter(a.id(), Some(&gray)).unwrap();
        push(&mixer, a.id(), [255, 0, 0, 255], VideoAttributes::new(2, 2));
        assert!(wait_for(|| mixer.source_frame(a.id()).is_some()));
        assert_eq!(mixer.source_frame(a.id()).unwrap().pixel(0, 0), [76, 76, 76, 255]);

        let failing: Arc<dyn VideoFilter> = Arc::new(Failing);
        mixer.set_source_filter(a.id(), Some(&failing)).unwrap();
        push(&mixer, a.id(), [0, 0, 255, 255], VideoAttributes::new(2, 2));
        assert!(wait_for(|| mixer.health().filter_failures() == 1));

        assert_eq!(mixer.source_frame(a.id()).unwrap().pixel(0, 0), [76, 76, 76, 255]);
        match rx.try_recv().unwrap() {
            SessionEvent::FilterFailed { source, filter, .. } => {
                assert_eq!(source, a.id());
                assert_eq!(filter, "failing");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // a dropped filter reads as no filter
        drop(failing);
        push(&mixer, a.id(), [0, 0, 255, 255], VideoAttributes::new(2, 2));
        assert_eq!(mixer.source_frame(a.id()).unwrap().pixel(0, 0), [0, 0, 255, 255]);
    }

    #[test]
    fn malformed_filter_output_keeps_previous_frame() {
        let (mixer, mut rx) = mixer();
        let collector = bind(&mixer);
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();
        push(&mixer, a.id(), [0, 0, 255, 255], VideoAttributes::new(4, 4));
        mixer.start().unwrap();

        let oversized: Arc<dyn VideoFilter> = Arc::new(Oversized);
        mixer.set_source_filter(a.id(), Some(&oversized)).unwrap();
        push(&mixer, a.id(), [255, 0, 0, 255], VideoAttributes::new(4, 4));
        assert!(wait_for(|| mixer.health().filter_failures() == 1));

        let kept = mixer.source_frame(a.id()).unwrap();
        assert_eq!((kept.width, kept.height), (4, 4));
        assert_eq!(kept.pixel(0, 0), [0, 0, 255, 255]);
        match rx.try_recv().unwrap() {
            SessionEvent::FilterFailed { source, filter, .. } => {
                assert_eq!(source, a.id());
                assert_eq!(filter, "oversized");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the mix thread keeps compositing the previous frame
        let count = collector.len();
        assert!(wait_for(|| collector.len() >= count + 3));
        assert!(mixer.state().is_active());
        assert!(!mixer.state().is_paused());
        let last = collector.frames.lock().last().map(|(data, _, _)| center(data));
        assert_eq!(last, Some([0, 0, 255, 255]));
        mixer.stop();
    }

    #[test]
    fn panicking_filter_does_not_stall_later_filters() {
        let (mixer, mut rx) = mixer();
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();

        let panicky: Arc<dyn VideoFilter> = Arc::new(Panicky);
        mixer.set_source_filter(a.id(), Some(&panicky)).unwrap();
        push(&mixer, a.id(), [0, 0, 255, 255], VideoAttributes::new(2, 2));
        assert!(wait_for(|| mixer.health().filter_failures() == 1));
        assert!(mixer.source_frame(a.id()).is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::FilterFailed { .. })
        ));

        let gray: Arc<dyn VideoFilter> = Arc::new(Grayscale);
        mixer.set_source_filter(a.id(), Some(&gray)).unwrap();
        push(&mixer, a.id(), [255, 0, 0, 255], VideoAttributes::new(2, 2));
        assert!(wait_for(|| mixer
            .source_frame(a.id())
            .is_some_and(|f| f.pixel(0, 0) == [76, 76, 76, 255])));
        assert_eq!(mixer.health().filter_failures(), 1);
    }

    #[test]
    fn dropped_output_is_tolerated() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        mixer.start().unwrap();
        assert!(wait_for(|| collector.len() >= 2));
        drop(collector);

        thread::sleep(FRAME * 5);
        assert!(mixer.state().is_running());
        mixer.stop();
        assert_eq!(mixer.state(), MixerState::Stopped);
    }

    #[test]
    fn dropped_sources_are_forgotten() {
        let (mixer, _rx) = mixer();
        let _collector = bind(&mixer);
        let a = TestSource::new();
        mixer.register_source(&a, 0).unwrap();
        drop(a);
        mixer.start().unwrap();
        assert!(wait_for(|| mixer.source_count() == 0));
    }

    #[test]
    fn exhausted_pool_skips_frames() {
        let (events, mut rx) = EventSender::channel();
        let pool = Arc::new(FramePool::new((W * H * 4) as usize).with_max_outstanding(1));
        let config = MixerConfig::new(W, H, FRAME).with_pool(pool);
        let mixer = VideoMixer::new(config, events).unwrap();
        let collector = bind(&mixer);
        mixer.start().unwrap();

        // the collector holds every frame, so only one can ever be allocated
        assert!(wait_for(|| mixer.health().pool_exhaustions() >= 2));
        mixer.stop();
        assert_eq!(collector.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::PoolExhausted { source: None });
    }

    #[test]
    fn corrupt_layer_map_is_fatal() {
        let (mixer, mut rx) = mixer();
        let _collector = bind(&mixer);
        mixer.corrupt_layer_map(SourceId::from_raw(0));
        mixer.start().unwrap();

        assert!(wait_for(|| mixer.state() == MixerState::Exiting));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Fatal { .. })));
        mixer.stop();
        assert_eq!(mixer.state(), MixerState::Stopped);
    }

    #[test]
    fn calls_after_stop_are_noops() {
        let (mixer, _rx) = mixer();
        let collector = bind(&mixer);
        mixer.start().unwrap();
        mixer.stop();
        let count = collector.len();

        let a = TestSource::new();
        assert!(mixer.register_source(&a, 0).is_ok());
        assert_eq!(mixer.source_count(), 0);
        push(&mixer, a.id(), [1, 2, 3, 4], VideoAttributes::new(2, 2));
        mixer.mix_paused(true);
        mixer.sync();
        assert!(mixer.start().is_ok());
        mixer.stop();

        thread::sleep(FRAME * 3);
        assert_eq!(collector.len(), count);
        assert_eq!(mixer.state(), MixerState::Stopped);
    }

    #[test]
    fn concurrent_producers_keep_table_consistent() {
        let (mixer, _rx) = mixer();
        let mixer = Arc::new(mixer);
        let collector = bind(&mixer);
        let sources: Vec<_> = (0..8).map(|_| TestSource::new()).collect();
        for s in &sources {
            mixer.register_source(s, 0).unwrap();
        }
        mixer.start().unwrap();

        let producers: Vec<_> = sources
            .iter()
            .enumerate()
            .map(|(n, s)| {
                let mixer = mixer.clone();
                let id = s.id();
                thread::spawn(move || {
                    let placement = Mat4::from_rect(-1.0, -1.0, 0.0, 0.0);
                    for i in 0..1000u32 {
                        let attrs = VideoAttributes::new(4, 4)
                            .with_transform(placement)
                            .with_layer((i % 4) as i32)
                            .with_blends(n % 2 == 0);
                        push(&mixer, id, [n as u8, (i % 256) as u8, 0, 255], attrs);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert!(wait_for(|| collector.len() >= 5));
        mixer.stop();

        assert_eq!(mixer.source_count(), sources.len());
        assert_eq!(mixer.layer_order().len(), sources.len());
        assert_eq!(mixer.health().buffers_accepted(), 8000);
        for s in &sources {
            // every producer's last push was i = 999
            assert_eq!(mixer.source_frame(s.id()).unwrap().pixel(0, 0)[1], (999 % 256) as u8);
        }
    }
}
