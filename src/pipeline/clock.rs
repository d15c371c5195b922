//! Frame clock for the mix thread

use std::time::{Duration, Instant};

/// Fixed-cadence frame clock
///
/// Every scheduled mix time is derived from the epoch:
/// `next_mix_time = epoch + frame_index * frame_duration`. The clock only ever
/// moves by whole ticks, so scheduling jitter on one pass never leaks into the
/// following ones.
///
/// # Catch-up
///
/// When the mix thread falls behind (a long pause, a slow pass, a stalled
/// host) [`MixClock::resync`] jumps to the first tick at or after "now" and
/// drops the backlog instead of replaying it.
#[derive(Debug, Clone)]
pub struct MixClock {
    epoch: Instant,
    frame_duration: Duration,
    frame_index: u64,
    last_emitted: Option<u64>,
    // `last_emitted` before the latest `advance`
    previous_emitted: Option<u64>,
}

impl MixClock {
    /// Create a clock anchored at `epoch`
    pub fn new(epoch: Instant, frame_duration: Duration) -> Self {
        Self {
            epoch,
            frame_duration,
            frame_index: 0,
            last_emitted: None,
            previous_emitted: None,
        }
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Index of the next tick to be emitted
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Offset of tick `index` from the epoch
    pub fn tick_offset(&self, index: u64) -> Duration {
        let nanos = self.frame_duration.as_nanos() * index as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Scheduled time of the next mix pass
    pub fn next_mix_time(&self) -> Instant {
        self.epoch + self.tick_offset(self.frame_index)
    }

    /// Reset the timing anchor; the next mix happens at `epoch`
    pub fn set_epoch(&mut self, epoch: Instant) {
        self.epoch = epoch;
        self.frame_index = 0;
        self.last_emitted = None;
        self.previous_emitted = None;
    }

    /// How far `now` is past the next scheduled mix time
    pub fn lag(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.next_mix_time())
    }

    /// Whether `now` is more than `max_frames` ticks behind schedule
    pub fn is_behind(&self, now: Instant, max_frames: u32) -> bool {
        self.lag(now) > self.frame_duration * max_frames
    }

    /// Jump to the first tick at or after `now`, dropping any backlog.
    /// Returns the number of skipped ticks.
    pub fn resync(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        let step = self.frame_duration.as_nanos().max(1);
        let target = elapsed.div_ceil(step) as u64;
        if target <= self.frame_index {
            return 0;
        }
        let skipped = target - self.frame_index;
        self.frame_index = target;
        skipped
    }

    /// Consume the current tick.
    ///
    /// Returns the emitted frame's timestamp delta: the distance from the
    /// previously emitted tick, or from the epoch for the first frame.
    pub fn advance(&mut self) -> Duration {
        let index = self.frame_index;
        let delta = match self.last_emitted {
            Some(prev) => self.tick_offset(index - prev),
            None => self.tick_offset(index),
        };
        self.previous_emitted = self.last_emitted;
        self.last_emitted = Some(index);
        self.frame_index += 1;
        delta
    }

    /// Turn the latest [`MixClock::advance`] into a skip, for a frame that was
    /// composited but never emitted. The next delta spans the withdrawn tick.
    pub fn retract(&mut self) {
        self.last_emitted = self.previous_emitted;
    }

    /// Consume the current tick without emitting a frame; the next emitted
    /// delta spans it.
    pub fn skip(&mut self) {
        self.frame_index += 1;
    }
}
