//! Capture sources
//!
//! Device capture is platform code and lives with the host application; this
//! module only carries the synthetic generators used by the demo and tests.

pub mod pattern;

pub use pattern::{SilentAudio, TestPattern};
