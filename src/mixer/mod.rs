//! Multi-source video compositing
//!
//! [`VideoMixer`] keeps the latest frame of every registered source and, on
//! its own clock, paints them bottom-to-top into one output frame.

pub mod compose;
pub mod filter;
pub mod frame_pool;
pub mod job_queue;
pub mod source_table;
pub mod transform;
pub mod video_mixer;

pub use filter::VideoFilter;
pub use transform::{Mat4, Orientation};
pub use video_mixer::{MixerConfig, VideoMixer};
