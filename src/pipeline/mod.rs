//! Pipeline abstraction layer
//!
//! Media moves between stages through the push contract in [`stage`]:
//! - Sources push buffers into the [`Output`] they are bound to
//! - Transforms are both, and may consume a shared epoch
//! - Async stages implement [`PipelineStage`] and are fed through channels
//!   bridged by [`sink::ChannelSink`]
//!
//! The [`clock`] drives the mixer's cadence, [`health`] counts what went
//! wrong, and [`events`] reports session-level changes to the host.

pub mod clock;
pub mod events;
pub mod health;
pub mod sender;
pub mod sink;
pub mod stage;
pub mod state;
pub mod types;

pub use clock::MixClock;
pub use events::{EventSender, SessionEvent, SessionState};
pub use health::{HealthMonitor, MixerHealth};
pub use stage::{Output, PipelineStage, Source, Transform};
pub use state::MixerState;
pub use types::{BufferMetadata, PacketMetadata, SourceId, Timestamp, TrackType, VideoFrame};
