//! Error types for the mixer and its per-source filters.

use thiserror::Error;

use crate::pipeline::types::SourceId;

/// Errors reported to callers of the compositor.
///
/// None of these are fatal to a running mix loop. The only condition that
/// stops the loop on its own is [`MixerError::CorruptLayerMap`].
#[derive(Debug, Error)]
pub enum MixerError {
    /// The identity is already registered.
    #[error("source {0} is already registered")]
    DuplicateSource(SourceId),

    /// No source with this identity is registered.
    #[error("source {0} is not registered")]
    UnknownSource(SourceId),

    /// The mix thread could not be spawned.
    #[error("failed to spawn mix thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Source table and layer map disagree.
    #[error("layer map corrupted: {0}")]
    CorruptLayerMap(String),

    /// Constructor-time configuration is unusable.
    #[error("invalid mixer configuration: {0}")]
    InvalidConfig(String),
}

/// Errors a [`VideoFilter`](crate::mixer::filter::VideoFilter) may return.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Input frame does not match what the filter can process.
    #[error("unsupported frame {width}x{height}: {reason}")]
    Unsupported {
        width: u32,
        height: u32,
        reason: String,
    },

    /// The filter backend failed.
    #[error("filter backend failed: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_source_displays_id() {
        let id = SourceId::from_raw(42);
        let msg = MixerError::DuplicateSource(id).to_string();
        assert!(msg.contains("42"));
    }

    #[test]
    fn io_error_converts_to_spawn() {
        let io = std::io::Error::other("no threads left");
        let err: MixerError = io.into();
        assert!(matches!(err, MixerError::Spawn(_)));
    }

    #[test]
    fn filter_error_displays_dimensions() {
        let err = FilterError::Unsupported {
            width: 16,
            height: 9,
            reason: "odd size".into(),
        };
        assert!(err.to_string().contains("16x9"));
    }
}
