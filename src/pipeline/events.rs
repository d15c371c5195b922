//! Session notifications
//!
//! Everything a host application may want to observe about a running session
//! (connection status, measured throughput, per-source failures) is delivered
//! as a [`SessionEvent`] over an unbounded channel. Senders never block, and a
//! host that stopped listening is silently ignored.

use tokio::sync::mpsc;

use super::types::SourceId;

/// Connection status of a broadcast session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    None,
    Starting,
    Started,
    Ended,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::None => "None",
            SessionState::Starting => "Starting",
            SessionState::Started => "Started",
            SessionState::Ended => "Ended",
            SessionState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStatusChanged(SessionState),

    /// Measured outgoing rate and the video rate the session is aiming for
    DetectedThroughput {
        bytes_per_second: u64,
        video_rate: u64,
    },

    /// A per-source filter failed; the source keeps its previous frame
    FilterFailed {
        source: SourceId,
        filter: String,
        reason: String,
    },

    /// No output buffer was available; `source` is `None` for the mixer itself
    PoolExhausted { source: Option<SourceId> },

    /// The mix loop hit an unrecoverable condition and stopped
    Fatal { reason: String },
}

/// Cloneable, non-blocking event emitter
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSender {
    /// Create a connected sender/receiver pair
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that discards every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            // receiver gone: nobody is listening any more
            let _ = tx.send(event);
        }
    }
}
