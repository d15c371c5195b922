//! Bridge from synchronous stages into async tasks

use bytes::Bytes;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use super::health::MixerHealth;
use super::stage::Output;

/// A buffer together with its envelope
#[derive(Debug, Clone)]
pub struct Packet<M> {
    pub data: Bytes,
    pub metadata: M,
}

/// [`Output`] that queues buffers into a bounded tokio channel.
///
/// Never blocks the producer: when the channel is full the buffer is dropped
/// and counted.
pub struct ChannelSink<M> {
    name: &'static str,
    tx: mpsc::Sender<Packet<M>>,
    health: Arc<MixerHealth>,
    closed: AtomicBool,
}

impl<M: Clone + Send + Sync + 'static> ChannelSink<M> {
    pub fn new(name: &'static str, capacity: usize, health: Arc<MixerHealth>) -> (Self, mpsc::Receiver<Packet<M>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                name,
                tx,
                health,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }
}

impl<M: Clone + Send + Sync + 'static> Output<M> for ChannelSink<M> {
    fn accept_buffer(&self, data: Bytes, metadata: &M) {
        let packet = Packet {
            data,
            metadata: metadata.clone(),
        };
        match self.tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("[{}] channel full, dropping buffer", self.name);
                self.health.record_frame_drop();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if !self.closed.swap(true, Ordering::Relaxed) {
                    warn!("[{}] receiver closed", self.name);
                }
            }
        }
    }
}
