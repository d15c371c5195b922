//! Pipeline stage contracts
//!
//! Every synchronous stage implements one or both capabilities:
//! - [`Output`]: accepts buffers pushed by an upstream stage
//! - [`Source`]: produces buffers into a bound downstream [`Output`]
//!
//! A [`Transform`] is simply a type implementing both. Bindings between
//! stages never own the downstream stage; a consumer that has been dropped
//! behaves like "no output".
//!
//! Stages that run as their own async task (the transmit stage) implement
//! [`PipelineStage`] instead.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::types::{BufferMetadata, SourceId};

/// A stage that consumes buffers
pub trait Output<M = BufferMetadata>: Send + Sync {
    /// Ingest a buffer. May be called from any thread, concurrently with the
    /// stage's own clock.
    fn accept_buffer(&self, data: Bytes, metadata: &M);
}

/// A stage that produces buffers
pub trait Source<M = BufferMetadata>: Send + Sync {
    /// Stable identity of this source for its whole lifetime
    fn id(&self) -> SourceId;

    /// Bind (or replace) the downstream consumer. The binding is non-owning.
    fn set_output(&self, output: &Arc<dyn Output<M>>);
}

/// A stage that both consumes and produces buffers
pub trait Transform<In = BufferMetadata, Out = BufferMetadata>: Output<In> + Source<Out> {
    /// Reset the stage's timing anchor. Stages without a clock ignore it.
    fn set_epoch(&self, _epoch: Instant) {}
}

/// Non-owning, rebindable downstream binding
pub struct OutputSlot<M> {
    output: RwLock<Option<Weak<dyn Output<M>>>>,
}

impl<M> OutputSlot<M> {
    pub fn new() -> Self {
        Self {
            output: RwLock::new(None),
        }
    }

    /// Replace the bound consumer
    pub fn bind(&self, output: &Arc<dyn Output<M>>) {
        *self.output.write() = Some(Arc::downgrade(output));
    }

    pub fn clear(&self) {
        *self.output.write() = None;
    }

    /// The bound consumer, if it is still alive
    pub fn get(&self) -> Option<Arc<dyn Output<M>>> {
        self.output.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_bound(&self) -> bool {
        self.get().is_some()
    }

    /// Push a buffer to the bound consumer. Returns `false` when there is none.
    pub fn forward(&self, data: Bytes, metadata: &M) -> bool {
        match self.get() {
            Some(output) => {
                output.accept_buffer(data, metadata);
                true
            }
            None => false,
        }
    }
}

impl<M> Default for OutputSlot<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for async pipeline stages that process data until shutdown
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Run the stage, processing data until its input closes or it is cancelled
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Gracefully shutdown the stage
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
