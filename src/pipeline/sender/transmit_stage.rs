//! Transmit stage for the sender pipeline
//!
//! Drains framed packets into a [`Transport`] and reports connection status
//! and measured throughput on the session's event channel.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::assets::THROUGHPUT_INTERVAL;
use crate::pipeline::PipelineStage;
use crate::pipeline::events::{EventSender, SessionEvent, SessionState};
use crate::pipeline::health::MixerHealth;
use crate::pipeline::sink::Packet;
use crate::pipeline::types::PacketMetadata;

/// Network side of the session. Handshake and chunking live behind it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, packet: Packet<PacketMetadata>) -> Result<()>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Transport that discards packets and counts them
#[derive(Debug, Default, Clone)]
pub struct NullTransport {
    packets: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn send(&mut self, packet: Packet<PacketMetadata>) -> Result<()> {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(packet.data.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Transmit stage: forwards framed packets to the transport
pub struct TransmitStage {
    transport: Box<dyn Transport>,
    input_rx: Option<mpsc::Receiver<Packet<PacketMetadata>>>,
    events: EventSender,
    health: Arc<MixerHealth>,
    cancel: CancellationToken,
    video_rate: u64,
    report_interval: Duration,
}

impl TransmitStage {
    pub fn new(
        transport: Box<dyn Transport>,
        events: EventSender,
        health: Arc<MixerHealth>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            input_rx: None,
            events,
            health,
            cancel,
            video_rate: 0,
            report_interval: THROUGHPUT_INTERVAL,
        }
    }

    pub fn set_input(&mut self, rx: mpsc::Receiver<Packet<PacketMetadata>>) {
        self.input_rx = Some(rx);
    }

    /// Video bitrate reported alongside throughput measurements
    pub fn with_video_rate(mut self, video_rate: u64) -> Self {
        self.video_rate = video_rate;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    fn status(&self, state: SessionState) {
        self.events.send(SessionEvent::ConnectionStatusChanged(state));
    }
}

#[async_trait]
impl PipelineStage for TransmitStage {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow!("No input channel"))?;

        self.status(SessionState::Starting);
        if let Err(e) = self.transport.connect().await {
            error!("{}: connect failed: {}", self.name(), e);
            self.status(SessionState::Error);
            return Err(e);
        }
        self.status(SessionState::Started);
        info!("{}: started", self.name());

        let mut interval = tokio::time::interval(self.report_interval);
        interval.tick().await;
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;
        let mut sent = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                packet = input_rx.recv() => {
                    let Some(packet) = packet else { break };
                    let size = packet.data.len() as u64;
                    if let Err(e) = self.transport.send(packet).await {
                        error!("{}: send failed: {}", self.name(), e);
                        self.health.record_frame_drop();
                        self.status(SessionState::Error);
                        return Err(e);
                    }
                    window_bytes += size;
                    sent += 1;
                }
                _ = interval.tick() => {
                    let elapsed = window_start.elapsed().as_secs_f64().max(f64::EPSILON);
                    self.events.send(SessionEvent::DetectedThroughput {
                        bytes_per_second: (window_bytes as f64 / elapsed) as u64,
                        video_rate: self.video_rate,
                    });
                    window_start = Instant::now();
                    window_bytes = 0;
                }
            }
        }

        self.shutdown().await?;
        info!("{}: finished, {} packets transmitted", self.name(), sent);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TransmitStage"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.transport.close().await?;
        self.status(SessionState::Ended);
        Ok(())
    }
}
