//! Broadcast session coordinator
//!
//! Chains the sender side together and manages its lifecycle:
//!
//! ```text
//! CaptureSource(s) ─► VideoMixer ─► video output (encoder, external)
//! audio samples ─► CaptureSource ─► AacPacketizer ─► ChannelSink ─► TransmitStage ─► Transport
//! ```

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::mixer::transform::Orientation;
use crate::mixer::video_mixer::VideoMixer;
use crate::pipeline::PipelineStage;
use crate::pipeline::events::EventSender;
use crate::pipeline::health::MixerHealth;
use crate::pipeline::sender::capture_stage::CaptureSource;
use crate::pipeline::sender::transmit_stage::{TransmitStage, Transport};
use crate::pipeline::sink::{ChannelSink, Packet};
use crate::pipeline::stage::{Output, Source, Transform};
use crate::pipeline::types::{PacketMetadata, SourceId, VideoFrame};
use crate::transforms::aac_packetizer::AacPacketizer;

/// Lifecycle of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Live,
    Paused,
    Ended,
}

/// Facade over one broadcast session
///
/// Samples pushed with [`BroadcastCoordinator::push_video_sample`] land on the
/// bottom layer; extra sources added with
/// [`BroadcastCoordinator::add_source`] stack above it.
pub struct BroadcastCoordinator {
    config: SessionConfig,
    events: EventSender,
    mixer: Arc<VideoMixer>,
    replay: Arc<CaptureSource>,
    audio: Arc<CaptureSource>,
    packetizer: Arc<AacPacketizer>,
    packet_sink: Arc<ChannelSink<PacketMetadata>>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet<PacketMetadata>>>>,
    sources: Mutex<HashMap<SourceId, Arc<CaptureSource>>>,
    phase: Mutex<SessionPhase>,
    cancel: CancellationToken,
    transmit: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl BroadcastCoordinator {
    pub fn new(config: SessionConfig, events: EventSender) -> Result<Self> {
        config.validate()?;

        let mixer = Arc::new(
            VideoMixer::new(config.mixer_config(), events.clone())
                .context("Failed to create video mixer")?,
        );
        let health = mixer.health();

        // Replay samples fill the frame on the bottom layer
        let replay = Arc::new(CaptureSource::new("replay").with_layer(0));
        let replay_source: Arc<dyn Source> = replay.clone();
        mixer.register_source(&replay_source, config.width as usize * config.height as usize * 4)?;
        let mixer_output: Arc<dyn Output> = mixer.clone();
        replay.set_output(&mixer_output);

        // Audio: source → packetizer → sink
        let packetizer = Arc::new(AacPacketizer::new(config.aac_config()));
        let (sink, packet_rx) = ChannelSink::new("audio", config.packet_channel_capacity, health);
        let packet_sink = Arc::new(sink);
        let sink_output: Arc<dyn Output<PacketMetadata>> = packet_sink.clone();
        packetizer.set_output(&sink_output);

        let audio = Arc::new(CaptureSource::new("audio"));
        let packetizer_output: Arc<dyn Output> = packetizer.clone();
        audio.set_output(&packetizer_output);

        Ok(Self {
            config,
            events,
            mixer,
            replay,
            audio,
            packetizer,
            packet_sink,
            packet_rx: Mutex::new(Some(packet_rx)),
            sources: Mutex::new(HashMap::new()),
            phase: Mutex::new(SessionPhase::Idle),
            cancel: CancellationToken::new(),
            transmit: Mutex::new(None),
        })
    }

    /// Start mixing and transmitting. Must be called inside a tokio runtime.
    pub fn start(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != SessionPhase::Idle {
            warn!("BroadcastCoordinator: start ignored in {:?}", *phase);
            return Ok(());
        }

        let packet_rx = self
            .packet_rx
            .lock()
            .take()
            .context("packet channel already consumed")?;

        let mut stage = TransmitStage::new(
            transport,
            self.events.clone(),
            self.mixer.health(),
            self.cancel.clone(),
        )
        .with_video_rate(self.config.video_bitrate);
        stage.set_input(packet_rx);

        let epoch = Instant::now();
        self.mixer.set_epoch(epoch);
        self.packetizer.set_epoch(epoch);
        self.mixer.start()?;

        let handle = tokio::spawn(async move {
            let result = stage.run().await;
            if let Err(e) = &result {
                error!("{} failed: {}", stage.name(), e);
            }
            result
        });
        *self.transmit.lock() = Some(handle);
        *phase = SessionPhase::Live;

        info!(
            "BroadcastCoordinator: live at {}x{} {} fps",
            self.config.width, self.config.height, self.config.fps
        );
        Ok(())
    }

    /// Push a captured frame with its device orientation
    pub fn push_video_sample(&self, frame: VideoFrame, orientation: Orientation) {
        if let Err(e) = self.mixer.set_source_orientation(self.replay.id(), orientation) {
            warn!("BroadcastCoordinator: {}", e);
        }
        self.replay.push_video(frame);
    }

    /// Push one encoded AAC frame lasting `duration`
    pub fn push_audio_sample(&self, data: Bytes, duration: Duration) {
        self.audio.push_audio(data, duration);
    }

    /// Composite another source on top of the existing ones
    pub fn add_source(&self, source: Arc<CaptureSource>, buffer_size: usize) -> Result<()> {
        let as_source: Arc<dyn Source> = source.clone();
        self.mixer.register_source(&as_source, buffer_size)?;
        let mixer_output: Arc<dyn Output> = self.mixer.clone();
        source.set_output(&mixer_output);
        info!("BroadcastCoordinator: added source '{}' ({})", source.name(), source.id());
        self.sources.lock().insert(source.id(), source);
        Ok(())
    }

    pub fn remove_source(&self, id: SourceId) -> bool {
        self.sources.lock().remove(&id);
        self.mixer.unregister_source(id)
    }

    /// Bind the consumer of composited frames (normally a video encoder)
    pub fn set_video_output(&self, output: &Arc<dyn Output>) {
        self.mixer.set_output(output);
    }

    /// Where an external video packetizer should deliver its packets
    pub fn packet_output(&self) -> Arc<dyn Output<PacketMetadata>> {
        self.packet_sink.clone()
    }

    pub fn pause(&self) {
        let mut phase = self.phase.lock();
        if *phase == SessionPhase::Live {
            self.mixer.mix_paused(true);
            *phase = SessionPhase::Paused;
            info!("BroadcastCoordinator: paused");
        }
    }

    pub fn resume(&self) {
        let mut phase = self.phase.lock();
        if *phase == SessionPhase::Paused {
            self.mixer.mix_paused(false);
            *phase = SessionPhase::Live;
            info!("BroadcastCoordinator: resumed");
        }
    }

    /// Stop mixing, flush the transmit stage and close the transport
    pub async fn end(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Ended {
                return Ok(());
            }
            *phase = SessionPhase::Ended;
        }

        // joins the mix thread
        let mixer = self.mixer.clone();
        tokio::task::spawn_blocking(move || mixer.stop())
            .await
            .context("mixer stop task panicked")?;
        self.cancel.cancel();

        let handle = self.transmit.lock().take();
        if let Some(handle) = handle {
            handle.await.context("transmit task panicked")??;
        }
        info!("BroadcastCoordinator: ended. {}", self.mixer.health().summary());
        Ok(())
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn mixer(&self) -> &Arc<VideoMixer> {
        &self.mixer
    }

    pub fn health(&self) -> Arc<MixerHealth> {
        self.mixer.health()
    }

    /// Identity of the source fed by `push_video_sample`
    pub fn replay_source(&self) -> SourceId {
        self.replay.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events::{SessionEvent, SessionState};
    use crate::pipeline::sender::transmit_stage::NullTransport;
    use crate::pipeline::types::{BufferMetadata, TrackType};
    use async_trait::async_trait;

    /// Keeps every packet it is handed
    #[derive(Default, Clone)]
    struct Recording {
        packets: Arc<Mutex<Vec<Packet<PacketMetadata>>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Recording {
        fn len(&self) -> usize {
            self.packets.lock().len()
        }
    }

    #[async_trait]
    impl Transport for Recording {
        async fn send(&mut self, packet: Packet<PacketMetadata>) -> Result<()> {
            self.packets.lock().push(packet);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock() = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Frames {
        count: Mutex<usize>,
        last: Mutex<Option<Bytes>>,
    }

    impl Output for Frames {
        fn accept_buffer(&self, data: Bytes, _metadata: &BufferMetadata) {
            *self.count.lock() += 1;
            *self.last.lock() = Some(data);
        }
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            width: 8,
            height: 8,
            fps: 100,
            ..SessionConfig::default()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_mixes_and_transmits() {
        let (events, mut rx) = EventSender::channel();
        let session = BroadcastCoordinator::new(small_config(), events).unwrap();
        let frames = Arc::new(Frames::default());
        let output: Arc<dyn Output> = frames.clone();
        session.set_video_output(&output);

        assert_eq!(session.phase(), SessionPhase::Idle);
        let transport = Recording::default();
        session.start(Box::new(transport.clone())).unwrap();
        assert_eq!(session.phase(), SessionPhase::Live);

        session.push_video_sample(VideoFrame::solid(4, 4, [200, 10, 10, 255]), Orientation::Right);
        for _ in 0..5 {
            session.push_audio_sample(Bytes::from_static(&[0x21, 0x10]), Duration::from_millis(23));
        }

        assert!(wait_for(|| transport.len() >= 5).await);
        {
            let packets = transport.packets.lock();
            // configuration record first, then the raw frames
            assert_eq!(&packets[0].data[..], &[0xAF, 0x00, 0x12, 0x10]);
            assert_eq!(packets[0].metadata.track, TrackType::Audio);
            assert_eq!(packets[0].metadata.stream_id, 4);
            for packet in packets[1..].iter() {
                assert_eq!(&packet.data[..], &[0xAF, 0x01, 0x21, 0x10]);
            }
            assert!(packets[1].metadata.timestamp <= packets[2].metadata.timestamp);
        }
        assert!(
            wait_for(|| frames
                .last
                .lock()
                .as_ref()
                .is_some_and(|f| f[0] == 200))
            .await
        );

        session.end().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Ended);
        assert!(!session.mixer().state().is_active());
        assert!(*transport.closed.lock());

        // ended sessions stay ended
        session.end().await.unwrap();
        session.resume();
        assert_eq!(session.phase(), SessionPhase::Ended);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::ConnectionStatusChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(states.first(), Some(&SessionState::Starting));
        assert_eq!(states.last(), Some(&SessionState::Ended));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_session_ignores_pause_and_ends_cleanly() {
        let session = BroadcastCoordinator::new(small_config(), EventSender::disabled()).unwrap();
        session.pause();
        assert_eq!(session.phase(), SessionPhase::Idle);
        session.end().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Ended);

        // no restart after the end
        session.start(Box::new(NullTransport::new())).unwrap();
        assert_eq!(session.phase(), SessionPhase::Ended);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_and_extra_sources() {
        let session = BroadcastCoordinator::new(small_config(), EventSender::disabled()).unwrap();
        let frames = Arc::new(Frames::default());
        let output: Arc<dyn Output> = frames.clone();
        session.set_video_output(&output);
        session.start(Box::new(NullTransport::new())).unwrap();

        let overlay = Arc::new(CaptureSource::new("overlay"));
        let overlay_id = overlay.id();
        session.add_source(overlay.clone(), 0).unwrap();
        assert_eq!(session.mixer().layer_order(), vec![session.replay_source(), overlay_id]);

        session.pause();
        assert_eq!(session.phase(), SessionPhase::Paused);
        assert!(session.mixer().state().is_paused());
        let held = *frames.count.lock();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*frames.count.lock(), held);
        // pausing twice changes nothing
        session.pause();
        assert_eq!(session.phase(), SessionPhase::Paused);

        session.resume();
        assert_eq!(session.phase(), SessionPhase::Live);
        assert!(!session.mixer().state().is_paused());

        assert!(session.remove_source(overlay_id));
        assert!(!session.remove_source(overlay_id));
        assert_eq!(session.mixer().source_count(), 1);

        assert!(wait_for(|| *frames.count.lock() > 0).await);
        session.end().await.unwrap();
        // ending twice is harmless
        session.end().await.unwrap();
    }
}
