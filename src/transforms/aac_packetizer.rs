//! Frames raw AAC access units as FLV audio tag bodies.
//!
//! Every packet starts with a two byte header: the FLV sound flags and the
//! AAC packet type (0 = AudioSpecificConfig, 1 = raw frame). The first buffer
//! of a session is replaced by the configuration record; raw frames follow.

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::assets::{AAC_CHANNELS, AAC_SAMPLE_RATE, AUDIO_STREAM_ID};
use crate::pipeline::stage::{Output, OutputSlot, Source, Transform};
use crate::pipeline::types::{BufferMetadata, PacketMetadata, SourceId, Timestamp, TrackType};

const FLV_CODECID_AAC: u8 = 10 << 4;
const FLV_SAMPLESSIZE_16BIT: u8 = 1 << 1;
const FLV_STEREO: u8 = 1;

const AAC_PACKET_SEQUENCE_HEADER: u8 = 0;
const AAC_PACKET_RAW: u8 = 1;

/// MPEG-4 audio object type: AAC low complexity
const AOT_AAC_LC: u16 = 2;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    pub sample_rate: u32,
    pub channels: u8,
}

impl Default for AacConfig {
    fn default() -> Self {
        Self {
            sample_rate: AAC_SAMPLE_RATE,
            channels: AAC_CHANNELS,
        }
    }
}

impl AacConfig {
    /// FLV sound rate code (2 bits)
    fn flv_rate(&self) -> u8 {
        match self.sample_rate {
            0..=8_000 => 0,
            8_001..=16_000 => 1,
            16_001..=32_000 => 2,
            _ => 3,
        }
    }

    /// First byte of every tag body
    pub fn flags(&self) -> u8 {
        let stereo = if self.channels > 1 { FLV_STEREO } else { 0 };
        FLV_CODECID_AAC | (self.flv_rate() << 2) | FLV_SAMPLESSIZE_16BIT | stereo
    }

    /// Two byte AudioSpecificConfig: object type, frequency index, channels
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let freq_index = SAMPLING_FREQUENCIES
            .iter()
            .position(|&f| f == self.sample_rate)
            .unwrap_or(4) as u16;
        let value = (AOT_AAC_LC << 11) | (freq_index << 7) | ((self.channels as u16 & 0x0f) << 3);
        value.to_be_bytes()
    }
}

struct PacketizerState {
    sent_config: bool,
    /// Track-local timestamp of the next payload
    audio_ts: Duration,
}

/// Framing stage for the audio track
pub struct AacPacketizer {
    id: SourceId,
    config: AacConfig,
    state: Mutex<PacketizerState>,
    output: OutputSlot<PacketMetadata>,
}

impl AacPacketizer {
    pub fn new(config: AacConfig) -> Self {
        Self {
            id: SourceId::next(),
            config,
            state: Mutex::new(PacketizerState {
                sent_config: false,
                audio_ts: Duration::ZERO,
            }),
            output: OutputSlot::new(),
        }
    }

    pub fn config(&self) -> AacConfig {
        self.config
    }

    /// Timestamp the next payload will carry
    pub fn audio_timestamp(&self) -> Duration {
        self.state.lock().audio_ts
    }

    fn packet(&self, packet_type: u8, body: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(body.len() + 2);
        out.put_u8(self.config.flags());
        out.put_u8(packet_type);
        out.put_slice(body);
        out.freeze()
    }
}

impl Output for AacPacketizer {
    fn accept_buffer(&self, data: Bytes, metadata: &BufferMetadata) {
        if metadata.track != TrackType::Audio {
            debug!("[aac] ignoring {} buffer", metadata.track);
            return;
        }
        // Nothing bound: drop without consuming the configuration record
        let Some(output) = self.output.get() else {
            return;
        };

        let mut state = self.state.lock();
        let (packet, timestamp) = if !state.sent_config {
            state.sent_config = true;
            let asc = self.config.audio_specific_config();
            info!("[aac] sending AudioSpecificConfig {:02x?}", asc);
            (self.packet(AAC_PACKET_SEQUENCE_HEADER, &asc), state.audio_ts)
        } else {
            let ts = state.audio_ts;
            state.audio_ts += metadata.timestamp_delta;
            (self.packet(AAC_PACKET_RAW, &data), ts)
        };

        let meta = PacketMetadata {
            timestamp: Timestamp::from_duration(timestamp),
            size: packet.len(),
            track: TrackType::Audio,
            stream_id: AUDIO_STREAM_ID,
        };
        // keep packet order when several producers push
        output.accept_buffer(packet, &meta);
    }
}

impl Source<PacketMetadata> for AacPacketizer {
    fn id(&self) -> SourceId {
        self.id
    }

    fn set_output(&self, output: &Arc<dyn Output<PacketMetadata>>) {
        self.output.bind(output);
    }
}

impl Transform<BufferMetadata, PacketMetadata> for AacPacketizer {
    /// Start a new session: the configuration record goes out again
    fn set_epoch(&self, _epoch: Instant) {
        let mut state = self.state.lock();
        state.sent_config = false;
        state.audio_ts = Duration::ZERO;
    }
}
