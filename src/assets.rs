use std::time::Duration;

pub const FRAME_RATE: u32 = 30;
pub const FRAME_WIDTH: u32 = 1280;
pub const FRAME_HEIGHT: u32 = 720;

// mixer
pub const STALE_AFTER: Duration = Duration::from_secs(1);
pub const MAX_LAG_FRAMES: u32 = 3;

// audio track
pub const AAC_SAMPLE_RATE: u32 = 44_100;
pub const AAC_CHANNELS: u8 = 2;
pub const AAC_SAMPLES_PER_FRAME: u32 = 1024;
pub const AUDIO_STREAM_ID: u32 = 4;

// transport
pub const PACKET_CHANNEL_CAPACITY: usize = 256;
pub const THROUGHPUT_INTERVAL: Duration = Duration::from_secs(1);
pub const VIDEO_BITRATE: u64 = 1_500_000;
