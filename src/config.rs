use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::assets::{
    AAC_CHANNELS, AAC_SAMPLE_RATE, FRAME_HEIGHT, FRAME_RATE, FRAME_WIDTH, MAX_LAG_FRAMES,
    PACKET_CHANNEL_CAPACITY, STALE_AFTER, VIDEO_BITRATE,
};
use crate::mixer::frame_pool::FramePool;
use crate::mixer::video_mixer::MixerConfig;
use crate::transforms::aac_packetizer::AacConfig;

/// Session settings, loadable from a JSON file. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target video bitrate reported with throughput measurements
    pub video_bitrate: u64,
    pub stale_after_ms: u64,
    pub max_lag_frames: u32,
    /// Bound on output frames alive at once; `None` for unbounded
    pub pool_frames: Option<usize>,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
    pub packet_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            fps: FRAME_RATE,
            video_bitrate: VIDEO_BITRATE,
            stale_after_ms: STALE_AFTER.as_millis() as u64,
            max_lag_frames: MAX_LAG_FRAMES,
            pool_frames: None,
            audio_sample_rate: AAC_SAMPLE_RATE,
            audio_channels: AAC_CHANNELS,
            packet_channel_capacity: PACKET_CHANNEL_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("frame size must be non-zero, got {}x{}", self.width, self.height);
        }
        if self.fps == 0 {
            bail!("fps must be non-zero");
        }
        if self.packet_channel_capacity == 0 {
            bail!("packet channel capacity must be non-zero");
        }
        if self.max_lag_frames == 0 {
            bail!("max_lag_frames must be at least 1");
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn mixer_config(&self) -> MixerConfig {
        let mut config = MixerConfig::new(self.width, self.height, self.frame_duration())
            .with_stale_after(Duration::from_millis(self.stale_after_ms))
            .with_max_lag_frames(self.max_lag_frames);
        if let Some(frames) = self.pool_frames {
            let frame_len = self.width as usize * self.height as usize * 4;
            config = config.with_pool(std::sync::Arc::new(
                FramePool::new(frame_len).with_max_outstanding(frames),
            ));
        }
        config
    }

    pub fn aac_config(&self) -> AacConfig {
        AacConfig {
            sample_rate: self.audio_sample_rate,
            channels: self.audio_channels,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = SessionConfig::from_json(r#"{ "fps": 60, "pool_frames": 3 }"#).unwrap();
        assert_eq!(config.fps, 60);
        assert_eq!(config.width, FRAME_WIDTH);
        assert_eq!(config.frame_duration(), Duration::from_secs(1) / 60);

        let mixer = config.mixer_config();
        assert_eq!(mixer.frame_duration, Duration::from_secs(1) / 60);
        assert!(mixer.pool.is_some());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SessionConfig::from_json(r#"{ "fps": 0 }"#).is_err());
        assert!(SessionConfig::from_json(r#"{ "max_lag_frames": 0 }"#).is_err());
        assert!(SessionConfig::from_json(r#"{ "width": "wide" }"#).is_err());
    }

    #[test]
    fn missing_file_has_context() {
        let err = SessionConfig::load("/nonexistent/castmix.json").unwrap_err();
        assert!(err.to_string().contains("castmix.json"));
    }
}
