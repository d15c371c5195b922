//! Framing stages that turn raw encoded buffers into transport packets

pub mod aac_packetizer;

pub use aac_packetizer::{AacConfig, AacPacketizer};
