//! Sender pipeline components
//!
//! - CaptureSource: entry point for raw frames and encoded audio
//! - TransmitStage: hands framed packets to the network transport
//! - BroadcastCoordinator: wires them to the mixer and packetizer
//!
//! The sender pipeline flow:
//! ```text
//! Capture → Mix → (encode) → Packetize → Transmit → Network
//! ```

pub mod capture_stage;
pub mod coordinator;
pub mod transmit_stage;

pub use capture_stage::CaptureSource;
pub use coordinator::{BroadcastCoordinator, SessionPhase};
pub use transmit_stage::{NullTransport, TransmitStage, Transport};
