//! Live multi-source video compositor and broadcast pipeline.

pub mod assets;
pub mod capture;
pub mod config;
pub mod error;
pub mod mixer;
pub mod pipeline;
pub mod transforms;
pub mod utils;
