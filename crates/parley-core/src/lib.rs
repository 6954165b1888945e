//! Core types, config, errors, and session state for parley.

pub mod config;
pub mod error;
pub mod registry;
pub mod session;

/// Pipeline-wide audio format: 48kHz signed 16-bit little-endian PCM.
pub mod audio_format {
    pub const SAMPLE_RATE: u32 = 48_000;
    pub const BYTES_PER_SAMPLE: usize = 2;
    pub const INBOUND_CHANNELS: u16 = 1;
    pub const OUTBOUND_CHANNELS: u16 = 2;
}
