//! Voice platform boundary: inbound audio source and outbound sink.
//!
//! Format contract: 48kHz signed 16-bit little-endian PCM. Inbound is
//! mono from the tracked participant, outbound is interleaved stereo.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_core::error::Result;

/// One item from a participant's inbound audio subscription.
///
/// The subscription ends when the receiver yields `None`.
#[derive(Debug)]
pub enum InboundAudio {
    /// Codec-framed packet, decoded by the capture pipeline.
    Packet(Vec<u8>),
    /// The subscription failed and will deliver nothing more.
    Error(String),
}

/// Status reported by an outbound player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Playing,
    /// Input closed and fully drained.
    Idle,
    Error(String),
}

/// Connects to a room/channel on the voice platform.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Join and resolve once the connection is ready to carry audio.
    ///
    /// Callers bound this with their own ready timeout.
    async fn join(&self, room_id: &str, channel_id: &str) -> Result<Arc<dyn VoiceConnection>>;
}

/// A ready voice connection owned by exactly one session.
pub trait VoiceConnection: Send + Sync {
    /// Subscribe to one participant's inbound audio.
    fn subscribe(&self, participant_id: &str) -> Result<mpsc::UnboundedReceiver<InboundAudio>>;

    /// Start a player fed by `frames` (stereo s16le). The player reports
    /// [`PlayerEvent::Idle`] once `frames` closes and everything has played.
    fn play(
        &self,
        frames: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<mpsc::UnboundedReceiver<PlayerEvent>>;

    /// Leave the channel. Safe to call more than once.
    fn disconnect(&self);
}
