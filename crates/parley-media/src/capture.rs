//! Capture pipeline: decode the tracked participant's audio, re-chunk it,
//! and forward it to transcription unless the session is speaking.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::error::{ParleyError, Result};
use parley_core::session::{CaptureState, VoiceSession};

use crate::audio::InboundAudio;
use crate::chunker::FixedChunker;

/// Turns one inbound codec packet into mono s16le PCM.
pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>>;
}

/// Decoder for sources that already deliver raw PCM.
#[derive(Debug, Default)]
pub struct PcmPassthrough;

impl FrameDecoder for PcmPassthrough {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() % 2 != 0 {
            return Err(ParleyError::MalformedAudio { len: packet.len() });
        }
        Ok(packet.to_vec())
    }
}

/// What the subscription forwarder reports back to the session reactor.
#[derive(Debug)]
pub enum CaptureSignal {
    Packet(Vec<u8>),
    Ended,
    Failed(String),
}

/// Capture state machine: `Idle → Attached ⇄ Suspended → TornDown`.
///
/// Owned by the session reactor, which feeds it every [`CaptureSignal`].
pub struct CapturePipeline {
    state: CaptureState,
    decoder: Option<Box<dyn FrameDecoder>>,
    chunker: Option<FixedChunker>,
    forwarder: Option<JoinHandle<()>>,
    forwarded: u64,
    dropped: u64,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Idle,
            decoder: None,
            chunker: None,
            forwarder: None,
            forwarded: 0,
            dropped: 0,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Take ownership of the inbound subscription. Allowed once per pipeline.
    pub fn attach(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundAudio>,
        decoder: Box<dyn FrameDecoder>,
        chunk_bytes: usize,
        signals: mpsc::UnboundedSender<CaptureSignal>,
    ) -> Result<()> {
        if self.state != CaptureState::Idle {
            return Err(ParleyError::Session(format!(
                "capture already {:?}",
                self.state
            )));
        }

        let chunker = FixedChunker::new(chunk_bytes)?;

        let forwarder = tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                let signal = match item {
                    InboundAudio::Packet(bytes) => CaptureSignal::Packet(bytes),
                    InboundAudio::Error(e) => {
                        let _ = signals.send(CaptureSignal::Failed(e));
                        return;
                    }
                };
                if signals.send(signal).is_err() {
                    return;
                }
            }
            let _ = signals.send(CaptureSignal::Ended);
        });

        self.decoder = Some(decoder);
        self.chunker = Some(chunker);
        self.forwarder = Some(forwarder);
        self.state = CaptureState::Attached;
        info!(chunk_bytes, "Capture attached");
        Ok(())
    }

    /// React to one signal from the subscription forwarder.
    pub fn handle(
        &mut self,
        session: &mut VoiceSession,
        signal: CaptureSignal,
        sink: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        match signal {
            CaptureSignal::Packet(packet) => self.on_packet(session, &packet, sink),
            CaptureSignal::Ended => {
                debug!("Inbound audio ended");
                if let Some(tail) = self.chunker.take().and_then(FixedChunker::finish) {
                    self.forward(session, tail, sink);
                }
                self.tear_down(session);
            }
            CaptureSignal::Failed(e) => {
                warn!(error = %e, "Inbound audio subscription failed");
                self.tear_down(session);
            }
        }
    }

    fn on_packet(
        &mut self,
        session: &mut VoiceSession,
        packet: &[u8],
        sink: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        if session.is_speaking() || !session.is_active() {
            self.suspend();
            return;
        }

        let (Some(decoder), Some(chunker)) = (self.decoder.as_mut(), self.chunker.as_mut()) else {
            return;
        };

        let pcm = match decoder.decode(packet) {
            Ok(pcm) => pcm,
            Err(e) => {
                debug!(error = %e, "Dropping undecodable frame");
                self.dropped += 1;
                return;
            }
        };

        let chunks = chunker.push(&pcm);
        for chunk in chunks {
            self.forward(session, chunk, sink);
        }
    }

    /// The speaking flag is read at the moment each chunk would be sent.
    fn forward(
        &mut self,
        session: &mut VoiceSession,
        chunk: Vec<u8>,
        sink: &mpsc::UnboundedSender<Vec<u8>>,
    ) {
        if session.is_speaking() || !session.is_active() {
            self.suspend();
            return;
        }

        self.state = CaptureState::Attached;
        if sink.send(chunk).is_err() {
            debug!("Transcription link closed, dropping chunk");
            session.stop_listening();
            self.dropped += 1;
            return;
        }
        session.resume_listening();
        self.forwarded += 1;
    }

    /// Drop the current audio along with any partial chunk captured so far,
    /// so nothing heard while speaking reaches transcription later.
    fn suspend(&mut self) {
        if self.state == CaptureState::Attached {
            debug!("Capture suspended while speaking");
        }
        self.state = CaptureState::Suspended;
        self.dropped += 1;
        if let Some(chunker) = self.chunker.as_mut() {
            chunker.clear();
        }
    }

    /// Release the decoder, chunker and subscription. Idempotent.
    pub fn tear_down(&mut self, session: &mut VoiceSession) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.decoder = None;
        self.chunker = None;
        session.stop_listening();

        if self.state != CaptureState::TornDown {
            info!(
                forwarded = self.forwarded,
                dropped = self.dropped,
                "Capture torn down"
            );
            self.state = CaptureState::TornDown;
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_core::session::{ModeParams, SessionIdentity};

    use super::*;

    fn session() -> VoiceSession {
        VoiceSession::new(
            SessionIdentity {
                participant_id: "user-1".into(),
                room_id: "room".into(),
                channel_id: "chan".into(),
            },
            ModeParams::Conversation { history: vec![] },
        )
    }

    fn attached(
        chunk_bytes: usize,
    ) -> (
        CapturePipeline,
        mpsc::UnboundedSender<InboundAudio>,
        mpsc::UnboundedReceiver<CaptureSignal>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let mut capture = CapturePipeline::new();
        capture
            .attach(inbound_rx, Box::new(PcmPassthrough), chunk_bytes, signal_tx)
            .unwrap();
        (capture, inbound_tx, signal_rx)
    }

    #[tokio::test]
    async fn test_forwards_fixed_chunks_when_silent() {
        let (mut capture, inbound, mut signals) = attached(4);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        inbound.send(InboundAudio::Packet(vec![1; 6])).unwrap();
        let signal = signals.recv().await.unwrap();
        capture.handle(&mut session, signal, &sink_tx);

        assert_eq!(sink_rx.try_recv().unwrap(), vec![1; 4]);
        assert!(sink_rx.try_recv().is_err());
        assert!(session.is_listening());
        assert_eq!(capture.state(), CaptureState::Attached);
    }

    #[tokio::test]
    async fn test_drops_chunks_while_speaking() {
        let (mut capture, _inbound, _signals) = attached(4);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        session.set_speaking(true);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 8]), &sink_tx);
        assert!(sink_rx.try_recv().is_err());
        assert_eq!(capture.state(), CaptureState::Suspended);
        assert_eq!(capture.dropped(), 1);
        assert!(!(session.is_speaking() && session.is_listening()));

        session.set_speaking(false);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 4]), &sink_tx);
        assert_eq!(sink_rx.try_recv().unwrap().len(), 4);
        assert_eq!(capture.state(), CaptureState::Attached);
    }

    #[tokio::test]
    async fn test_partial_chunk_heard_while_speaking_is_discarded() {
        let (mut capture, _inbound, _signals) = attached(4);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        session.set_speaking(true);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0xEE; 6]), &sink_tx);
        assert!(sink_rx.try_recv().is_err());

        session.set_speaking(false);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0x11; 2]), &sink_tx);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0x22; 2]), &sink_tx);

        let first = sink_rx.try_recv().unwrap();
        assert_eq!(first, vec![0x11, 0x11, 0x22, 0x22]);
        assert!(!first.contains(&0xEE));
    }

    #[tokio::test]
    async fn test_partial_chunk_before_speaking_is_discarded() {
        let (mut capture, _inbound, _signals) = attached(4);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        capture.handle(&mut session, CaptureSignal::Packet(vec![0x11; 2]), &sink_tx);
        session.set_speaking(true);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0xEE; 2]), &sink_tx);
        session.set_speaking(false);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0x22; 4]), &sink_tx);

        assert_eq!(sink_rx.try_recv().unwrap(), vec![0x22; 4]);
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_transcription_link_stops_listening() {
        let (mut capture, _inbound, _signals) = attached(2);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 2]), &sink_tx);
        assert!(session.is_listening());

        drop(sink_rx);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 2]), &sink_tx);
        assert!(!session.is_listening());
        assert_eq!(capture.forwarded(), 1);
        assert_eq!(capture.dropped(), 1);
    }

    #[tokio::test]
    async fn test_attach_rejects_zero_chunk_size() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        let mut capture = CapturePipeline::new();
        let err = capture
            .attach(rx, Box::new(PcmPassthrough), 0, signal_tx)
            .unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
        assert_eq!(capture.state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_interleaved_speaking_never_overlaps_forwarding() {
        let (mut capture, _inbound, _signals) = attached(2);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        for step in 0..40u32 {
            if step % 7 == 0 {
                session.set_speaking(step % 14 == 0);
            }
            capture.handle(&mut session, CaptureSignal::Packet(vec![0; 2]), &sink_tx);
            let sent = sink_rx.try_recv().is_ok();
            assert!(!(session.is_speaking() && sent));
            assert!(!(session.is_speaking() && session.is_listening()));
        }
    }

    #[tokio::test]
    async fn test_bad_frame_is_dropped_not_fatal() {
        let (mut capture, _inbound, _signals) = attached(2);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 3]), &sink_tx);
        assert_eq!(capture.dropped(), 1);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 2]), &sink_tx);
        assert!(sink_rx.try_recv().is_ok());
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_end_flushes_tail_and_tears_down() {
        let (mut capture, inbound, mut signals) = attached(4);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let mut session = session();

        inbound.send(InboundAudio::Packet(vec![9; 6])).unwrap();
        drop(inbound);
        while let Some(signal) = signals.recv().await {
            capture.handle(&mut session, signal, &sink_tx);
            if capture.state() == CaptureState::TornDown {
                break;
            }
        }

        assert_eq!(sink_rx.try_recv().unwrap().len(), 4);
        assert_eq!(sink_rx.try_recv().unwrap().len(), 2);
        assert!(!session.is_listening());
    }

    #[tokio::test]
    async fn test_subscription_error_tears_down() {
        let (mut capture, _inbound, _signals) = attached(4);
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let mut session = session();
        session.resume_listening();

        capture.handle(&mut session, CaptureSignal::Failed("gone".into()), &sink_tx);
        assert_eq!(capture.state(), CaptureState::TornDown);
        assert!(!session.is_listening());

        // Second teardown and late packets are harmless
        capture.tear_down(&mut session);
        capture.handle(&mut session, CaptureSignal::Packet(vec![0; 4]), &sink_tx);
        assert_eq!(capture.state(), CaptureState::TornDown);
    }

    #[tokio::test]
    async fn test_attach_twice_fails() {
        let (mut capture, _inbound, _signals) = attached(4);
        let (_tx, rx) = mpsc::unbounded_channel();
        let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
        assert!(capture.attach(rx, Box::new(PcmPassthrough), 4, signal_tx).is_err());
    }
}
