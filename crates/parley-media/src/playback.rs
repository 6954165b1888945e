//! Playback pipeline: stream reply text through synthesis, reframe the
//! mono audio to stereo, and feed the session's player.
//!
//! `Idle → Connecting → Streaming → Idle`. The session's `speaking` flag is
//! raised as soon as text is accepted and cleared when the player reports
//! idle, or on any failure before the failure is surfaced.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::error::{ParleyError, Result};
use parley_core::session::{PlaybackState, VoiceSession};

use crate::audio::{PlayerEvent, VoiceConnection};
use crate::reframe::mono_to_stereo;
use crate::synthesis::{SynthesisConnection, SynthesisEvent, SynthesisService};

/// Resolved once an utterance has finished playing or failed.
pub type PlaybackDone = oneshot::Sender<Result<()>>;

/// Events the pipeline's helper tasks post back to the session reactor.
pub enum PlaybackSignal {
    Opened {
        seq: u64,
        result: Result<SynthesisConnection>,
    },
    Synthesis {
        connection: u64,
        event: SynthesisEvent,
    },
    Player {
        seq: u64,
        event: PlayerEvent,
    },
    Timeout {
        seq: u64,
    },
}

struct Utterance {
    text: String,
    done: Option<PlaybackDone>,
}

struct InFlight {
    seq: u64,
    text: String,
    done: Option<PlaybackDone>,
    player_started: bool,
    final_received: bool,
}

pub struct PlaybackPipeline {
    state: PlaybackState,
    service: Arc<dyn SynthesisService>,
    voice: Arc<dyn VoiceConnection>,
    signals: mpsc::UnboundedSender<PlaybackSignal>,
    timeout: Duration,

    text_tx: Option<mpsc::UnboundedSender<String>>,
    connection_id: u64,
    connection_task: Option<JoinHandle<()>>,

    current: Option<InFlight>,
    queue: VecDeque<Utterance>,
    seq: u64,
    frames_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    player_task: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl PlaybackPipeline {
    pub fn new(
        service: Arc<dyn SynthesisService>,
        voice: Arc<dyn VoiceConnection>,
        signals: mpsc::UnboundedSender<PlaybackSignal>,
        timeout: Duration,
    ) -> Self {
        Self {
            state: PlaybackState::Idle,
            service,
            voice,
            signals,
            timeout,
            text_tx: None,
            connection_id: 0,
            connection_task: None,
            current: None,
            queue: VecDeque::new(),
            seq: 0,
            frames_tx: None,
            player_task: None,
            timer: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_connection(&self) -> bool {
        self.text_tx.is_some()
    }

    /// Queue `text` for playback. Speaking is raised immediately, before
    /// any audio exists, so capture is suppressed from this point on.
    pub fn speak(
        &mut self,
        session: &mut VoiceSession,
        text: String,
        done: Option<PlaybackDone>,
    ) {
        session.set_speaking(true);

        if self.current.is_some() {
            debug!(queued = self.queue.len() + 1, "Playback busy, queueing utterance");
            self.queue.push_back(Utterance { text, done });
            return;
        }
        self.start(Utterance { text, done });
    }

    fn start(&mut self, utterance: Utterance) {
        self.seq += 1;
        let seq = self.seq;
        debug!(seq, chars = utterance.text.len(), "Starting utterance");

        self.arm_timer(seq);
        self.state = PlaybackState::Connecting;
        self.current = Some(InFlight {
            seq,
            text: utterance.text.clone(),
            done: utterance.done,
            player_started: false,
            final_received: false,
        });

        // Reuse the open connection when there is one
        if let Some(text_tx) = &self.text_tx {
            if text_tx.send(utterance.text).is_ok() {
                return;
            }
            self.close_connection();
        }

        let service = Arc::clone(&self.service);
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let result = service.open().await;
            let _ = signals.send(PlaybackSignal::Opened { seq, result });
        });
    }

    fn arm_timer(&mut self, seq: u64) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let signals = self.signals.clone();
        let timeout = self.timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = signals.send(PlaybackSignal::Timeout { seq });
        }));
    }

    fn current_seq(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.seq)
    }

    /// React to one signal from a helper task.
    pub fn handle(&mut self, session: &mut VoiceSession, signal: PlaybackSignal) {
        match signal {
            PlaybackSignal::Opened { seq, result } => self.on_opened(session, seq, result),
            PlaybackSignal::Synthesis { connection, event } => {
                if connection == self.connection_id {
                    self.on_synthesis(session, event);
                }
            }
            PlaybackSignal::Player { seq, event } => {
                if self.current_seq() == Some(seq) {
                    self.on_player(session, event);
                }
            }
            PlaybackSignal::Timeout { seq } => {
                if self.current_seq() == Some(seq) {
                    let secs = self.timeout.as_secs();
                    self.fail(session, ParleyError::PlaybackTimeout(secs));
                }
            }
        }
    }

    fn on_opened(
        &mut self,
        session: &mut VoiceSession,
        seq: u64,
        result: Result<SynthesisConnection>,
    ) {
        if self.current_seq() != Some(seq) {
            debug!(seq, "Discarding connection for abandoned utterance");
            return;
        }

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                self.fail(session, e);
                return;
            }
        };

        self.connection_id += 1;
        let id = self.connection_id;
        let SynthesisConnection { text_tx, mut events } = connection;

        let signals = self.signals.clone();
        self.connection_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if signals
                    .send(PlaybackSignal::Synthesis { connection: id, event })
                    .is_err()
                {
                    break;
                }
            }
        }));

        let text = self.current.as_ref().map(|c| c.text.clone()).unwrap_or_default();
        if text_tx.send(text).is_err() {
            self.fail(
                session,
                ParleyError::SynthesisLink("connection closed before text was sent".into()),
            );
            return;
        }
        self.text_tx = Some(text_tx);
    }

    fn on_synthesis(&mut self, session: &mut VoiceSession, event: SynthesisEvent) {
        match event {
            SynthesisEvent::Audio(bytes) => self.on_audio(session, &bytes),
            SynthesisEvent::FinalAudio(bytes) => {
                if !bytes.is_empty() {
                    self.on_audio(session, &bytes);
                }
                let Some(current) = self.current.as_mut() else {
                    return;
                };
                current.final_received = true;
                // Closing the frame input lets the player drain and go idle
                self.frames_tx = None;
                if !current.player_started {
                    debug!("Synthesis produced no audio");
                    self.complete(session, Ok(()));
                }
            }
            SynthesisEvent::Error(e) => {
                self.close_connection();
                if self.current.is_some() {
                    self.fail(session, ParleyError::SynthesisLink(e));
                } else {
                    warn!(error = %e, "Synthesis connection error while idle");
                }
            }
            SynthesisEvent::Closed => {
                debug!("Synthesis connection closed");
                self.close_connection();
                let mid_utterance = self.current.as_ref().is_some_and(|c| !c.final_received);
                if mid_utterance {
                    self.fail(
                        session,
                        ParleyError::SynthesisLink("connection closed mid-utterance".into()),
                    );
                }
            }
        }
    }

    fn on_audio(&mut self, session: &mut VoiceSession, mono: &[u8]) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if current.final_received {
            return;
        }

        let stereo = match mono_to_stereo(mono) {
            Ok(stereo) => stereo,
            Err(e) => {
                warn!(error = %e, "Dropping malformed synthesis fragment");
                return;
            }
        };

        // Start playing on the first fragment rather than on connect
        if !current.player_started {
            current.player_started = true;
            let seq = current.seq;
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            match self.voice.play(frames_rx) {
                Ok(mut events) => {
                    let signals = self.signals.clone();
                    self.player_task = Some(tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            if signals.send(PlaybackSignal::Player { seq, event }).is_err() {
                                break;
                            }
                        }
                    }));
                    self.frames_tx = Some(frames_tx);
                    self.state = PlaybackState::Streaming;
                    info!(seq, "Playback started");
                }
                Err(e) => {
                    self.fail(session, e);
                    return;
                }
            }
        }

        if let Some(frames_tx) = &self.frames_tx {
            let _ = frames_tx.send(stereo);
        }
    }

    fn on_player(&mut self, session: &mut VoiceSession, event: PlayerEvent) {
        match event {
            PlayerEvent::Playing => debug!("Player playing"),
            PlayerEvent::Idle => self.complete(session, Ok(())),
            PlayerEvent::Error(e) => self.fail(session, ParleyError::Playback(e)),
        }
    }

    fn fail(&mut self, session: &mut VoiceSession, err: ParleyError) {
        warn!(error = %err, "Playback failed");
        if matches!(err, ParleyError::SynthesisLink(_) | ParleyError::PlaybackTimeout(_)) {
            self.close_connection();
        }
        self.complete(session, Err(err));
    }

    /// Finish the in-flight utterance, release speaking, then start the next.
    fn complete(&mut self, session: &mut VoiceSession, outcome: Result<()>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(player) = self.player_task.take() {
            player.abort();
        }
        self.frames_tx = None;
        self.state = PlaybackState::Idle;
        session.set_speaking(false);

        if let Some(current) = self.current.take() {
            if outcome.is_ok() {
                info!(seq = current.seq, "Playback finished");
            }
            if let Some(done) = current.done {
                let _ = done.send(outcome);
            }
        }

        if let Some(next) = self.queue.pop_front() {
            session.set_speaking(true);
            self.start(next);
        }
    }

    fn close_connection(&mut self) {
        self.text_tx = None;
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
    }

    /// Close the synthesis connection and reject anything pending. Idempotent.
    pub fn tear_down(&mut self, session: &mut VoiceSession) {
        self.close_connection();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(player) = self.player_task.take() {
            player.abort();
        }
        self.frames_tx = None;
        self.state = PlaybackState::Idle;
        session.set_speaking(false);

        let pending = self
            .current
            .take()
            .and_then(|c| c.done)
            .into_iter()
            .chain(self.queue.drain(..).filter_map(|u| u.done));
        for done in pending {
            let _ = done.send(Err(ParleyError::Session("session ended".into())));
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        for task in [
            self.connection_task.take(),
            self.player_task.take(),
            self.timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
