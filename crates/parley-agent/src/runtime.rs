//! Per-session reactor.
//!
//! One task owns the [`VoiceSession`] and every pipeline attached to it.
//! Inbound audio, transcripts, debounce timers, synthesis and player events
//! and control commands all arrive as messages, so session state is only
//! ever mutated from this task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use parley_core::session::{SessionSnapshot, VoiceSession};
use parley_media::audio::VoiceConnection;
use parley_media::capture::{CapturePipeline, CaptureSignal};
use parley_media::playback::{PlaybackDone, PlaybackPipeline, PlaybackSignal};
use parley_media::transcription::{TranscriptionEvent, TranscriptionLink};
use parley_providers::Reasoner;

use crate::debounce::{Discard, TurnDebouncer};
use crate::dispatcher::{self, TurnReply};

/// Control messages from the session manager.
pub enum SessionCommand {
    Speak {
        text: String,
        done: Option<PlaybackDone>,
    },
    Teardown,
}

/// Lifecycle notifications for whoever drives the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The closing reply of an interview has finished playing.
    InterviewComplete { participant: String },
    /// The session tore itself down after a fatal pipeline error.
    Failed { participant: String, reason: String },
}

pub struct ReactorParts {
    pub session: VoiceSession,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub capture: CapturePipeline,
    pub capture_rx: mpsc::UnboundedReceiver<CaptureSignal>,
    pub playback: PlaybackPipeline,
    pub playback_rx: mpsc::UnboundedReceiver<PlaybackSignal>,
    pub transcription: TranscriptionLink,
    pub voice: Arc<dyn VoiceConnection>,
    pub reasoner: Arc<dyn Reasoner>,
    pub debounce: Duration,
    /// Upper bound on one reasoning call.
    pub reply_timeout: Duration,
    pub notices: mpsc::UnboundedSender<SessionNotice>,
}

/// Every event source the reactor selects over.
struct Inputs {
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    capture: mpsc::UnboundedReceiver<CaptureSignal>,
    playback: mpsc::UnboundedReceiver<PlaybackSignal>,
    transcripts: mpsc::UnboundedReceiver<TranscriptionEvent>,
    debounce: mpsc::UnboundedReceiver<u64>,
    replies: mpsc::UnboundedReceiver<TurnReply>,
}

pub struct SessionReactor {
    session: VoiceSession,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    debouncer: TurnDebouncer,
    voice: Arc<dyn VoiceConnection>,
    reasoner: Arc<dyn Reasoner>,
    reply_timeout: Duration,
    audio_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    snapshots: watch::Sender<SessionSnapshot>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    reply_tx: mpsc::UnboundedSender<TurnReply>,
    inputs: Option<Inputs>,
    dispatching: bool,
    torn_down: bool,
}

impl SessionReactor {
    /// Build the reactor; returns it with the snapshot feed it publishes to.
    pub fn new(parts: ReactorParts) -> (Self, watch::Receiver<SessionSnapshot>) {
        let snapshot = parts
            .session
            .snapshot(parts.capture.state(), parts.playback.state());
        let (snapshots, snapshot_rx) = watch::channel(snapshot);
        let (debounce_tx, debounce_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let TranscriptionLink { audio_tx, events } = parts.transcription;

        let reactor = Self {
            session: parts.session,
            capture: parts.capture,
            playback: parts.playback,
            debouncer: TurnDebouncer::new(parts.debounce, debounce_tx),
            voice: parts.voice,
            reasoner: parts.reasoner,
            reply_timeout: parts.reply_timeout,
            audio_tx: Some(audio_tx),
            snapshots,
            notices: parts.notices,
            reply_tx,
            inputs: Some(Inputs {
                commands: parts.commands,
                capture: parts.capture_rx,
                playback: parts.playback_rx,
                transcripts: events,
                debounce: debounce_rx,
                replies: reply_rx,
            }),
            dispatching: false,
            torn_down: false,
        };
        (reactor, snapshot_rx)
    }

    /// Drive the session until torn down; returns its final state.
    pub async fn run(mut self) -> VoiceSession {
        let Some(mut inputs) = self.inputs.take() else {
            return self.session;
        };

        info!("Session reactor started");
        let mut transcripts_open = true;

        loop {
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(SessionCommand::Speak { text, done }) => {
                        self.playback.speak(&mut self.session, text, done);
                    }
                    Some(SessionCommand::Teardown) | None => break,
                },
                Some(signal) = inputs.capture.recv() => {
                    self.on_capture(signal);
                }
                Some(signal) = inputs.playback.recv() => {
                    self.playback.handle(&mut self.session, signal);
                }
                event = inputs.transcripts.recv(), if transcripts_open => match event {
                    Some(event) => self.on_transcript(event),
                    None => {
                        warn!("Transcription link closed");
                        transcripts_open = false;
                    }
                },
                Some(generation) = inputs.debounce.recv() => {
                    self.on_debounce(generation);
                }
                Some(reply) = inputs.replies.recv() => {
                    self.on_reply(reply);
                }
            }

            self.publish();
            if self.torn_down {
                break;
            }
        }

        self.teardown();
        self.publish();
        info!("Session reactor stopped");
        self.session
    }

    /// Queue an utterance directly, ahead of any command.
    pub fn speak(&mut self, text: String, done: Option<PlaybackDone>) {
        self.playback.speak(&mut self.session, text, done);
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(
            self.session
                .snapshot(self.capture.state(), self.playback.state()),
        );
    }

    fn on_capture(&mut self, signal: CaptureSignal) {
        let failure = match &signal {
            CaptureSignal::Failed(reason) => Some(reason.clone()),
            _ => None,
        };

        match &self.audio_tx {
            Some(audio_tx) => self.capture.handle(&mut self.session, signal, audio_tx),
            None => return,
        }

        if let Some(reason) = failure {
            warn!(reason = %reason, "Inbound subscription failed, ending session");
            let _ = self.notices.send(SessionNotice::Failed {
                participant: self.session.participant_id().to_string(),
                reason,
            });
            self.teardown();
        }
    }

    fn on_transcript(&mut self, event: TranscriptionEvent) {
        match event {
            TranscriptionEvent::Opened { session_id } => {
                debug!(transcription_session = %session_id, "Transcription ready");
            }
            TranscriptionEvent::Turn(turn) => {
                if !self.session.is_active() {
                    return;
                }
                match self
                    .debouncer
                    .on_fragment(&turn.text, turn.order, self.session.is_speaking())
                {
                    Ok(()) => debug!(order = turn.order, "Transcript fragment pending"),
                    Err(Discard::Speaking) => debug!(order = turn.order, "Fragment dropped while speaking"),
                    Err(Discard::Empty) => {}
                }
            }
            TranscriptionEvent::Error(e) => warn!(error = %e, "Transcription link error"),
            TranscriptionEvent::Closed => debug!("Transcription session terminated"),
        }
    }

    fn on_debounce(&mut self, generation: u64) {
        let Some(utterance) = self.debouncer.on_elapsed(generation) else {
            return;
        };

        // Turns that finalize after speech started belong to the echo window
        if self.session.is_speaking() || self.dispatching || !self.session.is_active() {
            debug!("Dropping finalized turn while busy");
            return;
        }

        info!(chars = utterance.len(), "User turn finalized");
        let plan = dispatcher::plan_turn(&mut self.session, utterance);

        // Suppress capture for the whole dispatch → synthesize → play cycle
        self.session.set_speaking(true);
        self.dispatching = true;

        let reasoner = Arc::clone(&self.reasoner);
        let reply_tx = self.reply_tx.clone();
        let limit = self.reply_timeout;
        tokio::spawn(async move {
            let reply = dispatcher::execute_within(plan, reasoner.as_ref(), limit).await;
            let reply = reply.unwrap_or(TurnReply {
                text: String::new(),
                history: None,
                concluded: false,
            });
            let _ = reply_tx.send(reply);
        });
    }

    fn on_reply(&mut self, reply: TurnReply) {
        self.dispatching = false;
        dispatcher::apply_reply(&mut self.session, &reply);

        if reply.text.is_empty() {
            self.session.set_speaking(false);
            return;
        }

        let done = if reply.concluded {
            let (tx, rx) = oneshot::channel();
            let notices = self.notices.clone();
            let participant = self.session.participant_id().to_string();
            tokio::spawn(async move {
                if let Ok(outcome) = rx.await {
                    if let Err(e) = outcome {
                        warn!(error = %e, "Closing reply did not play");
                    }
                    let _ = notices.send(SessionNotice::InterviewComplete { participant });
                }
            });
            Some(tx)
        } else {
            None
        };

        self.playback.speak(&mut self.session, reply.text, done);
    }

    /// Release every pipeline and the voice connection. Idempotent.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.debouncer.cancel();
        self.capture.tear_down(&mut self.session);
        self.playback.tear_down(&mut self.session);
        // Dropping the audio sender terminates the transcription session
        self.audio_tx = None;
        self.voice.disconnect();
        self.session.teardown();
        info!("Session torn down");
    }
}
