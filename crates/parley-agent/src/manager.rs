//! Session manager: create, look up and end voice sessions.
//!
//! Holds the process-owned registry of per-participant reactors and the
//! service boundaries every new session is wired to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use parley_core::config::VoiceConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::registry::SessionRegistry;
use parley_core::session::{
    Difficulty, ModeKind, ModeParams, SessionIdentity, SessionSnapshot, VoiceSession,
};
use parley_media::audio::{VoiceConnection, VoiceGateway};
use parley_media::capture::{CapturePipeline, FrameDecoder, PcmPassthrough};
use parley_media::playback::PlaybackPipeline;
use parley_media::synthesis::SynthesisService;
use parley_media::transcription::TranscriptionService;
use parley_providers::{InterviewReport, Reasoner};

use crate::dispatcher;
use crate::runtime::{ReactorParts, SessionCommand, SessionNotice, SessionReactor};

/// External boundaries shared by every session.
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<dyn VoiceGateway>,
    pub transcription: Arc<dyn TranscriptionService>,
    pub synthesis: Arc<dyn SynthesisService>,
    pub reasoner: Arc<dyn Reasoner>,
}

/// Mode requested by the caller at session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeRequest {
    Interview { role: String, difficulty: Difficulty },
    Conversation,
}

/// What ending a session reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub participant: String,
    pub mode: ModeKind,
    pub duration_secs: i64,
    pub detail: SessionDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionDetail {
    Interview {
        role: String,
        difficulty: Difficulty,
        answered: usize,
        total_questions: usize,
        /// Percentage of questions answered, rounded.
        completion_rate: u32,
        report: InterviewReport,
    },
    Conversation {
        turns: usize,
    },
}

type DecoderFactory = Arc<dyn Fn() -> Box<dyn FrameDecoder> + Send + Sync>;

/// Registry entry: the way in to one running reactor.
struct SessionHandle {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: Mutex<Option<JoinHandle<VoiceSession>>>,
}

impl SessionHandle {
    /// Stop the reactor and collect its final session state.
    async fn stop(&self) -> Option<VoiceSession> {
        let _ = self.commands.send(SessionCommand::Teardown);
        let task = self.task.lock().await.take()?;
        match task.await {
            Ok(session) => Some(session),
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Session task failed");
                None
            }
        }
    }
}

pub struct SessionManager {
    services: Services,
    voice: VoiceConfig,
    decoder: DecoderFactory,
    registry: SessionRegistry<Arc<SessionHandle>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionManager {
    /// Create a manager; the receiver yields lifecycle notices from every session.
    pub fn new(services: Services, voice: VoiceConfig) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let manager = Self {
            services,
            voice,
            decoder: Arc::new(|| Box::new(PcmPassthrough) as Box<dyn FrameDecoder>),
            registry: SessionRegistry::new(),
            notices,
        };
        (manager, notices_rx)
    }

    /// Use a different inbound codec for sessions created from now on.
    pub fn with_decoder<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FrameDecoder> + Send + Sync + 'static,
    {
        self.decoder = Arc::new(factory);
        self
    }

    pub async fn participants(&self) -> Vec<String> {
        self.registry.participants().await
    }

    /// Set up a session for `identity` and start its reactor.
    ///
    /// Fails with [`ParleyError::DuplicateSession`] if the participant
    /// already has one, and with [`ParleyError::ConnectionNotReady`] if the
    /// voice connection does not come up within the ready timeout. Partial
    /// setup is released before any error is returned.
    pub async fn create(&self, identity: SessionIdentity, mode: ModeRequest) -> Result<SessionSnapshot> {
        let participant = identity.participant_id.clone();
        if self.registry.contains(&participant).await {
            return Err(ParleyError::DuplicateSession(participant));
        }

        let params = match mode {
            ModeRequest::Interview { role, difficulty } => {
                let questions = self
                    .services
                    .reasoner
                    .generate_questions(&role, difficulty)
                    .await;
                info!(participant = %participant, role = %role, count = questions.len(), "Interview questions ready");
                ModeParams::Interview {
                    role,
                    difficulty,
                    questions,
                }
            }
            ModeRequest::Conversation => ModeParams::Conversation { history: Vec::new() },
        };

        let voice = match tokio::time::timeout(
            self.voice.ready_timeout(),
            self.services
                .gateway
                .join(&identity.room_id, &identity.channel_id),
        )
        .await
        {
            Ok(Ok(voice)) => voice,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ParleyError::ConnectionNotReady(format!(
                    "not ready after {}s",
                    self.voice.ready_timeout_secs
                )));
            }
        };

        let session = VoiceSession::new(identity, params);
        let session_id = session.id();
        let started_at = session.started_at();
        let greeting = dispatcher::greeting(&session);

        let (mut reactor, snapshots, commands) = match self.wire(session, Arc::clone(&voice)).await {
            Ok(wired) => wired,
            Err(e) => {
                voice.disconnect();
                return Err(e);
            }
        };

        // Queued before the reactor runs so the first snapshot already shows speaking
        let (done_tx, done_rx) = oneshot::channel();
        reactor.speak(greeting, Some(done_tx));
        tokio::spawn(
            async move {
                if let Ok(Err(e)) = done_rx.await {
                    warn!(error = %e, "Greeting did not play");
                }
            }
            .instrument(info_span!("greeting", participant = %participant)),
        );

        let snapshot = snapshots.borrow().clone();
        let span = info_span!("session", participant = %participant, session_id = %session_id);
        let task = tokio::spawn(reactor.run().instrument(span));

        let handle = Arc::new(SessionHandle {
            session_id,
            started_at,
            commands,
            snapshots,
            task: Mutex::new(Some(task)),
        });

        if let Err(e) = self.registry.insert(&participant, Arc::clone(&handle)).await {
            // Lost a race with a concurrent create for the same participant
            handle.stop().await;
            return Err(e);
        }

        info!(session_id = %session_id, "Session started");
        Ok(snapshot)
    }

    /// Connect transcription, attach capture and build playback for a
    /// freshly joined connection.
    async fn wire(
        &self,
        session: VoiceSession,
        voice: Arc<dyn VoiceConnection>,
    ) -> Result<(
        SessionReactor,
        watch::Receiver<SessionSnapshot>,
        mpsc::UnboundedSender<SessionCommand>,
    )> {
        let transcription = self.services.transcription.connect().await?;
        let inbound = voice.subscribe(session.participant_id())?;

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let mut capture = CapturePipeline::new();
        capture.attach(inbound, (self.decoder)(), self.voice.chunk_bytes, capture_tx)?;

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let playback = PlaybackPipeline::new(
            Arc::clone(&self.services.synthesis),
            Arc::clone(&voice),
            playback_tx,
            self.voice.playback_timeout(),
        );

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (reactor, snapshots) = SessionReactor::new(ReactorParts {
            session,
            commands: commands_rx,
            capture,
            capture_rx,
            playback,
            playback_rx,
            transcription,
            voice,
            reasoner: Arc::clone(&self.services.reasoner),
            debounce: self.voice.debounce(),
            reply_timeout: self.voice.reasoning_timeout(),
            notices: self.notices.clone(),
        });
        Ok((reactor, snapshots, commands))
    }

    /// Speak `text` in a participant's session and wait until it has played.
    pub async fn speak(&self, participant: &str, text: impl Into<String>) -> Result<()> {
        let handle = self.handle(participant).await?;
        let (done_tx, done_rx) = oneshot::channel();
        handle
            .commands
            .send(SessionCommand::Speak {
                text: text.into(),
                done: Some(done_tx),
            })
            .map_err(|_| ParleyError::Session("session has ended".into()))?;
        done_rx
            .await
            .map_err(|_| ParleyError::Session("session ended before playback finished".into()))?
    }

    /// Best-known snapshot of a participant's session.
    ///
    /// Served from the last state the reactor published, so it answers even
    /// after the reactor has stopped.
    pub async fn status(&self, participant: &str) -> Result<SessionSnapshot> {
        let handle = self.handle(participant).await?;
        let mut snapshot = handle.snapshots.borrow().clone();
        snapshot.elapsed_secs = (Utc::now() - handle.started_at).num_seconds();
        Ok(snapshot)
    }

    /// Tear a session down and summarize it. Interviews get a final report.
    pub async fn end_session(&self, participant: &str) -> Result<SessionSummary> {
        let handle = self
            .registry
            .remove(participant)
            .await
            .ok_or_else(|| ParleyError::SessionNotFound(participant.to_string()))?;

        let session = handle
            .stop()
            .await
            .ok_or_else(|| ParleyError::Session("session task did not return its state".into()))?;

        let detail = match session.interview() {
            Some(interview) => {
                let answered = interview.answers().len();
                let total_questions = interview.questions().len();
                let report = self
                    .services
                    .reasoner
                    .final_report(&interview.role, interview.answers())
                    .await;
                SessionDetail::Interview {
                    role: interview.role.clone(),
                    difficulty: interview.difficulty,
                    answered,
                    total_questions,
                    completion_rate: completion_rate(answered, total_questions),
                    report,
                }
            }
            None => SessionDetail::Conversation {
                turns: session.conversation_history().len(),
            },
        };

        let summary = SessionSummary {
            session_id: session.id(),
            participant: participant.to_string(),
            mode: session.mode(),
            duration_secs: (Utc::now() - handle.started_at).num_seconds(),
            detail,
        };
        info!(participant, session_id = %summary.session_id, duration_secs = summary.duration_secs, "Session ended");
        Ok(summary)
    }

    /// Tear a session down without building a summary.
    pub async fn teardown(&self, participant: &str) -> Result<()> {
        let handle = self
            .registry
            .remove(participant)
            .await
            .ok_or_else(|| ParleyError::SessionNotFound(participant.to_string()))?;
        handle.stop().await;
        info!(participant, "Session torn down");
        Ok(())
    }

    /// Tear down every session. Failures are logged, never raised.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain().await;
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Shutting down sessions");
        for (participant, handle) in sessions {
            if handle.stop().await.is_none() {
                warn!(participant = %participant, "Session did not stop cleanly");
            }
        }
    }

    async fn handle(&self, participant: &str) -> Result<Arc<SessionHandle>> {
        self.registry
            .get(participant)
            .await
            .ok_or_else(|| ParleyError::SessionNotFound(participant.to_string()))
    }
}

fn completion_rate(answered: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((answered as f64 / total as f64) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_rate() {
        assert_eq!(completion_rate(0, 0), 0);
        assert_eq!(completion_rate(2, 3), 67);
        assert_eq!(completion_rate(5, 5), 100);
    }

    #[test]
    fn test_summary_serializes_tagged_detail() {
        let summary = SessionSummary {
            session_id: Uuid::nil(),
            participant: "user-1".into(),
            mode: ModeKind::Conversation,
            duration_secs: 42,
            detail: SessionDetail::Conversation { turns: 4 },
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["detail"]["kind"], "conversation");
        assert_eq!(json["detail"]["turns"], 4);
    }
}
