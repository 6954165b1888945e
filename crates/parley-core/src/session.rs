//! Session state: one voice interaction with one tracked participant.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ParleyError, Result};

/// Where the session lives on the voice platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub participant_id: String,
    pub room_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Interview,
    Conversation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Junior,
    #[default]
    Intermediate,
    Senior,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Junior => "junior",
            Self::Intermediate => "intermediate",
            Self::Senior => "senior",
        })
    }
}

impl FromStr for Difficulty {
    type Err = ParleyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "junior" => Ok(Self::Junior),
            "intermediate" => Ok(Self::Intermediate),
            "senior" => Ok(Self::Senior),
            other => Err(ParleyError::Config(format!("unknown difficulty '{other}'"))),
        }
    }
}

/// Who said a line of conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Model,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: ChatRole::User, text: text.into() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: ChatRole::Model, text: text.into() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self { role: ChatRole::System, text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

/// Mode parameters supplied at session creation.
#[derive(Debug, Clone)]
pub enum ModeParams {
    Interview {
        role: String,
        difficulty: Difficulty,
        questions: Vec<String>,
    },
    Conversation {
        history: Vec<ChatTurn>,
    },
}

#[derive(Debug, Clone)]
pub struct InterviewState {
    pub role: String,
    pub difficulty: Difficulty,
    questions: Vec<String>,
    index: usize,
    answers: Vec<QaPair>,
}

impl InterviewState {
    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn answers(&self) -> &[QaPair] {
        &self.answers
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    history: Vec<ChatTurn>,
}

#[derive(Debug, Clone)]
pub enum SessionMode {
    Interview(InterviewState),
    Conversation(ConversationState),
}

/// Result of [`VoiceSession::current_question`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentQuestion<'a> {
    Asking(&'a str),
    Completed,
}

/// State of the inbound capture pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    Attached,
    Suspended,
    TornDown,
}

/// State of the outbound playback pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Connecting,
    Streaming,
}

/// Point-in-time view of a session for status display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub participant: String,
    pub mode: ModeKind,
    pub active: bool,
    pub speaking: bool,
    pub listening: bool,
    pub question_index: Option<usize>,
    pub total_questions: Option<usize>,
    pub current_question: Option<String>,
    pub answers: usize,
    pub conversation_turns: usize,
    pub elapsed_secs: i64,
    pub capture_state: CaptureState,
    pub playback_state: PlaybackState,
}

/// Shared mutable record of one participant's voice interaction.
///
/// `speaking` and `listening` are never both set: raising `speaking`
/// drops `listening`, and `listening` can only be raised while silent.
#[derive(Debug, Clone)]
pub struct VoiceSession {
    id: Uuid,
    identity: SessionIdentity,
    mode: SessionMode,
    started_at: DateTime<Utc>,
    active: bool,
    speaking: bool,
    listening: bool,
}

impl VoiceSession {
    pub fn new(identity: SessionIdentity, params: ModeParams) -> Self {
        let mode = match params {
            ModeParams::Interview { role, difficulty, questions } => {
                SessionMode::Interview(InterviewState {
                    role,
                    difficulty,
                    questions,
                    index: 0,
                    answers: Vec::new(),
                })
            }
            ModeParams::Conversation { history } => {
                SessionMode::Conversation(ConversationState { history })
            }
        };

        Self {
            id: Uuid::new_v4(),
            identity,
            mode,
            started_at: Utc::now(),
            active: true,
            speaking: false,
            listening: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn participant_id(&self) -> &str {
        &self.identity.participant_id
    }

    pub fn mode(&self) -> ModeKind {
        match self.mode {
            SessionMode::Interview(_) => ModeKind::Interview,
            SessionMode::Conversation(_) => ModeKind::Conversation,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn interview(&self) -> Option<&InterviewState> {
        match &self.mode {
            SessionMode::Interview(state) => Some(state),
            SessionMode::Conversation(_) => None,
        }
    }

    fn interview_mut(&mut self) -> Result<&mut InterviewState> {
        match &mut self.mode {
            SessionMode::Interview(state) => Ok(state),
            SessionMode::Conversation(_) => Err(ParleyError::Session(
                "operation requires interview mode".into(),
            )),
        }
    }

    // --- Liveness flags ---

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Raising `speaking` also drops `listening`; lowering it leaves
    /// `listening` for the capture pipeline to re-enable.
    pub fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking;
        if speaking {
            self.listening = false;
        }
    }

    /// Mark capture as forwarding. Refused while speaking or inactive.
    pub fn resume_listening(&mut self) -> bool {
        if self.speaking || !self.active {
            return false;
        }
        self.listening = true;
        true
    }

    pub fn stop_listening(&mut self) {
        self.listening = false;
    }

    /// Clear all flags and mark the session inactive. Idempotent.
    pub fn teardown(&mut self) {
        self.active = false;
        self.speaking = false;
        self.listening = false;
    }

    // --- Interview ---

    /// Append an answer to the question currently being asked.
    pub fn record_answer(&mut self, text: &str) -> Result<()> {
        let state = self.interview_mut()?;
        let question = state
            .questions
            .get(state.index)
            .cloned()
            .ok_or_else(|| ParleyError::Session("interview already complete".into()))?;
        state.answers.push(QaPair {
            question,
            answer: text.to_string(),
        });
        Ok(())
    }

    /// Move to the next question. Returns whether one remains.
    pub fn advance_question(&mut self) -> bool {
        match &mut self.mode {
            SessionMode::Interview(state) => {
                if state.index < state.questions.len() {
                    state.index += 1;
                }
                state.index < state.questions.len()
            }
            SessionMode::Conversation(_) => false,
        }
    }

    pub fn current_question(&self) -> CurrentQuestion<'_> {
        match &self.mode {
            SessionMode::Interview(state) => state
                .questions
                .get(state.index)
                .map(|q| CurrentQuestion::Asking(q.as_str()))
                .unwrap_or(CurrentQuestion::Completed),
            SessionMode::Conversation(_) => CurrentQuestion::Completed,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.interview()
            .is_some_and(|state| state.index >= state.questions.len())
    }

    // --- Conversation ---

    pub fn conversation_history(&self) -> &[ChatTurn] {
        match &self.mode {
            SessionMode::Conversation(state) => &state.history,
            SessionMode::Interview(_) => &[],
        }
    }

    /// Replace the conversation history wholesale with the service's copy.
    pub fn replace_history(&mut self, history: Vec<ChatTurn>) -> Result<()> {
        match &mut self.mode {
            SessionMode::Conversation(state) => {
                state.history = history;
                Ok(())
            }
            SessionMode::Interview(_) => Err(ParleyError::Session(
                "operation requires conversation mode".into(),
            )),
        }
    }

    pub fn snapshot(&self, capture_state: CaptureState, playback_state: PlaybackState) -> SessionSnapshot {
        let interview = self.interview();
        let current_question = match self.current_question() {
            CurrentQuestion::Asking(q) => Some(q.to_string()),
            CurrentQuestion::Completed => None,
        };

        SessionSnapshot {
            session_id: self.id,
            participant: self.identity.participant_id.clone(),
            mode: self.mode(),
            active: self.active,
            speaking: self.speaking,
            listening: self.listening,
            question_index: interview.map(|s| s.index),
            total_questions: interview.map(|s| s.questions.len()),
            current_question,
            answers: interview.map(|s| s.answers.len()).unwrap_or(0),
            conversation_turns: self.conversation_history().len(),
            elapsed_secs: (Utc::now() - self.started_at).num_seconds(),
            capture_state,
            playback_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            participant_id: "user-1".into(),
            room_id: "guild-1".into(),
            channel_id: "voice-1".into(),
        }
    }

    fn interview(count: usize) -> VoiceSession {
        let questions = (1..=count).map(|i| format!("Question {i}?")).collect();
        VoiceSession::new(
            identity(),
            ModeParams::Interview {
                role: "backend".into(),
                difficulty: Difficulty::Intermediate,
                questions,
            },
        )
    }

    #[test]
    fn test_advance_question_exhausts() {
        let mut session = interview(5);
        let results: Vec<bool> = (0..5).map(|_| session.advance_question()).collect();
        assert_eq!(results, vec![true, true, true, true, false]);
        assert_eq!(session.current_question(), CurrentQuestion::Completed);
        assert!(session.is_complete());

        // Further calls never push the index past the end
        assert!(!session.advance_question());
        assert_eq!(session.interview().unwrap().index(), 5);
    }

    #[test]
    fn test_record_answer_pairs_current_question() {
        let mut session = interview(2);
        session.record_answer("first").unwrap();
        session.advance_question();
        session.record_answer("second").unwrap();

        let answers = session.interview().unwrap().answers();
        assert_eq!(answers[0].question, "Question 1?");
        assert_eq!(answers[1].question, "Question 2?");
        assert_eq!(answers[1].answer, "second");

        session.advance_question();
        assert!(session.record_answer("late").is_err());
    }

    #[test]
    fn test_record_answer_rejects_conversation() {
        let mut session = VoiceSession::new(identity(), ModeParams::Conversation { history: vec![] });
        assert!(matches!(
            session.record_answer("hi"),
            Err(ParleyError::Session(_))
        ));
        assert!(!session.advance_question());
    }

    #[test]
    fn test_speaking_clears_listening() {
        let mut session = interview(1);
        assert!(session.resume_listening());
        assert!(session.is_listening());

        session.set_speaking(true);
        assert!(!session.is_listening());
        assert!(!session.resume_listening());

        session.set_speaking(false);
        assert!(!session.is_listening(), "listening is re-enabled by capture, not playback");
        assert!(session.resume_listening());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut session = interview(1);
        session.set_speaking(true);
        session.teardown();
        session.teardown();
        assert!(!session.is_active());
        assert!(!session.is_speaking());
        assert!(!session.resume_listening());
    }

    #[test]
    fn test_replace_history() {
        let mut session = VoiceSession::new(identity(), ModeParams::Conversation { history: vec![] });
        session
            .replace_history(vec![ChatTurn::user("hi"), ChatTurn::model("hello")])
            .unwrap();
        assert_eq!(session.conversation_history().len(), 2);
        assert_eq!(session.mode(), ModeKind::Conversation);
    }

    #[test]
    fn test_snapshot_fields() {
        let mut session = interview(3);
        session.record_answer("a").unwrap();
        session.advance_question();
        let snap = session.snapshot(CaptureState::Attached, PlaybackState::Idle);
        assert_eq!(snap.question_index, Some(1));
        assert_eq!(snap.total_questions, Some(3));
        assert_eq!(snap.current_question.as_deref(), Some("Question 2?"));
        assert_eq!(snap.answers, 1);
        assert_eq!(snap.capture_state, CaptureState::Attached);
    }

    #[test]
    fn test_difficulty_parse() {
        assert_eq!("Senior".parse::<Difficulty>().unwrap(), Difficulty::Senior);
        assert!("expert".parse::<Difficulty>().is_err());
        assert_eq!(Difficulty::default().to_string(), "intermediate");
    }
}
