//! Turn dispatcher: turn a finalized utterance into reply text.
//!
//! Split in two so session mutation stays on the reactor: [`plan_turn`]
//! updates interview state synchronously, [`execute`] makes the reasoning
//! call off-reactor, and [`apply_reply`] writes any returned history back.

use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::session::{ChatTurn, CurrentQuestion, ModeKind, QaPair, VoiceSession};
use parley_providers::Reasoner;

/// Spoken when answer evaluation fails while the interview continues.
pub const ERROR_FALLBACK: &str = "I'm sorry, there was an error. Let's continue with the next question.";

/// Spoken when a conversation reply fails.
pub const CONVERSATION_FALLBACK: &str = "Sorry, I lost my train of thought there. Could you say that again?";

/// Spoken when the closing feedback call fails.
pub const COMPLETE_FALLBACK: &str = "Thank you for your response. The interview is now complete.";

pub const COMPLETION_NOTICE: &str = "Thank you for completing the interview! You can use the leave command to disconnect.";

pub const CONVERSATION_GREETING: &str = "Hey there! What's on your mind?";

/// Opening line spoken once a session is set up.
pub fn greeting(session: &VoiceSession) -> String {
    match (session.mode(), session.current_question()) {
        (ModeKind::Interview, CurrentQuestion::Asking(first)) => {
            format!("Let's begin with the first question: {first}")
        }
        _ => CONVERSATION_GREETING.to_string(),
    }
}

/// What the reasoning service must be asked for this turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnPlan {
    Converse {
        utterance: String,
        history: Vec<ChatTurn>,
    },
    /// Answer recorded and pointer advanced; reply is feedback + next question.
    Evaluate {
        role: String,
        question: String,
        answer: String,
        next_question: String,
    },
    /// Last answer recorded; session already inactive.
    Conclude {
        role: String,
        answers: Vec<QaPair>,
    },
    /// Nothing to say (interview already finished).
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub text: String,
    /// Replacement conversation history, when the service returned one.
    pub history: Option<Vec<ChatTurn>>,
    pub concluded: bool,
}

/// Update session state for a finalized utterance.
pub fn plan_turn(session: &mut VoiceSession, utterance: String) -> TurnPlan {
    if session.mode() == ModeKind::Conversation {
        return TurnPlan::Converse {
            utterance,
            history: session.conversation_history().to_vec(),
        };
    }

    let question = match session.current_question() {
        CurrentQuestion::Asking(q) => q.to_string(),
        CurrentQuestion::Completed => {
            debug!("Utterance after interview completion ignored");
            return TurnPlan::Ignore;
        }
    };

    if let Err(e) = session.record_answer(&utterance) {
        warn!(error = %e, "Could not record answer");
        return TurnPlan::Ignore;
    }

    let role = session
        .interview()
        .map(|i| i.role.clone())
        .unwrap_or_default();

    if session.advance_question() {
        let next_question = match session.current_question() {
            CurrentQuestion::Asking(q) => q.to_string(),
            CurrentQuestion::Completed => String::new(),
        };
        TurnPlan::Evaluate {
            role,
            question,
            answer: utterance,
            next_question,
        }
    } else {
        session.deactivate();
        info!("Final answer recorded, interview complete");
        TurnPlan::Conclude {
            role,
            answers: session
                .interview()
                .map(|i| i.answers().to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Run the reasoning call for a plan. Never fails: errors become a fallback reply.
pub async fn execute(plan: TurnPlan, reasoner: &dyn Reasoner) -> Option<TurnReply> {
    let reply = match plan {
        TurnPlan::Ignore => return None,
        TurnPlan::Converse { utterance, history } => {
            match reasoner.continue_conversation(&utterance, &history).await {
                Ok(reply) => TurnReply {
                    text: reply.text,
                    history: Some(reply.history),
                    concluded: false,
                },
                Err(e) => {
                    warn!(error = %e, "Conversation reply failed, using fallback");
                    TurnReply {
                        text: CONVERSATION_FALLBACK.to_string(),
                        history: None,
                        concluded: false,
                    }
                }
            }
        }
        TurnPlan::Evaluate {
            role,
            question,
            answer,
            next_question,
        } => {
            let feedback = match reasoner.evaluate_answer(&question, &answer, &role).await {
                Ok(feedback) => feedback.trim().to_string(),
                Err(e) => {
                    warn!(error = %e, "Answer evaluation failed, using fallback");
                    ERROR_FALLBACK.to_string()
                }
            };
            TurnReply {
                text: format!("{feedback} {next_question}"),
                history: None,
                concluded: false,
            }
        }
        TurnPlan::Conclude { role, answers } => {
            let text = match reasoner.final_feedback(&role, &answers).await {
                Ok(summary) => format!("{} {COMPLETION_NOTICE}", summary.trim()),
                Err(e) => {
                    warn!(error = %e, "Final feedback failed, using fallback");
                    COMPLETE_FALLBACK.to_string()
                }
            };
            TurnReply {
                text,
                history: None,
                concluded: true,
            }
        }
    };
    Some(reply)
}

/// The reply spoken when the reasoning call for `plan` cannot be used.
pub fn fallback_reply(plan: &TurnPlan) -> Option<TurnReply> {
    let (text, concluded) = match plan {
        TurnPlan::Ignore => return None,
        TurnPlan::Converse { .. } => (CONVERSATION_FALLBACK.to_string(), false),
        TurnPlan::Evaluate { next_question, .. } => {
            (format!("{ERROR_FALLBACK} {next_question}"), false)
        }
        TurnPlan::Conclude { .. } => (COMPLETE_FALLBACK.to_string(), true),
    };
    Some(TurnReply {
        text,
        history: None,
        concluded,
    })
}

/// [`execute`] bounded by `limit`; a call still pending at the deadline is
/// abandoned and the plan's fallback reply used instead.
pub async fn execute_within(
    plan: TurnPlan,
    reasoner: &dyn Reasoner,
    limit: Duration,
) -> Option<TurnReply> {
    let fallback = fallback_reply(&plan);
    match tokio::time::timeout(limit, execute(plan, reasoner)).await {
        Ok(reply) => reply,
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Reasoning call timed out, using fallback");
            fallback
        }
    }
}

/// Write the service-owned history back to the session.
pub fn apply_reply(session: &mut VoiceSession, reply: &TurnReply) {
    if let Some(history) = &reply.history {
        if let Err(e) = session.replace_history(history.clone()) {
            warn!(error = %e, "Could not replace conversation history");
        }
    }
}

/// Plan, execute and apply in one step.
pub async fn dispatch_turn(
    session: &mut VoiceSession,
    utterance: String,
    reasoner: &dyn Reasoner,
) -> Option<TurnReply> {
    let plan = plan_turn(session, utterance);
    let reply = execute(plan, reasoner).await?;
    apply_reply(session, &reply);
    Some(reply)
}
