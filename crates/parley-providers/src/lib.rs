//! Reasoning service abstraction.
//!
//! The session pipeline talks to a [`Reasoner`] for question generation,
//! answer evaluation, interview feedback and reports, and conversation
//! replies. [`GeminiReasoner`] implements it over the Gemini API.

pub mod gemini;
pub mod reasoning;

pub use gemini::GeminiClient;
pub use reasoning::{ConversationReply, GeminiReasoner, InterviewReport, Reasoner};
