//! Reasoning service boundary and its Gemini implementation.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use parley_core::config::ReasoningConfig;
use parley_core::error::{ParleyError, Result};
use parley_core::session::{ChatRole, ChatTurn, Difficulty, QaPair};

use crate::gemini::{Content, GeminiClient, GeminiRequest, GenerationConfig, SafetySetting};

/// Questions used when generation fails or returns nothing usable.
pub const FALLBACK_QUESTIONS: [&str; 5] = [
    "Can you explain the event loop in Node.js?",
    "What's the difference between SQL and NoSQL databases?",
    "How would you implement user authentication in a Node.js app?",
    "Explain middleware in Express.js with an example.",
    "How would you optimize a slow Node.js application?",
];

const CREATOR_REPLY: &str = "I was created by the team 'Classroom of the Elite', and my voice is powered by Murf.ai! What else can I help you with today?";

const CONVERSATION_PERSONA: &str = "You are a friendly and engaging conversational AI assistant. \
Your name is not Gemini. You were developed by a team called Classroom of the Elite, \
and your voice is powered by Murf AI. \
Your responses must be calm, concise, and written in simple, easily readable text. \
Always keep your answer under 100 words. \
You must always end your response by asking a relevant, open-ended follow-up question to encourage continued interaction. \
Do not use markdown formatting.";

static CREATOR_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)who (made|created|developed) you").expect("static pattern")
});

/// Structured end-of-interview report. Scores are clamped to 0–10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewReport {
    pub total_score: f32,
    pub technical_score: f32,
    pub communication_score: f32,
    pub overall_performance: f32,
    pub strengths: Vec<String>,
    pub improvement_areas: Vec<String>,
    pub detailed_feedback: String,
    pub next_steps: String,
}

impl InterviewReport {
    /// Report substituted when the service reply cannot be used.
    pub fn fallback() -> Self {
        Self {
            total_score: 7.0,
            technical_score: 7.0,
            communication_score: 8.0,
            overall_performance: 7.0,
            strengths: vec![
                "Good communication skills".into(),
                "Structured thinking".into(),
                "Relevant experience".into(),
            ],
            improvement_areas: vec![
                "Technical depth".into(),
                "Confidence in responses".into(),
            ],
            detailed_feedback: "The candidate demonstrated solid foundational knowledge and communicated clearly throughout the interview. With some additional preparation on technical concepts, they would be well-positioned for similar roles.".into(),
            next_steps: "Focus on strengthening technical skills and practice more complex scenarios".into(),
        }
    }
}

/// Report as the model writes it; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReport {
    total_score: Option<f32>,
    technical_score: Option<f32>,
    communication_score: Option<f32>,
    overall_performance: Option<f32>,
    strengths: Option<Vec<String>>,
    improvement_areas: Option<Vec<String>>,
    detailed_feedback: Option<String>,
    next_steps: Option<String>,
}

/// Reply plus the full updated history, which replaces the session's copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationReply {
    pub text: String,
    pub history: Vec<ChatTurn>,
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Interview questions for a role. Never fails; falls back to a fixed list.
    async fn generate_questions(&self, role: &str, difficulty: Difficulty) -> Vec<String>;

    /// Brief spoken feedback on one answer.
    async fn evaluate_answer(&self, question: &str, answer: &str, role: &str) -> Result<String>;

    /// Short spoken summary once every question is answered.
    async fn final_feedback(&self, role: &str, answers: &[QaPair]) -> Result<String>;

    /// Structured report. Never fails; malformed replies yield [`InterviewReport::fallback`].
    async fn final_report(&self, role: &str, answers: &[QaPair]) -> InterviewReport;

    async fn continue_conversation(
        &self,
        utterance: &str,
        history: &[ChatTurn],
    ) -> Result<ConversationReply>;
}

pub struct GeminiReasoner {
    client: GeminiClient,
    max_output_tokens: u32,
}

impl GeminiReasoner {
    pub fn new(client: GeminiClient, max_output_tokens: u32) -> Self {
        Self {
            client,
            max_output_tokens,
        }
    }

    pub fn from_config(config: &ReasoningConfig) -> Result<Self> {
        let client = GeminiClient::from_config(config)
            .map_err(|e| ParleyError::Config(e.to_string()))?;
        Ok(Self::new(client, config.max_output_tokens))
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        self.client
            .generate(&GeminiRequest::prompt(prompt))
            .await
            .map_err(|e| ParleyError::ReasoningService(e.to_string()))
    }
}

#[async_trait]
impl Reasoner for GeminiReasoner {
    async fn generate_questions(&self, role: &str, difficulty: Difficulty) -> Vec<String> {
        let prompt = format!(
            "Generate 5 technical interview questions for a {role} position at {difficulty} level.\n\
             Format the response as a JSON array of strings. Questions should be practical and relevant to the role.\n\
             Keep questions concise for voice interview format.\n\n\
             Example format:\n\
             [\"Question 1 here\", \"Question 2 here\", \"Question 3 here\", \"Question 4 here\", \"Question 5 here\"]"
        );

        match self.ask(prompt).await {
            Ok(text) => parse_questions(&text).unwrap_or_else(|| {
                warn!("Question reply was not a JSON string array, using fallback questions");
                fallback_questions()
            }),
            Err(e) => {
                warn!(error = %e, "Question generation failed, using fallback questions");
                fallback_questions()
            }
        }
    }

    async fn evaluate_answer(&self, question: &str, answer: &str, role: &str) -> Result<String> {
        let prompt = format!(
            "As an interviewer for a {role} position, provide brief feedback on this answer:\n\n\
             Question: {question}\n\
             Answer: {answer}\n\n\
             Give a short, encouraging response (1-2 sentences) and do not ask a follow-up question. \
             Move on to the next question naturally. Keep it conversational for a voice interview.\n\n\
             If the candidate apologises or asks for a repeat, repeat the question: {question}"
        );
        self.ask(prompt).await
    }

    async fn final_feedback(&self, role: &str, answers: &[QaPair]) -> Result<String> {
        let prompt = format!(
            "Provide brief overall interview feedback for a {role} candidate:\n\n{}\n\n\
             Give encouraging feedback in 2-3 sentences covering:\n\
             - Overall performance\n\
             - Key strengths\n\
             - One area for improvement\n\n\
             Keep it conversational and positive for voice delivery.",
            format_answers(answers)
        );
        self.ask(prompt).await
    }

    async fn final_report(&self, role: &str, answers: &[QaPair]) -> InterviewReport {
        let prompt = format!(
            "Generate a comprehensive interview report for a {role} position candidate based on their responses:\n\n{}\n\n\
             Provide a detailed analysis in the following JSON format (respond with valid JSON only):\n\
             {{\n\
             \"totalScore\": number (0-10),\n\
             \"technicalScore\": number (0-10),\n\
             \"communicationScore\": number (0-10),\n\
             \"overallPerformance\": number (0-10),\n\
             \"strengths\": [\"strength1\", \"strength2\", \"strength3\"],\n\
             \"improvementAreas\": [\"area1\", \"area2\"],\n\
             \"detailedFeedback\": \"2-3 sentence summary of performance\",\n\
             \"nextSteps\": \"Recommended action for candidate\"\n\
             }}\n\n\
             Evaluate based on:\n\
             - Technical knowledge and accuracy\n\
             - Communication clarity and confidence\n\
             - Problem-solving approach\n\
             - Relevance of answers to the role",
            format_answers(answers)
        );

        match self.ask(prompt).await {
            Ok(text) => parse_report(&text).unwrap_or_else(|| {
                warn!("Report reply held no usable JSON, using fallback report");
                InterviewReport::fallback()
            }),
            Err(e) => {
                warn!(error = %e, "Report generation failed, using fallback report");
                InterviewReport::fallback()
            }
        }
    }

    async fn continue_conversation(
        &self,
        utterance: &str,
        history: &[ChatTurn],
    ) -> Result<ConversationReply> {
        if CREATOR_QUESTION.is_match(utterance) {
            info!("Creator question detected, replying with canned answer");
            return Ok(extend_history(history, utterance, CREATOR_REPLY));
        }

        let (system, mut contents) = split_history(history);
        contents.push(Content::text(Some("user"), utterance));

        let request = GeminiRequest {
            contents,
            system_instruction: Some(Content::text(None, system)),
            generation_config: Some(GenerationConfig {
                max_output_tokens: Some(self.max_output_tokens),
                temperature: None,
            }),
            safety_settings: vec![
                SafetySetting {
                    category: "HARM_CATEGORY_HARASSMENT",
                    threshold: "BLOCK_MEDIUM_AND_ABOVE",
                },
                SafetySetting {
                    category: "HARM_CATEGORY_HATE_SPEECH",
                    threshold: "BLOCK_MEDIUM_AND_ABOVE",
                },
            ],
        };

        let text = self
            .client
            .generate(&request)
            .await
            .map_err(|e| ParleyError::ReasoningService(e.to_string()))?;
        debug!(chars = text.len(), "Conversation reply received");
        Ok(extend_history(history, utterance, text.trim()))
    }
}

fn fallback_questions() -> Vec<String> {
    FALLBACK_QUESTIONS.iter().map(|q| q.to_string()).collect()
}

fn format_answers(answers: &[QaPair]) -> String {
    answers
        .iter()
        .enumerate()
        .map(|(i, qa)| format!("Q{n}: {}\nA{n}: {}", qa.question, qa.answer, n = i + 1))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Parse a JSON string array, tolerating markdown code fences.
pub fn parse_questions(text: &str) -> Option<Vec<String>> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let questions: Vec<String> = serde_json::from_str(cleaned.trim()).ok()?;
    let questions: Vec<String> = questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    (!questions.is_empty()).then_some(questions)
}

/// Parse the first `{...}` block of a reply into a clamped report.
pub fn parse_report(text: &str) -> Option<InterviewReport> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let raw: RawReport = serde_json::from_str(&text[start..=end]).ok()?;

    let fallback = InterviewReport::fallback();
    let score = |value: Option<f32>, default: f32| {
        value.filter(|v| v.is_finite()).unwrap_or(default).clamp(0.0, 10.0)
    };
    Some(InterviewReport {
        total_score: score(raw.total_score, fallback.total_score),
        technical_score: score(raw.technical_score, fallback.technical_score),
        communication_score: score(raw.communication_score, fallback.communication_score),
        overall_performance: score(raw.overall_performance, fallback.overall_performance),
        strengths: raw.strengths.unwrap_or(fallback.strengths),
        improvement_areas: raw.improvement_areas.unwrap_or(fallback.improvement_areas),
        detailed_feedback: raw.detailed_feedback.unwrap_or(fallback.detailed_feedback),
        next_steps: raw.next_steps.unwrap_or(fallback.next_steps),
    })
}

/// System turns fold into the persona; the rest map to Gemini roles.
fn split_history(history: &[ChatTurn]) -> (String, Vec<Content>) {
    let mut system = CONVERSATION_PERSONA.to_string();
    let mut contents = Vec::with_capacity(history.len() + 1);
    for turn in history {
        match turn.role {
            ChatRole::System => {
                system.push_str("\n\n");
                system.push_str(&turn.text);
            }
            ChatRole::User => contents.push(Content::text(Some("user"), turn.text.as_str())),
            ChatRole::Model => contents.push(Content::text(Some("model"), turn.text.as_str())),
        }
    }
    (system, contents)
}

fn extend_history(history: &[ChatTurn], utterance: &str, reply: &str) -> ConversationReply {
    let mut updated = history.to_vec();
    updated.push(ChatTurn::user(utterance));
    updated.push(ChatTurn::model(reply));
    ConversationReply {
        text: reply.to_string(),
        history: updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasoner() -> GeminiReasoner {
        // Unroutable base URL: any request fails fast
        GeminiReasoner::new(
            GeminiClient::new(
                Some("http://127.0.0.1:9"),
                "gemini-1.5-flash",
                "test".into(),
                std::time::Duration::from_secs(5),
            )
            .unwrap(),
            200,
        )
    }

    #[test]
    fn test_parse_questions_with_fences() {
        let text = "```json\n[\"What is Rust?\", \"  Explain ownership. \", \"\"]\n```";
        assert_eq!(
            parse_questions(text),
            Some(vec!["What is Rust?".to_string(), "Explain ownership.".to_string()])
        );
        assert_eq!(parse_questions("Here are some questions"), None);
        assert_eq!(parse_questions("[]"), None);
    }

    #[test]
    fn test_parse_report_extracts_and_clamps() {
        let text = r#"Sure! Here is the report:
{"totalScore": 12, "technicalScore": -3, "communicationScore": 8.5, "overallPerformance": 7,
 "strengths": ["clear"], "improvementAreas": ["depth"], "detailedFeedback": "ok", "nextSteps": "practice"}
Thanks."#;
        let report = parse_report(text).unwrap();
        assert_eq!(report.total_score, 10.0);
        assert_eq!(report.technical_score, 0.0);
        assert_eq!(report.communication_score, 8.5);
        assert_eq!(report.strengths, vec!["clear".to_string()]);
        assert_eq!(report.next_steps, "practice");
    }

    #[test]
    fn test_parse_report_partial_fills_from_fallback() {
        let report = parse_report(r#"{"totalScore": 9}"#).unwrap();
        assert_eq!(report.total_score, 9.0);
        assert_eq!(report.communication_score, 8.0);
        assert_eq!(report.strengths.len(), 3);
    }

    #[test]
    fn test_parse_report_rejects_non_json() {
        assert!(parse_report("no json here").is_none());
        assert!(parse_report("} backwards {").is_none());
        assert!(parse_report("{not: valid json]}").is_none());
    }

    #[test]
    fn test_split_history_folds_system_turns() {
        let history = vec![
            ChatTurn::system("The user's name is Sam."),
            ChatTurn::user("hi"),
            ChatTurn::model("hello"),
        ];
        let (system, contents) = split_history(&history);
        assert!(system.starts_with("You are a friendly"));
        assert!(system.ends_with("The user's name is Sam."));
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1].role.as_deref(), Some("model"));
    }

    #[test]
    fn test_format_answers() {
        let answers = vec![
            QaPair { question: "A?".into(), answer: "a".into() },
            QaPair { question: "B?".into(), answer: "b".into() },
        ];
        assert_eq!(format_answers(&answers), "Q1: A?\nA1: a\n\nQ2: B?\nA2: b");
    }

    #[tokio::test]
    async fn test_creator_question_skips_model() {
        let history = vec![ChatTurn::user("hey"), ChatTurn::model("hi!")];
        let reply = reasoner()
            .continue_conversation("So who CREATED you anyway?", &history)
            .await
            .unwrap();
        assert_eq!(reply.text, CREATOR_REPLY);
        assert_eq!(reply.history.len(), 4);
        assert_eq!(reply.history[3], ChatTurn::model(CREATOR_REPLY));
    }

    #[tokio::test]
    async fn test_service_failure_falls_back() {
        let reasoner = reasoner();
        assert_eq!(
            reasoner.generate_questions("backend", Difficulty::Junior).await,
            fallback_questions()
        );
        assert_eq!(reasoner.final_report("backend", &[]).await, InterviewReport::fallback());
        assert!(matches!(
            reasoner.evaluate_answer("q", "a", "backend").await,
            Err(ParleyError::ReasoningService(_))
        ));
    }
}
