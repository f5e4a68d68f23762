//! Conversation classifier: transcript in, validated phase/temperature out.
//!
//! Flow:
//! 1. Empty transcript → zero-confidence answer, no service call
//! 2. LLM call through the retry policy → strict JSON
//! 3. Validation against the eligible tag set
//! 4. Any failure along the way → keyword heuristic

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::automation::catalog::TagCatalog;
use crate::automation::heuristic;
use crate::automation::model::{Direction, TagDefinition, ThreadMessage};
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, RetryPolicy, complete_with_retry};

/// Max tokens for the classification call; the answer is a small JSON object.
const CLASSIFY_MAX_TOKENS: u32 = 400;

/// Deterministic-ish output.
const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Cap on the knowledge context copied into the prompt.
const KNOWLEDGE_MAX_CHARS: usize = 2_000;

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Model,
    Fallback,
    Empty,
}

impl OutputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
            Self::Empty => "empty",
        }
    }
}

/// A validated classification. Tag ids are always members of the answer space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationOutput {
    pub phase_tag_id: Option<String>,
    pub phase_confidence: u8,
    pub temperature_tag_id: Option<String>,
    pub temperature_confidence: u8,
    pub reason: String,
    pub source: OutputSource,
}

impl ClassificationOutput {
    /// The answer for a conversation with no messages.
    pub fn empty() -> Self {
        Self {
            phase_tag_id: None,
            phase_confidence: 0,
            temperature_tag_id: None,
            temperature_confidence: 0,
            reason: "no transcript".into(),
            source: OutputSource::Empty,
        }
    }
}

/// The tags a classification may answer with.
#[derive(Debug, Clone, Default)]
pub struct AnswerSpace {
    pub phase_tags: Vec<TagDefinition>,
    pub temperature_tags: Vec<TagDefinition>,
}

impl AnswerSpace {
    /// Every phase and temperature tag in the catalog.
    pub fn full(catalog: &TagCatalog) -> Self {
        Self {
            phase_tags: catalog.phase_tags.clone(),
            temperature_tags: catalog.temperature_tags.clone(),
        }
    }

    /// Phase tags that carry prompt text (optionally just `only_tag`), plus
    /// every temperature tag.
    pub fn prompted(catalog: &TagCatalog, only_tag: Option<&str>) -> Self {
        let phase_tags = catalog
            .phase_tags
            .iter()
            .filter(|t| t.has_prompt())
            .filter(|t| only_tag.is_none_or(|only| t.id == only))
            .cloned()
            .collect();
        Self {
            phase_tags,
            temperature_tags: catalog.temperature_tags.clone(),
        }
    }

    pub fn has_phase(&self, tag_id: &str) -> bool {
        self.phase_tags.iter().any(|t| t.id == tag_id)
    }

    pub fn has_temperature(&self, tag_id: &str) -> bool {
        self.temperature_tags.iter().any(|t| t.id == tag_id)
    }
}

/// Render the most recent `max_messages` messages, oldest first, one per line.
pub fn build_transcript(
    messages: &[ThreadMessage],
    max_messages: usize,
    max_chars_per_message: usize,
) -> String {
    let mut ordered: Vec<&ThreadMessage> = messages.iter().collect();
    ordered.sort_by_key(|m| m.sent_at);
    let skip = ordered.len().saturating_sub(max_messages);

    let mut transcript = String::new();
    for message in ordered.into_iter().skip(skip) {
        let text = message.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            continue;
        }
        let prefix = match message.direction {
            Direction::Inbound => "[Lead]",
            Direction::Outbound => "[Agent]",
        };
        let mut line: String = text.chars().take(max_chars_per_message).collect();
        if text.chars().count() > max_chars_per_message {
            line.push('…');
        }
        if !transcript.is_empty() {
            transcript.push('\n');
        }
        transcript.push_str(prefix);
        transcript.push(' ');
        transcript.push_str(&line);
    }
    transcript
}

/// LLM-backed classifier with heuristic fallback.
#[derive(Clone)]
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    /// Classify a transcript. Never fails: service and parse errors degrade
    /// to the heuristic.
    pub async fn classify(
        &self,
        transcript: &str,
        catalog: &TagCatalog,
        answers: &AnswerSpace,
        knowledge_context: Option<&str>,
    ) -> ClassificationOutput {
        if transcript.trim().is_empty() {
            return ClassificationOutput::empty();
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(transcript, answers, knowledge_context)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let result = complete_with_retry(self.llm.as_ref(), &request, &self.retry)
            .await
            .and_then(|response| parse_classification(&response.content, answers));

        match result {
            Ok(output) => {
                debug!(
                    model = self.llm.model_name(),
                    phase = ?output.phase_tag_id,
                    confidence = output.phase_confidence,
                    "Classification parsed"
                );
                output
            }
            Err(e) => {
                warn!(
                    model = self.llm.model_name(),
                    error = %e,
                    "Classification failed, using heuristic"
                );
                heuristic::classify(transcript, catalog, answers)
            }
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You classify sales lead conversations into a funnel phase and a lead temperature.\n\n\
     You will receive the list of allowed phase tags and temperature tags, optional business \
     context, and a transcript where [Lead] lines come from the prospect and [Agent] lines \
     from the business.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"phase_tag_id\": \"...\", \"phase_confidence\": 0, \"temperature_tag_id\": \"...\", \
     \"temperature_confidence\": 0, \"reason\": \"...\"}\n\n\
     Rules:\n\
     - Use only tag ids from the lists provided; use null when nothing fits\n\
     - Confidences are integers from 0 to 100\n\
     - Pick the phase the conversation is in now, judged by the latest messages\n\
     - Keep the reason to one short sentence"
        .to_string()
}

fn build_user_prompt(
    transcript: &str,
    answers: &AnswerSpace,
    knowledge_context: Option<&str>,
) -> String {
    let mut prompt = String::with_capacity(transcript.len() + 1024);

    prompt.push_str("Phase tags:\n");
    for tag in &answers.phase_tags {
        push_tag_line(&mut prompt, tag);
    }

    if answers.temperature_tags.is_empty() {
        prompt.push_str("\nTemperature tags: none (use null)\n");
    } else {
        prompt.push_str("\nTemperature tags:\n");
        for tag in &answers.temperature_tags {
            push_tag_line(&mut prompt, tag);
        }
    }

    if let Some(context) = knowledge_context.map(str::trim).filter(|c| !c.is_empty()) {
        let context: String = context.chars().take(KNOWLEDGE_MAX_CHARS).collect();
        prompt.push_str(&format!("\nBusiness context:\n{context}\n"));
    }

    prompt.push_str(&format!("\nTranscript:\n{transcript}"));
    prompt
}

fn push_tag_line(prompt: &mut String, tag: &TagDefinition) {
    prompt.push_str(&format!("- id: {} | name: {}", tag.id, tag.name));
    if let Some(text) = tag.prompt_text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        prompt.push_str(&format!(" | description: {text}"));
    }
    prompt.push('\n');
}

// ── Response parsing ────────────────────────────────────────────────

/// Decode and validate a model reply.
pub fn parse_classification(
    raw: &str,
    answers: &AnswerSpace,
) -> Result<ClassificationOutput, LlmError> {
    let json_str = extract_json_object(raw);
    let value: Value = serde_json::from_str(&json_str)?;
    let Some(obj) = value.as_object() else {
        return Err(LlmError::InvalidResponse {
            provider: "classifier".into(),
            reason: "expected a JSON object".into(),
        });
    };

    let phase_ids: HashSet<&str> = answers.phase_tags.iter().map(|t| t.id.as_str()).collect();
    let temperature_ids: HashSet<&str> = answers
        .temperature_tags
        .iter()
        .map(|t| t.id.as_str())
        .collect();

    let phase_tag_id = obj
        .get("phase_tag_id")
        .and_then(lenient_id)
        .filter(|id| phase_ids.contains(id.as_str()));
    let temperature_tag_id = obj
        .get("temperature_tag_id")
        .and_then(lenient_id)
        .filter(|id| temperature_ids.contains(id.as_str()));

    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("no reason given")
        .to_string();

    Ok(ClassificationOutput {
        phase_tag_id,
        phase_confidence: obj
            .get("phase_confidence")
            .and_then(lenient_confidence)
            .unwrap_or(0),
        temperature_tag_id,
        temperature_confidence: obj
            .get("temperature_confidence")
            .and_then(lenient_confidence)
            .unwrap_or(0),
        reason,
        source: OutputSource::Model,
    })
}

fn lenient_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integers pass through, fractions in `[0, 1]` are percentages, strings are
/// parsed the same way. Always clamped to `[0, 100]`.
fn lenient_confidence(value: &Value) -> Option<u8> {
    let scaled = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i as f64,
            None => scale_fraction(n.as_f64()?),
        },
        Value::String(s) => {
            let s = s.trim().trim_end_matches('%').trim();
            if let Ok(i) = s.parse::<i64>() {
                i as f64
            } else {
                scale_fraction(s.parse::<f64>().ok()?)
            }
        }
        _ => return None,
    };
    if !scaled.is_finite() {
        return None;
    }
    Some(scaled.round().clamp(0.0, 100.0) as u8)
}

fn scale_fraction(f: f64) -> f64 {
    if (0.0..=1.0).contains(&f) { f * 100.0 } else { f }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Try to find object bounds
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::llm::testing::StubLlm;

    fn catalog() -> TagCatalog {
        TagCatalog::from_tags(vec![
            TagDefinition::new("t1", "New Lead"),
            TagDefinition::new("t2", "In Contact"),
            TagDefinition::new("t3", "Call Booked").with_prompt("A call or meeting is scheduled"),
            TagDefinition::new("t4", "Won").with_prompt("Customer has paid"),
            TagDefinition::new("h1", "Hot"),
            TagDefinition::new("c1", "Cold Lead"),
            TagDefinition::new("x1", "VIP"),
        ])
    }

    fn message(i: i64, direction: Direction, text: &str) -> ThreadMessage {
        ThreadMessage {
            id: format!("m{i}"),
            conversation_id: "conv".into(),
            direction,
            text: text.into(),
            sent_at: Utc::now() - Duration::minutes(100 - i),
        }
    }

    fn classifier(llm: Arc<StubLlm>) -> Classifier {
        Classifier::new(llm, RetryPolicy::no_retry())
    }

    // ── Transcript ──────────────────────────────────────────────────

    #[test]
    fn transcript_keeps_latest_messages_in_order() {
        let messages: Vec<_> = (0..5)
            .map(|i| {
                let dir = if i % 2 == 0 { Direction::Inbound } else { Direction::Outbound };
                message(i, dir, &format!("msg {i}"))
            })
            .rev()
            .collect();
        let transcript = build_transcript(&messages, 3, 500);
        assert_eq!(transcript, "[Lead] msg 2\n[Agent] msg 3\n[Lead] msg 4");
    }

    #[test]
    fn transcript_truncates_long_messages() {
        let long = "a".repeat(20);
        let transcript = build_transcript(&[message(1, Direction::Inbound, &long)], 30, 5);
        assert_eq!(transcript, "[Lead] aaaaa…");
    }

    #[test]
    fn transcript_skips_blank_messages() {
        let transcript = build_transcript(&[message(1, Direction::Inbound, "   ")], 30, 500);
        assert!(transcript.is_empty());
    }

    // ── Answer space ────────────────────────────────────────────────

    #[test]
    fn prompted_space_filters_phase_tags() {
        let catalog = catalog();
        let all = AnswerSpace::prompted(&catalog, None);
        assert_eq!(all.phase_tags.len(), 2);
        assert_eq!(all.temperature_tags.len(), 2);

        let single = AnswerSpace::prompted(&catalog, Some("t4"));
        assert_eq!(single.phase_tags.len(), 1);
        assert!(single.has_phase("t4"));
        assert!(!single.has_phase("t3"));
    }

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_plain_response() {
        let answers = AnswerSpace::full(&catalog());
        let out = parse_classification(
            r#"{"phase_tag_id": "t3", "phase_confidence": 85, "temperature_tag_id": "h1", "temperature_confidence": 70, "reason": "call booked for Tuesday"}"#,
            &answers,
        )
        .unwrap();
        assert_eq!(out.phase_tag_id.as_deref(), Some("t3"));
        assert_eq!(out.phase_confidence, 85);
        assert_eq!(out.temperature_tag_id.as_deref(), Some("h1"));
        assert_eq!(out.source, OutputSource::Model);
    }

    #[test]
    fn parse_wrapped_in_markdown() {
        let answers = AnswerSpace::full(&catalog());
        let raw = "Here you go:\n```json\n{\"phase_tag_id\": \"t2\", \"phase_confidence\": \"77\"}\n```";
        let out = parse_classification(raw, &answers).unwrap();
        assert_eq!(out.phase_tag_id.as_deref(), Some("t2"));
        assert_eq!(out.phase_confidence, 77);
        assert_eq!(out.temperature_tag_id, None);
        assert_eq!(out.reason, "no reason given");
    }

    #[test]
    fn parse_scales_and_clamps_confidence() {
        let answers = AnswerSpace::full(&catalog());
        let out = parse_classification(
            r#"{"phase_tag_id": "t1", "phase_confidence": 0.92, "temperature_confidence": 180}"#,
            &answers,
        )
        .unwrap();
        assert_eq!(out.phase_confidence, 92);
        assert_eq!(out.temperature_confidence, 100);

        let out = parse_classification(r#"{"phase_confidence": "0.5"}"#, &answers).unwrap();
        assert_eq!(out.phase_confidence, 50);

        let out = parse_classification(r#"{"phase_confidence": -3}"#, &answers).unwrap();
        assert_eq!(out.phase_confidence, 0);
    }

    #[test]
    fn parse_rejects_ids_outside_answer_space() {
        let answers = AnswerSpace::full(&catalog());
        // Unknown id, excluded tag, and categories swapped
        let out = parse_classification(
            r#"{"phase_tag_id": "h1", "phase_confidence": 90, "temperature_tag_id": "t3"}"#,
            &answers,
        )
        .unwrap();
        assert_eq!(out.phase_tag_id, None);
        assert_eq!(out.temperature_tag_id, None);

        let out = parse_classification(r#"{"phase_tag_id": "x1"}"#, &answers).unwrap();
        assert_eq!(out.phase_tag_id, None);
    }

    #[test]
    fn parse_garbage_is_an_error() {
        let answers = AnswerSpace::full(&catalog());
        assert!(parse_classification("I think it's a won deal", &answers).is_err());
        assert!(parse_classification("[1, 2, 3]", &answers).is_err());
    }

    // ── Classifier ──────────────────────────────────────────────────

    #[tokio::test]
    async fn empty_transcript_skips_service() {
        let llm = Arc::new(StubLlm::replying("{}"));
        let catalog = catalog();
        let out = classifier(llm.clone())
            .classify("", &catalog, &AnswerSpace::full(&catalog), None)
            .await;
        assert_eq!(out, ClassificationOutput::empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn prompt_lists_answer_space_and_context() {
        let llm = Arc::new(StubLlm::replying(
            r#"{"phase_tag_id": "t3", "phase_confidence": 88, "reason": "booked"}"#,
        ));
        let catalog = catalog();
        let answers = AnswerSpace::prompted(&catalog, None);
        let out = classifier(llm.clone())
            .classify("[Lead] see you Tuesday", &catalog, &answers, Some("We sell solar"))
            .await;
        assert_eq!(out.phase_tag_id.as_deref(), Some("t3"));

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("id: t3 | name: Call Booked | description: A call or meeting is scheduled"));
        assert!(!prompt.contains("id: t1"));
        assert!(!prompt.contains("VIP"));
        assert!(prompt.contains("We sell solar"));
        assert!(prompt.contains("[Lead] see you Tuesday"));
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back() {
        let llm = Arc::new(StubLlm::replying("sorry, I cannot help"));
        let catalog = catalog();
        let out = classifier(llm)
            .classify("[Lead] can we book a call tomorrow at 3?", &catalog, &AnswerSpace::full(&catalog), None)
            .await;
        assert_eq!(out.source, OutputSource::Fallback);
        assert_eq!(out.phase_tag_id.as_deref(), Some("t3"));
        assert!(out.phase_confidence <= 65);
    }

    #[tokio::test]
    async fn service_error_falls_back() {
        let llm = Arc::new(StubLlm::failing(|| LlmError::AuthFailed {
            provider: "stub".into(),
        }));
        let catalog = catalog();
        let out = classifier(llm.clone())
            .classify("[Lead] hello there", &catalog, &AnswerSpace::full(&catalog), None)
            .await;
        assert_eq!(out.source, OutputSource::Fallback);
        assert_eq!(llm.calls(), 1);
    }
}
