//! Keyword heuristic used when the classification service is unavailable or
//! returns something unusable.
//!
//! Rules are checked in order; the first one whose stage has a tag in the
//! answer space wins. Confidence never exceeds `MAX_CONFIDENCE`, so the
//! default gate keeps existing phases untouched.

use std::sync::LazyLock;

use regex::Regex;

use crate::automation::catalog::{StageKey, TagCatalog, TemperatureKey};
use crate::automation::classifier::{AnswerSpace, ClassificationOutput, OutputSource};

/// Ceiling for any heuristic confidence.
pub const MAX_CONFIDENCE: u8 = 65;

static REJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not interested|unsubscribe|too expensive|no thanks|no thank you|stop)\b")
        .expect("rejection pattern is valid")
});

static SCHEDULING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(book(ed|ing)?|call|meeting|calendar|tomorrow at|zoom|schedul(e|ed|ing))\b")
        .expect("scheduling pattern is valid")
});

static BUYING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(price|pricing|cost|how much|ready|sign up|buy|invoice|budget)\b")
        .expect("buying pattern is valid")
});

/// A heuristic rule outcome before it is mapped onto tags.
struct Signal {
    stage: StageKey,
    phase_confidence: u8,
    temperature: TemperatureKey,
    temperature_confidence: u8,
    reason: &'static str,
}

/// Score a transcript. Always returns an answer restricted to `answers`.
pub fn classify(
    transcript: &str,
    catalog: &TagCatalog,
    answers: &AnswerSpace,
) -> ClassificationOutput {
    let lead_text = lead_lines(transcript);
    let has_inbound = !lead_text.is_empty();
    let scheduling_hits = SCHEDULING.find_iter(transcript).count();

    let mut signals = Vec::new();
    if REJECTION.is_match(&lead_text) {
        signals.push(Signal {
            stage: StageKey::Unqualified,
            phase_confidence: 60,
            temperature: TemperatureKey::Cold,
            temperature_confidence: 60,
            reason: "heuristic: rejection language",
        });
    }
    if scheduling_hits > 0 {
        let bonus = u8::try_from(scheduling_hits.saturating_sub(1))
            .unwrap_or(u8::MAX)
            .saturating_mul(5);
        signals.push(Signal {
            stage: StageKey::CallBooked,
            phase_confidence: 55u8.saturating_add(bonus).min(MAX_CONFIDENCE),
            temperature: TemperatureKey::Hot,
            temperature_confidence: 50,
            reason: "heuristic: scheduling language",
        });
    }
    if BUYING.is_match(&lead_text) {
        signals.push(Signal {
            stage: StageKey::Qualified,
            phase_confidence: 55,
            temperature: TemperatureKey::Hot,
            temperature_confidence: 55,
            reason: "heuristic: pricing or readiness questions",
        });
    }
    if has_inbound {
        signals.push(Signal {
            stage: StageKey::InContact,
            phase_confidence: 45,
            temperature: TemperatureKey::Warm,
            temperature_confidence: 45,
            reason: "heuristic: lead replied",
        });
    }
    signals.push(Signal {
        stage: StageKey::NewLead,
        phase_confidence: 30,
        temperature: TemperatureKey::Cold,
        temperature_confidence: 30,
        reason: "heuristic: no clear signal",
    });
    signals.push(Signal {
        stage: StageKey::InContact,
        phase_confidence: 30,
        temperature: TemperatureKey::Cold,
        temperature_confidence: 30,
        reason: "heuristic: no clear signal",
    });

    let chosen = signals
        .iter()
        .find_map(|s| phase_tag(catalog, answers, s.stage).map(|id| (s, id)));

    match chosen {
        Some((signal, phase_tag_id)) => {
            let temperature_tag_id = temperature_tag(catalog, answers, signal.temperature);
            ClassificationOutput {
                phase_tag_id: Some(phase_tag_id),
                phase_confidence: signal.phase_confidence.min(MAX_CONFIDENCE),
                temperature_confidence: if temperature_tag_id.is_some() {
                    signal.temperature_confidence.min(MAX_CONFIDENCE)
                } else {
                    0
                },
                temperature_tag_id,
                reason: signal.reason.to_string(),
                source: OutputSource::Fallback,
            }
        }
        None => ClassificationOutput {
            phase_tag_id: None,
            phase_confidence: 0,
            temperature_tag_id: None,
            temperature_confidence: 0,
            reason: "heuristic: no known stage in answer space".into(),
            source: OutputSource::Fallback,
        },
    }
}

/// Text of `[Lead]` lines only, lowercased.
fn lead_lines(transcript: &str) -> String {
    transcript
        .lines()
        .filter_map(|line| line.strip_prefix("[Lead]"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase()
}

fn phase_tag(catalog: &TagCatalog, answers: &AnswerSpace, stage: StageKey) -> Option<String> {
    answers
        .phase_tags
        .iter()
        .find(|t| catalog.stage_key(&t.id) == Some(stage))
        .map(|t| t.id.clone())
}

fn temperature_tag(
    catalog: &TagCatalog,
    answers: &AnswerSpace,
    key: TemperatureKey,
) -> Option<String> {
    answers
        .temperature_tags
        .iter()
        .find(|t| catalog.temperature_key_by_tag_id.get(&t.id) == Some(&key))
        .map(|t| t.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::model::TagDefinition;

    fn catalog() -> TagCatalog {
        TagCatalog::from_tags(vec![
            TagDefinition::new("p-new", "New Lead"),
            TagDefinition::new("p-contact", "Contacted"),
            TagDefinition::new("p-qual", "Qualified"),
            TagDefinition::new("p-unqual", "Disqualified"),
            TagDefinition::new("p-booked", "Meeting Booked"),
            TagDefinition::new("t-hot", "Hot"),
            TagDefinition::new("t-warm", "Warm"),
            TagDefinition::new("t-cold", "Cold"),
        ])
    }

    fn run(transcript: &str) -> ClassificationOutput {
        let catalog = catalog();
        classify(transcript, &catalog, &AnswerSpace::full(&catalog))
    }

    #[test]
    fn scheduling_maps_to_call_booked() {
        let out = run("[Agent] want to jump on a zoom?\n[Lead] yes, book me tomorrow at 3");
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-booked"));
        assert!(out.phase_confidence >= 55 && out.phase_confidence <= MAX_CONFIDENCE);
        assert_eq!(out.source, OutputSource::Fallback);
    }

    #[test]
    fn rejection_maps_to_unqualified_and_cold() {
        let out = run("[Agent] following up\n[Lead] Not interested, thanks");
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-unqual"));
        assert_eq!(out.temperature_tag_id.as_deref(), Some("t-cold"));
    }

    #[test]
    fn pricing_maps_to_qualified_and_hot() {
        let out = run("[Lead] how much does the premium plan cost?");
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-qual"));
        assert_eq!(out.temperature_tag_id.as_deref(), Some("t-hot"));
    }

    #[test]
    fn agent_only_pricing_does_not_qualify() {
        let out = run("[Agent] our price is $99");
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-new"));
        assert_eq!(out.phase_confidence, 30);
    }

    #[test]
    fn any_reply_is_in_contact() {
        let out = run("[Agent] hi!\n[Lead] hey");
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-contact"));
        assert_eq!(out.temperature_tag_id.as_deref(), Some("t-warm"));
    }

    #[test]
    fn restricted_answer_space_falls_through() {
        let catalog = catalog();
        let answers = AnswerSpace {
            phase_tags: vec![TagDefinition::new("p-contact", "Contacted")],
            temperature_tags: vec![],
        };
        let out = classify("[Lead] can we schedule a call?", &catalog, &answers);
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-contact"));
        assert_eq!(out.temperature_tag_id, None);
        assert_eq!(out.temperature_confidence, 0);
    }

    #[test]
    fn no_known_stage_yields_no_phase() {
        let catalog = TagCatalog::from_tags(vec![TagDefinition::new("x", "Custom Stage")]);
        let out = classify("[Lead] hello", &catalog, &AnswerSpace::full(&catalog));
        assert_eq!(out.phase_tag_id, None);
        assert_eq!(out.phase_confidence, 0);
    }

    #[test]
    fn long_scheduling_threads_stay_at_cap() {
        let transcript = format!("[Lead] {}", "call ".repeat(257));
        let out = run(&transcript);
        assert_eq!(out.phase_tag_id.as_deref(), Some("p-booked"));
        assert_eq!(out.phase_confidence, MAX_CONFIDENCE);
    }

    #[test]
    fn confidence_never_exceeds_cap() {
        let out = run("[Lead] book a call, meeting, zoom, calendar, schedule, booking, call call call");
        assert_eq!(out.phase_confidence, MAX_CONFIDENCE);
    }
}
