//! Deterministic rule-based conversation analysis.
//!
//! Consolidation runs this over each merged, time-sorted message group to
//! populate the analytical fields of a `ConversationRecord`: what the user
//! wanted, what the assistant did, which decisions were made, and a coarse
//! flow of the conversation.
//!
//! The rule set is keyword/regex families and nothing else: the same
//! messages always produce the same analysis, and no I/O or external
//! service is involved. The families themselves are an implementation
//! detail and deliberately easy to swap; everything downstream depends only
//! on the output shape.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Message, Role};

static DECISION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(decided|decision|let's go with|we'll use|going with|chose|agreed|settled on)\b")
        .unwrap()
});

static ACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(created|added|implemented|fixed|updated|refactored|removed|renamed|wrote|moved)\b")
        .unwrap()
});

static INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(need to|want to|can you|please|let's|how do|should we|implement|add|fix|build|make)\b")
        .unwrap()
});

static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[\w./-]+\.(rs|toml|json|jsonl|md|py|ts|js|sql|sh|yml|yaml)\b").unwrap()
});

static COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(^\s*\$\s|\b(cargo|git|npm|pnpm|make|docker)\s+\w)").unwrap()
});

static CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(fn|struct|impl|trait|enum|function|class|interface)\s+\w+").unwrap()
});

static DEBUGGING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|panic|backtrace|stack trace|failed|failing|bug|crash)\b").unwrap()
});

static ARCHITECTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(architecture|design|module|pipeline|layering|schema|refactor)\b").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TechCategory {
    Code,
    Files,
    Commands,
    Architecture,
    Debugging,
}

impl std::fmt::Display for TechCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TechCategory::Code => write!(f, "code"),
            TechCategory::Files => write!(f, "files"),
            TechCategory::Commands => write!(f, "commands"),
            TechCategory::Architecture => write!(f, "architecture"),
            TechCategory::Debugging => write!(f, "debugging"),
        }
    }
}

/// Flow marker: the coarse classification of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marker {
    Text,
    Question,
    Decision,
    Action,
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Marker::Text => write!(f, "text"),
            Marker::Question => write!(f, "question"),
            Marker::Decision => write!(f, "decision"),
            Marker::Action => write!(f, "action"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNote {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechNote {
    pub timestamp: DateTime<Utc>,
    pub category: TechCategory,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionNote {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub index: usize,
    pub role: Role,
    pub marker: Marker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub user_intents: Vec<Intent>,
    pub ai_actions: Vec<ActionNote>,
    pub technical_work: Vec<TechNote>,
    pub decisions: Vec<DecisionNote>,
    pub flow: Vec<FlowEntry>,
    pub working_state: String,
}

/// Analyze a time-sorted message group.
pub fn analyze(messages: &[Message]) -> Analysis {
    let mut analysis = Analysis::default();

    for (index, message) in messages.iter().enumerate() {
        let text = message.content.as_str();
        let summary = summary_line(text);

        if let Some(m) = DECISION.find(text) {
            analysis.decisions.push(DecisionNote {
                timestamp: message.timestamp,
                text: sentence_around(text, m.start()),
            });
        }

        match message.role {
            Role::User => {
                analysis.user_intents.push(Intent {
                    timestamp: message.timestamp,
                    text: summary.clone(),
                    confidence: intent_confidence(text),
                });
            }
            Role::Assistant | Role::System => {
                if ACTION.is_match(text) {
                    analysis.ai_actions.push(ActionNote {
                        timestamp: message.timestamp,
                        text: summary.clone(),
                    });
                }
            }
        }

        if let Some(category) = tech_category(text) {
            analysis.technical_work.push(TechNote {
                timestamp: message.timestamp,
                category,
                text: summary,
            });
        }

        analysis.flow.push(FlowEntry {
            index,
            role: message.role,
            marker: marker_for(message),
        });
    }

    analysis.working_state = working_state(&analysis);
    analysis
}

fn marker_for(message: &Message) -> Marker {
    let text = message.content.as_str();
    if DECISION.is_match(text) {
        Marker::Decision
    } else if message.role == Role::User && text.contains('?') {
        Marker::Question
    } else if message.role != Role::User && ACTION.is_match(text) {
        Marker::Action
    } else {
        Marker::Text
    }
}

fn intent_confidence(text: &str) -> Confidence {
    if INTENT.is_match(text) {
        Confidence::High
    } else if text.split_whitespace().count() >= 8 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

/// Categorize technical content, most specific family first.
fn tech_category(text: &str) -> Option<TechCategory> {
    if COMMAND.is_match(text) {
        Some(TechCategory::Commands)
    } else if CODE.is_match(text) {
        Some(TechCategory::Code)
    } else if FILE_PATH.is_match(text) {
        Some(TechCategory::Files)
    } else if DEBUGGING.is_match(text) {
        Some(TechCategory::Debugging)
    } else if ARCHITECTURE.is_match(text) {
        Some(TechCategory::Architecture)
    } else {
        None
    }
}

/// One-sentence state of the conversation: the last decision when there is
/// one, else the last user intent, else a fixed placeholder.
fn working_state(analysis: &Analysis) -> String {
    if let Some(decision) = analysis.decisions.last() {
        return decision.text.clone();
    }
    if let Some(intent) = analysis.user_intents.last() {
        return format!("Working on: {}", intent.text);
    }
    "No analyzed activity".to_string()
}

/// First line of the text, clipped to a display-friendly length.
pub fn summary_line(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    truncate(first_line, 160).to_string()
}

/// The sentence containing byte offset `at`, clipped like `summary_line`.
fn sentence_around(text: &str, at: usize) -> String {
    let start = text[..at]
        .rfind(['.', '!', '?', '\n'])
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = text[at..]
        .find(['.', '!', '?', '\n'])
        .map(|i| at + i)
        .unwrap_or(text.len());
    truncate(text[start..end].trim(), 160).to_string()
}

/// Truncate to at most `max` bytes without splitting a UTF-8 codepoint.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;

    fn message(role: Role, ts: &str, content: &str) -> Message {
        Message::new(
            content.len().to_string(),
            "c1",
            ts.parse().unwrap(),
            role,
            content,
            Platform::ClaudeCli,
            "test",
        )
    }

    #[test]
    fn test_greeting_produces_no_decisions() {
        let messages = vec![
            message(Role::User, "2025-10-25T10:00:00Z", "hi"),
            message(Role::Assistant, "2025-10-25T10:00:05Z", "hello"),
        ];
        let analysis = analyze(&messages);

        assert!(analysis.decisions.is_empty());
        assert_eq!(analysis.flow.len(), 2);
        assert_eq!(analysis.flow[0].role, Role::User);
        assert_eq!(analysis.flow[0].marker, Marker::Text);
        assert_eq!(analysis.flow[1].role, Role::Assistant);
        assert_eq!(analysis.user_intents.len(), 1);
        assert_eq!(analysis.user_intents[0].confidence, Confidence::Low);
    }

    #[test]
    fn test_decision_detected_with_sentence() {
        let messages = vec![message(
            Role::Assistant,
            "2025-10-25T10:00:00Z",
            "Looked at both options. We decided to use sqlite for the cache. Next is wiring.",
        )];
        let analysis = analyze(&messages);

        assert_eq!(analysis.decisions.len(), 1);
        assert_eq!(
            analysis.decisions[0].text,
            "We decided to use sqlite for the cache"
        );
        assert_eq!(analysis.flow[0].marker, Marker::Decision);
        assert_eq!(analysis.working_state, "We decided to use sqlite for the cache");
    }

    #[test]
    fn test_intent_confidence_levels() {
        assert_eq!(intent_confidence("can you add a retry loop"), Confidence::High);
        assert_eq!(
            intent_confidence("the thing over there is not quite what I expected to see"),
            Confidence::Medium
        );
        assert_eq!(intent_confidence("hi"), Confidence::Low);
    }

    #[test]
    fn test_tech_categories() {
        assert_eq!(tech_category("run cargo test first"), Some(TechCategory::Commands));
        assert_eq!(tech_category("define struct Config here"), Some(TechCategory::Code));
        assert_eq!(tech_category("look at src/main.rs please"), Some(TechCategory::Files));
        assert_eq!(
            tech_category("there is a panic in the parser"),
            Some(TechCategory::Debugging)
        );
        assert_eq!(
            tech_category("the pipeline has three stages"),
            Some(TechCategory::Architecture)
        );
        assert_eq!(tech_category("nothing technical here"), None);
    }

    #[test]
    fn test_assistant_action_detected() {
        let messages = vec![message(
            Role::Assistant,
            "2025-10-25T10:00:00Z",
            "Fixed the off-by-one and added a regression test.",
        )];
        let analysis = analyze(&messages);
        assert_eq!(analysis.ai_actions.len(), 1);
        assert_eq!(analysis.flow[0].marker, Marker::Action);
    }

    #[test]
    fn test_user_question_marker() {
        let messages = vec![message(
            Role::User,
            "2025-10-25T10:00:00Z",
            "why does this happen?",
        )];
        let analysis = analyze(&messages);
        assert_eq!(analysis.flow[0].marker, Marker::Question);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let messages = vec![
            message(Role::User, "2025-10-25T10:00:00Z", "please fix src/cache.rs"),
            message(Role::Assistant, "2025-10-25T10:01:00Z", "Updated the writer. Decided to keep hashing."),
        ];
        assert_eq!(analyze(&messages), analyze(&messages));
    }

    #[test]
    fn test_summary_line_clips_multiline() {
        let text = "first line here\nsecond line";
        assert_eq!(summary_line(text), "first line here");
        let long = "x".repeat(300);
        assert_eq!(summary_line(&long).len(), 160);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "héllo wörld";
        let t = truncate(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
    }
}
