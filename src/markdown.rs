//! Markdown companion files for consolidated records.
//!
//! Every AICF record in `.aicf/recent/` gets a human-readable twin at the
//! same basename under `.ai/recent/`. The companion is a plain summary for
//! people skimming their memory directory; the AICF file remains the
//! machine-readable source of truth. Sections with nothing to say are
//! omitted rather than rendered empty.

use std::fmt::Write;

use crate::model::{ConversationRecord, format_timestamp};

/// Render the companion document for one record.
pub fn render(record: &ConversationRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Conversation {}", record.conversation_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Platforms:** {}", record.platforms_csv());
    let _ = writeln!(
        out,
        "- **Span:** {} \u{2192} {}",
        format_timestamp(&record.timestamp_start),
        format_timestamp(&record.timestamp_end)
    );
    let _ = writeln!(out, "- **Messages:** {}", record.message_count);
    let _ = writeln!(out, "- **State:** {}", record.analysis.working_state);

    if !record.analysis.decisions.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Decisions");
        let _ = writeln!(out);
        for decision in &record.analysis.decisions {
            let _ = writeln!(
                out,
                "- {} ({})",
                decision.text,
                format_timestamp(&decision.timestamp)
            );
        }
    }

    if !record.analysis.user_intents.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## User intents");
        let _ = writeln!(out);
        for intent in &record.analysis.user_intents {
            let _ = writeln!(out, "- {} _[{}]_", intent.text, intent.confidence);
        }
    }

    if !record.analysis.ai_actions.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Assistant actions");
        let _ = writeln!(out);
        for action in &record.analysis.ai_actions {
            let _ = writeln!(out, "- {}", action.text);
        }
    }

    if !record.analysis.technical_work.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Technical work");
        let _ = writeln!(out);
        for tech in &record.analysis.technical_work {
            let _ = writeln!(out, "- `{}` {}", tech.category, tech.text);
        }
    }

    out
}
