//! Session consolidation: per-day grouping of recent records.
//!
//! This agent owns `.aicf/sessions/`. It is a pure function of the current
//! contents of `.aicf/recent/`: records are grouped by the UTC calendar
//! date in their filename prefix, and each date with at least one record
//! gets `sessions/<date>-session.aicf` rewritten in full:
//!
//! ```text
//! version|3.0.0-alpha
//! @SESSION|2025-10-25|2
//! @CONVERSATION_REF|a1|augment|2025-10-25T10:00:00Z|2025-10-25T10:00:05Z|2
//! @CONVERSATION_REF|w9|warp|2025-10-25T11:00:00Z|2025-10-25T11:20:00Z|14
//! ```
//!
//! Rewriting in full keeps the run idempotent: stale refs for records that
//! drop-off has since migrated away disappear on the next pass.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::codec::{AicfCodec, AicfRecord};
use crate::layout::{Layout, Tier};

/// Outcome of one session-consolidation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub session_files_written: usize,
    pub conversations_referenced: usize,
    pub skipped_malformed: usize,
}

/// One `@CONVERSATION_REF` row.
#[derive(Debug, Clone)]
struct ConversationRef {
    conversation_id: String,
    platforms: String,
    start: String,
    end: String,
    message_count: String,
}

pub struct SessionConsolidationAgent {
    layout: Layout,
}

impl SessionConsolidationAgent {
    pub fn new(layout: Layout) -> SessionConsolidationAgent {
        SessionConsolidationAgent { layout }
    }

    pub fn consolidate(&self, codec: &AicfCodec) -> SessionStats {
        let mut stats = SessionStats::default();
        let mut by_date: BTreeMap<String, Vec<ConversationRef>> = BTreeMap::new();

        for path in self.recent_files() {
            let Some(date) = date_prefix(&path) else {
                stats.skipped_malformed += 1;
                continue;
            };
            match read_ref(codec, &path, &mut stats) {
                Some(conv_ref) => by_date.entry(date).or_default().push(conv_ref),
                None => stats.skipped_malformed += 1,
            }
        }

        for (date, mut refs) in by_date {
            refs.sort_by(|a, b| {
                a.start
                    .cmp(&b.start)
                    .then_with(|| a.conversation_id.cmp(&b.conversation_id))
            });

            let mut record = AicfRecord::new();
            record.push("@SESSION", &[&date, &refs.len().to_string()]);
            for r in &refs {
                record.push(
                    "@CONVERSATION_REF",
                    &[
                        &r.conversation_id,
                        &r.platforms,
                        &r.start,
                        &r.end,
                        &r.message_count,
                    ],
                );
            }

            let path = self.layout.sessions_dir().join(format!("{date}-session.aicf"));
            match codec.write_record(&path, &record) {
                Ok(()) => {
                    stats.session_files_written += 1;
                    stats.conversations_referenced += refs.len();
                }
                Err(e) => {
                    tracing::warn!(date = %date, error = %e, "session write failed");
                }
            }
        }
        stats
    }

    fn recent_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(self.layout.tier_dir(Tier::Recent))
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "aicf"))
            .collect();
        files.sort();
        files
    }
}

/// `YYYY-MM-DD` prefix of a record filename, validated loosely.
fn date_prefix(path: &PathBuf) -> Option<String> {
    let name = path.file_stem()?.to_str()?;
    let (date, rest) = name.split_at_checked(10)?;
    if !rest.starts_with('_') {
        return None;
    }
    let bytes = date.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && date
            .bytes()
            .enumerate()
            .all(|(i, b)| matches!(i, 4 | 7) || b.is_ascii_digit());
    shape_ok.then(|| date.to_string())
}

fn read_ref(codec: &AicfCodec, path: &PathBuf, stats: &mut SessionStats) -> Option<ConversationRef> {
    let doc = match codec.read_all(path) {
        Ok(doc) => doc,
        Err(_) => return None,
    };
    stats.skipped_malformed += doc.skipped_malformed;

    let start = doc.first("timestamp")?.field(0)?.to_string();
    Some(ConversationRef {
        conversation_id: doc.first("conversationId")?.field(0)?.to_string(),
        platforms: doc.first("platforms")?.field(0).unwrap_or("").to_string(),
        end: doc
            .first("timestampEnd")
            .and_then(|l| l.field(0))
            .unwrap_or(&start)
            .to_string(),
        message_count: doc
            .first("messageCount")
            .and_then(|l| l.field(0))
            .unwrap_or("0")
            .to_string(),
        start,
    })
}
