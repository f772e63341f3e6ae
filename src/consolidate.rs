//! Cache consolidation: platform chunks → per-conversation AICF records.
//!
//! # Architecture overview
//!
//! This agent owns `.aicf/recent/`. Each pass it:
//!
//! 1. loads every chunk under `.cache/llm/*/`,
//! 2. groups them by conversation id,
//! 3. merges each group, deduplicating by content hash (earliest timestamp
//!    wins, `platforms` is the union of every contributing source),
//! 4. analyzes the merged, time-sorted messages,
//! 5. writes the AICF record and its Markdown companion atomically,
//! 6. deletes the contributing chunks only after both writes succeeded.
//!
//! Partially-seen conversations are written as-is; a later pass that finds
//! more chunks produces a superset merge and overwrites the record through
//! the same atomic rename. A conversation that fails to consolidate leaves
//! its chunks in place for the next tick and does not stop the others.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::codec::{AicfCodec, AicfRecord};
use crate::error::RecallError;
use crate::extract;
use crate::layout::{Layout, Tier};
use crate::markdown;
use crate::model::{CacheChunk, ConversationRecord, Message, format_timestamp};
use crate::watcher::CancelToken;

/// Outcome of one consolidation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolidationStats {
    pub records_written: usize,
    pub chunks_deleted: usize,
    pub conversations_failed: usize,
    pub duplicates_removed: usize,
    pub skipped_malformed: usize,
}

pub struct ConsolidationAgent {
    layout: Layout,
}

impl ConsolidationAgent {
    pub fn new(layout: Layout) -> ConsolidationAgent {
        ConsolidationAgent { layout }
    }

    pub fn consolidate(&self, codec: &AicfCodec, cancel: &CancelToken) -> ConsolidationStats {
        let mut stats = ConsolidationStats::default();
        let mut groups: BTreeMap<String, Vec<(PathBuf, CacheChunk)>> = BTreeMap::new();

        for (path, chunk) in self.load_chunks(&mut stats) {
            groups
                .entry(chunk.conversation_id.clone())
                .or_default()
                .push((path, chunk));
        }

        for (conversation_id, chunks) in groups {
            if cancel.is_cancelled() {
                break;
            }
            match self.consolidate_one(codec, &chunks) {
                Ok(outcome) => {
                    stats.records_written += outcome.record_written as usize;
                    stats.chunks_deleted += outcome.chunks_deleted;
                    stats.duplicates_removed += outcome.duplicates_removed;
                }
                Err(e) => {
                    // Chunks stay in place; the next tick retries.
                    tracing::warn!(conversation = %conversation_id, error = %e, "consolidation failed");
                    stats.conversations_failed += 1;
                }
            }
        }
        stats
    }

    /// All parseable chunks under the cache root. Unparseable files are
    /// counted and left alone.
    fn load_chunks(&self, stats: &mut ConsolidationStats) -> Vec<(PathBuf, CacheChunk)> {
        let mut chunks = Vec::new();
        let cache_root = self.layout.cache_root();
        let Ok(platform_dirs) = std::fs::read_dir(&cache_root) else {
            return chunks;
        };
        let mut paths: Vec<PathBuf> = platform_dirs
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .flat_map(|dir| {
                std::fs::read_dir(dir.path())
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
            })
            .filter(|p| {
                p.extension().is_some_and(|e| e == "json")
                    && p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with("chunk-"))
            })
            .collect();
        paths.sort();

        for path in paths {
            let parsed = std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<CacheChunk>(&bytes).ok());
            match parsed {
                Some(chunk) => chunks.push((path, chunk)),
                None => stats.skipped_malformed += 1,
            }
        }
        chunks
    }

    fn consolidate_one(
        &self,
        codec: &AicfCodec,
        chunks: &[(PathBuf, CacheChunk)],
    ) -> Result<ConversationOutcome, RecallError> {
        let mut outcome = ConversationOutcome::default();

        // Union every message, tracking sources before dedup so a duplicate
        // still contributes its platform to the record.
        let mut all: Vec<Message> = chunks
            .iter()
            .flat_map(|(_, chunk)| chunk.messages.iter().cloned())
            .collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut platforms = BTreeSet::new();
        let mut by_hash: BTreeMap<String, Message> = BTreeMap::new();
        for message in all {
            platforms.insert(message.metadata.source);
            // First sighting wins; the list is time-sorted, so the kept
            // message carries the earliest timestamp.
            match by_hash.entry(message.metadata.content_hash.clone()) {
                std::collections::btree_map::Entry::Vacant(slot) => {
                    slot.insert(message);
                }
                std::collections::btree_map::Entry::Occupied(_) => {
                    outcome.duplicates_removed += 1;
                }
            }
        }
        let mut messages: Vec<Message> = by_hash.into_values().collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        if messages.is_empty() {
            // Nothing worth a record; clear the degenerate chunks.
            outcome.chunks_deleted += delete_chunks(chunks)?;
            return Ok(outcome);
        }

        let timestamp_start = messages[0].timestamp;
        let timestamp_end = messages[messages.len() - 1].timestamp;
        let analysis = extract::analyze(&messages);
        let record = ConversationRecord {
            conversation_id: chunks[0].1.conversation_id.clone(),
            timestamp_start,
            timestamp_end,
            platforms,
            message_count: messages.len(),
            analysis,
        };

        let aicf_path = self.layout.tier_dir(Tier::Recent).join(record.file_name());
        codec.write_record(&aicf_path, &record_to_aicf(&record))?;

        let md_name = record.file_name().replace(".aicf", ".md");
        let md_path = self.layout.markdown_dir().join(md_name);
        codec.write_file(&md_path, markdown::render(&record).as_bytes())?;

        outcome.record_written = true;
        outcome.chunks_deleted += delete_chunks(chunks)?;
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct ConversationOutcome {
    record_written: bool,
    chunks_deleted: usize,
    duplicates_removed: usize,
}

fn delete_chunks(chunks: &[(PathBuf, CacheChunk)]) -> Result<usize, RecallError> {
    let mut deleted = 0;
    for (path, _) in chunks {
        std::fs::remove_file(path)?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Serialize a record into AICF lines. Free-text fields are flattened and
/// clipped here, so the codec's validation can only fail on programmer
/// error.
pub fn record_to_aicf(record: &ConversationRecord) -> AicfRecord {
    let mut out = AicfRecord::new();
    out.push("timestamp", &[&format_timestamp(&record.timestamp_start)]);
    out.push("timestampEnd", &[&format_timestamp(&record.timestamp_end)]);
    out.push("conversationId", &[&field(&record.conversation_id)]);
    out.push("platforms", &[&record.platforms_csv()]);
    out.push("messageCount", &[&record.message_count.to_string()]);

    for intent in &record.analysis.user_intents {
        out.push(
            "userIntents",
            &[
                &format_timestamp(&intent.timestamp),
                &field(&intent.text),
                &intent.confidence.to_string(),
            ],
        );
    }
    for action in &record.analysis.ai_actions {
        out.push(
            "aiActions",
            &[&format_timestamp(&action.timestamp), &field(&action.text)],
        );
    }
    for tech in &record.analysis.technical_work {
        out.push(
            "technicalWork",
            &[
                &format_timestamp(&tech.timestamp),
                &tech.category.to_string(),
                &field(&tech.text),
            ],
        );
    }
    for decision in &record.analysis.decisions {
        out.push(
            "decisions",
            &[&format_timestamp(&decision.timestamp), &field(&decision.text)],
        );
    }
    for entry in &record.analysis.flow {
        out.push(
            "flow",
            &[
                &entry.index.to_string(),
                &entry.role.to_string(),
                &entry.marker.to_string(),
            ],
        );
    }
    out.push("workingState", &[&field(&record.analysis.working_state)]);
    out.push("compression", &["FULL"]);
    out
}

fn field(text: &str) -> String {
    AicfCodec::sanitize_field(extract::truncate(text, 200))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, Role};
    use chrono::{DateTime, Utc};

    fn message(id: &str, conv: &str, ts: &str, role: Role, content: &str, source: Platform) -> Message {
        Message::new(id, conv, ts.parse::<DateTime<Utc>>().unwrap(), role, content, source, "test")
    }

    fn write_chunk(layout: &Layout, chunk: &CacheChunk) -> PathBuf {
        let path = layout.cache_dir(chunk.platform).join(chunk.file_name());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec_pretty(chunk).unwrap()).unwrap();
        path
    }

    fn chunk(platform: Platform, conv: &str, messages: Vec<Message>) -> CacheChunk {
        CacheChunk {
            platform,
            conversation_id: conv.into(),
            produced_at: "2025-10-25T12:00:00Z".parse().unwrap(),
            messages,
        }
    }

    #[test]
    fn test_single_chunk_produces_record_and_companion() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let codec = AicfCodec::new();
        let chunk_path = write_chunk(
            &layout,
            &chunk(
                Platform::Augment,
                "a1",
                vec![
                    message("1", "a1", "2025-10-25T10:00:00Z", Role::User, "hi", Platform::Augment),
                    message("2", "a1", "2025-10-25T10:00:05Z", Role::Assistant, "hello", Platform::Augment),
                ],
            ),
        );

        let agent = ConsolidationAgent::new(layout.clone());
        let stats = agent.consolidate(&codec, &CancelToken::new());

        assert_eq!(stats.records_written, 1);
        assert_eq!(stats.chunks_deleted, 1);
        assert!(!chunk_path.exists());

        let record_path = layout.tier_dir(Tier::Recent).join("2025-10-25_a1.aicf");
        let doc = codec.read_all(&record_path).unwrap();
        assert_eq!(doc.first("platforms").unwrap().field(0), Some("augment"));
        assert_eq!(doc.first("messageCount").unwrap().field(0), Some("2"));
        assert_eq!(doc.all("flow").count(), 2);
        assert_eq!(doc.all("decisions").count(), 0);
        assert_eq!(doc.first("compression").unwrap().field(0), Some("FULL"));

        assert!(layout.markdown_dir().join("2025-10-25_a1.md").exists());
    }

    #[test]
    fn test_cross_platform_duplicate_kept_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let codec = AicfCodec::new();

        write_chunk(
            &layout,
            &chunk(
                Platform::Warp,
                "c1",
                vec![message("w1", "c1", "2025-10-25T10:00:05Z", Role::Assistant, "ok", Platform::Warp)],
            ),
        );
        write_chunk(
            &layout,
            &chunk(
                Platform::ClaudeDesktop,
                "c1",
                vec![message(
                    "d1",
                    "c1",
                    "2025-10-25T10:00:00Z",
                    Role::Assistant,
                    "ok",
                    Platform::ClaudeDesktop,
                )],
            ),
        );

        let agent = ConsolidationAgent::new(layout.clone());
        let stats = agent.consolidate(&codec, &CancelToken::new());
        assert_eq!(stats.records_written, 1);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.chunks_deleted, 2);

        let doc = codec
            .read_all(&layout.tier_dir(Tier::Recent).join("2025-10-25_c1.aicf"))
            .unwrap();
        // Both platforms survive the dedup; the earliest timestamp wins.
        assert_eq!(
            doc.first("platforms").unwrap().field(0),
            Some("claude-desktop,warp")
        );
        assert_eq!(doc.first("messageCount").unwrap().field(0), Some("1"));
        assert_eq!(
            doc.first("timestamp").unwrap().field(0),
            Some("2025-10-25T10:00:00Z")
        );
        assert_eq!(doc.all("flow").count(), 1);
    }

    #[test]
    fn test_no_chunks_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let agent = ConsolidationAgent::new(layout.clone());
        let stats = agent.consolidate(&AicfCodec::new(), &CancelToken::new());

        assert_eq!(stats.records_written, 0);
        assert_eq!(stats.chunks_deleted, 0);
        assert!(!layout.tier_dir(Tier::Recent).exists());
    }

    #[test]
    fn test_malformed_chunk_counted_and_left() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let bad = layout.cache_dir(Platform::Warp).join("chunk-bogus.json");
        std::fs::create_dir_all(bad.parent().unwrap()).unwrap();
        std::fs::write(&bad, "{ truncated").unwrap();

        let agent = ConsolidationAgent::new(layout.clone());
        let stats = agent.consolidate(&AicfCodec::new(), &CancelToken::new());
        assert_eq!(stats.skipped_malformed, 1);
        assert!(bad.exists());
    }

    #[test]
    fn test_record_spanning_two_dates_uses_earliest() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let codec = AicfCodec::new();
        write_chunk(
            &layout,
            &chunk(
                Platform::ClaudeCli,
                "s1",
                vec![
                    message("1", "s1", "2025-10-25T23:50:00Z", Role::User, "late question", Platform::ClaudeCli),
                    message("2", "s1", "2025-10-26T00:10:00Z", Role::Assistant, "early answer", Platform::ClaudeCli),
                ],
            ),
        );

        let agent = ConsolidationAgent::new(layout.clone());
        agent.consolidate(&codec, &CancelToken::new());
        assert!(layout.tier_dir(Tier::Recent).join("2025-10-25_s1.aicf").exists());
    }

    #[test]
    fn test_growing_conversation_rewrites_record() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let codec = AicfCodec::new();
        let agent = ConsolidationAgent::new(layout.clone());

        write_chunk(
            &layout,
            &chunk(
                Platform::Warp,
                "c1",
                vec![message("1", "c1", "2025-10-25T10:00:00Z", Role::User, "start", Platform::Warp)],
            ),
        );
        agent.consolidate(&codec, &CancelToken::new());

        write_chunk(
            &layout,
            &chunk(
                Platform::Warp,
                "c1",
                vec![
                    message("1", "c1", "2025-10-25T10:00:00Z", Role::User, "start", Platform::Warp),
                    message("2", "c1", "2025-10-25T10:05:00Z", Role::Assistant, "continued", Platform::Warp),
                ],
            ),
        );
        let stats = agent.consolidate(&codec, &CancelToken::new());
        assert_eq!(stats.records_written, 1);

        let doc = codec
            .read_all(&layout.tier_dir(Tier::Recent).join("2025-10-25_c1.aicf"))
            .unwrap();
        assert_eq!(doc.first("messageCount").unwrap().field(0), Some("2"));
    }
}
