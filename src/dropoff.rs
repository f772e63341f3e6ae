//! Memory drop-off: age-based tier migration with progressive compression.
//!
//! # Architecture overview
//!
//! This agent owns `.aicf/medium/`, `.aicf/old/`, and `.aicf/archive/`. On
//! each pass it scans `recent/`, `medium/`, and `old/`, computes every
//! record's age from its start timestamp, and migrates files whose age
//! belongs to a colder tier. A record can skip tiers: a 40-day-old file
//! found in `recent/` goes straight to its age-appropriate tier, rewritten
//! at that tier's compression level:
//!
//! - `recent/`  FULL — untouched
//! - `medium/`  SUMMARY — drops raw intents/actions/flow, keeps decisions
//!   and technical context, adds a paragraph `summary|` line
//! - `old/`     KEY_POINTS — only decisions and outcomes survive
//! - `archive/` SINGLE_LINE — exactly one `<date>|<conversationId>|<sentence>`
//!   line, no version header
//!
//! Each migration is atomic per file: the destination is written (tmp +
//! fsync + rename) before the source is deleted, so a failure mid-run
//! leaves the source untouched. Files already at their age-appropriate
//! tier are skipped, which makes the pass a no-op when everything is
//! settled.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::codec::{AicfCodec, AicfDocument, AicfLine, AicfRecord};
use crate::config::RetentionConfig;
use crate::error::RecallError;
use crate::layout::{Layout, Tier};
use crate::watcher::CancelToken;

/// Outcome of one drop-off pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropoffStats {
    pub to_medium: usize,
    pub to_old: usize,
    pub to_archive: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct MemoryDropoffAgent {
    layout: Layout,
    retention: RetentionConfig,
}

impl MemoryDropoffAgent {
    pub fn new(layout: Layout, retention: RetentionConfig) -> MemoryDropoffAgent {
        MemoryDropoffAgent { layout, retention }
    }

    /// Migrate every record whose age has outgrown its tier. `now` is
    /// injected so age math is testable.
    pub fn dropoff(&self, codec: &AicfCodec, now: DateTime<Utc>, cancel: &CancelToken) -> DropoffStats {
        let mut stats = DropoffStats::default();

        // Archive is terminal; only the three warmer tiers are scanned.
        for tier in [Tier::Recent, Tier::Medium, Tier::Old] {
            for path in tier_files(&self.layout.tier_dir(tier)) {
                if cancel.is_cancelled() {
                    return stats;
                }
                let Some(start) = record_start(codec, &path) else {
                    stats.failed += 1;
                    continue;
                };
                let age_days = (now - start).num_days();
                let target = self.target_tier(age_days);
                if target <= tier {
                    stats.skipped += 1;
                    continue;
                }
                match self.migrate(codec, &path, target) {
                    Ok(()) => match target {
                        Tier::Medium => stats.to_medium += 1,
                        Tier::Old => stats.to_old += 1,
                        Tier::Archive => stats.to_archive += 1,
                        Tier::Recent => {}
                    },
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "tier migration failed");
                        stats.failed += 1;
                    }
                }
            }
        }
        stats
    }

    fn target_tier(&self, age_days: i64) -> Tier {
        if age_days >= self.retention.archive_after_days {
            Tier::Archive
        } else if age_days >= self.retention.old_after_days {
            Tier::Old
        } else if age_days >= self.retention.medium_after_days {
            Tier::Medium
        } else {
            Tier::Recent
        }
    }

    /// Rewrite at the target compression, then delete the source. The
    /// destination write is atomic, so the source is only removed once the
    /// new tier holds a durable copy.
    fn migrate(&self, codec: &AicfCodec, path: &Path, target: Tier) -> Result<(), RecallError> {
        let doc = codec.read_all(path)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| RecallError::Other(format!("no file name: {}", path.display())))?;
        let dest = self.layout.tier_dir(target).join(file_name);

        match target {
            Tier::Medium => codec.write_record(&dest, &summarize(&doc))?,
            Tier::Old => codec.write_record(&dest, &key_points(&doc))?,
            Tier::Archive => {
                codec.write_lines(&dest, &[archive_line(&doc, file_name.to_string_lossy().as_ref())], false)?
            }
            Tier::Recent => unreachable!("recent is never a migration target"),
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}

fn tier_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "aicf"))
        .collect();
    files.sort();
    files
}

/// A record's start timestamp: the `timestamp|` line, with the filename's
/// date prefix (midnight UTC) as fallback.
fn record_start(codec: &AicfCodec, path: &Path) -> Option<DateTime<Utc>> {
    if let Ok(doc) = codec.read_all(path) {
        if let Some(ts) = doc.first("timestamp").and_then(|l| l.field(0)) {
            if let Some(parsed) = crate::model::parse_timestamp(ts) {
                return Some(parsed);
            }
        }
    }
    let name = path.file_stem()?.to_str()?;
    let date = name.get(..10)?;
    format!("{date}T00:00:00Z").parse().ok()
}

fn copy_line(doc: &AicfDocument, key: &str, out: &mut AicfRecord) {
    for line in doc.all(key) {
        let fields: Vec<&str> = line.fields.iter().map(String::as_str).collect();
        out.push(key, &fields);
    }
}

fn header_field<'a>(doc: &'a AicfDocument, key: &str) -> &'a str {
    doc.first(key).and_then(|l| l.field(0)).unwrap_or("")
}

/// SUMMARY compression: header + decisions + technical context + one
/// paragraph, deterministic for a given input document.
fn summarize(doc: &AicfDocument) -> AicfRecord {
    let mut out = AicfRecord::new();
    for key in ["timestamp", "timestampEnd", "conversationId", "platforms", "messageCount"] {
        copy_line(doc, key, &mut out);
    }
    copy_line(doc, "decisions", &mut out);
    copy_line(doc, "technicalWork", &mut out);
    out.push("summary", &[&summary_paragraph(doc)]);
    out.push("compression", &["SUMMARY"]);
    out
}

fn summary_paragraph(doc: &AicfDocument) -> String {
    let conversation = header_field(doc, "conversationId");
    let platforms = header_field(doc, "platforms");
    let messages = header_field(doc, "messageCount");
    let decisions = doc.all("decisions").count();
    let technical = doc.all("technicalWork").count();
    let state = header_field(doc, "workingState");
    let mut paragraph = format!(
        "Conversation {conversation} across {platforms}: {messages} messages, \
         {decisions} decisions, {technical} technical notes."
    );
    if !state.is_empty() {
        paragraph.push(' ');
        paragraph.push_str(state);
    }
    AicfCodec::sanitize_field(&paragraph)
}

/// KEY_POINTS compression: decisions plus the conversation's outcome, and
/// nothing else beyond the identifying header.
fn key_points(doc: &AicfDocument) -> AicfRecord {
    let mut out = AicfRecord::new();
    for key in ["timestamp", "timestampEnd", "conversationId", "platforms"] {
        copy_line(doc, key, &mut out);
    }
    for decision in doc.all("decisions") {
        let fields: Vec<&str> = decision.fields.iter().map(String::as_str).collect();
        out.push("keyPoints", &fields);
    }
    // Carry forward key points from an earlier KEY_POINTS rewrite.
    copy_line(doc, "keyPoints", &mut out);
    let outcome = outcome_sentence(doc);
    if !outcome.is_empty() {
        let end = doc
            .first("timestampEnd")
            .and_then(|l| l.field(0))
            .unwrap_or_else(|| header_field(doc, "timestamp"));
        out.push("keyPoints", &[end, &outcome]);
    }
    out.push("compression", &["KEY_POINTS"]);
    out
}

/// The best available one-sentence outcome for a document at any
/// compression level.
fn outcome_sentence(doc: &AicfDocument) -> String {
    let candidate = doc
        .first("summary")
        .and_then(|l| l.field(0))
        .or_else(|| doc.first("workingState").and_then(|l| l.field(0)))
        .unwrap_or("");
    AicfCodec::sanitize_field(candidate)
}

/// SINGLE_LINE compression: `<date>|<conversationId>|<sentence>`.
fn archive_line(doc: &AicfDocument, file_name: &str) -> AicfLine {
    let date = file_name.get(..10).unwrap_or("unknown").to_string();
    let conversation = header_field(doc, "conversationId").to_string();
    let mut sentence = outcome_sentence(doc);
    if sentence.is_empty() {
        sentence = doc
            .all("keyPoints")
            .next()
            .and_then(|l| l.field(1))
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{} messages across {}",
                    header_field(doc, "messageCount"),
                    header_field(doc, "platforms")
                )
            });
    }
    AicfLine::new(&date, &[&conversation, &AicfCodec::sanitize_field(&sentence)])
}
