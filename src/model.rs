//! Core data model for the memory pipeline.
//!
//! # Architecture overview
//!
//! Recall ingests conversations from four local AI platforms, each with its
//! own storage format, and normalizes everything into a shared model before
//! any pipeline stage touches it:
//!
//! ```text
//! Platform store → Reader → Message → CacheChunk → ConversationRecord → AICF
//! ```
//!
//! Parsers normalize per-platform quirks into `Message`; every later stage
//! (cache writers, consolidation, drop-off) only ever sees these types, never
//! raw platform data.
//!
//! Content identity is a SHA-256 over the trimmed, casefolded message text.
//! The same hash drives deduplication across platforms and the
//! content-addressed chunk filenames, so both are stable across re-runs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies which AI platform produced a message.
///
/// The `Display` form is the on-disk platform id used in cache directory
/// names, `platforms|` CSV fields, and audit rows. `BTreeSet<Platform>`
/// iterates in this declaration-independent, id-sorted order because the
/// derive of `Ord` follows variant order, which matches the sorted ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Augment,
    ClaudeCli,
    ClaudeDesktop,
    Warp,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Augment,
        Platform::ClaudeCli,
        Platform::ClaudeDesktop,
        Platform::Warp,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Platform::Augment => "augment",
            Platform::ClaudeCli => "claude-cli",
            Platform::ClaudeDesktop => "claude-desktop",
            Platform::Warp => "warp",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "augment" => Ok(Platform::Augment),
            "claude-cli" => Ok(Platform::ClaudeCli),
            "claude-desktop" => Ok(Platform::ClaudeDesktop),
            "warp" => Ok(Platform::Warp),
            _ => Err(format!(
                "Unknown platform: {s}. Valid: augment, claude-cli, claude-desktop, warp"
            )),
        }
    }
}

/// Speaker role within a conversation turn.
///
/// `System` covers synthetic messages recall itself injects (e.g. Warp
/// command renderings) that have no speaker in the original conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Provenance attached to every message by its reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub source: Platform,
    /// Where in the platform store the message came from (a LevelDB key, a
    /// SQLite row id, a JSONL file path). Diagnostic only.
    pub extracted_from: String,
    /// Lowercase hex SHA-256 of the normalized content; never empty.
    pub content_hash: String,
}

/// The canonical conversation atom.
///
/// `timestamp` is monotonic within one source's session but not across
/// sources; consolidation re-sorts merged groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within its source, not globally.
    pub id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub metadata: MessageMetadata,
}

impl Message {
    /// Build a message, computing the content hash from `content`.
    ///
    /// Callers must have already rejected empty content; readers drop
    /// messages whose trimmed text is empty before constructing one.
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        role: Role,
        content: impl Into<String>,
        source: Platform,
        extracted_from: impl Into<String>,
    ) -> Message {
        let content = content.into();
        let content_hash = content_hash(&content);
        Message {
            id: id.into(),
            conversation_id: conversation_id.into(),
            timestamp,
            role,
            content,
            metadata: MessageMetadata {
                source,
                extracted_from: extracted_from.into(),
                content_hash,
            },
        }
    }
}

/// SHA-256 of the trimmed, casefolded content, as lowercase hex.
///
/// Normalization (trim + lowercase) makes the hash stable against the
/// whitespace and casing drift different platforms apply to the same text.
pub fn content_hash(content: &str) -> String {
    let normalized = content.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// A batch of messages for one conversation, cached on disk as JSON at
/// `.cache/llm/<platform>/chunk-<hash>.json`.
///
/// The filename hash is derived from member content hashes, so re-emitting
/// identical content is a filename collision and therefore a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheChunk {
    pub platform: Platform,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "producedAt")]
    pub produced_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl CacheChunk {
    /// Deterministic chunk identity: SHA-256 over the member content hashes
    /// concatenated in ascending order. Message order within the chunk does
    /// not affect the result.
    pub fn chunk_hash(&self) -> String {
        let mut hashes: Vec<&str> = self
            .messages
            .iter()
            .map(|m| m.metadata.content_hash.as_str())
            .collect();
        hashes.sort_unstable();
        let mut hasher = Sha256::new();
        for h in hashes {
            hasher.update(h.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn file_name(&self) -> String {
        format!("chunk-{}.json", self.chunk_hash())
    }
}

/// The consolidated, analyzed, multi-platform representation of a single
/// conversation; one per `conversation_id`, serialized as an AICF record
/// named `YYYY-MM-DD_<conversationId>.aicf` after its start date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub platforms: BTreeSet<Platform>,
    pub message_count: usize,
    pub analysis: crate::extract::Analysis,
}

impl ConversationRecord {
    /// Filename for this record within a tier directory. Conversation ids
    /// come from foreign stores, so anything path-hostile is normalized.
    pub fn file_name(&self) -> String {
        let safe_id: String = self
            .conversation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
            .collect();
        format!("{}_{safe_id}.aicf", self.timestamp_start.format("%Y-%m-%d"))
    }

    /// Sorted CSV of platform ids, e.g. `claude-desktop,warp`.
    pub fn platforms_csv(&self) -> String {
        let ids: Vec<&str> = self.platforms.iter().map(Platform::id).collect();
        ids.join(",")
    }
}

/// Render a timestamp in the canonical AICF form: RFC 3339 UTC, `Z` suffix,
/// whole seconds.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Parse a timestamp in any RFC 3339 flavor back to UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().ok()
}
