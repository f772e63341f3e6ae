//! Per-platform cache writers: reader output → content-addressed chunks.
//!
//! A cache writer polls its reader (through the permission gate), groups
//! the returned messages by conversation, and drops one JSON chunk file per
//! group into `.cache/llm/<platform>/`. Chunk filenames embed the SHA-256
//! of the member content hashes, so writing the same conversation state
//! twice hits the same filename and is skipped without touching disk.
//!
//! Consolidation deletes chunks after merging them, so filename existence
//! alone cannot make re-runs idempotent. Each platform cache keeps an
//! `.emitted.aicf` ledger of every chunk hash ever written; a hash present
//! in the ledger is never re-emitted, which keeps a steady-state tick at
//! zero new chunks. Writers never mutate platform data and are safe to
//! re-run at any time.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::Utc;

use crate::codec::{AicfCodec, AicfLine};
use crate::error::RecallError;
use crate::layout::Layout;
use crate::model::{CacheChunk, Message, Platform};
use crate::permissions::PermissionStore;
use crate::reader::Reader;

/// Outcome of one cache-writer pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    pub new_chunks: usize,
    pub skipped_chunks: usize,
    pub messages_seen: usize,
    pub skipped_malformed: usize,
}

pub struct CacheWriter {
    reader: Box<dyn Reader>,
    cache_dir: PathBuf,
}

impl CacheWriter {
    pub fn new(reader: Box<dyn Reader>, layout: &Layout) -> CacheWriter {
        let cache_dir = layout.cache_dir(reader.platform());
        CacheWriter { reader, cache_dir }
    }

    pub fn platform(&self) -> Platform {
        self.reader.platform()
    }

    /// One poll: read (gated), group, hash, write new chunks atomically.
    pub fn write(
        &self,
        gate: &mut PermissionStore,
        codec: &AicfCodec,
    ) -> Result<WriteStats, RecallError> {
        let outcome = self.reader.read_all(gate);
        let mut stats = WriteStats {
            messages_seen: outcome.messages.len(),
            skipped_malformed: outcome.skipped_malformed,
            ..Default::default()
        };

        // BTreeMap keeps chunk emission order deterministic across runs.
        let mut groups: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for message in outcome.messages {
            groups
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }

        let ledger_path = self.cache_dir.join(".emitted.aicf");
        let emitted = load_ledger(codec, &ledger_path);

        for (conversation_id, messages) in groups {
            let chunk = CacheChunk {
                platform: self.platform(),
                conversation_id,
                produced_at: Utc::now(),
                messages,
            };
            let hash = chunk.chunk_hash();
            let path = self.cache_dir.join(chunk.file_name());
            if path.exists() || emitted.contains(&hash) {
                stats.skipped_chunks += 1;
                continue;
            }
            let bytes = serde_json::to_vec_pretty(&chunk)?;
            codec.write_file(&path, &bytes)?;
            codec.append_line(&ledger_path, &AicfLine::new("chunk", &[&hash]))?;
            stats.new_chunks += 1;
        }
        Ok(stats)
    }
}

/// Chunk hashes this platform has ever emitted. A missing or unreadable
/// ledger degrades to an empty set, which only costs a redundant re-emit.
fn load_ledger(codec: &AicfCodec, path: &PathBuf) -> HashSet<String> {
    let Ok(doc) = codec.read_all(path) else {
        return HashSet::new();
    };
    doc.all("chunk")
        .filter_map(|line| line.field(0))
        .map(str::to_string)
        .collect()
}
