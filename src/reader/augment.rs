//! Augment reader: LevelDB key-value stores under VSCode workspaceStorage.
//!
//! The Augment extension keeps one LevelDB per VSCode workspace at
//! `<workspaceStorage>/<ws>/Augment.vscode-augment/augment-kv-store`. Each
//! `exchange:` key holds one request/response pair as a JSON blob; the
//! reader emits up to two messages per exchange (user request, assistant
//! response), skipping whichever side is empty.
//!
//! When the host VSCode process holds the store's LOCK, opening fails; the
//! bounded retry runs first, then the store directory is copied into a temp
//! location and the copy is opened instead. The copy is deleted before the
//! reader returns.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rusty_leveldb::LdbIterator;
use serde_json::Value;

use crate::error::RecallError;
use crate::model::{Message, Platform, Role};
use crate::reader::{ReadOutcome, Reader, copy_dir_to_tmp, default_source_path, with_retry};

const EXCHANGE_PREFIX: &[u8] = b"exchange:";

pub struct AugmentReader {
    /// A VSCode workspaceStorage root, or a single kv-store directory.
    source: Option<PathBuf>,
}

impl AugmentReader {
    pub fn new(source_override: Option<PathBuf>) -> AugmentReader {
        AugmentReader {
            source: source_override.or_else(|| default_source_path(Platform::Augment)),
        }
    }

    /// All kv-store directories under the source. A source that is itself a
    /// LevelDB directory (has a CURRENT file) is used directly; otherwise it
    /// is treated as a workspaceStorage root and scanned one workspace deep.
    fn store_dirs(&self) -> Vec<PathBuf> {
        let Some(source) = &self.source else {
            return Vec::new();
        };
        if source.join("CURRENT").exists() {
            return vec![source.clone()];
        }
        let mut stores = Vec::new();
        if let Ok(entries) = std::fs::read_dir(source) {
            for entry in entries.filter_map(|e| e.ok()) {
                let store = entry
                    .path()
                    .join("Augment.vscode-augment")
                    .join("augment-kv-store");
                if store.is_dir() {
                    stores.push(store);
                }
            }
        }
        stores.sort();
        stores
    }
}

impl Reader for AugmentReader {
    fn platform(&self) -> Platform {
        Platform::Augment
    }

    fn is_available(&self) -> bool {
        !self.store_dirs().is_empty()
    }

    fn read_unchecked(&self) -> Result<ReadOutcome, RecallError> {
        let mut outcome = ReadOutcome::empty();
        for store in self.store_dirs() {
            read_store(&store, &mut outcome)?;
        }
        Ok(outcome)
    }
}

fn read_store(store: &Path, outcome: &mut ReadOutcome) -> Result<(), RecallError> {
    let entries = match with_retry(|| read_exchange_entries(store)) {
        Ok(entries) => entries,
        Err(_) => {
            // LOCK held by the host process: snapshot the directory and
            // read the snapshot. The guard removes the copy on drop.
            let (_guard, copy) = copy_dir_to_tmp(store)?;
            read_exchange_entries(&copy)?
        }
    };

    for (key, value) in entries {
        match parse_exchange(&key, &value, store) {
            Some(messages) => outcome.messages.extend(messages),
            None => outcome.skipped_malformed += 1,
        }
    }
    Ok(())
}

/// Open a store and collect all `exchange:` entries as (key, raw value).
fn read_exchange_entries(store: &Path) -> Result<Vec<(String, Vec<u8>)>, RecallError> {
    let mut opts = rusty_leveldb::Options::default();
    opts.create_if_missing = false;
    let mut db = rusty_leveldb::DB::open(store, opts).map_err(|e| RecallError::LevelDb {
        path: store.to_path_buf(),
        detail: format!("{e:?}"),
    })?;
    let mut iter = db.new_iter().map_err(|e| RecallError::LevelDb {
        path: store.to_path_buf(),
        detail: format!("{e:?}"),
    })?;

    let mut entries = Vec::new();
    while let Some((key, value)) = iter.next() {
        if key.starts_with(EXCHANGE_PREFIX) {
            entries.push((String::from_utf8_lossy(&key).into_owned(), value));
        }
    }
    Ok(entries)
}

/// Parse one exchange blob into up to two messages. Returns `None` when the
/// value is not the expected JSON shape.
fn parse_exchange(key: &str, value: &[u8], store: &Path) -> Option<Vec<Message>> {
    let blob: Value = serde_json::from_slice(value).ok()?;
    let obj = blob.as_object()?;

    let timestamp = obj
        .get("timestamp")
        .and_then(exchange_timestamp)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    // conversationId field when present, else the middle segment of
    // `exchange:<conversation>:<message>`.
    let conversation_id = obj
        .get("conversationId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| key.split(':').nth(1).map(str::to_string))?;

    let extracted_from = format!("{}#{key}", store.display());
    let mut messages = Vec::new();

    if let Some(request) = obj.get("request_message").and_then(|v| v.as_str()) {
        let trimmed = request.trim();
        if !trimmed.is_empty() {
            messages.push(Message::new(
                format!("{key}:user"),
                conversation_id.clone(),
                timestamp,
                Role::User,
                trimmed,
                Platform::Augment,
                extracted_from.clone(),
            ));
        }
    }
    if let Some(response) = obj.get("response_text").and_then(|v| v.as_str()) {
        let trimmed = response.trim();
        if !trimmed.is_empty() {
            messages.push(Message::new(
                format!("{key}:assistant"),
                conversation_id,
                timestamp,
                Role::Assistant,
                trimmed,
                Platform::Augment,
                extracted_from,
            ));
        }
    }
    Some(messages)
}

/// Exchange timestamps appear as RFC 3339 strings or epoch numbers
/// (seconds or milliseconds).
fn exchange_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a real LevelDB store with the given exchange entries.
    fn seed_store(dir: &Path, entries: &[(&str, &str)]) {
        let mut opts = rusty_leveldb::Options::default();
        opts.create_if_missing = true;
        let mut db = rusty_leveldb::DB::open(dir, opts).unwrap();
        for (key, value) in entries {
            db.put(key.as_bytes(), value.as_bytes()).unwrap();
        }
        db.flush().unwrap();
    }

    #[test]
    fn test_reads_single_exchange() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(
            dir.path(),
            &[(
                "exchange:a1:m1",
                r#"{"request_message":"hi","response_text":"hello","timestamp":"2025-10-25T10:00:00Z","conversationId":"a1"}"#,
            )],
        );

        let reader = AugmentReader::new(Some(dir.path().to_path_buf()));
        assert!(reader.is_available());
        let outcome = reader.read_unchecked().unwrap();

        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.skipped_malformed, 0);
        let user = &outcome.messages[0];
        assert_eq!(user.role, Role::User);
        assert_eq!(user.content, "hi");
        assert_eq!(user.conversation_id, "a1");
        assert_eq!(user.metadata.source, Platform::Augment);
        assert!(!user.metadata.content_hash.is_empty());
        assert_eq!(outcome.messages[1].role, Role::Assistant);
    }

    #[test]
    fn test_skips_empty_sides() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(
            dir.path(),
            &[(
                "exchange:a1:m2",
                r#"{"request_message":"  ","response_text":"answer only","timestamp":"2025-10-25T10:00:00Z","conversationId":"a1"}"#,
            )],
        );

        let reader = AugmentReader::new(Some(dir.path().to_path_buf()));
        let outcome = reader.read_unchecked().unwrap();
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].role, Role::Assistant);
    }

    #[test]
    fn test_counts_malformed_values() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(dir.path(), &[("exchange:a1:m3", "not json at all")]);

        let reader = AugmentReader::new(Some(dir.path().to_path_buf()));
        let outcome = reader.read_unchecked().unwrap();
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.skipped_malformed, 1);
    }

    #[test]
    fn test_ignores_non_exchange_keys() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(
            dir.path(),
            &[
                ("settings:theme", r#"{"theme":"dark"}"#),
                (
                    "exchange:a1:m1",
                    r#"{"request_message":"q","response_text":"a","timestamp":"2025-10-25T10:00:00Z","conversationId":"a1"}"#,
                ),
            ],
        );

        let reader = AugmentReader::new(Some(dir.path().to_path_buf()));
        let outcome = reader.read_unchecked().unwrap();
        assert_eq!(outcome.messages.len(), 2);
    }

    #[test]
    fn test_conversation_id_from_key_fallback() {
        let dir = tempfile::tempdir().unwrap();
        seed_store(
            dir.path(),
            &[(
                "exchange:conv42:m1",
                r#"{"request_message":"q","response_text":"a","timestamp":1761386400}"#,
            )],
        );

        let reader = AugmentReader::new(Some(dir.path().to_path_buf()));
        let outcome = reader.read_unchecked().unwrap();
        assert_eq!(outcome.messages[0].conversation_id, "conv42");
    }

    #[test]
    fn test_unavailable_when_source_missing() {
        let reader = AugmentReader::new(Some(PathBuf::from("/definitely/not/here")));
        assert!(!reader.is_available());
    }
}
