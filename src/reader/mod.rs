//! Reader trait, permission gating, and shared platform-store plumbing.
//!
//! # Architecture overview
//!
//! A `Reader` is a read-only adapter over one platform's storage (LevelDB,
//! SQLite, or JSONL) that produces normalized `Message` sequences. Readers
//! never mutate platform data and never fail the pipeline: every failure
//! mode degrades to an empty result plus an audit row.
//!
//! The gating and error-downgrade logic is shared trait plumbing. Concrete
//! readers implement `read_unchecked` (open the store, parse, return
//! messages) and get `read_all` / `read_since` for free:
//!
//! - permission not `active` → empty + `access_denied` audit row
//! - store missing → empty + `source_unavailable` audit row
//! - open/parse failure → empty + `read_error` audit row
//!
//! # Locked stores
//!
//! A store held exclusively by its host process (LevelDB LOCK, SQLite busy)
//! gets a bounded retry (3 attempts over at most 5 seconds) before readers
//! fall back to copying the store into a temp directory and reading the
//! copy. Temp copies are owned by `tempfile` guards and vanish on return.

pub mod augment;
pub mod claude_cli;
pub mod claude_desktop;
pub mod warp;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags};

use crate::error::RecallError;
use crate::model::{Message, Platform, format_timestamp, parse_timestamp};
use crate::permissions::{AuditEvent, PermissionStore};

/// Result of one read pass over a platform store.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub messages: Vec<Message>,
    pub skipped_malformed: usize,
}

impl ReadOutcome {
    pub fn empty() -> ReadOutcome {
        ReadOutcome::default()
    }
}

/// Read-only adapter over one platform's conversation storage.
pub trait Reader {
    fn platform(&self) -> Platform;

    /// Whether the platform store exists on this machine.
    fn is_available(&self) -> bool;

    /// Open the store and read every message. Errors are surfaced here and
    /// downgraded to audit rows by `read_all`; implementations must not
    /// write to the store.
    fn read_unchecked(&self) -> Result<ReadOutcome, RecallError>;

    /// The gated entry point used by cache writers.
    fn read_all(&self, gate: &mut PermissionStore) -> ReadOutcome {
        let platform = self.platform();
        if !gate.is_active(platform) {
            let _ = gate.log_event(AuditEvent::access_denied(platform));
            return ReadOutcome::empty();
        }
        if !self.is_available() {
            let _ = gate.log_event(AuditEvent::source_unavailable(platform, "store missing"));
            return ReadOutcome::empty();
        }
        match self.read_unchecked() {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = gate.log_event(AuditEvent::read_error(platform, e.to_string()));
                ReadOutcome::empty()
            }
        }
    }

    /// Incremental read: messages strictly newer than `cursor` (an RFC 3339
    /// timestamp), plus the new cursor. With no new messages the cursor is
    /// carried forward unchanged.
    fn read_since(
        &self,
        gate: &mut PermissionStore,
        cursor: Option<&str>,
    ) -> (ReadOutcome, Option<String>) {
        let mut outcome = self.read_all(gate);
        let since: Option<DateTime<Utc>> = cursor.and_then(parse_timestamp);
        if let Some(since) = since {
            outcome.messages.retain(|m| m.timestamp > since);
        }
        let new_cursor = outcome
            .messages
            .iter()
            .map(|m| m.timestamp)
            .max()
            .map(|t| format_timestamp(&t))
            .or_else(|| cursor.map(str::to_string));
        (outcome, new_cursor)
    }
}

/// Default source location for a platform, or `None` when it cannot be
/// derived (no home directory).
pub fn default_source_path(platform: Platform) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let path = match platform {
        Platform::Augment => vscode_workspace_storage(&home),
        Platform::ClaudeCli => home.join(".claude/projects"),
        Platform::ClaudeDesktop => home.join("Library/Application Support/Claude"),
        Platform::Warp => home.join(
            "Library/Group Containers/2BBY89MBSN.dev.warp/Library/Application Support/dev.warp.Warp-Stable/warp.sqlite",
        ),
    };
    Some(path)
}

/// VSCode's per-workspace storage root, which hosts the Augment extension's
/// LevelDB under each workspace directory.
fn vscode_workspace_storage(home: &Path) -> PathBuf {
    let macos = home.join("Library/Application Support/Code/User/workspaceStorage");
    if macos.exists() {
        macos
    } else {
        home.join(".config/Code/User/workspaceStorage")
    }
}

/// Retry an open operation against a possibly-locked store: 3 attempts with
/// short sleeps, at most ~5 seconds total, before giving up.
pub(crate) fn with_retry<T>(
    mut op: impl FnMut() -> Result<T, RecallError>,
) -> Result<T, RecallError> {
    const ATTEMPTS: usize = 3;
    const BACKOFF: [u64; 2] = [500, 2000];
    let mut last_err = None;
    for attempt in 0..ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < ATTEMPTS {
                    std::thread::sleep(Duration::from_millis(BACKOFF[attempt]));
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RecallError::Other("retry with zero attempts".into())))
}

/// Open a SQLite database strictly read-only.
pub(crate) fn open_sqlite_readonly(path: &Path) -> Result<Connection, RecallError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

/// Copy a single file into a fresh temp directory and return the guard plus
/// the copied path. Used for live SQLite databases that must not be opened
/// in place.
pub(crate) fn copy_file_to_tmp(path: &Path) -> Result<(tempfile::TempDir, PathBuf), RecallError> {
    let dir = tempfile::tempdir()?;
    let file_name = path
        .file_name()
        .ok_or_else(|| RecallError::Other(format!("not a file: {}", path.display())))?;
    let dest = dir.path().join(file_name);
    std::fs::copy(path, &dest)?;
    // WAL sidecars carry unmerged pages; copy them when present so the
    // snapshot contains recent writes.
    for suffix in ["-wal", "-shm"] {
        let mut side_name = path.as_os_str().to_os_string();
        side_name.push(suffix);
        let side = PathBuf::from(&side_name);
        if side.exists() {
            let mut dest_name = dest.as_os_str().to_os_string();
            dest_name.push(suffix);
            let _ = std::fs::copy(&side, PathBuf::from(dest_name));
        }
    }
    Ok((dir, dest))
}

/// Recursively copy a directory into a fresh temp directory. Used for
/// LevelDB stores whose LOCK is held by the host process.
pub(crate) fn copy_dir_to_tmp(src: &Path) -> Result<(tempfile::TempDir, PathBuf), RecallError> {
    let dir = tempfile::tempdir()?;
    let dest = dir.path().join("store");
    copy_dir_recursive(src, &dest)?;
    Ok((dir, dest))
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<(), RecallError> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if entry.file_name() != "LOCK" {
            // The source LOCK file belongs to the host process; the copy
            // gets a fresh one when opened.
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Interpret a SQLite column as a timestamp: ISO-8601 text, unix seconds,
/// or unix milliseconds.
pub(crate) fn timestamp_from_sql(value: &rusqlite::types::Value) -> Option<DateTime<Utc>> {
    use rusqlite::types::Value;
    match value {
        Value::Text(s) => parse_timestamp(s).or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        }),
        Value::Integer(i) => {
            if *i > 100_000_000_000 {
                Utc.timestamp_millis_opt(*i).single()
            } else {
                Utc.timestamp_opt(*i, 0).single()
            }
        }
        Value::Real(f) => Utc.timestamp_opt(*f as i64, 0).single(),
        _ => None,
    }
}
