//! Claude Desktop reader: message tables from the app's SQLite databases.
//!
//! Claude Desktop keeps its local databases under the app-support
//! directory. The databases are live while the app runs, so the reader
//! always snapshots each `.db` file into a temp directory before opening
//! it; the snapshot is removed on return.
//!
//! Vendor schemas drift between app versions, so the reader probes
//! `sqlite_master` for a `messages` table and reads the
//! `(id, conversation_id, role, content, created_at)` shape. A database
//! without that table is skipped silently; it belongs to some other
//! feature of the app.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use walkdir::WalkDir;

use crate::error::RecallError;
use crate::model::{Message, Platform, Role};
use crate::reader::{
    ReadOutcome, Reader, copy_file_to_tmp, default_source_path, open_sqlite_readonly,
    timestamp_from_sql,
};

pub struct ClaudeDesktopReader {
    /// Directory scanned for `.db` files.
    source: Option<PathBuf>,
}

impl ClaudeDesktopReader {
    pub fn new(source_override: Option<PathBuf>) -> ClaudeDesktopReader {
        ClaudeDesktopReader {
            source: source_override.or_else(|| default_source_path(Platform::ClaudeDesktop)),
        }
    }

    fn db_files(&self) -> Vec<PathBuf> {
        let Some(source) = &self.source else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = WalkDir::new(source)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "db"))
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();
        files
    }
}

impl Reader for ClaudeDesktopReader {
    fn platform(&self) -> Platform {
        Platform::ClaudeDesktop
    }

    fn is_available(&self) -> bool {
        !self.db_files().is_empty()
    }

    fn read_unchecked(&self) -> Result<ReadOutcome, RecallError> {
        let mut outcome = ReadOutcome::empty();
        for db in self.db_files() {
            // Always snapshot: the live database may be mid-write.
            let (_guard, copy) = copy_file_to_tmp(&db)?;
            let conn = open_sqlite_readonly(&copy)?;
            if has_messages_table(&conn)? {
                read_messages(&conn, &db, &mut outcome)?;
            }
        }
        Ok(outcome)
    }
}

fn has_messages_table(conn: &Connection) -> Result<bool, RecallError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'messages'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn read_messages(
    conn: &Connection,
    origin: &Path,
    outcome: &mut ReadOutcome,
) -> Result<(), RecallError> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, created_at
         FROM messages
         ORDER BY created_at ASC, id ASC",
    )?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let conversation_id: String = match row.get::<_, Option<String>>(1)? {
            Some(c) if !c.is_empty() => c,
            _ => {
                outcome.skipped_malformed += 1;
                continue;
            }
        };
        let role_raw: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
        let content: String = row.get::<_, Option<String>>(3)?.unwrap_or_default();
        let ts_value: rusqlite::types::Value = row.get(4)?;

        let Some(role) = parse_role(&role_raw) else {
            outcome.skipped_malformed += 1;
            continue;
        };
        let Some(timestamp) = timestamp_from_sql(&ts_value) else {
            outcome.skipped_malformed += 1;
            continue;
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            continue;
        }

        outcome.messages.push(Message::new(
            id.to_string(),
            conversation_id,
            timestamp,
            role,
            trimmed,
            Platform::ClaudeDesktop,
            format!("{}#messages/{id}", origin.display()),
        ));
    }
    Ok(())
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw {
        "user" | "human" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}
