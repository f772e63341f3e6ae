//! Warp reader: agent conversations from Warp's SQLite database.
//!
//! Warp stores agent-mode activity in `warp.sqlite`. The reader joins
//! `agent_conversations` with `ai_queries` and unpacks each query's JSON
//! `input` array:
//!
//! - `Query` elements carry the user's typed text → user messages.
//! - `ActionResult` elements describe what the agent did (commands run,
//!   files touched) → synthetic assistant messages rendering the command
//!   or file list.
//!
//! The database is opened read-only. A busy database gets the bounded
//! retry, then a snapshot copy is read instead.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use crate::error::RecallError;
use crate::model::{Message, Platform, Role};
use crate::reader::{
    ReadOutcome, Reader, copy_file_to_tmp, default_source_path, open_sqlite_readonly,
    timestamp_from_sql, with_retry,
};

pub struct WarpReader {
    db_path: Option<PathBuf>,
}

impl WarpReader {
    pub fn new(source_override: Option<PathBuf>) -> WarpReader {
        WarpReader {
            db_path: source_override.or_else(|| default_source_path(Platform::Warp)),
        }
    }
}

impl Reader for WarpReader {
    fn platform(&self) -> Platform {
        Platform::Warp
    }

    fn is_available(&self) -> bool {
        self.db_path.as_deref().is_some_and(|p| p.exists())
    }

    fn read_unchecked(&self) -> Result<ReadOutcome, RecallError> {
        let path = self
            .db_path
            .as_deref()
            .ok_or_else(|| RecallError::Other("no Warp database path".into()))?;

        match with_retry(|| open_sqlite_readonly(path).and_then(|conn| read_queries(&conn))) {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                // Busy for the whole retry window: read a snapshot copy.
                let (_guard, copy) = copy_file_to_tmp(path)?;
                let conn = open_sqlite_readonly(&copy)?;
                read_queries(&conn)
            }
        }
    }
}

fn read_queries(conn: &Connection) -> Result<ReadOutcome, RecallError> {
    let mut stmt = conn.prepare(
        "SELECT q.id, q.conversation_id, q.start_ts, q.input
         FROM ai_queries q
         JOIN agent_conversations c ON c.conversation_id = q.conversation_id
         ORDER BY q.start_ts ASC, q.id ASC",
    )?;

    let mut outcome = ReadOutcome::empty();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let query_id: i64 = row.get(0)?;
        let conversation_id: String = row.get::<_, rusqlite::types::Value>(1)?.into_string();
        let ts_value: rusqlite::types::Value = row.get(2)?;
        let input: String = row.get(3)?;

        let Some(timestamp) = timestamp_from_sql(&ts_value) else {
            outcome.skipped_malformed += 1;
            continue;
        };
        match parse_input(&input, query_id, &conversation_id, timestamp) {
            Some(messages) => outcome.messages.extend(messages),
            None => outcome.skipped_malformed += 1,
        }
    }
    Ok(outcome)
}

trait IntoStringValue {
    fn into_string(self) -> String;
}

impl IntoStringValue for rusqlite::types::Value {
    fn into_string(self) -> String {
        use rusqlite::types::Value;
        match self {
            Value::Text(s) => s,
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            _ => String::new(),
        }
    }
}

/// Unpack one query's JSON `input` array into messages. Returns `None` when
/// the JSON is unparseable.
fn parse_input(
    input: &str,
    query_id: i64,
    conversation_id: &str,
    timestamp: DateTime<Utc>,
) -> Option<Vec<Message>> {
    let parsed: Value = serde_json::from_str(input).ok()?;
    let items = parsed.as_array()?;

    let mut messages = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let id = format!("{query_id}:{idx}");
        let extracted_from = format!("ai_queries#{query_id}");

        if let Some(query) = item.get("Query") {
            if let Some(text) = query.get("text").and_then(|t| t.as_str()) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    messages.push(Message::new(
                        id,
                        conversation_id,
                        timestamp,
                        Role::User,
                        trimmed,
                        Platform::Warp,
                        extracted_from,
                    ));
                }
            }
        } else if let Some(action) = item.get("ActionResult") {
            if let Some(rendered) = render_action_result(action) {
                messages.push(Message::new(
                    id,
                    conversation_id,
                    timestamp,
                    Role::Assistant,
                    rendered,
                    Platform::Warp,
                    extracted_from,
                ));
            }
        }
    }
    Some(messages)
}

/// Render an ActionResult into transcript text. Commands and file lists get
/// a readable prefix; other result shapes fall back to any embedded text.
fn render_action_result(action: &Value) -> Option<String> {
    if let Some(command) = find_string(action, "command") {
        return Some(format!("Ran command: {}", command.trim()));
    }
    if let Some(files) = find_array(action, "files") {
        let names: Vec<&str> = files.iter().filter_map(|f| f.as_str()).collect();
        if !names.is_empty() {
            return Some(format!("Touched files: {}", names.join(", ")));
        }
    }
    if let Some(text) = find_string(action, "text").or_else(|| find_string(action, "content")) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    None
}

/// Depth-first search for the first string value under the given key.
fn find_string<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).and_then(|v| v.as_str()) {
                return Some(found);
            }
            map.values().find_map(|v| find_string(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_string(v, key)),
        _ => None,
    }
}

fn find_array<'a>(value: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).and_then(|v| v.as_array()) {
                return Some(found);
            }
            map.values().find_map(|v| find_array(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_array(v, key)),
        _ => None,
    }
}
