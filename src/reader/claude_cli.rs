//! Claude CLI reader: JSONL session logs under `~/.claude/projects/`.
//!
//! Each project subdirectory holds one `.jsonl` file per session; each line
//! is a JSON record `{type, message: {role, content}, timestamp, sessionId}`.
//! The session id is the conversation id. `content` is either a plain
//! string or an array of content blocks, whose `text` parts are
//! concatenated. Records flagged `isMeta` and user lines that are injected
//! XML-ish system content (leading `<`) are skipped, as are `.bak`
//! leftovers from interrupted CLI writes.
//!
//! A truncated or otherwise unparseable line increments the malformed
//! counter and parsing continues with the next line; one bad line must not
//! cost the rest of the session.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::RecallError;
use crate::model::{Message, Platform, Role, parse_timestamp};
use crate::reader::{ReadOutcome, Reader, default_source_path};

pub struct ClaudeCliReader {
    projects_dir: Option<PathBuf>,
}

impl ClaudeCliReader {
    pub fn new(source_override: Option<PathBuf>) -> ClaudeCliReader {
        ClaudeCliReader {
            projects_dir: source_override.or_else(|| default_source_path(Platform::ClaudeCli)),
        }
    }

    /// Project subdirectories currently present under the projects root.
    pub fn available_projects(&self) -> Vec<PathBuf> {
        let Some(root) = &self.projects_dir else {
            return Vec::new();
        };
        let mut projects: Vec<PathBuf> = std::fs::read_dir(root)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.path())
            .collect();
        projects.sort();
        projects
    }

    fn session_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for project in self.available_projects() {
            for entry in WalkDir::new(&project).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "jsonl")
                    && !path
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().contains(".bak"))
                {
                    files.push(path.to_path_buf());
                }
            }
        }
        files.sort();
        files
    }
}

impl Reader for ClaudeCliReader {
    fn platform(&self) -> Platform {
        Platform::ClaudeCli
    }

    fn is_available(&self) -> bool {
        self.projects_dir.as_deref().is_some_and(Path::is_dir)
    }

    fn read_unchecked(&self) -> Result<ReadOutcome, RecallError> {
        let mut outcome = ReadOutcome::empty();
        for file in self.session_files() {
            read_session_file(&file, &mut outcome)?;
        }
        Ok(outcome)
    }
}

#[derive(Deserialize)]
struct SessionRecord {
    #[serde(rename = "type")]
    record_type: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    timestamp: String,
    uuid: Option<String>,
    #[serde(rename = "isMeta")]
    is_meta: Option<bool>,
    message: Value,
}

fn read_session_file(path: &Path, outcome: &mut ReadOutcome) -> Result<(), RecallError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.unwrap_or_default();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: SessionRecord = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(_) => {
                outcome.skipped_malformed += 1;
                continue;
            }
        };

        if !matches!(record.record_type.as_str(), "message" | "user" | "assistant") {
            continue;
        }
        if record.is_meta.unwrap_or(false) {
            continue;
        }
        let Some(timestamp) = parse_timestamp(&record.timestamp) else {
            outcome.skipped_malformed += 1;
            continue;
        };
        let Some(role) = record
            .message
            .get("role")
            .and_then(|r| r.as_str())
            .and_then(parse_role)
        else {
            continue;
        };

        let Some(content) = collect_content(&record.message) else {
            continue;
        };
        if role == Role::User && content.starts_with('<') {
            // Injected system content (command output wrappers, reminders).
            continue;
        }

        let id = record
            .uuid
            .clone()
            .unwrap_or_else(|| format!("{}:{}", record.session_id, line_no));
        outcome.messages.push(Message::new(
            id,
            record.session_id,
            timestamp,
            role,
            content,
            Platform::ClaudeCli,
            path.display().to_string(),
        ));
    }
    Ok(())
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

/// Flatten a message's content to plain text: a string passes through, an
/// array contributes the text of its `text` blocks joined by newlines.
/// Returns `None` when the result is empty after trimming.
fn collect_content(message: &Value) -> Option<String> {
    let content = message.get("content")?;
    let text = if let Some(s) = content.as_str() {
        s.to_string()
    } else if let Some(blocks) = content.as_array() {
        let parts: Vec<&str> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        parts.join("\n")
    } else {
        return None;
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
