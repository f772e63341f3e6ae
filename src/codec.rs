//! AICF codec: pipe-delimited, append-safe, atomic file I/O.
//!
//! # Architecture overview
//!
//! Every file the pipeline writes goes through this module: AICF records,
//! the permissions file, session files, and (via `write_file`) the JSON
//! chunk cache and Markdown companions. Centralizing the write path gives
//! every artifact the same guarantees:
//!
//! - **Atomicity** — content goes to `<path>.tmp`, is fsynced, then renamed
//!   over `<path>`. A crash mid-write leaves either the old file or the new
//!   one, never a partial tail.
//! - **Mutual exclusion** — an advisory `fs2` lock on the destination is
//!   held for the duration of every write or append.
//! - **Validation** — a field containing `|`, CR, or LF is rejected.
//!   Callers flatten free text with `sanitize_field` first.
//! - **Redaction** — an optional hook applied to every field before write;
//!   identity by default.
//!
//! # Format
//!
//! AICF files are line-oriented. Each line is a key followed by
//! pipe-delimited fields; the first line of every record file is
//! `version|3.0.0-alpha`. On read, malformed lines (no `|` at all) are
//! skipped and counted rather than failing the file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;

use crate::error::RecallError;

pub const AICF_VERSION: &str = "3.0.0-alpha";

/// Field filter applied before write; returns the replacement text.
pub type Redactor = Box<dyn Fn(&str) -> String + Send + Sync>;

/// One pipe-delimited line: a key token plus zero or more fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AicfLine {
    pub key: String,
    pub fields: Vec<String>,
}

impl AicfLine {
    pub fn new(key: impl Into<String>, fields: &[&str]) -> AicfLine {
        AicfLine {
            key: key.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Parse a raw line. Returns `None` for lines with no `|` separator,
    /// which the reader counts as malformed.
    pub fn parse(raw: &str) -> Option<AicfLine> {
        if !raw.contains('|') {
            return None;
        }
        let mut parts = raw.split('|');
        let key = parts.next()?.to_string();
        Some(AicfLine {
            key,
            fields: parts.map(|f| f.to_string()).collect(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = self.key.clone();
        for f in &self.fields {
            out.push('|');
            out.push_str(f);
        }
        out
    }

    /// First field, if present.
    pub fn field(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(String::as_str)
    }
}

/// An AICF record ready to be written: ordered lines, version header implied.
#[derive(Debug, Clone, Default)]
pub struct AicfRecord {
    lines: Vec<AicfLine>,
}

impl AicfRecord {
    pub fn new() -> AicfRecord {
        AicfRecord::default()
    }

    pub fn push(&mut self, key: &str, fields: &[&str]) {
        self.lines.push(AicfLine::new(key, fields));
    }

    pub fn lines(&self) -> &[AicfLine] {
        &self.lines
    }
}

/// Parsed AICF file contents.
#[derive(Debug, Default)]
pub struct AicfDocument {
    pub lines: Vec<AicfLine>,
    pub skipped_malformed: usize,
}

impl AicfDocument {
    /// First line with the given key.
    pub fn first(&self, key: &str) -> Option<&AicfLine> {
        self.lines.iter().find(|l| l.key == key)
    }

    /// All lines with the given key, in file order.
    pub fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a AicfLine> {
        self.lines.iter().filter(move |l| l.key == key)
    }
}

pub struct AicfCodec {
    redactor: Option<Redactor>,
}

impl std::fmt::Debug for AicfCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AicfCodec")
            .field("redactor", &self.redactor.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for AicfCodec {
    fn default() -> Self {
        AicfCodec::new()
    }
}

impl AicfCodec {
    pub fn new() -> AicfCodec {
        AicfCodec { redactor: None }
    }

    pub fn with_redactor(redactor: Redactor) -> AicfCodec {
        AicfCodec {
            redactor: Some(redactor),
        }
    }

    /// Reject any field containing a pipe or line break.
    ///
    /// Callers are responsible for pre-sanitizing free text; a violation
    /// here is a programmer error for that record, not a recoverable input
    /// condition.
    pub fn validate_field(field: &str) -> Result<(), RecallError> {
        if field.contains('|') || field.contains('\r') || field.contains('\n') {
            return Err(RecallError::Codec {
                field: truncate_for_error(field),
                detail: "field must not contain '|', CR, or LF".into(),
            });
        }
        Ok(())
    }

    /// Flatten free text into a single valid field: pipes and line breaks
    /// become spaces, runs of whitespace collapse.
    pub fn sanitize_field(text: &str) -> String {
        let replaced: String = text
            .chars()
            .map(|c| match c {
                '|' | '\r' | '\n' => ' ',
                other => other,
            })
            .collect();
        replaced.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn apply_redaction(&self, field: &str) -> String {
        match &self.redactor {
            Some(r) => r(field),
            None => field.to_string(),
        }
    }

    /// Write a record file: `version|3.0.0-alpha` header then each line,
    /// redacted and validated, atomically and under the path lock.
    pub fn write_record(&self, path: &Path, record: &AicfRecord) -> Result<(), RecallError> {
        self.write_lines(path, record.lines(), true)
    }

    /// Write raw lines with or without the version header. The headerless
    /// form exists for the SINGLE_LINE archive tier, which is exactly one
    /// line by contract.
    pub fn write_lines(
        &self,
        path: &Path,
        lines: &[AicfLine],
        with_header: bool,
    ) -> Result<(), RecallError> {
        let mut content = String::new();
        if with_header {
            content.push_str("version|");
            content.push_str(AICF_VERSION);
            content.push('\n');
        }
        for line in lines {
            content.push_str(&self.render_checked(line)?);
            content.push('\n');
        }
        self.write_file(path, content.as_bytes())
    }

    /// Append one line to an existing file (creating it if needed), under
    /// the path lock, fsynced before return.
    pub fn append_line(&self, path: &Path, line: &AicfLine) -> Result<(), RecallError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = self.render_checked(line)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.lock_exclusive()?;
        let result = (|| -> Result<(), RecallError> {
            writeln!(file, "{rendered}")?;
            file.sync_all()?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    /// Read and parse an entire AICF file. Malformed lines are skipped and
    /// counted; blank lines are ignored.
    pub fn read_all(&self, path: &Path) -> Result<AicfDocument, RecallError> {
        let content = fs::read_to_string(path)?;
        let mut doc = AicfDocument::default();
        for raw in content.lines() {
            let trimmed = raw.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match AicfLine::parse(trimmed) {
                Some(line) => doc.lines.push(line),
                None => doc.skipped_malformed += 1,
            }
        }
        Ok(doc)
    }

    /// Write arbitrary bytes atomically under the path lock. Used for the
    /// JSON chunk cache and Markdown companions so every pipeline artifact
    /// shares the same durability path.
    pub fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), RecallError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new().create(true).append(true).open(path)?;
        lock.lock_exclusive()?;
        let result = atomic_write(path, bytes);
        let _ = fs2::FileExt::unlock(&lock);
        result
    }

    fn render_checked(&self, line: &AicfLine) -> Result<String, RecallError> {
        Self::validate_field(&line.key)?;
        let mut out = line.key.clone();
        for field in &line.fields {
            let redacted = self.apply_redaction(field);
            Self::validate_field(&redacted)?;
            out.push('|');
            out.push_str(&redacted);
        }
        Ok(out)
    }
}

/// tmp + fsync + rename. The tmp file lives next to the destination so the
/// rename stays on one filesystem. On failure the tmp file is removed and
/// the destination is untouched.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RecallError> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);
    let result = (|| -> Result<(), RecallError> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn truncate_for_error(field: &str) -> String {
    let mut end = field.len().min(40);
    while end > 0 && !field.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].to_string()
}
