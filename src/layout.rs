//! Storage-root path derivation.
//!
//! Every path the pipeline reads or writes hangs off one storage root
//! (normally the project directory). Centralizing the derivation here keeps
//! the authoritative layout in one place:
//!
//! ```text
//! <root>/.cache/llm/<platform>/chunk-<sha256>.json
//! <root>/.aicf/recent/<YYYY-MM-DD>_<conversationId>.aicf
//! <root>/.aicf/sessions/<YYYY-MM-DD>-session.aicf
//! <root>/.aicf/medium/…  <root>/.aicf/old/…  <root>/.aicf/archive/…
//! <root>/.aicf/.permissions.aicf
//! <root>/.aicf/.pipeline.lock
//! <root>/.aicf/config.json
//! <root>/.ai/recent/<YYYY-MM-DD>_<conversationId>.md
//! ```
//!
//! This module only derives paths; it never creates directories. Writers
//! create their own parents on demand so that a read-only operation against
//! a fresh root leaves no droppings.

use std::path::{Path, PathBuf};

use crate::model::Platform;

/// Retention tier of a conversation record, ordered coldest-last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Recent,
    Medium,
    Old,
    Archive,
}

impl Tier {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Tier::Recent => "recent",
            Tier::Medium => "medium",
            Tier::Old => "old",
            Tier::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// All pipeline paths for one storage root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Layout {
        Layout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.cache/llm/<platform>/` — chunk cache for one platform.
    pub fn cache_dir(&self, platform: Platform) -> PathBuf {
        self.root.join(".cache/llm").join(platform.id())
    }

    /// `.cache/llm/` — parent of all platform caches.
    pub fn cache_root(&self) -> PathBuf {
        self.root.join(".cache/llm")
    }

    pub fn aicf_dir(&self) -> PathBuf {
        self.root.join(".aicf")
    }

    /// `.aicf/<tier>/` for record tiers.
    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.aicf_dir().join(tier.dir_name())
    }

    /// `.aicf/sessions/` — daily session files.
    pub fn sessions_dir(&self) -> PathBuf {
        self.aicf_dir().join("sessions")
    }

    /// `.ai/recent/` — Markdown companions for recent records.
    pub fn markdown_dir(&self) -> PathBuf {
        self.root.join(".ai/recent")
    }

    pub fn permissions_file(&self) -> PathBuf {
        self.aicf_dir().join(".permissions.aicf")
    }

    pub fn pipeline_lock_file(&self) -> PathBuf {
        self.aicf_dir().join(".pipeline.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.aicf_dir().join("config.json")
    }

    pub fn watcher_log_file(&self) -> PathBuf {
        self.root.join(".watcher.log")
    }

    pub fn watcher_error_log_file(&self) -> PathBuf {
        self.root.join(".watcher.error.log")
    }
}
