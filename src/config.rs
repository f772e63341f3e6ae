//! Configuration loading for the memory pipeline.
//!
//! # Architecture overview
//!
//! Configuration lives at `.aicf/config.json` under the storage root and is
//! purely optional. When the file is absent every option falls back to a
//! built-in default, so a fresh root works with zero setup. An unparseable
//! file also falls back to defaults, with a warning, rather than failing the
//! pipeline: a corrupt config must not take memory capture offline.
//!
//! Keys use the camelCase names of the on-disk format (`tickIntervalMs`,
//! `retention.mediumAfterDays`); serde renames keep the Rust side idiomatic.
//!
//! `platforms.<id>.enabled` is a coarse opt-out and is evaluated *in
//! addition to* the consent gate in `permissions`: a platform runs only when
//! it is both enabled here and `active` in the permission store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::model::Platform;

/// Retention thresholds in days, measured from a record's start timestamp.
///
/// The tier ordering (recent < medium < old < archive) is part of the
/// pipeline contract; only the boundaries are tunable.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionConfig {
    pub medium_after_days: i64,
    pub old_after_days: i64,
    pub archive_after_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            medium_after_days: 2,
            old_after_days: 7,
            archive_after_days: 14,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    #[serde(rename = "redactPII")]
    pub redact_pii: bool,
}

/// Watcher run mode; affects logging only (daemon mirrors the stream to
/// `.watcher.log` / `.watcher.error.log`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherMode {
    Daemon,
    #[default]
    Foreground,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub mode: WatcherMode,
}

/// Per-platform source path overrides.
///
/// Users who keep platform data in non-standard locations point recall at
/// the right place here. An absent key means "use the platform default";
/// tilde expansion happens at point of use so the stored strings stay
/// portable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SourcesConfig {
    pub augment: Option<String>,
    pub claude_cli: Option<String>,
    pub claude_desktop: Option<String>,
    pub warp: Option<String>,
}

impl SourcesConfig {
    /// Resolve the configured override for a platform, expanding `~`.
    pub fn path_for(&self, platform: Platform) -> Option<PathBuf> {
        let raw = match platform {
            Platform::Augment => self.augment.as_deref(),
            Platform::ClaudeCli => self.claude_cli.as_deref(),
            Platform::ClaudeDesktop => self.claude_desktop.as_deref(),
            Platform::Warp => self.warp.as_deref(),
        };
        raw.map(expand_tilde)
    }
}

/// Top-level config deserialized from `.aicf/config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub tick_interval_ms: u64,
    pub platforms: HashMap<String, PlatformConfig>,
    pub retention: RetentionConfig,
    pub codec: CodecConfig,
    pub watcher: WatcherConfig,
    pub sources: SourcesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 300_000,
            platforms: HashMap::new(),
            retention: RetentionConfig::default(),
            codec: CodecConfig::default(),
            watcher: WatcherConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `path`, falling back to defaults when the file is
    /// absent or unreadable. A present-but-invalid file logs a warning so
    /// the user learns their edits were ignored.
    pub fn load(path: &Path) -> Config {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Config::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config");
                Config::default()
            }
        }
    }

    /// Whether a platform is enabled in config (default: enabled).
    ///
    /// This is the coarse config switch; the consent gate in
    /// `permissions` is checked separately by every reader.
    pub fn platform_enabled(&self, platform: Platform) -> bool {
        self.platforms
            .get(platform.id())
            .and_then(|p| p.enabled)
            .unwrap_or(true)
    }
}

/// Expand a leading `~` or `~/` prefix to the user's home directory.
///
/// A bare `~` expands to the home directory itself; paths without a leading
/// `~` are returned unchanged, so absolute and relative paths both work.
/// Without a resolvable home directory the raw string passes through.
pub(crate) fn expand_tilde(raw: &str) -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(raw);
    };
    match raw.strip_prefix('~') {
        Some("") => home,
        Some(tail) => match tail.strip_prefix('/') {
            Some(relative) => home.join(relative),
            // `~user` style paths are not supported; treat them literally.
            None => PathBuf::from(raw),
        },
        None => PathBuf::from(raw),
    }
}
