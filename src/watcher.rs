//! Watcher orchestrator: the periodic tick that drives the whole pipeline.
//!
//! # Architecture overview
//!
//! One tick runs the stages in fixed order:
//!
//! ```text
//! cache writers (per active platform) → consolidation → sessions → drop-off
//! ```
//!
//! Every component is injected through the constructor; the watcher owns no
//! global state and each tick rebuilds its working set from disk. Ticks are
//! serialized by an advisory lock on `.aicf/.pipeline.lock`: a tick that
//! cannot take the lock immediately is skipped with a warning, never
//! queued, so overlapping schedules (or a second process) degrade to "this
//! tick did less".
//!
//! # Cancellation
//!
//! `CancelToken` is checked between stages and, inside the longer agents,
//! between conversations/files. Cancellation finishes the current atomic
//! write, releases the lock, and returns normally; no partial files exist
//! because every write is tmp-then-rename.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;

use crate::cache::{CacheWriter, WriteStats};
use crate::codec::AicfCodec;
use crate::config::Config;
use crate::consolidate::{ConsolidationAgent, ConsolidationStats};
use crate::dropoff::{DropoffStats, MemoryDropoffAgent};
use crate::error::RecallError;
use crate::layout::Layout;
use crate::model::Platform;
use crate::permissions::PermissionStore;
use crate::reader::augment::AugmentReader;
use crate::reader::claude_cli::ClaudeCliReader;
use crate::reader::claude_desktop::ClaudeDesktopReader;
use crate::reader::warp::WarpReader;
use crate::session::{SessionConsolidationAgent, SessionStats};

/// Cooperative cancellation flag shared between the signal handler and the
/// pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-tick aggregate of every stage's stats.
#[derive(Debug, Default)]
pub struct TickStats {
    /// True when the pipeline lock was held and the tick did nothing.
    pub skipped: bool,
    pub writers: Vec<(Platform, WriteStats)>,
    pub consolidation: ConsolidationStats,
    pub sessions: SessionStats,
    pub dropoff: DropoffStats,
}

/// Advisory lock serializing ticks across threads and processes. Held for
/// the duration of one tick; dropped (and unlocked) on scope exit.
struct PipelineLock {
    file: std::fs::File,
}

impl PipelineLock {
    fn try_acquire(path: &Path) -> Result<PipelineLock, RecallError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| RecallError::LockHeld(path.to_path_buf()))?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(PipelineLock { file })
    }
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub struct Watcher {
    layout: Layout,
    config: Config,
    codec: AicfCodec,
    writers: Vec<CacheWriter>,
    consolidator: ConsolidationAgent,
    sessions: SessionConsolidationAgent,
    dropoff: MemoryDropoffAgent,
    cancel: CancelToken,
}

impl Watcher {
    /// Assemble a watcher from explicit components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: Layout,
        config: Config,
        codec: AicfCodec,
        writers: Vec<CacheWriter>,
        consolidator: ConsolidationAgent,
        sessions: SessionConsolidationAgent,
        dropoff: MemoryDropoffAgent,
        cancel: CancelToken,
    ) -> Watcher {
        Watcher {
            layout,
            config,
            codec,
            writers,
            consolidator,
            sessions,
            dropoff,
            cancel,
        }
    }

    /// Assemble the standard four-platform watcher: one cache writer per
    /// config-enabled platform, with source overrides applied.
    pub fn with_default_platforms(layout: Layout, config: Config, cancel: CancelToken) -> Watcher {
        let codec = if config.codec.redact_pii {
            AicfCodec::with_redactor(Box::new(crate::redact::redact_field))
        } else {
            AicfCodec::new()
        };

        let mut writers = Vec::new();
        for platform in Platform::ALL {
            if !config.platform_enabled(platform) {
                continue;
            }
            let source = config.sources.path_for(platform);
            let reader: Box<dyn crate::reader::Reader> = match platform {
                Platform::Augment => Box::new(AugmentReader::new(source)),
                Platform::ClaudeCli => Box::new(ClaudeCliReader::new(source)),
                Platform::ClaudeDesktop => Box::new(ClaudeDesktopReader::new(source)),
                Platform::Warp => Box::new(WarpReader::new(source)),
            };
            writers.push(CacheWriter::new(reader, &layout));
        }

        let consolidator = ConsolidationAgent::new(layout.clone());
        let sessions = SessionConsolidationAgent::new(layout.clone());
        let dropoff = MemoryDropoffAgent::new(layout.clone(), config.retention.clone());
        Watcher::new(layout, config, codec, writers, consolidator, sessions, dropoff, cancel)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// One pipeline pass. Takes the pipeline lock fail-fast; a held lock
    /// skips the tick rather than waiting.
    pub fn tick(&self, permissions: &mut PermissionStore) -> TickStats {
        let started = Instant::now();
        let _lock = match PipelineLock::try_acquire(&self.layout.pipeline_lock_file()) {
            Ok(lock) => lock,
            Err(_) => {
                tracing::warn!("pipeline lock held, skipping tick");
                return TickStats {
                    skipped: true,
                    ..Default::default()
                };
            }
        };

        let mut stats = TickStats::default();

        for writer in &self.writers {
            if self.cancel.is_cancelled() {
                break;
            }
            match writer.write(permissions, &self.codec) {
                Ok(write_stats) => stats.writers.push((writer.platform(), write_stats)),
                Err(e) => {
                    tracing::warn!(platform = %writer.platform(), error = %e, "cache writer failed");
                }
            }
            self.warn_if_stuck(started, "writers");
        }

        if !self.cancel.is_cancelled() {
            stats.consolidation = self.consolidator.consolidate(&self.codec, &self.cancel);
            self.warn_if_stuck(started, "consolidation");
        }
        if !self.cancel.is_cancelled() {
            stats.sessions = self.sessions.consolidate(&self.codec);
            self.warn_if_stuck(started, "sessions");
        }
        if !self.cancel.is_cancelled() {
            stats.dropoff = self.dropoff.dropoff(&self.codec, Utc::now(), &self.cancel);
            self.warn_if_stuck(started, "dropoff");
        }

        let new_chunks: usize = stats.writers.iter().map(|(_, w)| w.new_chunks).sum();
        let skipped_malformed: usize = stats
            .writers
            .iter()
            .map(|(_, w)| w.skipped_malformed)
            .sum::<usize>()
            + stats.consolidation.skipped_malformed
            + stats.sessions.skipped_malformed;
        tracing::info!(
            duration_ms = started.elapsed().as_millis() as u64,
            new_chunks,
            chunks_deleted = stats.consolidation.chunks_deleted,
            records_written = stats.consolidation.records_written,
            session_files = stats.sessions.session_files_written,
            migrated = stats.dropoff.to_medium + stats.dropoff.to_old + stats.dropoff.to_archive,
            skipped_malformed,
            cancelled = self.cancel.is_cancelled(),
            "tick complete"
        );
        stats
    }

    /// Run the tick loop until cancelled. A tick that overruns its interval
    /// is followed immediately by the next one; missed slots are not
    /// queued.
    pub fn start(&self, interval: Duration, permissions: &mut PermissionStore) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "watcher started");
        while !self.cancel.is_cancelled() {
            let tick_started = Instant::now();
            self.tick(permissions);

            while tick_started.elapsed() < interval {
                if self.cancel.is_cancelled() {
                    tracing::info!("watcher cancelled, exiting");
                    return;
                }
                let remaining = interval.saturating_sub(tick_started.elapsed());
                std::thread::sleep(remaining.min(Duration::from_millis(200)));
            }
        }
        tracing::info!("watcher cancelled, exiting");
    }

    /// A stage pushing the whole tick past 10× the configured interval is
    /// worth a warning, but never killed.
    fn warn_if_stuck(&self, started: Instant, stage: &str) {
        let limit = Duration::from_millis(self.config.tick_interval_ms.saturating_mul(10));
        if started.elapsed() > limit {
            tracing::warn!(stage, elapsed_ms = started.elapsed().as_millis() as u64, "stuck stage");
        }
    }
}
