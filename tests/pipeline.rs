//! End-to-end pipeline scenarios over a temporary storage root.
//!
//! Each test seeds real platform stores (a LevelDB kv-store, SQLite
//! databases, JSONL session logs), runs watcher ticks, and asserts on the
//! resulting on-disk memory tree.
//!
//! Conversation timestamps are taken an hour before the wall clock so the
//! seeded records are genuinely "recent": the drop-off stage runs inside
//! every tick and must see no reason to migrate them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use recall::codec::{AicfCodec, AicfRecord};
use recall::config::Config;
use recall::layout::{Layout, Tier};
use recall::model::{Platform, format_timestamp};
use recall::permissions::{AuditKind, PermissionStore};
use recall::watcher::{CancelToken, Watcher};

/// An hour ago, truncated to whole seconds so formatting round-trips.
fn base_time() -> DateTime<Utc> {
    let now = Utc::now() - Duration::hours(1);
    now - Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos()))
}

struct TestRoot {
    dir: TempDir,
    sources: TempDir,
}

impl TestRoot {
    fn new() -> TestRoot {
        TestRoot {
            dir: tempfile::tempdir().unwrap(),
            sources: tempfile::tempdir().unwrap(),
        }
    }

    fn layout(&self) -> Layout {
        Layout::new(self.dir.path())
    }

    fn source(&self, name: &str) -> PathBuf {
        let path = self.sources.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    /// Config with every platform source pinned inside the temp tree, so a
    /// test never touches the real home directory.
    fn config(&self) -> Config {
        let json = format!(
            r#"{{ "sources": {{
                "augment": "{}",
                "claude-cli": "{}",
                "claude-desktop": "{}",
                "warp": "{}"
            }} }}"#,
            self.sources.path().join("augment").display(),
            self.sources.path().join("claude-cli").display(),
            self.sources.path().join("claude-desktop").display(),
            self.sources.path().join("warp/warp.sqlite").display(),
        );
        serde_json::from_str(&json).unwrap()
    }

    fn permissions(&self) -> PermissionStore {
        PermissionStore::load(&self.layout().permissions_file()).unwrap()
    }

    fn watcher(&self) -> Watcher {
        Watcher::with_default_platforms(self.layout(), self.config(), CancelToken::new())
    }
}

fn seed_augment_exchange(store: &Path, key: &str, request: &str, response: &str, ts: &str, conv: &str) {
    let mut opts = rusty_leveldb::Options::default();
    opts.create_if_missing = true;
    let mut db = rusty_leveldb::DB::open(store, opts).unwrap();
    let value = serde_json::json!({
        "request_message": request,
        "response_text": response,
        "timestamp": ts,
        "conversationId": conv,
        "model_id": "claude-sonnet",
    });
    db.put(key.as_bytes(), value.to_string().as_bytes()).unwrap();
    db.flush().unwrap();
}

fn seed_warp_db(path: &Path, rows: &[(i64, &str, &str, &str)]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agent_conversations (conversation_id TEXT PRIMARY KEY, last_modified_at TEXT);
         CREATE TABLE IF NOT EXISTS ai_queries (id INTEGER PRIMARY KEY, conversation_id TEXT, start_ts TEXT, input TEXT);",
    )
    .unwrap();
    for (id, conv, ts, input) in rows {
        conn.execute(
            "INSERT OR IGNORE INTO agent_conversations (conversation_id, last_modified_at) VALUES (?1, ?2)",
            rusqlite::params![conv, ts],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ai_queries (id, conversation_id, start_ts, input) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, conv, ts, input],
        )
        .unwrap();
    }
}

fn seed_desktop_db(path: &Path, rows: &[(i64, &str, &str, &str, &str)]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
             id INTEGER PRIMARY KEY, conversation_id TEXT, role TEXT, content TEXT, created_at TEXT
         );",
    )
    .unwrap();
    for (id, conv, role, content, ts) in rows {
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, conv, role, content, ts],
        )
        .unwrap();
    }
}

fn chunk_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("chunk-"))
        })
        .collect()
}

#[test]
fn single_augment_exchange_end_to_end() {
    let root = TestRoot::new();
    let t0 = base_time();
    let date = t0.format("%Y-%m-%d").to_string();
    seed_augment_exchange(
        &root.source("augment"),
        "exchange:a1:m1",
        "hi",
        "hello",
        &format_timestamp(&t0),
        "a1",
    );
    let mut permissions = root.permissions();
    permissions.grant(Platform::Augment, "full_access").unwrap();

    let stats = root.watcher().tick(&mut permissions);

    let augment_stats = stats
        .writers
        .iter()
        .find(|(p, _)| *p == Platform::Augment)
        .map(|(_, s)| *s)
        .unwrap();
    assert_eq!(augment_stats.new_chunks, 1);
    assert_eq!(stats.consolidation.records_written, 1);

    // Chunk consumed, record + companion produced.
    let layout = root.layout();
    assert!(chunk_files(&layout.cache_dir(Platform::Augment)).is_empty());

    let record_path = layout.tier_dir(Tier::Recent).join(format!("{date}_a1.aicf"));
    let doc = AicfCodec::new().read_all(&record_path).unwrap();
    assert_eq!(doc.first("version").unwrap().field(0), Some("3.0.0-alpha"));
    assert_eq!(doc.first("platforms").unwrap().field(0), Some("augment"));
    let flow: Vec<_> = doc.all("flow").collect();
    assert_eq!(flow.len(), 2);
    assert_eq!(flow[0].field(1), Some("user"));
    assert_eq!(flow[1].field(1), Some("assistant"));
    assert_eq!(doc.all("decisions").count(), 0);

    assert!(layout.markdown_dir().join(format!("{date}_a1.md")).exists());
    assert!(
        layout
            .sessions_dir()
            .join(format!("{date}-session.aicf"))
            .exists()
    );
}

#[test]
fn rerun_with_no_new_data_is_stable() {
    let root = TestRoot::new();
    let t0 = base_time();
    let date = t0.format("%Y-%m-%d").to_string();
    seed_augment_exchange(
        &root.source("augment"),
        "exchange:a1:m1",
        "hi",
        "hello",
        &format_timestamp(&t0),
        "a1",
    );
    let mut permissions = root.permissions();
    permissions.grant(Platform::Augment, "full_access").unwrap();

    let watcher = root.watcher();
    watcher.tick(&mut permissions);

    let record_path = root
        .layout()
        .tier_dir(Tier::Recent)
        .join(format!("{date}_a1.aicf"));
    let before = std::fs::read(&record_path).unwrap();

    let stats = watcher.tick(&mut permissions);
    let new_chunks: usize = stats.writers.iter().map(|(_, s)| s.new_chunks).sum();
    assert_eq!(new_chunks, 0);
    assert_eq!(stats.consolidation.records_written, 0);
    assert_eq!(stats.consolidation.chunks_deleted, 0);
    assert_eq!(std::fs::read(&record_path).unwrap(), before);
}

#[test]
fn cross_platform_duplicate_kept_once() {
    let root = TestRoot::new();
    let t0 = base_time();
    let date = t0.format("%Y-%m-%d").to_string();
    // Claude Desktop reports "ok" at T1, Warp the same body 5 seconds later.
    seed_desktop_db(
        &root.source("claude-desktop").join("chats.db"),
        &[(1, "x1", "assistant", "ok", &format_timestamp(&t0))],
    );
    seed_warp_db(
        &root.source("warp").join("warp.sqlite"),
        &[(
            1,
            "x1",
            &format_timestamp(&(t0 + Duration::seconds(5))),
            r#"[{"ActionResult":{"result":{"text":"ok"}}}]"#,
        )],
    );
    let mut permissions = root.permissions();
    permissions.grant(Platform::Warp, "full_access").unwrap();
    permissions
        .grant(Platform::ClaudeDesktop, "full_access")
        .unwrap();

    let stats = root.watcher().tick(&mut permissions);
    assert_eq!(stats.consolidation.records_written, 1);
    assert_eq!(stats.consolidation.duplicates_removed, 1);

    let doc = AicfCodec::new()
        .read_all(
            &root
                .layout()
                .tier_dir(Tier::Recent)
                .join(format!("{date}_x1.aicf")),
        )
        .unwrap();
    assert_eq!(
        doc.first("platforms").unwrap().field(0),
        Some("claude-desktop,warp")
    );
    assert_eq!(doc.first("messageCount").unwrap().field(0), Some("1"));
    assert_eq!(doc.all("flow").count(), 1);
    // Earliest sighting wins.
    assert_eq!(
        doc.first("timestamp").unwrap().field(0),
        Some(format_timestamp(&t0).as_str())
    );
}

#[test]
fn revoked_platform_is_audited_and_writes_nothing() {
    let root = TestRoot::new();
    let t0 = base_time();
    let date = t0.format("%Y-%m-%d").to_string();
    seed_warp_db(
        &root.source("warp").join("warp.sqlite"),
        &[(
            1,
            "w1",
            &format_timestamp(&t0),
            r#"[{"Query":{"text":"hello warp"}}]"#,
        )],
    );
    let mut permissions = root.permissions();
    permissions.grant(Platform::Warp, "full_access").unwrap();

    let watcher = root.watcher();
    watcher.tick(&mut permissions);
    let record_path = root
        .layout()
        .tier_dir(Tier::Recent)
        .join(format!("{date}_w1.aicf"));
    assert!(record_path.exists());
    let before = std::fs::read(&record_path).unwrap();

    // Revoked between ticks.
    permissions.revoke(Platform::Warp).unwrap();
    let stats = watcher.tick(&mut permissions);

    let warp_stats = stats
        .writers
        .iter()
        .find(|(p, _)| *p == Platform::Warp)
        .map(|(_, s)| *s)
        .unwrap();
    assert_eq!(warp_stats.new_chunks, 0);
    assert_eq!(warp_stats.messages_seen, 0);
    assert!(
        permissions
            .audit()
            .iter()
            .any(|e| e.event == AuditKind::AccessDenied && e.platform == Some(Platform::Warp))
    );
    // Previously consolidated memory is untouched.
    assert_eq!(std::fs::read(&record_path).unwrap(), before);
}

#[test]
fn malformed_jsonl_line_is_skipped_not_fatal() {
    let root = TestRoot::new();
    let t0 = base_time();
    let date = t0.format("%Y-%m-%d").to_string();
    let project = root.source("claude-cli").join("proj-x");
    std::fs::create_dir_all(&project).unwrap();
    let mut lines: Vec<String> = (0..10)
        .map(|i| {
            let ts = format_timestamp(&(t0 + Duration::seconds(i)));
            format!(
                r#"{{"type":"user","sessionId":"s1","timestamp":"{ts}","uuid":"u{i:02}","message":{{"role":"user","content":"question number {i}"}}}}"#
            )
        })
        .collect();
    lines.push(r#"{"type":"assistant","sessionId":"s1","timestamp":"2025-1"#.into());
    std::fs::write(project.join("s1.jsonl"), lines.join("\n")).unwrap();

    let mut permissions = root.permissions();
    permissions.grant(Platform::ClaudeCli, "full_access").unwrap();

    let stats = root.watcher().tick(&mut permissions);
    let cli_stats = stats
        .writers
        .iter()
        .find(|(p, _)| *p == Platform::ClaudeCli)
        .map(|(_, s)| *s)
        .unwrap();
    assert_eq!(cli_stats.messages_seen, 10);
    assert_eq!(cli_stats.skipped_malformed, 1);
    assert_eq!(stats.consolidation.records_written, 1);

    let doc = AicfCodec::new()
        .read_all(
            &root
                .layout()
                .tier_dir(Tier::Recent)
                .join(format!("{date}_s1.aicf")),
        )
        .unwrap();
    assert_eq!(doc.first("messageCount").unwrap().field(0), Some("10"));
}

#[test]
fn aged_records_migrate_to_their_tiers() {
    let root = TestRoot::new();
    let layout = root.layout();
    let codec = AicfCodec::new();
    let now = Utc::now();

    let seed = |age_days: i64, conv: &str| {
        let start: DateTime<Utc> = now - Duration::days(age_days);
        let date = start.format("%Y-%m-%d").to_string();
        let mut record = AicfRecord::new();
        record.push("timestamp", &[&format_timestamp(&start)]);
        record.push("timestampEnd", &[&format_timestamp(&start)]);
        record.push("conversationId", &[conv]);
        record.push("platforms", &["warp"]);
        record.push("messageCount", &["3"]);
        record.push("decisions", &[&format_timestamp(&start), "ship it"]);
        record.push("workingState", &["done"]);
        record.push("compression", &["FULL"]);
        let name = format!("{date}_{conv}.aicf");
        codec
            .write_record(&layout.tier_dir(Tier::Recent).join(&name), &record)
            .unwrap();
        name
    };

    let fresh = seed(1, "f1");
    let medium = seed(3, "m1");
    let old = seed(10, "o1");
    let archive = seed(40, "z1");

    let mut permissions = root.permissions();
    let stats = root.watcher().tick(&mut permissions);
    assert_eq!(stats.dropoff.to_medium, 1);
    assert_eq!(stats.dropoff.to_old, 1);
    assert_eq!(stats.dropoff.to_archive, 1);

    assert!(layout.tier_dir(Tier::Recent).join(&fresh).exists());
    assert!(!layout.tier_dir(Tier::Recent).join(&medium).exists());

    let medium_doc = codec
        .read_all(&layout.tier_dir(Tier::Medium).join(&medium))
        .unwrap();
    assert_eq!(medium_doc.first("compression").unwrap().field(0), Some("SUMMARY"));

    let old_doc = codec.read_all(&layout.tier_dir(Tier::Old).join(&old)).unwrap();
    assert_eq!(old_doc.first("compression").unwrap().field(0), Some("KEY_POINTS"));

    let archived =
        std::fs::read_to_string(layout.tier_dir(Tier::Archive).join(&archive)).unwrap();
    let lines: Vec<&str> = archived.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("|z1|"));
}

#[test]
fn second_settled_tick_moves_nothing() {
    let root = TestRoot::new();
    let mut permissions = root.permissions();
    let watcher = root.watcher();
    watcher.tick(&mut permissions);

    let stats = watcher.tick(&mut permissions);
    assert_eq!(
        stats.dropoff.to_medium + stats.dropoff.to_old + stats.dropoff.to_archive,
        0
    );
    assert_eq!(stats.consolidation.records_written, 0);
}
