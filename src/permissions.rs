//! Per-platform consent records and the append-only audit log.
//!
//! # Architecture overview
//!
//! The permission store is the gate in front of every platform read. A
//! reader may only open platform storage when the platform's latest entry is
//! `active`; anything else produces an empty read plus an `access_denied`
//! audit row. Consent state and the audit trail persist together in
//! `.aicf/.permissions.aicf`:
//!
//! ```text
//! version|3.0.0-alpha
//! @PERMISSIONS|<platform count>
//! @PLATFORM|warp|active|full_access|2025-10-25T10:00:00Z|-
//! @AUDIT|consent_granted|2025-10-25T10:00:00Z|warp|user|grant
//! ```
//!
//! `@AUDIT` rows are logically append-only: events are only ever added,
//! never edited or dropped. Physically, `log_event` appends a single line,
//! while `grant`/`revoke` rewrite the whole file (every `@PLATFORM` row
//! plus the full audit history) through one atomic temp-and-rename, so a
//! reader tailing the file will occasionally see a full replace rather
//! than a pure append.
//!
//! A permissions file that exists but cannot be parsed is one of the two
//! fatal startup conditions: silently proceeding could turn a revocation
//! back into an active grant.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::codec::{AicfCodec, AicfLine, AicfRecord};
use crate::error::RecallError;
use crate::model::{Platform, format_timestamp, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Active,
    Revoked,
    Pending,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionStatus::Active => write!(f, "active"),
            PermissionStatus::Revoked => write!(f, "revoked"),
            PermissionStatus::Pending => write!(f, "pending"),
        }
    }
}

impl std::str::FromStr for PermissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PermissionStatus::Active),
            "revoked" => Ok(PermissionStatus::Revoked),
            "pending" => Ok(PermissionStatus::Pending),
            _ => Err(format!("Unknown permission status: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionEntry {
    pub platform: Platform,
    pub status: PermissionStatus,
    pub consent_type: String,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Audit event kinds, written as the first `@AUDIT` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    ConsentGranted,
    ConsentRevoked,
    AccessDenied,
    SourceUnavailable,
    ReadError,
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditKind::ConsentGranted => "consent_granted",
            AuditKind::ConsentRevoked => "consent_revoked",
            AuditKind::AccessDenied => "access_denied",
            AuditKind::SourceUnavailable => "source_unavailable",
            AuditKind::ReadError => "read_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub platform: Option<Platform>,
    pub actor: String,
    pub action: String,
}

impl AuditEvent {
    pub fn new(event: AuditKind, platform: Option<Platform>, action: impl Into<String>) -> Self {
        AuditEvent {
            event,
            timestamp: Utc::now(),
            platform,
            actor: "recall".into(),
            action: action.into(),
        }
    }

    pub fn access_denied(platform: Platform) -> Self {
        Self::new(AuditKind::AccessDenied, Some(platform), "read")
    }

    pub fn source_unavailable(platform: Platform, detail: impl Into<String>) -> Self {
        Self::new(AuditKind::SourceUnavailable, Some(platform), detail)
    }

    pub fn read_error(platform: Platform, detail: impl Into<String>) -> Self {
        Self::new(AuditKind::ReadError, Some(platform), detail)
    }
}

/// Consent records plus the audit trail, backed by one AICF file.
#[derive(Debug)]
pub struct PermissionStore {
    path: PathBuf,
    codec: AicfCodec,
    entries: Vec<PermissionEntry>,
    audit: Vec<AuditEvent>,
}

impl PermissionStore {
    /// Load the store from disk. An absent file yields an empty store (no
    /// platform has consented yet); a present but unparseable file is
    /// fatal.
    pub fn load(path: &Path) -> Result<PermissionStore, RecallError> {
        let codec = AicfCodec::new();
        let mut store = PermissionStore {
            path: path.to_path_buf(),
            codec,
            entries: Vec::new(),
            audit: Vec::new(),
        };

        if !path.exists() {
            return Ok(store);
        }

        let doc = store.codec.read_all(path)?;
        for line in &doc.lines {
            match line.key.as_str() {
                "@PLATFORM" => {
                    let entry = parse_platform_line(line)
                        .ok_or_else(|| RecallError::CorruptPermissions(path.to_path_buf()))?;
                    store.entries.push(entry);
                }
                "@AUDIT" => {
                    // Audit rows are tolerated when malformed; losing one
                    // historical row must not take the pipeline offline.
                    if let Some(event) = parse_audit_line(line) {
                        store.audit.push(event);
                    }
                }
                _ => {}
            }
        }
        Ok(store)
    }

    pub fn list(&self) -> &[PermissionEntry] {
        &self.entries
    }

    pub fn audit(&self) -> &[AuditEvent] {
        &self.audit
    }

    pub fn get(&self, platform: Platform) -> Option<&PermissionEntry> {
        self.entries.iter().find(|e| e.platform == platform)
    }

    /// The gate: true only when the platform's latest entry is `active`.
    pub fn is_active(&self, platform: Platform) -> bool {
        matches!(
            self.get(platform).map(|e| e.status),
            Some(PermissionStatus::Active)
        )
    }

    /// Grant consent for a platform, appending a `consent_granted` audit
    /// row and rewriting the file atomically.
    pub fn grant(&mut self, platform: Platform, consent_type: &str) -> Result<(), RecallError> {
        let now = Utc::now();
        match self.entries.iter_mut().find(|e| e.platform == platform) {
            Some(entry) => {
                entry.status = PermissionStatus::Active;
                entry.consent_type = consent_type.to_string();
                entry.granted_at = now;
                entry.revoked_at = None;
            }
            None => self.entries.push(PermissionEntry {
                platform,
                status: PermissionStatus::Active,
                consent_type: consent_type.to_string(),
                granted_at: now,
                revoked_at: None,
            }),
        }
        self.audit.push(AuditEvent {
            event: AuditKind::ConsentGranted,
            timestamp: now,
            platform: Some(platform),
            actor: "user".into(),
            action: "grant".into(),
        });
        self.save()
    }

    /// Revoke consent for a platform. Granting again later is allowed; the
    /// audit trail keeps both transitions.
    pub fn revoke(&mut self, platform: Platform) -> Result<(), RecallError> {
        let now = Utc::now();
        match self.entries.iter_mut().find(|e| e.platform == platform) {
            Some(entry) => {
                entry.status = PermissionStatus::Revoked;
                entry.revoked_at = Some(now);
            }
            None => self.entries.push(PermissionEntry {
                platform,
                status: PermissionStatus::Revoked,
                consent_type: "none".into(),
                granted_at: now,
                revoked_at: Some(now),
            }),
        }
        self.audit.push(AuditEvent {
            event: AuditKind::ConsentRevoked,
            timestamp: now,
            platform: Some(platform),
            actor: "user".into(),
            action: "revoke".into(),
        });
        self.save()
    }

    /// Append an audit event: in memory and as one `@AUDIT` line on disk.
    pub fn log_event(&mut self, event: AuditEvent) -> Result<(), RecallError> {
        let line = render_audit_line(&event);
        self.codec.append_line(&self.path, &line)?;
        self.audit.push(event);
        Ok(())
    }

    fn save(&self) -> Result<(), RecallError> {
        let mut record = AicfRecord::new();
        record.push("@PERMISSIONS", &[&self.entries.len().to_string()]);
        for entry in &self.entries {
            let granted = format_timestamp(&entry.granted_at);
            let revoked = entry
                .revoked_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_else(|| "-".into());
            record.push(
                "@PLATFORM",
                &[
                    entry.platform.id(),
                    &entry.status.to_string(),
                    &entry.consent_type,
                    &granted,
                    &revoked,
                ],
            );
        }
        for event in &self.audit {
            let line = render_audit_line(event);
            let fields: Vec<&str> = line.fields.iter().map(String::as_str).collect();
            record.push("@AUDIT", &fields);
        }
        self.codec.write_record(&self.path, &record)
    }
}

fn render_audit_line(event: &AuditEvent) -> AicfLine {
    let platform = event
        .platform
        .map(|p| p.id().to_string())
        .unwrap_or_else(|| "-".into());
    AicfLine::new(
        "@AUDIT",
        &[
            &event.event.to_string(),
            &format_timestamp(&event.timestamp),
            &platform,
            &event.actor,
            &AicfCodec::sanitize_field(&event.action),
        ],
    )
}

fn parse_platform_line(line: &AicfLine) -> Option<PermissionEntry> {
    let platform: Platform = line.field(0)?.parse().ok()?;
    let status: PermissionStatus = line.field(1)?.parse().ok()?;
    let consent_type = line.field(2)?.to_string();
    let granted_at = parse_timestamp(line.field(3)?)?;
    let revoked_at = match line.field(4) {
        Some("-") | None => None,
        Some(ts) => Some(parse_timestamp(ts)?),
    };
    Some(PermissionEntry {
        platform,
        status,
        consent_type,
        granted_at,
        revoked_at,
    })
}

fn parse_audit_line(line: &AicfLine) -> Option<AuditEvent> {
    let event = match line.field(0)? {
        "consent_granted" => AuditKind::ConsentGranted,
        "consent_revoked" => AuditKind::ConsentRevoked,
        "access_denied" => AuditKind::AccessDenied,
        "source_unavailable" => AuditKind::SourceUnavailable,
        "read_error" => AuditKind::ReadError,
        _ => return None,
    };
    let timestamp = parse_timestamp(line.field(1)?)?;
    let platform = match line.field(2) {
        Some("-") | None => None,
        Some(id) => id.parse().ok(),
    };
    Some(AuditEvent {
        event,
        timestamp,
        platform,
        actor: line.field(3).unwrap_or("-").to_string(),
        action: line.field(4).unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> PermissionStore {
        PermissionStore::load(&dir.path().join(".permissions.aicf")).unwrap()
    }

    #[test]
    fn test_empty_store_denies_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        for p in Platform::ALL {
            assert!(!store.is_active(p));
        }
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_grant_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.grant(Platform::Warp, "full_access").unwrap();

        assert!(store.is_active(Platform::Warp));
        assert!(!store.is_active(Platform::Augment));
        let entry = store.get(Platform::Warp).unwrap();
        assert_eq!(entry.consent_type, "full_access");
        assert!(entry.revoked_at.is_none());
    }

    #[test]
    fn test_revoke_flips_status_and_audits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.grant(Platform::Warp, "full_access").unwrap();
        store.revoke(Platform::Warp).unwrap();

        assert!(!store.is_active(Platform::Warp));
        assert!(store.get(Platform::Warp).unwrap().revoked_at.is_some());
        let kinds: Vec<AuditKind> = store.audit().iter().map(|e| e.event).collect();
        assert_eq!(kinds, vec![AuditKind::ConsentGranted, AuditKind::ConsentRevoked]);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".permissions.aicf");
        {
            let mut store = PermissionStore::load(&path).unwrap();
            store.grant(Platform::ClaudeCli, "full_access").unwrap();
            store.revoke(Platform::Augment).unwrap();
            store
                .log_event(AuditEvent::access_denied(Platform::Augment))
                .unwrap();
        }
        let reloaded = PermissionStore::load(&path).unwrap();
        assert!(reloaded.is_active(Platform::ClaudeCli));
        assert!(!reloaded.is_active(Platform::Augment));
        assert_eq!(reloaded.audit().len(), 3);
        assert_eq!(reloaded.audit()[2].event, AuditKind::AccessDenied);
    }

    #[test]
    fn test_log_event_appends_without_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".permissions.aicf");
        let mut store = PermissionStore::load(&path).unwrap();
        store.grant(Platform::Warp, "full_access").unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        store
            .log_event(AuditEvent::access_denied(Platform::Warp))
            .unwrap();
        let after = std::fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&before));
        assert!(after.contains("access_denied"));
    }

    #[test]
    fn test_corrupt_platform_row_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".permissions.aicf");
        std::fs::write(&path, "version|3.0.0-alpha\n@PLATFORM|warp|bogus-status\n").unwrap();
        match PermissionStore::load(&path) {
            Err(RecallError::CorruptPermissions(p)) => assert_eq!(p, path),
            other => panic!("expected CorruptPermissions, got {other:?}"),
        }
    }

    #[test]
    fn test_regrant_after_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.grant(Platform::Warp, "full_access").unwrap();
        store.revoke(Platform::Warp).unwrap();
        store.grant(Platform::Warp, "read_only").unwrap();

        let entry = store.get(Platform::Warp).unwrap();
        assert_eq!(entry.status, PermissionStatus::Active);
        assert_eq!(entry.consent_type, "read_only");
        assert!(entry.revoked_at.is_none());
        assert_eq!(store.audit().len(), 3);
    }
}
