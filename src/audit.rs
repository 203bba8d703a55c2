/// Audit log of redundancy removals
///
/// Every path rule the analyzer removes is appended to `audit.jsonl` in the
/// output directory, one JSON object per line, tagged with the run that
/// removed it.
use crate::core::analyze::RedundancyRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const AUDIT_FILE_NAME: &str = "audit.jsonl";

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the run finished (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Compiler run the removal belongs to
    pub run_id: Uuid,

    #[serde(flatten)]
    pub record: RedundancyRecord,
}

impl AuditEvent {
    pub fn new(run_id: Uuid, record: RedundancyRecord) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            record,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            log_path: out_dir.join(AUDIT_FILE_NAME),
        }
    }

    /// Appends events to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, events: &[AuditEvent]) -> std::io::Result<()> {
        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(buf.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let mut events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        events.reverse();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Logs the removals of one run. Failures are logged, not returned.
pub async fn log_removals(out_dir: &Path, run_id: Uuid, records: &[RedundancyRecord]) {
    if records.is_empty() {
        return;
    }
    let events: Vec<AuditEvent> = records
        .iter()
        .map(|r| AuditEvent::new(run_id, r.clone()))
        .collect();
    let audit = AuditLog::new(out_dir);
    if let Err(e) = audit.log(&events).await {
        tracing::warn!("Failed to write audit log {}: {}", audit.path().display(), e);
    }
}
