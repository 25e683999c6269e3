//! Append-only JSONL audit trail.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use mediator_protocol::AuditEntry;

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AuditLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON line. Wrapped so that any I/O failure — a full disk,
    /// a missing parent directory — never propagates: the audit log is
    /// best-effort and must never block or fail the caller's decision path.
    pub async fn append(&self, entry: AuditEntry) {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || append_blocking(&path, &entry)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "audit append failed"),
            Err(err) => tracing::warn!(error = %err, "audit append task panicked"),
        }
    }

    /// Parse the log line-by-line, skipping malformed lines, and return up
    /// to `limit` entries, most-recent-first. A missing file yields an
    /// empty result rather than an error.
    pub async fn read(&self, limit: usize) -> Vec<AuditEntry> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_blocking(&path, limit))
            .await
            .unwrap_or_default()
    }
}

fn append_blocking(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_blocking(path: &Path, limit: usize) -> Vec<AuditEntry> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut entries: Vec<AuditEntry> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    entries.reverse();
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_protocol::Category;
    use mediator_protocol::RequestStatus;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn entry(id: &str, ts: i64) -> AuditEntry {
        AuditEntry {
            timestamp: ts,
            id: id.to_string(),
            category: Category::Network,
            action: "CONNECT example.com:443".to_string(),
            decision: RequestStatus::Approved,
            resolved_by: None,
            duration_ms: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        assert!(log.read(50).await.is_empty());
    }

    #[tokio::test]
    async fn read_reverses_and_truncates() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        for i in 0..5 {
            log.append(entry(&format!("req-{i}"), i)).await;
        }
        let recent = log.read(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "req-4");
        assert_eq!(recent[1].id, "req-3");
    }

    #[tokio::test]
    async fn read_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        tokio::fs::write(&path, "not json\n{\"bad\":true}\n")
            .await
            .unwrap();
        let log = AuditLog::new(path);
        assert!(log.read(10).await.is_empty());
    }
}
