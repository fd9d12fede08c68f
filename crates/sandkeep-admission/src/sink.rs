use std::path::PathBuf;

use async_trait::async_trait;
use sandkeep_core::AuditEvent;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Where sealed [`AuditEvent`]s are durably recorded. A sink failure must
/// never block admission — callers log the error and proceed.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Test and single-process fallback sink: holds every sealed event in
/// memory, in append order.
#[derive(Default)]
pub struct InMemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemorySink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Append-only JSON-lines audit log, one file per process — one JSON
/// object per line, append-only, never rewritten in place.
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandkeep_core::{AuditId, AuditResource, AuditResult};
    use std::collections::BTreeMap;

    fn sample_event() -> AuditEvent {
        AuditEvent {
            id: AuditId::new(),
            timestamp: chrono::Utc::now(),
            action: "admitted".into(),
            result: AuditResult::Accepted,
            resource: AuditResource {
                kind: "sandbox".into(),
                id: "sbx-1".into(),
            },
            identity: "tenant:acme".into(),
            metadata: BTreeMap::new(),
            previous_hash: String::new(),
            hash: "deadbeef".into(),
        }
    }

    #[tokio::test]
    async fn in_memory_sink_records_in_order() {
        let sink = InMemorySink::new();
        sink.record(&sample_event()).await.unwrap();
        sink.record(&sample_event()).await.unwrap();
        assert_eq!(sink.events().await.len(), 2);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlFileSink::new(&path);

        sink.record(&sample_event()).await.unwrap();
        sink.record(&sample_event()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            let parsed: AuditEvent = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.action, "admitted");
        }
    }
}
