//! Append-only audit trail.
//!
//! Every authorize decision, every backend attempt and every finished action
//! produces one [`AuditRecord`]. Records are numbered and handed to the sinks
//! under a single lock, so sink order always matches action order.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{ActionKind, BackendId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied { reason: String },
    AttemptSucceeded,
    AttemptFailed { error: String },
    AttemptTimedOut { after_ms: u64 },
    Completed,
    Failed { error: String },
}

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub action_kind: String,
    pub params_redacted: Value,
    pub backend_used: Option<BackendId>,
    pub outcome: AuditOutcome,
    pub caller_context: String,
}

/// Destination for audit records outside the in-memory ring.
pub trait AuditSink: Send + Sync {
    fn write(&self, record: &AuditRecord) -> std::io::Result<()>;
}

/// Appends one JSON object per line. Lines are queued and written by a
/// task on the blocking pool, in the order they were queued.
pub struct JsonlSink {
    lines: mpsc::UnboundedSender<String>,
}

impl JsonlSink {
    /// Open (or create) `path` for appending. Must be called from inside a
    /// Tokio runtime.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let (lines, mut queued) = mpsc::unbounded_channel::<String>();
        let path = path.to_path_buf();
        runtime.spawn_blocking(move || {
            let mut writer = BufWriter::new(file);
            while let Some(line) = queued.blocking_recv() {
                let written = writeln!(writer, "{}", line).and_then(|_| writer.flush());
                if let Err(e) = written {
                    tracing::warn!(path = %path.display(), "Failed to write audit line: {}", e);
                }
            }
        });
        Ok(Self { lines })
    }
}

impl AuditSink for JsonlSink {
    fn write(&self, record: &AuditRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        self.lines.send(line).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "audit writer has stopped")
        })
    }
}

struct AuditState {
    next_seq: u64,
    records: VecDeque<AuditRecord>,
}

pub struct AuditLog {
    state: Mutex<AuditState>,
    sinks: Vec<Box<dyn AuditSink>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(AuditState {
                next_seq: 1,
                records: VecDeque::with_capacity(capacity.min(4096)),
            }),
            sinks: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Append a record and return its sequence number.
    pub fn append(
        &self,
        action_kind: &str,
        params_redacted: Value,
        backend_used: Option<BackendId>,
        outcome: AuditOutcome,
        caller_context: &str,
    ) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = AuditRecord {
            seq: state.next_seq,
            timestamp: Utc::now(),
            action_kind: action_kind.to_string(),
            params_redacted,
            backend_used,
            outcome,
            caller_context: caller_context.to_string(),
        };
        state.next_seq += 1;

        for sink in &self.sinks {
            if let Err(e) = sink.write(&record) {
                tracing::warn!(seq = record.seq, "Failed to write audit record: {}", e);
            }
        }

        let seq = record.seq;
        state.records.push_back(record);
        while state.records.len() > self.capacity {
            state.records.pop_front();
        }
        seq
    }

    /// The most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let skip = state.records.len().saturating_sub(limit);
        state.records.iter().skip(skip).cloned().collect()
    }

    /// Records whose caller context matches, oldest first.
    pub fn for_caller(&self, caller_context: &str) -> Vec<AuditRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .iter()
            .filter(|r| r.caller_context == caller_context)
            .cloned()
            .collect()
    }
}

/// Strip secrets from params before they are audited. Typed text is
/// reduced to its length.
pub fn redact_params(kind: ActionKind, params: &Value) -> Value {
    let mut redacted = params.clone();
    if kind == ActionKind::TypeText {
        if let Some(obj) = redacted.as_object_mut() {
            if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                let len = text.chars().count();
                obj.insert(
                    "text".to_string(),
                    Value::String(format!("<redacted {} chars>", len)),
                );
            }
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_and_capacity() {
        let log = AuditLog::new(2);
        for i in 0..3 {
            log.append(
                "click_screen",
                json!({"i": i}),
                None,
                AuditOutcome::Allowed,
                "test",
            );
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].seq, 2);
        assert_eq!(recent[1].seq, 3);
    }

    async fn lines_in(path: &Path, want: usize) -> Vec<String> {
        for _ in 0..200 {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            let lines: Vec<String> = content.lines().map(str::to_string).collect();
            if lines.len() >= want {
                return lines;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("audit file never reached {} lines", want);
    }

    #[tokio::test]
    async fn test_jsonl_sink_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.log");
        let log = AuditLog::new(10).with_sink(Box::new(JsonlSink::open(&path).unwrap()));

        for i in 0..50 {
            log.append("type_text", json!({"i": i}), None, AuditOutcome::Allowed, "a");
        }
        log.append(
            "type_text",
            json!({}),
            Some(BackendId::Xdotool),
            AuditOutcome::Completed,
            "a",
        );

        let seqs: Vec<u64> = lines_in(&path, 51)
            .await
            .iter()
            .map(|l| serde_json::from_str::<AuditRecord>(l).unwrap().seq)
            .collect();
        assert_eq!(seqs, (1..=51).collect::<Vec<u64>>());
    }

    #[test]
    fn test_jsonl_sink_needs_runtime() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JsonlSink::open(&dir.path().join("audit.log")).is_err());
    }

    #[test]
    fn test_typed_text_is_redacted() {
        let params = json!({"text": "hunter2", "interval": 0.0});
        let redacted = redact_params(ActionKind::TypeText, &params);
        assert_eq!(redacted["text"], "<redacted 7 chars>");
        assert_eq!(redacted["interval"], 0.0);

        let untouched = redact_params(ActionKind::FindText, &json!({"text": "OK"}));
        assert_eq!(untouched["text"], "OK");
    }
}
