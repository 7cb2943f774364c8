//! Per-request audit trail

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Caller recorded when authentication did not succeed
pub const ANONYMOUS: &str = "anonymous";

/// Furthest stage a chat request reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Authenticated,
    Routed,
    Forwarded,
    Completed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Received => "received",
            Stage::Authenticated => "authenticated",
            Stage::Routed => "routed",
            Stage::Forwarded => "forwarded",
            Stage::Completed => "completed",
        })
    }
}

/// One audited chat request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    /// Instance name of the key holder
    pub caller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub stream: bool,
    pub stage: Stage,
    /// HTTP status returned to the caller
    pub status: u16,
    /// Error category when the request failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub latency_ms: u64,
}

impl AuditEntry {
    /// Start an entry for a freshly received request
    pub fn received(request_id: impl Into<String>) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            request_id: request_id.into(),
            caller: ANONYMOUS.to_string(),
            model: None,
            stream: false,
            stage: Stage::Received,
            status: 0,
            category: None,
            latency_ms: 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.category.is_some()
    }
}

/// Bounded in-memory ring of recent audit entries.
///
/// Every entry is also emitted as a structured event at target
/// `emx_gate::audit`.
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        AuditLog {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    /// Record an entry, evicting the oldest once full
    pub fn record(&self, entry: AuditEntry) {
        if entry.is_failure() {
            tracing::warn!(
                target: "emx_gate::audit",
                request_id = %entry.request_id,
                caller = %entry.caller,
                model = entry.model.as_deref().unwrap_or("-"),
                stream = entry.stream,
                stage = %entry.stage,
                status = entry.status,
                category = entry.category.as_deref().unwrap_or("-"),
                latency_ms = entry.latency_ms,
                "request failed"
            );
        } else {
            tracing::info!(
                target: "emx_gate::audit",
                request_id = %entry.request_id,
                caller = %entry.caller,
                model = entry.model.as_deref().unwrap_or("-"),
                stream = entry.stream,
                stage = %entry.stage,
                status = entry.status,
                latency_ms = entry.latency_ms,
                "request completed"
            );
        }

        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> AuditEntry {
        AuditEntry::received(id)
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = AuditLog::new(2);
        log.record(entry("a"));
        log.record(entry("b"));
        log.record(entry("c"));
        let ids: Vec<_> = log.recent(10).into_iter().map(|e| e.request_id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_recent_limit() {
        let log = AuditLog::new(10);
        for i in 0..5 {
            log.record(entry(&i.to_string()));
        }
        assert_eq!(log.recent(3).len(), 3);
        assert_eq!(log.recent(3)[0].request_id, "4");
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let log = AuditLog::new(0);
        log.record(entry("a"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_entry_serialization() {
        let mut e = entry("req-1");
        e.stage = Stage::Routed;
        e.status = 502;
        e.category = Some("upstream_unavailable".into());
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["caller"], "anonymous");
        assert_eq!(value["stage"], "routed");
        assert!(value.get("model").is_none());
        assert!(e.is_failure());
    }
}
