// =============================================================================
// Audit log: append-only, timestamped reasons attached to every Decision
// =============================================================================
//
// Operators reconstruct why an event was (or was not) observed purely from
// this log, so every rule branch and orchestration stage writes one line.
// Each line is also mirrored to tracing at debug level.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    /// Alert whose processing produced the line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<Uuid>,
    pub message: String,
}

impl std::fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.alert_id {
            Some(id) => write!(f, "{}: Event ID {}: {}", self.at.to_rfc3339(), id, self.message),
            None => write!(f, "{}: {}", self.at.to_rfc3339(), self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: DateTime<Utc>, alert_id: Option<Uuid>, message: impl Into<String>) {
        let message = message.into();
        debug!(alert_id = ?alert_id, "{}", message);
        self.entries.push(AuditEntry {
            at,
            alert_id,
            message,
        });
    }

    /// Append every entry of `other` in order.
    pub fn extend(&mut self, other: AuditLog) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_message(&self) -> Option<&str> {
        self.entries.last().map(|e| e.message.as_str())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }

    /// Newline-joined text, the form shown to operators.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
