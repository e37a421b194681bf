use crate::LedgerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured error attached to a failed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
}

/// Current lifecycle state of one `(doc_id, adapter)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub doc_id: String,
    pub adapter: String,
    pub state: LedgerState,
    pub updated_at: DateTime<Utc>,
    /// Retry count: incremented on each transition into Retrying.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One line of the append-only audit log. `old_state` is None for the
/// initial record of a doc_id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<LedgerState>,
    pub new_state: LedgerState,
    pub timestamp: DateTime<Utc>,
    pub adapter: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, serde_json::Value>>,
}

impl AuditRecord {
    /// Fold this record into the entry it produces, as used both on the
    /// live write path and during delta replay.
    pub(crate) fn into_entry(self) -> LedgerEntry {
        LedgerEntry {
            doc_id: self.doc_id,
            adapter: self.adapter,
            state: self.new_state,
            updated_at: self.timestamp,
            attempt: self.attempt,
            error: self.error,
            metadata: self.parameters.unwrap_or_default(),
        }
    }
}
