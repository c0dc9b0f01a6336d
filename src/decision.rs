// =============================================================================
// Decisions and observations: the persisted outcome of processing a group
// =============================================================================
//
// A Decision is keyed by (trig_id, policy id) and there is exactly one per
// key.  Observations are appended, one per scheduled observation id, and
// always reference the Decision that produced them.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::geometry::{HorizontalCoord, SkyPosition};
use crate::pointing::Pointing;
use crate::types::DecisionState;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecisionKey {
    pub trig_id: String,
    pub policy_id: String,
}

impl DecisionKey {
    pub fn new(trig_id: impl Into<String>, policy_id: impl Into<String>) -> Self {
        Self {
            trig_id: trig_id.into(),
            policy_id: policy_id.into(),
        }
    }
}

impl std::fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.trig_id, self.policy_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub key: DecisionKey,
    pub state: DecisionState,
    pub reason_log: AuditLog,
    /// Position the decision last acted on.
    pub position: Option<SkyPosition>,
    pub horizontal: Option<HorizontalCoord>,
    pub pos_error: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(key: DecisionKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            state: DecisionState::PendingEvaluation,
            reason_log: AuditLog::new(),
            position: None,
            horizontal: None,
            pos_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// Voltage buffer dump captured right after a GW alert.
    BufferDump,
    Standard,
    Repoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub key: DecisionKey,
    /// Telescope name as sent to the scheduler.
    pub telescope: String,
    /// Id assigned by the scheduler (or a local placeholder).
    pub obsid: String,
    pub trigger_id: Option<String>,
    pub kind: ObservationKind,
    pub reason: String,
    pub pointing: Option<Pointing>,
    pub pretend: bool,
    pub request_sent_at: DateTime<Utc>,
    /// Raw scheduler response, kept for audit.
    pub response: serde_json::Value,
}
