// =============================================================================
// Trigger errors: the failure taxonomy shared by rules, pointing and scheduling
// =============================================================================
//
// Every variant is caught at the orchestration boundary and converted into a
// Decision state plus an audit line.  Nothing here ever escapes the engine
// loop as a panic.
// =============================================================================

use thiserror::Error;

use crate::types::DecisionState;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TriggerError {
    /// Malformed position, unparsable false-alarm rate, missing inputs.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Source is below the horizon limit for the whole exposure.
    #[error("{0}")]
    VisibilityRejected(String),

    /// Scheduler returned failure, null, or the call raised / timed out.
    #[error("scheduling failed: {0}")]
    Scheduling(String),

    /// Alert role and policy test mode are incompatible.
    #[error("{0}")]
    Configuration(String),

    /// Sky-map pointings could not be resolved from a fetched map.
    #[error("pointing resolution failed: {0}")]
    Pointing(String),

    /// Sky map or other external dependency could not be fetched.
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),
}

impl TriggerError {
    /// State the owning Decision moves to, or `None` when it must stay as is.
    pub fn decision_state(&self) -> Option<DecisionState> {
        match self {
            Self::Validation(_) | Self::Scheduling(_) | Self::Configuration(_) => {
                Some(DecisionState::Error)
            }
            Self::VisibilityRejected(_) => Some(DecisionState::Ignored),
            Self::Pointing(_) | Self::DownstreamUnavailable(_) => None,
        }
    }
}
