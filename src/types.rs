// =============================================================================
// Shared types used across the trigger engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Astrophysical class of a transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "GRB")]
    Grb,
    #[serde(rename = "GW")]
    Gw,
    #[serde(rename = "NU")]
    Nu,
    #[serde(rename = "FS")]
    FlareStar,
}

impl SourceType {
    /// Plural noun used in audit messages ("This proposal does not observe GRBs").
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Grb => "GRBs",
            Self::Gw => "GWs",
            Self::Nu => "NUs",
            Self::FlareStar => "FSs",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grb => write!(f, "GRB"),
            Self::Gw => write!(f, "GW"),
            Self::Nu => write!(f, "NU"),
            Self::FlareStar => write!(f, "FS"),
        }
    }
}

/// Whether an alert describes a real event or an injected test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertRole {
    #[serde(alias = "observation")]
    Real,
    Test,
}

impl Default for AlertRole {
    fn default() -> Self {
        Self::Real
    }
}

impl std::fmt::Display for AlertRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Which alert roles a policy reacts to, and whether real requests are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestMode {
    /// Real alerts only, real requests.
    RealOnly,
    /// Real and test alerts; real alerts produce real requests.
    Both,
    /// Real alerts only, every request is a dry run.
    PretendReal,
}

impl Default for TestMode {
    fn default() -> Self {
        Self::PretendReal
    }
}

impl std::fmt::Display for TestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RealOnly => write!(f, "REAL_ONLY"),
            Self::Both => write!(f, "BOTH"),
            Self::PretendReal => write!(f, "PRETEND_REAL"),
        }
    }
}

/// Lifecycle of a (group, policy) decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionState {
    PendingEvaluation,
    Triggered,
    Ignored,
    AwaitingHuman,
    Error,
    Cancelled,
}

impl Default for DecisionState {
    fn default() -> Self {
        Self::PendingEvaluation
    }
}

impl DecisionState {
    /// Single-letter code used by operators (T, I, P, E, C).
    pub fn code(&self) -> char {
        match self {
            Self::PendingEvaluation => '-',
            Self::Triggered => 'T',
            Self::Ignored => 'I',
            Self::AwaitingHuman => 'P',
            Self::Error => 'E',
            Self::Cancelled => 'C',
        }
    }
}

impl std::fmt::Display for DecisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingEvaluation => write!(f, "PendingEvaluation"),
            Self::Triggered => write!(f, "Triggered"),
            Self::Ignored => write!(f, "Ignored"),
            Self::AwaitingHuman => write!(f, "AwaitingHuman"),
            Self::Error => write!(f, "Error"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Notice type carried by gravitational-wave alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GwAlertKind {
    EarlyWarning,
    Preliminary,
    Initial,
    Update,
    Retraction,
    Other,
}

impl GwAlertKind {
    /// Parse the event-type string of an alert.  Matching ignores case and any
    /// `LVC_` style prefix, so both "EarlyWarning" and "LVC_EARLY_WARNING" map.
    pub fn from_event_type(raw: &str) -> Self {
        let flat: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        if flat.ends_with("EARLYWARNING") {
            Self::EarlyWarning
        } else if flat.ends_with("PRELIMINARY") {
            Self::Preliminary
        } else if flat.ends_with("INITIAL") {
            Self::Initial
        } else if flat.ends_with("UPDATE") {
            Self::Update
        } else if flat.ends_with("RETRACTION") {
            Self::Retraction
        } else {
            Self::Other
        }
    }
}

impl std::fmt::Display for GwAlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EarlyWarning => write!(f, "EarlyWarning"),
            Self::Preliminary => write!(f, "Preliminary"),
            Self::Initial => write!(f, "Initial"),
            Self::Update => write!(f, "Update"),
            Self::Retraction => write!(f, "Retraction"),
            Self::Other => write!(f, "Other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_codes_match_operator_letters() {
        assert_eq!(DecisionState::Triggered.code(), 'T');
        assert_eq!(DecisionState::AwaitingHuman.code(), 'P');
        assert_eq!(DecisionState::Cancelled.code(), 'C');
    }

    #[test]
    fn gw_kind_parses_prefixed_and_plain_names() {
        assert_eq!(
            GwAlertKind::from_event_type("LVC_EARLY_WARNING"),
            GwAlertKind::EarlyWarning
        );
        assert_eq!(
            GwAlertKind::from_event_type("Retraction"),
            GwAlertKind::Retraction
        );
        assert_eq!(GwAlertKind::from_event_type("Counterpart"), GwAlertKind::Other);
    }

    #[test]
    fn role_accepts_observation_alias() {
        let role: AlertRole = serde_json::from_str("\"observation\"").unwrap();
        assert_eq!(role, AlertRole::Real);
        let mode: TestMode = serde_json::from_str("\"REAL_ONLY\"").unwrap();
        assert_eq!(mode, TestMode::RealOnly);
    }
}
