// =============================================================================
// Trigger rules: decide Trigger / Pending / Ignore for one (alert, policy)
// =============================================================================
//
// Evaluation is a short-circuiting gate chain:
//
//   1. Applicability  - event telescope, source type, stream
//   2. Validation     - position must lie on the celestial sphere
//   3. Position sanity - zero / oversized uncertainty, declination bands
//   4. Source rule    - GRB, GW or NU specific thresholds
//
// Rules are pure: they read the alert and policy and return a Verdict whose
// `reasons` become audit lines.  Nothing here touches shared state.
// =============================================================================

mod grb;
mod gw;
mod nu;

pub use grb::GrbRule;
pub use gw::GwRule;
pub use nu::NuRule;

use chrono::{DateTime, Utc};

use crate::alert::AlertRecord;
use crate::error::TriggerError;
use crate::policy::Policy;
use crate::types::SourceType;

// -----------------------------------------------------------------------------
// Verdict
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Trigger,
    Pending,
    Ignore,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trigger => write!(f, "TRIGGER"),
            Self::Pending => write!(f, "PENDING"),
            Self::Ignore => write!(f, "IGNORE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub outcome: Outcome,
    /// Marks near misses worth an operator's attention.
    pub debug: bool,
    pub reasons: Vec<String>,
}

impl Verdict {
    fn new() -> Self {
        Self {
            outcome: Outcome::Ignore,
            debug: false,
            reasons: Vec::new(),
        }
    }

    fn note(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    fn finish(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    fn single(outcome: Outcome, reason: impl Into<String>) -> Self {
        let mut v = Self::new();
        v.note(reason);
        v.finish(outcome)
    }
}

/// Inputs to evaluation that are not part of the alert or policy.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext {
    pub now: DateTime<Utc>,
    /// GW alerts whose event time is older than this are ignored.
    pub gw_max_event_age: chrono::Duration,
}

/// One source-type specific threshold check.
pub trait TriggerRule: Send + Sync {
    fn evaluate(
        &self,
        alert: &AlertRecord,
        policy: &Policy,
        ctx: &RuleContext,
    ) -> Result<Verdict, TriggerError>;
}

fn rule_for(source_type: SourceType) -> Option<&'static dyn TriggerRule> {
    match source_type {
        SourceType::Grb => Some(&GrbRule),
        SourceType::Gw => Some(&GwRule),
        SourceType::Nu => Some(&NuRule),
        SourceType::FlareStar => None,
    }
}

// -----------------------------------------------------------------------------
// Gates
// -----------------------------------------------------------------------------

/// Returns a terminal verdict when the policy does not apply to the alert.
/// An empty stream list accepts every stream.
pub fn applicability(alert: &AlertRecord, policy: &Policy) -> Option<Verdict> {
    if let Some(event_telescope) = &policy.event_telescope {
        if !event_telescope.eq_ignore_ascii_case(alert.telescope.trim()) {
            return Some(Verdict::single(
                Outcome::Ignore,
                format!(
                    "This proposal does not trigger on events from {}",
                    alert.telescope
                ),
            ));
        }
    }

    let alert_type = alert.source_type();
    if policy.source_type == SourceType::FlareStar && alert_type == SourceType::FlareStar {
        return Some(Verdict::single(
            Outcome::Trigger,
            format!(
                "Triggering on Flare Star {}",
                alert.source_name.as_deref().unwrap_or("(unnamed)")
            ),
        ));
    }

    if policy.source_type != alert_type {
        return Some(Verdict::single(
            Outcome::Ignore,
            format!("This proposal does not observe {}", alert_type.plural()),
        ));
    }

    let stream = alert.stream();
    if !policy.streams.is_empty() && !policy.streams.iter().any(|s| s == &stream) {
        return Some(Verdict::single(
            Outcome::Ignore,
            format!("This proposal does not listen to the {} stream", stream),
        ));
    }

    None
}

/// Position checks shared by all source types.
pub fn position_sanity(alert: &AlertRecord, policy: &Policy) -> Option<Verdict> {
    if let Some(err) = alert.pos_error {
        if err == 0.0 {
            return Some(Verdict::single(
                Outcome::Ignore,
                "The position uncertainty is 0.0 which is likely an error so not triggering",
            ));
        }
        if let Some(max) = policy.maximum_position_uncertainty {
            if err > max {
                return Some(Verdict::single(
                    Outcome::Ignore,
                    format!(
                        "The position uncertainty ({:.4} deg) is greater than {:.4} deg so not triggering",
                        err, max
                    ),
                ));
            }
        }
    }

    if let (Some(bands), Some(pos)) = (policy.telescope.declination_bands(), alert.position) {
        if !bands.iter().any(|b| b.contains(pos.dec)) {
            return Some(Verdict::single(
                Outcome::Ignore,
                format!(
                    "Declination {:.4} deg is outside the limits [{}, {}] and [{}, {}] so not triggering",
                    pos.dec, bands[0].min, bands[0].max, bands[1].min, bands[1].max
                ),
            ));
        }
    }

    None
}

/// Run the full gate chain for one alert against one policy.
pub fn evaluate(
    alert: &AlertRecord,
    policy: &Policy,
    ctx: &RuleContext,
) -> Result<Verdict, TriggerError> {
    if let Some(verdict) = applicability(alert, policy) {
        return Ok(verdict);
    }

    if let Some(pos) = alert.position {
        if !pos.is_valid() {
            return Err(TriggerError::Validation(format!(
                "position (ra={}, dec={}) is not on the celestial sphere",
                pos.ra, pos.dec
            )));
        }
    }

    if let Some(verdict) = position_sanity(alert, policy) {
        return Ok(verdict);
    }

    match rule_for(alert.source_type()) {
        Some(rule) => rule.evaluate(alert, policy, ctx),
        None => Ok(Verdict::single(
            Outcome::Ignore,
            format!("No trigger rule for {}", alert.source_type().plural()),
        )),
    }
}

#[cfg(test)]
pub(crate) fn test_context(now: DateTime<Utc>) -> RuleContext {
    RuleContext {
        now,
        gw_max_event_age: chrono::Duration::hours(3),
    }
}
