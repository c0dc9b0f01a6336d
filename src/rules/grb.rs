// GRB rule: classifier likelihood, then duration windows.

use super::{Outcome, RuleContext, TriggerRule, Verdict};
use crate::alert::AlertRecord;
use crate::error::TriggerError;
use crate::policy::Policy;

/// Fermi classifier bin for a GRB.
const FERMI_GRB_INDEX: i32 = 4;

pub struct GrbRule;

fn within(value: f64, min: f64, max: f64) -> bool {
    value >= min && value <= max
}

impl TriggerRule for GrbRule {
    fn evaluate(
        &self,
        alert: &AlertRecord,
        policy: &Policy,
        _ctx: &RuleContext,
    ) -> Result<Verdict, TriggerError> {
        let metrics = alert
            .grb()
            .ok_or_else(|| TriggerError::Validation("GRB rule given a non-GRB alert".into()))?;
        let t = &policy.grb;
        let mut v = Verdict::new();

        // ── Likelihood ──────────────────────────────────────────────────
        let likely = if let Some(index) = metrics.most_likely_index {
            if index == FERMI_GRB_INDEX {
                let prob = metrics.detection_prob.unwrap_or(0.0);
                if prob >= t.fermi_min_detection_prob {
                    v.note(format!(
                        "The probability of a GRB ({:.1}%) is at least {:.1}%",
                        prob, t.fermi_min_detection_prob
                    ));
                    true
                } else {
                    v.debug = true;
                    v.note(format!(
                        "The probability of a GRB ({:.1}%) is less than {:.1}% so not triggering",
                        prob, t.fermi_min_detection_prob
                    ));
                    false
                }
            } else {
                v.note(format!(
                    "The most likely class index is {} (not a GRB) so not triggering",
                    index
                ));
                false
            }
        } else if let Some(signif) = metrics.rate_signif {
            if signif >= t.swift_min_rate_signif {
                v.note(format!(
                    "SWIFT rate significance ({:.3}) is at least {:.3}",
                    signif, t.swift_min_rate_signif
                ));
                true
            } else {
                v.debug = true;
                v.note(format!(
                    "SWIFT rate significance ({:.3}) is less than {:.3} so not triggering",
                    signif, t.swift_min_rate_signif
                ));
                false
            }
        } else if let Some(signif) = metrics.hess_significance {
            if within(signif, t.minimum_hess_significance, t.maximum_hess_significance) {
                v.note(format!(
                    "HESS significance ({:.3}) is within {:.3} to {:.3}",
                    signif, t.minimum_hess_significance, t.maximum_hess_significance
                ));
                true
            } else {
                v.note(format!(
                    "HESS significance ({:.3}) is outside {:.3} to {:.3} so not triggering",
                    signif, t.minimum_hess_significance, t.maximum_hess_significance
                ));
                false
            }
        } else {
            v.note("No detection probability given so assuming it is a GRB");
            true
        };

        if !likely {
            return Ok(v.finish(Outcome::Ignore));
        }

        // ── Duration ────────────────────────────────────────────────────
        if t.event_any_duration {
            v.note("Accepting any event duration so triggering");
            return Ok(v.finish(Outcome::Trigger));
        }

        let Some(duration) = alert.duration else {
            v.debug = true;
            v.note("No event duration (None) so not triggering");
            return Ok(v.finish(Outcome::Ignore));
        };

        if within(duration, t.event_min_duration, t.event_max_duration) {
            v.note(format!(
                "The event duration ({:.3} s) is between {:.3} and {:.3} s so triggering",
                duration, t.event_min_duration, t.event_max_duration
            ));
            return Ok(v.finish(Outcome::Trigger));
        }

        let pending_windows = [
            (t.pending_min_duration_1, t.pending_max_duration_1),
            (t.pending_min_duration_2, t.pending_max_duration_2),
        ];
        if let Some((min, max)) = pending_windows
            .iter()
            .copied()
            .find(|(min, max)| within(duration, *min, *max))
        {
            v.debug = true;
            v.note(format!(
                "The event duration ({:.3} s) is between {:.3} and {:.3} s so waiting for a human's decision",
                duration, min, max
            ));
            return Ok(v.finish(Outcome::Pending));
        }

        v.debug = true;
        v.note(format!(
            "The event duration ({:.3} s) is outside the trigger and pending windows so not triggering",
            duration
        ));
        Ok(v.finish(Outcome::Ignore))
    }
}
