// GW rule: age, detector count, notice kind, false-alarm rate, class
// probabilities, then significance.

use super::{Outcome, RuleContext, TriggerRule, Verdict};
use crate::alert::AlertRecord;
use crate::error::TriggerError;
use crate::policy::{Policy, ProbabilityBand};
use crate::types::GwAlertKind;

pub struct GwRule;

/// The only telescope whose GW notices carry the fields checked below.
const GW_NETWORK: &str = "LVC";

fn parse_rate(raw: &str, label: &str) -> Result<f64, TriggerError> {
    raw.trim().parse::<f64>().map_err(|_| {
        TriggerError::Validation(format!("could not parse {} '{}' as a number", label, raw))
    })
}

impl TriggerRule for GwRule {
    fn evaluate(
        &self,
        alert: &AlertRecord,
        policy: &Policy,
        ctx: &RuleContext,
    ) -> Result<Verdict, TriggerError> {
        let metrics = alert
            .gw()
            .ok_or_else(|| TriggerError::Validation("GW rule given a non-GW alert".into()))?;
        let t = &policy.gw;

        let age = ctx.now - alert.observed;
        if age > ctx.gw_max_event_age {
            return Ok(Verdict::single(
                Outcome::Ignore,
                format!(
                    "The event is {:.2} hours old which is more than {} hours so not triggering",
                    age.num_seconds() as f64 / 3600.0,
                    ctx.gw_max_event_age.num_hours()
                ),
            ));
        }

        if let Some(count) = metrics.instrument_count() {
            if count < 2 {
                return Ok(Verdict::single(
                    Outcome::Ignore,
                    format!(
                        "Only {} interferometer(s) ({}) detected the event so not triggering",
                        count,
                        metrics.instruments.as_deref().unwrap_or_default()
                    ),
                ));
            }
        }

        if alert.telescope != GW_NETWORK {
            return Ok(Verdict::single(
                Outcome::Ignore,
                format!(
                    "GW notices from {} are not evaluated, only {} so not triggering",
                    alert.telescope, GW_NETWORK
                ),
            ));
        }

        match alert.gw_kind() {
            Some(GwAlertKind::EarlyWarning) => {
                return Ok(Verdict::single(
                    Outcome::Trigger,
                    "Early warning, no information so triggering",
                ));
            }
            Some(GwAlertKind::Retraction) => {
                return Ok(Verdict::single(
                    Outcome::Trigger,
                    "Retraction, scheduling no capture observation",
                ));
            }
            _ => {}
        }

        if let Some(raw) = metrics.far.as_deref() {
            let far = parse_rate(raw, "false alarm rate")?;
            if let Some(min_raw) = t.minimum_false_alarm_rate.as_deref() {
                let min = parse_rate(min_raw, "minimum false alarm rate")?;
                if far < min {
                    return Ok(Verdict::single(
                        Outcome::Ignore,
                        format!(
                            "The FAR is {:e} which is less than {:e} so not triggering",
                            far, min
                        ),
                    ));
                }
            }
            if let Some(max_raw) = t.maximum_false_alarm_rate.as_deref() {
                let max = parse_rate(max_raw, "maximum false alarm rate")?;
                if far > max {
                    return Ok(Verdict::single(
                        Outcome::Ignore,
                        format!(
                            "The FAR is {:e} which is greater than {:e} so not triggering",
                            far, max
                        ),
                    ));
                }
            }
        }

        let bands: [(&str, Option<f64>, ProbabilityBand); 5] = [
            ("PROB_NS", metrics.prob_ns, t.prob_ns),
            ("PROB_BNS", metrics.prob_bns, t.prob_bns),
            ("PROB_NSBH", metrics.prob_nsbh, t.prob_nsbh),
            ("PROB_BBH", metrics.prob_bbh, t.prob_bbh),
            ("PROB_Terre", metrics.prob_terrestrial, t.prob_terrestrial),
        ];
        for (label, value, band) in bands {
            let Some(p) = value else { continue };
            if p > band.max {
                return Ok(Verdict::single(
                    Outcome::Ignore,
                    format!(
                        "The {} probability ({:.3}) is greater than {:.3} so not triggering",
                        label, p, band.max
                    ),
                ));
            }
            if p < band.min {
                return Ok(Verdict::single(
                    Outcome::Ignore,
                    format!(
                        "The {} probability ({:.3}) is less than {:.3} so not triggering",
                        label, p, band.min
                    ),
                ));
            }
        }

        if metrics.significant == Some(true) && !t.observe_significant {
            return Ok(Verdict::single(
                Outcome::Ignore,
                "The event is significant and this proposal does not observe significant events so not triggering",
            ));
        }

        Ok(Verdict::single(
            Outcome::Trigger,
            "The probability looks good so triggering",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{fixtures as alerts, SourceMetrics};
    use crate::policy::fixtures as policies;
    use crate::rules::test_context;

    fn run_at(alert: &AlertRecord, minutes_after: i64) -> Result<Verdict, TriggerError> {
        let now = alert.observed + chrono::Duration::minutes(minutes_after);
        GwRule.evaluate(alert, &policies::mwa_gw(), &test_context(now))
    }

    fn set_metrics(alert: &mut AlertRecord, f: impl FnOnce(&mut crate::alert::GwMetrics)) {
        if let SourceMetrics::Gw(m) = &mut alert.metrics {
            f(m);
        }
    }

    #[test]
    fn single_detector_is_ignored() {
        let mut alert = alerts::gw("S1", "Preliminary");
        set_metrics(&mut alert, |m| m.instruments = Some("H1".into()));
        let v = run_at(&alert, 1).unwrap();
        assert_eq!(v.outcome, Outcome::Ignore);
        assert!(v.reasons[0].contains("Only 1"));
    }

    #[test]
    fn four_hour_old_event_is_ignored() {
        let alert = alerts::gw("S2", "Preliminary");
        let v = run_at(&alert, 240).unwrap();
        assert_eq!(v.outcome, Outcome::Ignore);
        assert!(v.reasons[0].contains("hours old"));
    }

    #[test]
    fn early_warning_triggers_without_probabilities() {
        let mut alert = alerts::gw("S3", "EarlyWarning");
        set_metrics(&mut alert, |m| {
            m.prob_ns = None;
            m.far = Some("garbage".into());
        });
        let v = run_at(&alert, 1).unwrap();
        assert_eq!(v.outcome, Outcome::Trigger);
        assert_eq!(v.reasons, vec!["Early warning, no information so triggering"]);
    }

    #[test]
    fn notices_from_other_networks_are_ignored() {
        let mut alert = alerts::gw("S8", "EarlyWarning");
        alert.telescope = "KAGRA".into();
        let v = run_at(&alert, 1).unwrap();
        assert_eq!(v.outcome, Outcome::Ignore);
        assert!(v.reasons[0].contains("KAGRA"));
    }

    #[test]
    fn retraction_triggers_no_capture() {
        let v = run_at(&alerts::gw("S4", "Retraction"), 1).unwrap();
        assert_eq!(v.outcome, Outcome::Trigger);
        assert!(v.reasons[0].starts_with("Retraction"));
    }

    #[test]
    fn high_false_alarm_rate_is_ignored() {
        let mut alert = alerts::gw("S5", "Initial");
        set_metrics(&mut alert, |m| m.far = Some("3.2e-5".into()));
        let v = run_at(&alert, 1).unwrap();
        assert_eq!(v.outcome, Outcome::Ignore);
        assert!(v.reasons[0].contains("FAR"));
    }

    #[test]
    fn unparsable_false_alarm_rate_is_an_error() {
        let mut alert = alerts::gw("S6", "Initial");
        set_metrics(&mut alert, |m| m.far = Some("n/a".into()));
        assert!(matches!(run_at(&alert, 1), Err(TriggerError::Validation(_))));
    }

    #[test]
    fn probability_bands_checked_in_order() {
        let mut alert = alerts::gw("S7", "Update");
        set_metrics(&mut alert, |m| {
            m.prob_ns = Some(0.0);
            m.prob_terrestrial = Some(0.99);
        });
        let v = run_at(&alert, 1).unwrap();
        assert_eq!(v.outcome, Outcome::Ignore);
        assert!(v.reasons[0].contains("PROB_NS"), "NS band is checked before terrestrial");
    }

    #[test]
    fn significant_events_need_opt_in() {
        let mut alert = alerts::gw("S8", "Preliminary");
        set_metrics(&mut alert, |m| m.significant = Some(true));
        assert_eq!(run_at(&alert, 1).unwrap().outcome, Outcome::Ignore);
    }

    #[test]
    fn good_probabilities_trigger() {
        let v = run_at(&alerts::gw("S9", "Preliminary"), 1).unwrap();
        assert_eq!(v.outcome, Outcome::Trigger);
        assert_eq!(v.reasons, vec!["The probability looks good so triggering"]);
    }
}
