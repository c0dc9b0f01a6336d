// Neutrino rule: Antares alerts are gated on ranking, others always trigger.

use super::{Outcome, RuleContext, TriggerRule, Verdict};
use crate::alert::AlertRecord;
use crate::error::TriggerError;
use crate::policy::Policy;

pub struct NuRule;

impl TriggerRule for NuRule {
    fn evaluate(
        &self,
        alert: &AlertRecord,
        policy: &Policy,
        _ctx: &RuleContext,
    ) -> Result<Verdict, TriggerError> {
        let metrics = alert
            .nu()
            .ok_or_else(|| TriggerError::Validation("NU rule given a non-NU alert".into()))?;

        if !alert.telescope.trim().eq_ignore_ascii_case("antares") {
            return Ok(Verdict::single(
                Outcome::Trigger,
                format!("No thresholds for {} neutrinos so triggering", alert.telescope),
            ));
        }

        let min = policy.nu.antares_min_ranking;
        let verdict = match metrics.ranking {
            Some(ranking) if ranking <= min => Verdict::single(
                Outcome::Trigger,
                format!(
                    "The Antares ranking ({}) is less than or equal to {} so triggering",
                    ranking, min
                ),
            ),
            Some(ranking) => Verdict::single(
                Outcome::Ignore,
                format!(
                    "The Antares ranking ({}) is greater than {} so not triggering",
                    ranking, min
                ),
            ),
            None => Verdict::single(Outcome::Ignore, "No Antares ranking so not triggering"),
        };
        Ok(verdict)
    }
}
