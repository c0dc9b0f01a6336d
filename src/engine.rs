// =============================================================================
// Trigger engine: group alerts, evaluate every policy, route to orchestration
// =============================================================================
//
// Alerts are handled in arrival order.  For each alert the group is updated
// first, then every active policy is evaluated concurrently.  Work for one
// (trig_id, policy) pair runs under that pair's own async mutex for the whole
// evaluate-then-orchestrate sequence, so a buffer dump and a follow-up alert
// for the same pair can never interleave.  A semaphore bounds how many
// orchestrations talk to the schedulers at once.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::alert::AlertRecord;
use crate::decision::{Decision, DecisionKey};
use crate::geometry::angular_separation;
use crate::grouping::{EventGroup, GroupingStore};
use crate::orchestrator::{OrchestrationMode, OrchestrationRequest, Orchestrator};
use crate::policy::{Policy, PolicyStore};
use crate::rules::{self, Outcome, RuleContext};
use crate::store::ObservationStore;
use crate::types::{DecisionState, GwAlertKind, SourceType};

/// What one policy made of one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub key: DecisionKey,
    pub state: DecisionState,
    /// Observations created while handling this alert.
    pub observations: usize,
}

pub struct TriggerEngine {
    groups: GroupingStore,
    policies: Arc<PolicyStore>,
    store: Arc<dyn ObservationStore>,
    orchestrator: Orchestrator,
    key_locks: Mutex<HashMap<DecisionKey, Arc<tokio::sync::Mutex<()>>>>,
    permits: Semaphore,
    gw_max_event_age: chrono::Duration,
}

impl TriggerEngine {
    pub fn new(
        policies: Arc<PolicyStore>,
        store: Arc<dyn ObservationStore>,
        orchestrator: Orchestrator,
        max_concurrent_orchestrations: usize,
        gw_max_event_age: chrono::Duration,
    ) -> Self {
        Self {
            groups: GroupingStore::new(),
            policies,
            store,
            orchestrator,
            key_locks: Mutex::new(HashMap::new()),
            permits: Semaphore::new(max_concurrent_orchestrations.max(1)),
            gw_max_event_age,
        }
    }

    pub fn groups(&self) -> &GroupingStore {
        &self.groups
    }

    /// Consume alerts until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<AlertRecord>) {
        info!("trigger engine started");
        while let Some(alert) = rx.recv().await {
            let trig_id = alert.trig_id.clone();
            let outcomes = self.handle_alert(alert).await;
            let triggered = outcomes
                .iter()
                .filter(|o| o.state == DecisionState::Triggered)
                .count();
            let observations: usize = outcomes.iter().map(|o| o.observations).sum();
            let group_alerts = self.groups.get(&trig_id).map(|g| g.alert_count).unwrap_or(0);
            info!(
                trig_id = %trig_id,
                group_alerts,
                policies = outcomes.len(),
                triggered,
                observations,
                "alert processed"
            );
        }
        info!("alert channel closed, trigger engine stopping");
    }

    pub async fn handle_alert(&self, alert: AlertRecord) -> Vec<PolicyOutcome> {
        self.handle_alert_at(alert, Utc::now()).await
    }

    /// Process one alert as if the wall clock read `now`.
    pub async fn handle_alert_at(
        &self,
        alert: AlertRecord,
        now: DateTime<Utc>,
    ) -> Vec<PolicyOutcome> {
        let group = self.groups.ingest(&alert);
        if alert.ignored {
            info!(
                trig_id = %alert.trig_id,
                alert_id = %alert.id,
                "alert flagged unreliable, skipping policy evaluation"
            );
            return Vec::new();
        }

        let policies = self.policies.snapshot();
        let work = policies
            .iter()
            .map(|policy| self.process_policy(&alert, &group, policy, now));
        join_all(work).await
    }

    fn key_lock(&self, key: &DecisionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `key` once no other task holds or waits on it.
    fn release_key_lock(&self, key: &DecisionKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    async fn process_policy(
        &self,
        alert: &AlertRecord,
        group: &EventGroup,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> PolicyOutcome {
        let key = DecisionKey::new(&group.trig_id, &policy.id);
        let lock = self.key_lock(&key);
        let guard = lock.lock().await;

        let mut decision = self
            .store
            .decision(&key)
            .unwrap_or_else(|| Decision::new(key.clone(), now));
        let previous = decision.state;

        let observations = self.route(&mut decision, alert, group, policy, now).await;

        decision.updated_at = now;
        self.store.upsert_decision(&decision);

        if decision.state != previous {
            info!(
                key = %key,
                telescope = %policy.telescope.name(),
                from = %previous,
                to = %decision.state,
                code = %decision.state.code(),
                observations,
                "decision state changed"
            );
            if decision.state == DecisionState::Error {
                warn!(key = %key, reasons = %decision.reason_log.render(), "decision needs operator review");
            }
        } else {
            debug!(
                key = %key,
                state = %decision.state,
                reasons = decision.reason_log.len(),
                "decision unchanged"
            );
        }

        drop(guard);
        self.release_key_lock(&key, lock);

        PolicyOutcome {
            key,
            state: decision.state,
            observations,
        }
    }

    // -------------------------------------------------------------------------
    // Prior-state routing
    // -------------------------------------------------------------------------

    async fn route(
        &self,
        decision: &mut Decision,
        alert: &AlertRecord,
        group: &EventGroup,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> usize {
        let retraction = alert.gw_kind() == Some(GwAlertKind::Retraction);
        if retraction && decision.state != DecisionState::PendingEvaluation {
            decision.reason_log.push(
                now,
                Some(alert.id),
                format!("Retraction received, keeping the {} decision", decision.state),
            );
            return 0;
        }

        match decision.state {
            DecisionState::Cancelled => {
                decision.reason_log.push(
                    now,
                    Some(alert.id),
                    "Previous observation canceled so not observing",
                );
                0
            }
            DecisionState::AwaitingHuman => {
                decision
                    .reason_log
                    .push(now, Some(alert.id), "Awaiting human decision so not re-evaluating");
                0
            }
            DecisionState::Triggered => self.follow_up(decision, alert, group, policy, now).await,
            DecisionState::PendingEvaluation | DecisionState::Ignored | DecisionState::Error => {
                self.evaluate_fresh(decision, alert, group, policy, now).await
            }
        }
    }

    async fn evaluate_fresh(
        &self,
        decision: &mut Decision,
        alert: &AlertRecord,
        group: &EventGroup,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> usize {
        if decision.state != DecisionState::PendingEvaluation {
            decision
                .reason_log
                .push(now, Some(alert.id), "Checking new Event");
        }
        if group.position.is_some() {
            decision.position = group.position;
            decision.pos_error = group.pos_error;
        }

        let ctx = RuleContext {
            now,
            gw_max_event_age: self.gw_max_event_age,
        };
        let verdict = match rules::evaluate(alert, policy, &ctx) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %decision.key, error = %e, "rule evaluation failed");
                decision.reason_log.push(now, Some(alert.id), e.to_string());
                if let Some(state) = e.decision_state() {
                    decision.state = state;
                }
                return 0;
            }
        };

        for reason in &verdict.reasons {
            decision.reason_log.push(now, Some(alert.id), reason.as_str());
        }
        debug!(
            key = %decision.key,
            outcome = %verdict.outcome,
            near_miss = verdict.debug,
            "rules evaluated"
        );

        match verdict.outcome {
            Outcome::Ignore => {
                decision.state = DecisionState::Ignored;
                0
            }
            Outcome::Pending => {
                decision.state = DecisionState::AwaitingHuman;
                0
            }
            Outcome::Trigger => {
                decision.state = DecisionState::Triggered;
                if alert.gw_kind() == Some(GwAlertKind::Retraction) {
                    return 0;
                }
                self.orchestrate(decision, alert, group, policy, OrchestrationMode::Initial, now)
                    .await
            }
        }
    }

    async fn follow_up(
        &self,
        decision: &mut Decision,
        alert: &AlertRecord,
        group: &EventGroup,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> usize {
        let sub_arrays = policy.mwa().map(|m| m.sub_arrays).unwrap_or(false);
        if policy.source_type == SourceType::Gw && sub_arrays {
            return self
                .orchestrate(decision, alert, group, policy, OrchestrationMode::FollowUp, now)
                .await;
        }

        let (Some(new), Some(old)) = (alert.position, decision.position) else {
            decision
                .reason_log
                .push(now, Some(alert.id), "No new position so not repointing");
            return 0;
        };

        let separation = angular_separation(old, new);
        if separation > policy.repointing_limit {
            let reason = format!(
                "Repointing because separation ({:.4} deg) is greater than the repointing limit ({:.4} deg)",
                separation, policy.repointing_limit
            );
            decision.reason_log.push(now, Some(alert.id), reason.as_str());
            self.orchestrate(
                decision,
                alert,
                group,
                policy,
                OrchestrationMode::Repoint(reason),
                now,
            )
            .await
        } else {
            decision.reason_log.push(
                now,
                Some(alert.id),
                format!(
                    "Separation ({:.4} deg) is within the repointing limit ({:.4} deg) so not repointing",
                    separation, policy.repointing_limit
                ),
            );
            0
        }
    }

    async fn orchestrate(
        &self,
        decision: &mut Decision,
        alert: &AlertRecord,
        group: &EventGroup,
        policy: &Policy,
        mode: OrchestrationMode,
        now: DateTime<Utc>,
    ) -> usize {
        let Ok(_permit) = self.permits.acquire().await else {
            warn!(key = %decision.key, "orchestration permits closed");
            return 0;
        };

        let result = {
            let request = OrchestrationRequest {
                policy,
                group,
                alert,
                decision: &*decision,
                mode,
                now,
            };
            self.orchestrator.orchestrate(&request).await
        };

        decision.reason_log.extend(result.audit);
        if let Some(state) = result.state {
            decision.state = state;
        }
        if result.horizontal.is_some() {
            decision.horizontal = result.horizontal;
        }
        if !result.observations.is_empty() && group.position.is_some() {
            decision.position = group.position;
            decision.pos_error = group.pos_error;
        }
        result.observations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::fixtures as alerts;
    use crate::decision::ObservationKind;
    use crate::geometry::{horizontal_to_equatorial, HorizontalCoord, ObserverLocation};
    use crate::orchestrator::testing::StaticSkyMap;
    use crate::orchestrator::OrchestratorSettings;
    use crate::policy::fixtures as policies;
    use crate::scheduler::mock::{MockScheduler, Reply};
    use crate::scheduler::ScheduleResponse;
    use crate::store::MemoryStore;
    use crate::types::AlertRole;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 14, 0, 0).unwrap()
    }

    struct Harness {
        scheduler: Arc<MockScheduler>,
        store: Arc<MemoryStore>,
        engine: TriggerEngine,
    }

    fn harness(policies: Vec<Policy>) -> Harness {
        let scheduler = Arc::new(MockScheduler::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            scheduler.clone(),
            Arc::new(StaticSkyMap::uniform()),
            store.clone(),
            OrchestratorSettings::default(),
        );
        let engine = TriggerEngine::new(
            Arc::new(PolicyStore::new(policies)),
            store.clone(),
            orchestrator,
            4,
            chrono::Duration::hours(3),
        );
        Harness {
            scheduler,
            store,
            engine,
        }
    }

    fn grb_at(trig_id: &str, alt: f64, az: f64) -> AlertRecord {
        let mut alert = alerts::grb(trig_id);
        alert.observed = now() - chrono::Duration::seconds(30);
        alert.position = Some(horizontal_to_equatorial(
            HorizontalCoord { alt, az },
            &ObserverLocation::mwa(),
            now(),
        ));
        alert
    }

    fn decision(h: &Harness, trig_id: &str, policy_id: &str) -> Decision {
        h.store
            .decision(&DecisionKey::new(trig_id, policy_id))
            .expect("decision stored")
    }

    #[tokio::test]
    async fn visible_grb_triggers_one_observation() {
        let h = harness(vec![policies::mwa_grb()]);
        let outcomes = h.engine.handle_alert_at(grb_at("GRB1", 70.0, 30.0), now()).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].state, DecisionState::Triggered);
        assert_eq!(outcomes[0].observations, 1);
        let d = decision(&h, "GRB1", "MWA_GRB");
        assert!(d.reason_log.contains("Above horizon"));
        assert!(d.horizontal.is_some());
    }

    #[tokio::test]
    async fn key_locks_are_released_after_each_alert() {
        let h = harness(vec![policies::mwa_grb(), policies::atca_grb()]);
        h.engine.handle_alert_at(grb_at("GRB-L1", 70.0, 30.0), now()).await;
        h.engine.handle_alert_at(grb_at("GRB-L2", 70.0, 30.0), now()).await;
        assert!(h.engine.key_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn key_lock_survives_while_another_task_holds_it() {
        let h = harness(vec![policies::mwa_grb()]);
        let key = DecisionKey::new("GRB-L3", "MWA_GRB");
        let held = h.engine.key_lock(&key);
        let ours = h.engine.key_lock(&key);

        h.engine.release_key_lock(&key, ours);
        assert_eq!(h.engine.key_locks.lock().len(), 1);

        h.engine.release_key_lock(&key, held);
        assert!(h.engine.key_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn repeated_alert_does_not_duplicate_observation() {
        let h = harness(vec![policies::mwa_grb()]);
        let alert = grb_at("GRB2", 70.0, 30.0);
        h.engine.handle_alert_at(alert.clone(), now()).await;
        let second = h.engine.handle_alert_at(alert, now()).await;

        assert_eq!(second[0].state, DecisionState::Triggered);
        assert_eq!(second[0].observations, 0);
        assert_eq!(h.scheduler.calls(), 1);
        assert_eq!(h.store.observation_count(), 1);
        assert!(decision(&h, "GRB2", "MWA_GRB")
            .reason_log
            .contains("so not repointing"));
    }

    #[tokio::test]
    async fn moved_position_repoints() {
        let h = harness(vec![policies::mwa_grb()]);
        h.engine.handle_alert_at(grb_at("GRB3", 70.0, 30.0), now()).await;
        let second = h
            .engine
            .handle_alert_at(grb_at("GRB3", 45.0, 200.0), now())
            .await;

        assert_eq!(second[0].state, DecisionState::Triggered);
        assert_eq!(second[0].observations, 1);
        let observations = h
            .store
            .observations(&DecisionKey::new("GRB3", "MWA_GRB"));
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[1].kind, ObservationKind::Repoint);
        assert!(observations[1].reason.starts_with("Repointing because separation"));
    }

    #[tokio::test]
    async fn scheduler_failure_marks_error_without_observation() {
        let h = harness(vec![policies::mwa_grb()]);
        let mut errors = BTreeMap::new();
        errors.insert("obstime".to_string(), serde_json::Value::from("clashes with calibration"));
        h.scheduler.push(Reply::Ok(ScheduleResponse {
            success: false,
            errors,
            ..Default::default()
        }));

        let outcomes = h.engine.handle_alert_at(grb_at("GRB4", 70.0, 30.0), now()).await;
        assert_eq!(outcomes[0].state, DecisionState::Error);
        assert_eq!(h.store.observation_count(), 0);
        assert!(decision(&h, "GRB4", "MWA_GRB")
            .reason_log
            .contains("obstime: clashes with calibration"));
    }

    #[tokio::test]
    async fn errored_decision_is_re_evaluated_on_next_alert() {
        let h = harness(vec![policies::mwa_grb()]);
        h.scheduler.push(Reply::Null);
        h.engine.handle_alert_at(grb_at("GRB5", 70.0, 30.0), now()).await;
        let second = h.engine.handle_alert_at(grb_at("GRB5", 70.0, 30.0), now()).await;

        assert_eq!(second[0].state, DecisionState::Triggered);
        let d = decision(&h, "GRB5", "MWA_GRB");
        assert!(d.reason_log.contains("Web API error"));
        assert!(d.reason_log.contains("Checking new Event"));
    }

    #[tokio::test]
    async fn cancelled_decision_is_left_alone() {
        let h = harness(vec![policies::mwa_grb()]);
        let mut cancelled = Decision::new(DecisionKey::new("GRB6", "MWA_GRB"), now());
        cancelled.state = DecisionState::Cancelled;
        h.store.upsert_decision(&cancelled);

        let outcomes = h.engine.handle_alert_at(grb_at("GRB6", 70.0, 30.0), now()).await;
        assert_eq!(outcomes[0].state, DecisionState::Cancelled);
        assert_eq!(h.scheduler.calls(), 0);
        assert_eq!(
            decision(&h, "GRB6", "MWA_GRB").reason_log.last_message(),
            Some("Previous observation canceled so not observing")
        );
    }

    #[tokio::test]
    async fn pending_verdict_waits_for_a_human() {
        let h = harness(vec![policies::mwa_grb()]);
        let mut alert = grb_at("GRB7", 70.0, 30.0);
        alert.duration = Some(0.2);

        let first = h.engine.handle_alert_at(alert.clone(), now()).await;
        assert_eq!(first[0].state, DecisionState::AwaitingHuman);

        alert.duration = Some(0.5);
        let second = h.engine.handle_alert_at(alert, now()).await;
        assert_eq!(second[0].state, DecisionState::AwaitingHuman);
        assert_eq!(h.scheduler.calls(), 0);
    }

    #[tokio::test]
    async fn test_alert_against_real_only_policy_is_an_error() {
        let h = harness(vec![policies::mwa_grb()]);
        let mut alert = grb_at("GRB8", 70.0, 30.0);
        alert.role = AlertRole::Test;

        let outcomes = h.engine.handle_alert_at(alert, now()).await;
        assert_eq!(outcomes[0].state, DecisionState::Error);
        assert!(decision(&h, "GRB8", "MWA_GRB")
            .reason_log
            .contains("Invalid event observation and proposal setting"));
        assert_eq!(h.scheduler.calls(), 0);
    }

    #[tokio::test]
    async fn every_policy_gets_its_own_decision() {
        let h = harness(vec![policies::mwa_grb(), policies::mwa_nu()]);
        let outcomes = h.engine.handle_alert_at(grb_at("GRB9", 70.0, 30.0), now()).await;

        assert_eq!(outcomes.len(), 2);
        let nu = decision(&h, "GRB9", "MWA_NU");
        assert_eq!(nu.state, DecisionState::Ignored);
        assert!(nu.reason_log.contains("This proposal does not observe GRBs"));
        assert_eq!(decision(&h, "GRB9", "MWA_GRB").state, DecisionState::Triggered);
    }

    #[tokio::test]
    async fn gw_early_warning_then_retraction() {
        let h = harness(vec![policies::mwa_gw()]);
        let mut ew = alerts::gw("S240601a", "EarlyWarning");
        ew.observed = now() - chrono::Duration::seconds(60);
        let first = h.engine.handle_alert_at(ew, now()).await;
        assert_eq!(first[0].state, DecisionState::Triggered);
        assert_eq!(first[0].observations, 2);

        let mut retraction = alerts::gw("S240601a", "Retraction");
        retraction.observed = now() - chrono::Duration::seconds(30);
        let second = h.engine.handle_alert_at(retraction, now()).await;
        assert_eq!(second[0].state, DecisionState::Triggered);
        assert_eq!(second[0].observations, 0);
        assert_eq!(h.scheduler.calls(), 2);
    }

    #[tokio::test]
    async fn first_retraction_triggers_without_scheduling() {
        let h = harness(vec![policies::mwa_gw()]);
        let mut retraction = alerts::gw("S240601b", "Retraction");
        retraction.observed = now() - chrono::Duration::seconds(30);

        let outcomes = h.engine.handle_alert_at(retraction, now()).await;
        assert_eq!(outcomes[0].state, DecisionState::Triggered);
        assert_eq!(h.scheduler.calls(), 0);
        assert!(decision(&h, "S240601b", "MWA_GW_BNS")
            .reason_log
            .contains("Retraction, scheduling no capture observation"));
    }

    #[tokio::test]
    async fn unreliable_alert_only_updates_the_group() {
        let h = harness(vec![policies::mwa_grb()]);
        let mut alert = grb_at("GRB10", 70.0, 30.0);
        alert.ignored = true;

        let outcomes = h.engine.handle_alert_at(alert, now()).await;
        assert!(outcomes.is_empty());
        assert_eq!(h.engine.groups().len(), 1);
        assert_eq!(h.store.decision_count(), 0);
    }

    #[tokio::test]
    async fn run_drains_channel() {
        let h = harness(vec![policies::mwa_grb()]);
        let engine = Arc::new(h.engine);
        let (tx, rx) = mpsc::channel(4);
        tx.send(alerts::grb("GRB11")).await.unwrap();
        drop(tx);
        engine.clone().run(rx).await;
        assert_eq!(engine.groups().len(), 1);
        assert_eq!(h.store.decision_count(), 1);
    }
}
