// =============================================================================
// Observation store: Decision and Observation persistence
// =============================================================================
//
// `ObservationStore` is the persistence seam.  `MemoryStore` keeps everything
// in memory and can snapshot to a JSON file with the same tmp + rename write
// used for configuration, so a restart resumes with prior decisions intact.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decision::{Decision, DecisionKey, Observation};
use crate::pointing::Pointing;

pub trait ObservationStore: Send + Sync {
    fn decision(&self, key: &DecisionKey) -> Option<Decision>;

    /// Insert or replace the decision for `decision.key`.
    fn upsert_decision(&self, decision: &Decision);

    fn append_observation(&self, observation: Observation);

    /// Observations for `key` in the order they were appended.
    fn observations(&self, key: &DecisionKey) -> Vec<Observation>;

    /// Pointing of the most recent non-buffer observation for `key`.
    fn latest_pointing(&self, key: &DecisionKey) -> Option<Pointing> {
        self.observations(key)
            .into_iter()
            .rev()
            .filter(|o| o.kind != crate::decision::ObservationKind::BufferDump)
            .find_map(|o| o.pointing)
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    decisions: Vec<Decision>,
    observations: Vec<Observation>,
}

pub struct MemoryStore {
    decisions: RwLock<HashMap<DecisionKey, Decision>>,
    observations: RwLock<Vec<Observation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            decisions: RwLock::new(HashMap::new()),
            observations: RwLock::new(Vec::new()),
        }
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.read().len()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.read().len()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read store snapshot from {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse store snapshot from {}", path.display()))?;

        let decisions = snapshot
            .decisions
            .into_iter()
            .map(|d| (d.key.clone(), d))
            .collect::<HashMap<_, _>>();
        info!(
            path = %path.display(),
            decisions = decisions.len(),
            observations = snapshot.observations.len(),
            "store snapshot loaded"
        );
        Ok(Self {
            decisions: RwLock::new(decisions),
            observations: RwLock::new(snapshot.observations),
        })
    }

    /// Atomic write: serialise to a `.json.tmp` sibling, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut decisions: Vec<Decision> = self.decisions.read().values().cloned().collect();
        decisions.sort_by(|a, b| a.key.cmp(&b.key));
        let snapshot = Snapshot {
            decisions,
            observations: self.observations.read().clone(),
        };
        let content =
            serde_json::to_string_pretty(&snapshot).context("failed to serialise store snapshot")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        info!(path = %path.display(), "store snapshot saved (atomic)");
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationStore for MemoryStore {
    fn decision(&self, key: &DecisionKey) -> Option<Decision> {
        self.decisions.read().get(key).cloned()
    }

    fn upsert_decision(&self, decision: &Decision) {
        self.decisions
            .write()
            .insert(decision.key.clone(), decision.clone());
    }

    fn append_observation(&self, observation: Observation) {
        self.observations.write().push(observation);
    }

    fn observations(&self, key: &DecisionKey) -> Vec<Observation> {
        self.observations
            .read()
            .iter()
            .filter(|o| &o.key == key)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ObservationKind;
    use crate::geometry::SkyPosition;
    use crate::types::DecisionState;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn observation(key: &DecisionKey, kind: ObservationKind, ra: f64) -> Observation {
        Observation {
            id: Uuid::new_v4(),
            decision_id: Uuid::new_v4(),
            key: key.clone(),
            telescope: "MWA_VCS".into(),
            obsid: format!("obs-{}", ra),
            trigger_id: None,
            kind,
            reason: "test".into(),
            pointing: Some(Pointing::Fixed {
                position: SkyPosition::new(ra, -30.0),
                horizontal: None,
            }),
            pretend: true,
            request_sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            response: serde_json::Value::Null,
        }
    }

    #[test]
    fn upsert_replaces_by_key() {
        let store = MemoryStore::new();
        let key = DecisionKey::new("T1", "P1");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut d = Decision::new(key.clone(), now);
        store.upsert_decision(&d);
        d.state = DecisionState::Triggered;
        store.upsert_decision(&d);
        assert_eq!(store.decision_count(), 1);
        assert_eq!(store.decision(&key).map(|d| d.state), Some(DecisionState::Triggered));
    }

    #[test]
    fn latest_pointing_skips_buffer_dumps() {
        let store = MemoryStore::new();
        let key = DecisionKey::new("T2", "P1");
        store.append_observation(observation(&key, ObservationKind::Standard, 10.0));
        store.append_observation(observation(&key, ObservationKind::BufferDump, 20.0));
        store.append_observation(observation(&DecisionKey::new("T3", "P1"), ObservationKind::Standard, 30.0));
        let latest = store.latest_pointing(&key).unwrap();
        assert_eq!(latest.positions(), vec![SkyPosition::new(10.0, -30.0)]);
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = MemoryStore::new();
        let key = DecisionKey::new("T4", "P1");
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut decision = Decision::new(key.clone(), now);
        decision.reason_log.push(now, None, "Checking new Event");
        store.upsert_decision(&decision);
        store.append_observation(observation(&key, ObservationKind::Repoint, 40.0));
        store.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = MemoryStore::load(&path).unwrap();
        assert_eq!(loaded.decision(&key), Some(decision));
        assert_eq!(loaded.observations(&key).len(), 1);
    }
}
