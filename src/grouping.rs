// =============================================================================
// Event grouping: fold every alert sharing a trig_id into one EventGroup
// =============================================================================
//
// Groups are created on first sight of a trig_id and mutated in place by every
// later alert.  Updates are monotone: the time window only widens and the
// best-known position is only ever replaced by a present value, never nulled.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::alert::AlertRecord;
use crate::geometry::SkyPosition;
use crate::types::SourceType;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventGroup {
    pub id: Uuid,
    pub trig_id: String,
    pub source_type: SourceType,
    pub earliest_observed: DateTime<Utc>,
    pub latest_observed: DateTime<Utc>,
    /// Best-known position.
    pub position: Option<SkyPosition>,
    pub pos_error: Option<f64>,
    pub source_name: Option<String>,
    /// True when the alert that created the group was flagged unreliable.
    pub ignored: bool,
    pub alert_count: u32,
    /// Facilities that reported this event, used to name observations.
    pub telescopes: BTreeSet<String>,
}

impl EventGroup {
    fn from_alert(alert: &AlertRecord) -> Self {
        let mut telescopes = BTreeSet::new();
        telescopes.insert(alert.telescope.clone());
        Self {
            id: Uuid::new_v4(),
            trig_id: alert.trig_id.clone(),
            source_type: alert.source_type(),
            earliest_observed: alert.observed,
            latest_observed: alert.observed,
            position: alert.position,
            pos_error: alert.pos_error,
            source_name: alert.source_name.clone(),
            ignored: alert.ignored,
            alert_count: 1,
            telescopes,
        }
    }

    fn absorb(&mut self, alert: &AlertRecord) {
        if alert.observed < self.earliest_observed {
            self.earliest_observed = alert.observed;
        }
        if alert.observed > self.latest_observed {
            self.latest_observed = alert.observed;
        }
        if let Some(pos) = alert.position {
            self.position = Some(pos);
        }
        if let Some(err) = alert.pos_error {
            self.pos_error = Some(err);
        }
        if self.source_name.is_none() {
            self.source_name = alert.source_name.clone();
        }
        self.telescopes.insert(alert.telescope.clone());
        self.alert_count += 1;
    }

    /// Observation name: reporting telescopes joined by `_`, then the trig_id.
    pub fn observation_name(&self) -> String {
        let telescopes: Vec<&str> = self.telescopes.iter().map(String::as_str).collect();
        format!("{}_{}", telescopes.join("_"), self.trig_id)
    }
}

/// Thread-safe map from trig_id to its EventGroup.
pub struct GroupingStore {
    groups: RwLock<HashMap<String, EventGroup>>,
}

impl GroupingStore {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Create or update the group for `alert.trig_id` and return a snapshot of
    /// the group after the update.
    pub fn ingest(&self, alert: &AlertRecord) -> EventGroup {
        let mut groups = self.groups.write();
        match groups.get_mut(&alert.trig_id) {
            Some(group) => {
                group.absorb(alert);
                debug!(
                    trig_id = %group.trig_id,
                    alerts = group.alert_count,
                    "event group updated"
                );
                group.clone()
            }
            None => {
                let group = EventGroup::from_alert(alert);
                info!(
                    trig_id = %group.trig_id,
                    source_type = %group.source_type,
                    ignored = group.ignored,
                    "new event group"
                );
                groups.insert(alert.trig_id.clone(), group.clone());
                group
            }
        }
    }

    pub fn get(&self, trig_id: &str) -> Option<EventGroup> {
        self.groups.read().get(trig_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }
}

impl Default for GroupingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::fixtures;

    #[test]
    fn alerts_with_same_trig_id_share_one_group() {
        let store = GroupingStore::new();
        let first = store.ingest(&fixtures::grb("GRB-1"));
        let mut second_alert = fixtures::grb("GRB-1");
        second_alert.telescope = "SWIFT".into();
        second_alert.observed = second_alert.observed + chrono::Duration::seconds(30);
        let second = store.ingest(&second_alert);

        assert_eq!(store.len(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(second.alert_count, 2);
        assert_eq!(second.latest_observed, second_alert.observed);
        assert_eq!(second.earliest_observed, first.earliest_observed);
        assert_eq!(second.observation_name(), "Fermi_SWIFT_GRB-1");
    }

    #[test]
    fn missing_position_never_erases_known_position() {
        let store = GroupingStore::new();
        store.ingest(&fixtures::grb("GRB-2"));
        let mut bare = fixtures::grb("GRB-2");
        bare.position = None;
        bare.pos_error = None;
        let group = store.ingest(&bare);

        assert_eq!(group.position, Some(SkyPosition::new(120.0, -40.0)));
        assert_eq!(group.pos_error, Some(0.03));
    }

    #[test]
    fn newer_position_replaces_older() {
        let store = GroupingStore::new();
        store.ingest(&fixtures::grb("GRB-3"));
        let mut refined = fixtures::grb("GRB-3");
        refined.position = Some(SkyPosition::new(121.0, -41.0));
        refined.pos_error = Some(0.01);
        let group = store.ingest(&refined);
        assert_eq!(group.position, Some(SkyPosition::new(121.0, -41.0)));
        assert_eq!(group.pos_error, Some(0.01));
    }

    #[test]
    fn ignored_flag_comes_from_creating_alert() {
        let store = GroupingStore::new();
        let mut flagged = fixtures::grb("GRB-4");
        flagged.ignored = true;
        assert!(store.ingest(&flagged).ignored);
        assert!(store.get("GRB-4").map(|g| g.ignored).unwrap_or(false));
        assert!(!store.ingest(&fixtures::grb("GRB-5")).ignored);
    }
}
