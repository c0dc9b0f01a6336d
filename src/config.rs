// =============================================================================
// Engine Configuration: service-level settings with atomic save
// =============================================================================
//
// Everything that is not a per-policy threshold lives here: where alerts and
// policies come from, scheduler endpoints and timeouts, concurrency limits,
// and telescope sites.  All fields carry serde defaults so an older file
// keeps loading after new fields are added.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::geometry::ObserverLocation;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_alerts_path() -> String {
    "alerts.jsonl".to_string()
}

fn default_policies_path() -> String {
    "policies.json".to_string()
}

fn default_policy_refresh_secs() -> u64 {
    60
}

fn default_store_path() -> String {
    "tracet_store.json".to_string()
}

fn default_store_save_secs() -> u64 {
    30
}

fn default_mwa_scheduler_url() -> String {
    "http://localhost:8000/trigger/mwa".to_string()
}

fn default_atca_scheduler_url() -> String {
    "http://localhost:8000/trigger/atca".to_string()
}

fn default_schedule_timeout_secs() -> u64 {
    30
}

fn default_skymap_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_orchestrations() -> usize {
    8
}

fn default_gw_max_event_age_hours() -> i64 {
    3
}

fn default_declustering_radius_deg() -> f64 {
    10.0
}

fn default_creator() -> String {
    "tracet".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // ── Inputs ──────────────────────────────────────────────────────────
    /// NDJSON alert file, or "-" for stdin.
    #[serde(default = "default_alerts_path")]
    pub alerts_path: String,
    #[serde(default = "default_policies_path")]
    pub policies_path: String,
    #[serde(default = "default_policy_refresh_secs")]
    pub policy_refresh_secs: u64,

    // ── Persistence ─────────────────────────────────────────────────────
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_store_save_secs")]
    pub store_save_secs: u64,

    // ── Schedulers ──────────────────────────────────────────────────────
    #[serde(default = "default_mwa_scheduler_url")]
    pub mwa_scheduler_url: String,
    #[serde(default = "default_atca_scheduler_url")]
    pub atca_scheduler_url: String,
    /// Upper bound on a single scheduling call.
    #[serde(default = "default_schedule_timeout_secs")]
    pub schedule_timeout_secs: u64,
    #[serde(default = "default_skymap_timeout_secs")]
    pub skymap_timeout_secs: u64,
    /// Name recorded as the creator of every request.
    #[serde(default = "default_creator")]
    pub creator: String,

    // ── Engine ──────────────────────────────────────────────────────────
    #[serde(default = "default_max_concurrent_orchestrations")]
    pub max_concurrent_orchestrations: usize,
    #[serde(default = "default_gw_max_event_age_hours")]
    pub gw_max_event_age_hours: i64,
    #[serde(default = "default_declustering_radius_deg")]
    pub declustering_radius_deg: f64,

    // ── Sites ───────────────────────────────────────────────────────────
    #[serde(default = "ObserverLocation::mwa")]
    pub mwa_location: ObserverLocation,
    #[serde(default = "ObserverLocation::atca")]
    pub atca_location: ObserverLocation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alerts_path: default_alerts_path(),
            policies_path: default_policies_path(),
            policy_refresh_secs: default_policy_refresh_secs(),
            store_path: default_store_path(),
            store_save_secs: default_store_save_secs(),
            mwa_scheduler_url: default_mwa_scheduler_url(),
            atca_scheduler_url: default_atca_scheduler_url(),
            schedule_timeout_secs: default_schedule_timeout_secs(),
            skymap_timeout_secs: default_skymap_timeout_secs(),
            creator: default_creator(),
            max_concurrent_orchestrations: default_max_concurrent_orchestrations(),
            gw_max_event_age_hours: default_gw_max_event_age_hours(),
            declustering_radius_deg: default_declustering_radius_deg(),
            mwa_location: ObserverLocation::mwa(),
            atca_location: ObserverLocation::atca(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            policies = %config.policies_path,
            alerts = %config.alerts_path,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply `TRACET_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRACET_ALERTS") {
            self.alerts_path = v;
        }
        if let Ok(v) = std::env::var("TRACET_POLICIES") {
            self.policies_path = v;
        }
        if let Ok(v) = std::env::var("TRACET_STORE") {
            self.store_path = v;
        }
        if let Ok(v) = std::env::var("TRACET_MWA_SCHEDULER_URL") {
            self.mwa_scheduler_url = v;
        }
        if let Ok(v) = std::env::var("TRACET_ATCA_SCHEDULER_URL") {
            self.atca_scheduler_url = v;
        }
    }

    pub fn gw_max_event_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.gw_max_event_age_hours)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.schedule_timeout_secs, 30);
        assert_eq!(cfg.max_concurrent_orchestrations, 8);
        assert_eq!(cfg.gw_max_event_age(), chrono::Duration::hours(3));
        assert_eq!(cfg.declustering_radius_deg, 10.0);
        assert!((cfg.mwa_location.lat_deg + 26.703).abs() < 1e-3);
    }

    #[test]
    fn empty_object_loads_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracet_config.json");
        let mut cfg = EngineConfig::default();
        cfg.alerts_path = "-".into();
        cfg.max_concurrent_orchestrations = 2;
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(EngineConfig::load(&path).unwrap(), cfg);
    }
}
