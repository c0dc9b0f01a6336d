// =============================================================================
// Policies: operator-defined proposals binding a telescope to trigger rules
// =============================================================================
//
// Policies are loaded from a JSON file and published as an immutable
// `Arc<Vec<Policy>>` snapshot.  A refresh swaps the whole snapshot, so an
// evaluation in flight keeps the policies it started with.
//
// Every numeric field carries a serde default so that a minimal policy file
// (id, telescope class, source type) is already usable.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::geometry::HorizontalCoord;
use crate::types::{SourceType, TestMode};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_priority() -> u32 {
    1
}

fn default_repointing_limit() -> f64 {
    10.0
}

fn default_early_observation_time() -> u64 {
    900
}

fn default_event_min_duration() -> f64 {
    0.256
}

fn default_event_max_duration() -> f64 {
    1.023
}

fn default_pending_min_1() -> f64 {
    0.124
}

fn default_pending_max_1() -> f64 {
    0.255
}

fn default_pending_min_2() -> f64 {
    1.024
}

fn default_pending_max_2() -> f64 {
    2.048
}

fn default_fermi_min_prob() -> f64 {
    50.0
}

fn default_max_hess() -> f64 {
    1.0
}

fn default_antares_min_ranking() -> i64 {
    2
}

fn default_max_far() -> Option<String> {
    Some("1.00e-8".to_string())
}

fn default_ns_band() -> ProbabilityBand {
    ProbabilityBand::new(0.01, 1.0)
}

fn default_bbh_band() -> ProbabilityBand {
    ProbabilityBand::new(0.0, 1.0)
}

fn default_terrestrial_band() -> ProbabilityBand {
    ProbabilityBand::new(0.0, 0.95)
}

fn default_mwa_name() -> String {
    "MWA_VCS".to_string()
}

fn default_freqspecs() -> String {
    "144,24".to_string()
}

fn default_mwa_exptime() -> u64 {
    896
}

fn default_calexptime() -> f64 {
    120.0
}

fn default_freqres() -> f64 {
    10.0
}

fn default_inttime() -> f64 {
    0.5
}

fn default_horizon_limit() -> f64 {
    10.0
}

fn default_atca_name() -> String {
    "ATCA".to_string()
}

fn default_atca_band_minutes() -> u32 {
    60
}

fn default_atca_max_minutes() -> u32 {
    720
}

fn default_atca_min_minutes() -> u32 {
    30
}

fn default_dec_bands() -> [DeclinationBand; 2] {
    [
        DeclinationBand { min: -90.0, max: -5.0 },
        DeclinationBand { min: 5.0, max: 20.0 },
    ]
}

// =============================================================================
// Threshold blocks
// =============================================================================

/// Inclusive [min, max] window on a probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityBand {
    pub min: f64,
    pub max: f64,
}

impl ProbabilityBand {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// Inclusive declination window in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeclinationBand {
    pub min: f64,
    pub max: f64,
}

impl DeclinationBand {
    pub fn contains(&self, dec: f64) -> bool {
        dec >= self.min && dec <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrbThresholds {
    /// Skip all duration windows and trigger on any likely GRB.
    #[serde(default)]
    pub event_any_duration: bool,
    #[serde(default = "default_event_min_duration")]
    pub event_min_duration: f64,
    #[serde(default = "default_event_max_duration")]
    pub event_max_duration: f64,
    #[serde(default = "default_pending_min_1")]
    pub pending_min_duration_1: f64,
    #[serde(default = "default_pending_max_1")]
    pub pending_max_duration_1: f64,
    #[serde(default = "default_pending_min_2")]
    pub pending_min_duration_2: f64,
    #[serde(default = "default_pending_max_2")]
    pub pending_max_duration_2: f64,
    #[serde(default = "default_fermi_min_prob")]
    pub fermi_min_detection_prob: f64,
    #[serde(default)]
    pub swift_min_rate_signif: f64,
    #[serde(default)]
    pub minimum_hess_significance: f64,
    #[serde(default = "default_max_hess")]
    pub maximum_hess_significance: f64,
}

impl Default for GrbThresholds {
    fn default() -> Self {
        Self {
            event_any_duration: false,
            event_min_duration: default_event_min_duration(),
            event_max_duration: default_event_max_duration(),
            pending_min_duration_1: default_pending_min_1(),
            pending_max_duration_1: default_pending_max_1(),
            pending_min_duration_2: default_pending_min_2(),
            pending_max_duration_2: default_pending_max_2(),
            fermi_min_detection_prob: default_fermi_min_prob(),
            swift_min_rate_signif: 0.0,
            minimum_hess_significance: 0.0,
            maximum_hess_significance: default_max_hess(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GwThresholds {
    #[serde(default = "default_ns_band")]
    pub prob_ns: ProbabilityBand,
    #[serde(default = "default_ns_band")]
    pub prob_bns: ProbabilityBand,
    #[serde(default = "default_ns_band")]
    pub prob_nsbh: ProbabilityBand,
    #[serde(default = "default_bbh_band")]
    pub prob_bbh: ProbabilityBand,
    #[serde(default = "default_terrestrial_band")]
    pub prob_terrestrial: ProbabilityBand,
    /// Events with a false-alarm rate below this are ignored.
    #[serde(default)]
    pub minimum_false_alarm_rate: Option<String>,
    /// Events with a false-alarm rate above this are ignored.
    #[serde(default = "default_max_far")]
    pub maximum_false_alarm_rate: Option<String>,
    #[serde(default)]
    pub observe_significant: bool,
}

impl Default for GwThresholds {
    fn default() -> Self {
        Self {
            prob_ns: default_ns_band(),
            prob_bns: default_ns_band(),
            prob_nsbh: default_ns_band(),
            prob_bbh: default_bbh_band(),
            prob_terrestrial: default_terrestrial_band(),
            minimum_false_alarm_rate: None,
            maximum_false_alarm_rate: default_max_far(),
            observe_significant: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NuThresholds {
    /// Antares rankings at or below this trigger (1 is best).
    #[serde(default = "default_antares_min_ranking")]
    pub antares_min_ranking: i64,
}

impl Default for NuThresholds {
    fn default() -> Self {
        Self {
            antares_min_ranking: default_antares_min_ranking(),
        }
    }
}

// =============================================================================
// Telescope settings
// =============================================================================

/// Fixed (alt, az) pointings of the four MWA sub-arrays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubArrayDefaults {
    pub ne: HorizontalCoord,
    pub nw: HorizontalCoord,
    pub se: HorizontalCoord,
    pub sw: HorizontalCoord,
}

impl Default for SubArrayDefaults {
    fn default() -> Self {
        Self {
            ne: HorizontalCoord { alt: 90.0, az: 0.0 },
            nw: HorizontalCoord { alt: 66.85, az: 270.0 },
            se: HorizontalCoord { alt: 59.35, az: 219.88 },
            sw: HorizontalCoord { alt: 43.97, az: 270.0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MwaSettings {
    /// Telescope name sent to the scheduler; a `VCS` suffix selects
    /// voltage-capture mode.
    #[serde(default = "default_mwa_name")]
    pub name: String,
    #[serde(default = "default_freqspecs")]
    pub freqspecs: String,
    /// Exposure time in seconds.
    #[serde(default = "default_mwa_exptime")]
    pub exptime: u64,
    #[serde(default = "default_calexptime")]
    pub calexptime: f64,
    #[serde(default = "default_freqres")]
    pub freqres: f64,
    #[serde(default = "default_inttime")]
    pub inttime: f64,
    #[serde(default = "default_horizon_limit")]
    pub horizon_limit: f64,
    #[serde(default)]
    pub calibrator: bool,
    /// Observe GW events with four independently pointed sub-arrays.
    #[serde(default)]
    pub sub_arrays: bool,
    #[serde(default)]
    pub sub_array_pointings: SubArrayDefaults,
}

impl MwaSettings {
    pub fn vcs_mode(&self) -> bool {
        self.name.ends_with("VCS")
    }
}

impl Default for MwaSettings {
    fn default() -> Self {
        Self {
            name: default_mwa_name(),
            freqspecs: default_freqspecs(),
            exptime: default_mwa_exptime(),
            calexptime: default_calexptime(),
            freqres: default_freqres(),
            inttime: default_inttime(),
            horizon_limit: default_horizon_limit(),
            calibrator: false,
            sub_arrays: false,
            sub_array_pointings: SubArrayDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtcaBand {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_atca_band_minutes")]
    pub exptime_minutes: u32,
    /// Centre frequencies in MHz; `None` leaves the receiver default.
    #[serde(default)]
    pub freq1: Option<u32>,
    #[serde(default)]
    pub freq2: Option<u32>,
}

impl Default for AtcaBand {
    fn default() -> Self {
        Self {
            enabled: false,
            exptime_minutes: default_atca_band_minutes(),
            freq1: None,
            freq2: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtcaSettings {
    #[serde(default = "default_atca_name")]
    pub name: String,
    #[serde(default)]
    pub band_3mm: AtcaBand,
    #[serde(default)]
    pub band_7mm: AtcaBand,
    #[serde(default)]
    pub band_15mm: AtcaBand,
    #[serde(default)]
    pub band_4cm: AtcaBand,
    #[serde(default)]
    pub band_16cm: AtcaBand,
    #[serde(default = "default_atca_max_minutes")]
    pub max_exptime_minutes: u32,
    #[serde(default = "default_atca_min_minutes")]
    pub min_exptime_minutes: u32,
    #[serde(default)]
    pub prioritise_source: bool,
    #[serde(default = "default_dec_bands")]
    pub dec_bands: [DeclinationBand; 2],
}

impl Default for AtcaSettings {
    fn default() -> Self {
        Self {
            name: default_atca_name(),
            band_3mm: AtcaBand::default(),
            band_7mm: AtcaBand::default(),
            band_15mm: AtcaBand::default(),
            band_4cm: AtcaBand::default(),
            band_16cm: AtcaBand::default(),
            max_exptime_minutes: default_atca_max_minutes(),
            min_exptime_minutes: default_atca_min_minutes(),
            prioritise_source: false,
            dec_bands: default_dec_bands(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum TelescopeSettings {
    #[serde(rename = "MWA")]
    Mwa(MwaSettings),
    #[serde(rename = "ATCA")]
    Atca(AtcaSettings),
}

impl TelescopeSettings {
    pub fn name(&self) -> &str {
        match self {
            Self::Mwa(s) => &s.name,
            Self::Atca(s) => &s.name,
        }
    }

    pub fn declination_bands(&self) -> Option<&[DeclinationBand; 2]> {
        match self {
            Self::Mwa(_) => None,
            Self::Atca(s) => Some(&s.dec_bands),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Credentials for the scheduling service.  The key is never logged.
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectCredentials {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub secure_key: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl std::fmt::Debug for ProjectCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCredentials")
            .field("project_id", &self.project_id)
            .field("secure_key", &"***")
            .field("email", &self.email)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Stable identifier, e.g. "MWA_GRB_VCS".
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub telescope: TelescopeSettings,
    pub source_type: SourceType,
    /// Restrict to alerts from one facility; `None` accepts any.
    #[serde(default)]
    pub event_telescope: Option<String>,
    /// Accepted stream names (upper-case `TELESCOPE_EVENTTYPE`).
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub test_mode: TestMode,
    #[serde(default)]
    pub project: ProjectCredentials,
    #[serde(default)]
    pub maximum_position_uncertainty: Option<f64>,
    /// Separation in degrees beyond which a triggered observation is repointed.
    #[serde(default = "default_repointing_limit")]
    pub repointing_limit: f64,
    /// Window after the event for sky-map observations; 0 disables the check.
    #[serde(default)]
    pub maximum_observation_time_seconds: u64,
    /// Window after the event for early-warning observations.
    #[serde(default = "default_early_observation_time")]
    pub early_observation_time_seconds: u64,
    #[serde(default)]
    pub grb: GrbThresholds,
    #[serde(default)]
    pub gw: GwThresholds,
    #[serde(default)]
    pub nu: NuThresholds,
}

impl Policy {
    pub fn mwa(&self) -> Option<&MwaSettings> {
        match &self.telescope {
            TelescopeSettings::Mwa(s) => Some(s),
            TelescopeSettings::Atca(_) => None,
        }
    }
}

// =============================================================================
// PolicyStore
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    List(Vec<Policy>),
    Wrapped { policies: Vec<Policy> },
}

/// Read-mostly holder of the current policy snapshot.
pub struct PolicyStore {
    current: RwLock<Arc<Vec<Policy>>>,
}

impl PolicyStore {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            current: RwLock::new(Arc::new(policies)),
        }
    }

    /// Parse a policy file, either a bare array or `{"policies": [...]}`.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<Policy>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policies from {}", path.display()))?;
        let parsed: PolicyFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse policies from {}", path.display()))?;
        let mut policies = match parsed {
            PolicyFile::List(list) => list,
            PolicyFile::Wrapped { policies } => policies,
        };
        policies.sort_by_key(|p| p.priority);
        Ok(policies)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let policies = Self::read_file(path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            count = policies.len(),
            "policies loaded"
        );
        Ok(Self::new(policies))
    }

    pub fn snapshot(&self) -> Arc<Vec<Policy>> {
        self.current.read().clone()
    }

    /// Swap in a fresh snapshot from `path`.  On failure the previous
    /// snapshot stays in place.
    pub fn refresh(&self, path: impl AsRef<Path>) -> Result<usize> {
        let policies = Self::read_file(path.as_ref())?;
        let count = policies.len();
        *self.current.write() = Arc::new(policies);
        Ok(count)
    }

    /// Periodically reload `path`.  Runs until the task is dropped.
    pub async fn run_refresh(self: Arc<Self>, path: String, every: std::time::Duration) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.refresh(&path) {
                Ok(count) => info!(path = %path, count, "policies refreshed"),
                Err(e) => warn!(path = %path, error = %e, "policy refresh failed, keeping previous set"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn policy(id: &str, source_type: SourceType, telescope: TelescopeSettings) -> Policy {
        Policy {
            id: id.into(),
            description: String::new(),
            priority: 1,
            telescope,
            source_type,
            event_telescope: None,
            streams: Vec::new(),
            test_mode: TestMode::RealOnly,
            project: ProjectCredentials {
                project_id: "T001".into(),
                secure_key: "secret".into(),
                email: None,
            },
            maximum_position_uncertainty: None,
            repointing_limit: default_repointing_limit(),
            maximum_observation_time_seconds: 0,
            early_observation_time_seconds: default_early_observation_time(),
            grb: GrbThresholds::default(),
            gw: GwThresholds::default(),
            nu: NuThresholds::default(),
        }
    }

    pub fn mwa_grb() -> Policy {
        let mut p = policy(
            "MWA_GRB",
            SourceType::Grb,
            TelescopeSettings::Mwa(MwaSettings::default()),
        );
        p.streams = vec!["FERMI_GBM_GND_POS".into(), "SWIFT_BAT_GRB_POS".into()];
        p
    }

    pub fn mwa_gw() -> Policy {
        let mut p = policy(
            "MWA_GW_BNS",
            SourceType::Gw,
            TelescopeSettings::Mwa(MwaSettings {
                sub_arrays: true,
                ..MwaSettings::default()
            }),
        );
        p.event_telescope = Some("LVC".into());
        p.streams = vec![
            "LVC_EARLYWARNING".into(),
            "LVC_PRELIMINARY".into(),
            "LVC_INITIAL".into(),
            "LVC_UPDATE".into(),
            "LVC_RETRACTION".into(),
        ];
        p.maximum_observation_time_seconds = 18_000;
        p
    }

    pub fn mwa_nu() -> Policy {
        let mut p = policy(
            "MWA_NU",
            SourceType::Nu,
            TelescopeSettings::Mwa(MwaSettings::default()),
        );
        p.streams = vec!["ANTARES_ALERT".into(), "ICECUBE_ALERT".into()];
        p
    }

    pub fn atca_grb() -> Policy {
        let mut p = policy(
            "ATCA_GRB",
            SourceType::Grb,
            TelescopeSettings::Atca(AtcaSettings::default()),
        );
        p.streams = vec!["FERMI_GBM_GND_POS".into()];
        p
    }
}
