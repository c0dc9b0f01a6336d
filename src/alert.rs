// =============================================================================
// Alert records: one parsed notice from a broker stream
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::SkyPosition;
use crate::types::{AlertRole, GwAlertKind, SourceType};

// -----------------------------------------------------------------------------
// Source-specific metrics
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrbMetrics {
    /// Fermi classifier bin with the highest probability (4 = GRB).
    #[serde(default)]
    pub most_likely_index: Option<i32>,
    #[serde(default)]
    pub detection_prob: Option<f64>,
    #[serde(default)]
    pub rate_signif: Option<f64>,
    #[serde(default)]
    pub hess_significance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GwMetrics {
    #[serde(default)]
    pub prob_ns: Option<f64>,
    #[serde(default)]
    pub prob_bns: Option<f64>,
    #[serde(default)]
    pub prob_nsbh: Option<f64>,
    #[serde(default)]
    pub prob_bbh: Option<f64>,
    #[serde(default)]
    pub prob_terrestrial: Option<f64>,
    /// Kept as the broker's string form; parsed when a rule needs it.
    #[serde(default)]
    pub far: Option<String>,
    #[serde(default)]
    pub significant: Option<bool>,
    /// Comma-separated detector list, e.g. "H1,L1,V1".
    #[serde(default)]
    pub instruments: Option<String>,
    #[serde(default)]
    pub skymap_url: Option<String>,
}

impl GwMetrics {
    pub fn instrument_count(&self) -> Option<usize> {
        self.instruments.as_ref().map(|raw| {
            raw.split(',')
                .filter(|name| !name.trim().is_empty())
                .count()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NuMetrics {
    #[serde(default)]
    pub ranking: Option<i64>,
}

/// Metrics tagged by source type.  Serialised flat alongside the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_type")]
pub enum SourceMetrics {
    #[serde(rename = "GRB")]
    Grb(GrbMetrics),
    #[serde(rename = "GW")]
    Gw(GwMetrics),
    #[serde(rename = "NU")]
    Nu(NuMetrics),
    #[serde(rename = "FS")]
    FlareStar,
}

impl SourceMetrics {
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::Grb(_) => SourceType::Grb,
            Self::Gw(_) => SourceType::Gw,
            Self::Nu(_) => SourceType::Nu,
            Self::FlareStar => SourceType::FlareStar,
        }
    }
}

// -----------------------------------------------------------------------------
// AlertRecord
// -----------------------------------------------------------------------------

/// A single parsed alert.  Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Detecting facility ("Fermi", "SWIFT", "LVC", "Antares", ...).
    pub telescope: String,
    /// Group key shared by all notices about one event.
    pub trig_id: String,
    #[serde(default)]
    pub sequence_num: Option<i64>,
    #[serde(default)]
    pub role: AlertRole,
    #[serde(default)]
    pub event_type: Option<String>,
    /// Time of the astrophysical event.
    pub observed: DateTime<Utc>,
    #[serde(default)]
    pub position: Option<SkyPosition>,
    /// Positional uncertainty radius in degrees.
    #[serde(default)]
    pub pos_error: Option<f64>,
    /// Event duration in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub source_name: Option<String>,
    /// Set upstream when the notice is known to be unreliable.
    #[serde(default)]
    pub ignored: bool,
    #[serde(flatten)]
    pub metrics: SourceMetrics,
}

impl AlertRecord {
    pub fn source_type(&self) -> SourceType {
        self.metrics.source_type()
    }

    /// Stream name, `<TELESCOPE>_<EVENT_TYPE>` upper-cased with trailing
    /// separators stripped ("SWIFT_BAT_GRB_POS", "LVC_EARLYWARNING").
    pub fn stream(&self) -> String {
        let raw = format!(
            "{}_{}",
            self.telescope,
            self.event_type.as_deref().unwrap_or_default()
        );
        raw.to_uppercase()
            .trim_end_matches(|c| c == '_' || c == '-')
            .to_string()
    }

    /// Notice kind for GW alerts; `None` for every other source type.
    pub fn gw_kind(&self) -> Option<GwAlertKind> {
        match self.metrics {
            SourceMetrics::Gw(_) => Some(
                self.event_type
                    .as_deref()
                    .map(GwAlertKind::from_event_type)
                    .unwrap_or(GwAlertKind::Other),
            ),
            _ => None,
        }
    }

    pub fn grb(&self) -> Option<&GrbMetrics> {
        match &self.metrics {
            SourceMetrics::Grb(m) => Some(m),
            _ => None,
        }
    }

    pub fn gw(&self) -> Option<&GwMetrics> {
        match &self.metrics {
            SourceMetrics::Gw(m) => Some(m),
            _ => None,
        }
    }

    pub fn nu(&self) -> Option<&NuMetrics> {
        match &self.metrics {
            SourceMetrics::Nu(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn base(trig_id: &str, metrics: SourceMetrics) -> AlertRecord {
        AlertRecord {
            id: Uuid::new_v4(),
            telescope: "Fermi".into(),
            trig_id: trig_id.into(),
            sequence_num: None,
            role: AlertRole::Real,
            event_type: Some("GBM_Gnd_Pos".into()),
            observed: Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap(),
            position: Some(SkyPosition::new(120.0, -40.0)),
            pos_error: Some(0.03),
            duration: Some(0.5),
            source_name: None,
            ignored: false,
            metrics,
        }
    }

    pub fn grb(trig_id: &str) -> AlertRecord {
        base(
            trig_id,
            SourceMetrics::Grb(GrbMetrics {
                most_likely_index: Some(4),
                detection_prob: Some(80.0),
                ..Default::default()
            }),
        )
    }

    pub fn gw(trig_id: &str, event_type: &str) -> AlertRecord {
        let mut alert = base(
            trig_id,
            SourceMetrics::Gw(GwMetrics {
                prob_ns: Some(0.9),
                prob_bns: Some(0.9),
                prob_nsbh: Some(0.05),
                prob_bbh: Some(0.0),
                prob_terrestrial: Some(0.05),
                far: Some("1.0e-10".into()),
                significant: Some(false),
                instruments: Some("H1,L1".into()),
                skymap_url: None,
            }),
        );
        alert.telescope = "LVC".into();
        alert.event_type = Some(event_type.into());
        alert.position = None;
        alert.pos_error = None;
        alert.duration = None;
        alert
    }

    pub fn nu(trig_id: &str, telescope: &str, ranking: i64) -> AlertRecord {
        let mut alert = base(
            trig_id,
            SourceMetrics::Nu(NuMetrics {
                ranking: Some(ranking),
            }),
        );
        alert.telescope = telescope.into();
        alert.event_type = Some("Alert".into());
        alert.duration = None;
        alert
    }
}
