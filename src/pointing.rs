// =============================================================================
// Pointing resolution: fixed positions, default sub-arrays, sky-map sub-arrays
// =============================================================================
//
// GW follow-up with the MWA splits the array into four independently steered
// sub-arrays.  With no sky map they use fixed (alt, az) pointings; with a sky
// map the built-in sweet-spot catalogue is ranked by probability and the four
// best mutually separated pointings are taken.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TriggerError;
use crate::geometry::{
    angular_separation, horizontal_to_equatorial, HorizontalCoord, ObserverLocation, SkyPosition,
};
use crate::policy::SubArrayDefaults;
use crate::skymap::ProbabilityTable;

/// Scheduler names for the four sub-arrays, in assignment order.
pub const SUB_ARRAY_NAMES: [&str; 4] = ["all_ne", "all_nw", "all_se", "all_sw"];

/// MWA sweet-spot pointings as (number, azimuth, elevation) in degrees.
const SWEET_SPOTS: &[(u32, f64, f64)] = &[
    (1, 0.0, 90.0),
    (2, 90.0, 69.16),
    (3, 180.0, 69.16),
    (4, 270.0, 69.16),
    (5, 0.0, 69.16),
    (6, 45.0, 60.0),
    (7, 135.0, 60.0),
    (8, 225.0, 60.0),
    (9, 315.0, 60.0),
    (10, 90.0, 54.73),
    (11, 180.0, 54.73),
    (12, 270.0, 54.73),
    (13, 0.0, 54.73),
    (14, 26.57, 47.87),
    (15, 63.43, 47.87),
    (16, 116.57, 47.87),
    (17, 153.43, 47.87),
    (18, 206.57, 47.87),
    (19, 243.43, 47.87),
    (20, 296.57, 47.87),
    (21, 333.43, 47.87),
    (22, 0.0, 38.3),
    (23, 90.0, 38.3),
    (24, 180.0, 38.3),
    (25, 270.0, 38.3),
    (26, 45.0, 30.0),
    (27, 135.0, 30.0),
    (28, 225.0, 30.0),
    (29, 315.0, 30.0),
    (30, 0.0, 20.0),
    (31, 90.0, 20.0),
    (32, 180.0, 20.0),
    (33, 270.0, 20.0),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubArrayPointing {
    pub name: String,
    pub position: SkyPosition,
}

/// Where an observation was (or will be) pointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pointing {
    Fixed {
        position: SkyPosition,
        horizontal: Option<HorizontalCoord>,
    },
    SubArrays {
        pointings: Vec<SubArrayPointing>,
    },
}

impl Pointing {
    pub fn positions(&self) -> Vec<SkyPosition> {
        match self {
            Self::Fixed { position, .. } => vec![*position],
            Self::SubArrays { pointings } => pointings.iter().map(|p| p.position).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedPointing {
    pub number: u32,
    pub horizontal: HorizontalCoord,
    pub position: SkyPosition,
    /// Probability per square degree at the pointing centre.
    pub probability: f64,
}

fn label(positions: impl IntoIterator<Item = SkyPosition>) -> Vec<SubArrayPointing> {
    SUB_ARRAY_NAMES
        .iter()
        .zip(positions)
        .map(|(name, position)| SubArrayPointing {
            name: (*name).to_string(),
            position,
        })
        .collect()
}

/// The fixed sub-array pointings converted to RA/Dec at `now`.
pub fn default_sub_arrays(
    defaults: &SubArrayDefaults,
    location: &ObserverLocation,
    now: DateTime<Utc>,
) -> Vec<SubArrayPointing> {
    let ordered = [defaults.ne, defaults.nw, defaults.se, defaults.sw];
    label(
        ordered
            .into_iter()
            .map(|h| horizontal_to_equatorial(h, location, now)),
    )
}

/// Every catalogue pointing with its sky-map probability, highest first.
pub fn rank_sweet_spots(
    table: &ProbabilityTable,
    location: &ObserverLocation,
    now: DateTime<Utc>,
) -> Vec<RankedPointing> {
    let mut ranked: Vec<RankedPointing> = SWEET_SPOTS
        .iter()
        .map(|&(number, az, alt)| {
            let horizontal = HorizontalCoord { alt, az };
            let position = horizontal_to_equatorial(horizontal, location, now);
            RankedPointing {
                number,
                horizontal,
                position,
                probability: table.probability_per_deg2(position),
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    ranked
}

/// Greedy selection: walk `ranked` in order, keep a pointing unless it lies
/// within `radius` of one already kept, stop at `max`.
pub fn decluster(ranked: &[RankedPointing], radius: f64, max: usize) -> Vec<RankedPointing> {
    let mut kept: Vec<RankedPointing> = Vec::with_capacity(max);
    for candidate in ranked {
        if kept.len() == max {
            break;
        }
        let clear = kept
            .iter()
            .all(|k| angular_separation(k.position, candidate.position) >= radius);
        if clear {
            kept.push(*candidate);
        }
    }
    kept
}

/// Four declustered sky-map pointings, labelled for the scheduler.
pub fn skymap_sub_arrays(
    table: &ProbabilityTable,
    location: &ObserverLocation,
    now: DateTime<Utc>,
    radius: f64,
) -> Result<Vec<SubArrayPointing>, TriggerError> {
    let ranked = rank_sweet_spots(table, location, now);
    let chosen = decluster(&ranked, radius, SUB_ARRAY_NAMES.len());
    if chosen.len() < SUB_ARRAY_NAMES.len() {
        return Err(TriggerError::Pointing(format!(
            "only {} pointings are separated by {} deg",
            chosen.len(),
            radius
        )));
    }
    Ok(label(chosen.into_iter().map(|p| p.position)))
}

/// True only if every new pointing is at least `radius` from every previous
/// pointing.
pub fn should_repoint(previous: &[SkyPosition], new: &[SkyPosition], radius: f64) -> bool {
    new.iter().all(|n| {
        previous
            .iter()
            .all(|p| angular_separation(*n, *p) >= radius)
    })
}

/// Round seconds to the nearest multiple of 8; a remainder of 4 rounds up.
pub fn round_to_nearest_modulo_8(seconds: f64) -> u64 {
    let seconds = seconds.max(0.0);
    let remainder = seconds % 8.0;
    let rounded = if remainder >= 4.0 {
        seconds + (8.0 - remainder)
    } else {
        seconds - remainder
    };
    rounded.round() as u64
}
