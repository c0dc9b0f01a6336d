// =============================================================================
// Horizon check: is a fixed-position target above the limit for the exposure?
// =============================================================================

use chrono::{DateTime, Duration, Utc};

use crate::geometry::{equatorial_to_horizontal, HorizontalCoord, ObserverLocation, SkyPosition};
use crate::policy::MwaSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Above,
    Below,
    /// Rises above the limit during the exposure.
    MarginalStart,
    /// Sets below the limit before the exposure ends.
    MarginalEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityReport {
    pub visibility: Visibility,
    pub limit: f64,
    pub start: HorizontalCoord,
    pub end: HorizontalCoord,
}

impl VisibilityReport {
    /// Audit line for this outcome, as operators expect to read it.
    pub fn describe(&self, telescope: &str) -> String {
        match self.visibility {
            Visibility::Below => format!(
                "Not triggering due to horizon limit: alt_beg {:.4} < {:.4} and alt_end {:.4} < {:.4}",
                self.start.alt, self.limit, self.end.alt, self.limit
            ),
            Visibility::MarginalStart => format!(
                "Warning: The source is below the horizon limit at the start of the observation (alt {:.4} < {:.4}) so attempting to observe with {}",
                self.start.alt, self.limit, telescope
            ),
            Visibility::MarginalEnd => format!(
                "Warning: The source will set below the horizon limit by the end of the observation (alt {:.4} < {:.4}) so attempting to observe with {}",
                self.end.alt, self.limit, telescope
            ),
            Visibility::Above => format!("Above horizon so attempting to observe with {}", telescope),
        }
    }
}

/// Compare elevation at `now` and `now + exptime` against the horizon limit.
pub fn assess(
    settings: &MwaSettings,
    position: SkyPosition,
    location: &ObserverLocation,
    now: DateTime<Utc>,
) -> VisibilityReport {
    let limit = settings.horizon_limit;
    let start = equatorial_to_horizontal(position, location, now);
    let end = equatorial_to_horizontal(
        position,
        location,
        now + Duration::seconds(settings.exptime as i64),
    );

    let visibility = match (start.alt < limit, end.alt < limit) {
        (true, true) => Visibility::Below,
        (true, false) => Visibility::MarginalStart,
        (false, true) => Visibility::MarginalEnd,
        (false, false) => Visibility::Above,
    };

    VisibilityReport {
        visibility,
        limit,
        start,
        end,
    }
}
