// =============================================================================
// Observation orchestrator: turn a "trigger" verdict into scheduled observations
// =============================================================================
//
// One orchestration walks an explicit stage sequence:
//
//   Start -> HorizonCheck -> PointingResolution -> Scheduling
//         -> Scheduled -> Persisted        (or SchedulingError)
//
// The request is immutable; the result carries the new decision state (if
// any), the audit lines written along the way, and the observations that
// were persisted.  Failures never retry automatically: they are recorded and
// left for an operator.
//
// Flows:
//   - MWA fixed position: horizon check, single pointing.
//   - MWA GW sub-arrays: buffer dump on first contact, then default or
//     sky-map sub-array pointings inside the observation window, and on
//     later alerts a repoint only when every new pointing moved.
//   - ATCA: single pointing, no horizon check.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::AlertRecord;
use crate::audit::AuditLog;
use crate::decision::{Decision, Observation, ObservationKind};
use crate::error::TriggerError;
use crate::geometry::{
    equatorial_to_horizontal, format_dec_dms, format_ra_hms, HorizontalCoord, ObserverLocation,
};
use crate::grouping::EventGroup;
use crate::policy::{AtcaSettings, MwaSettings, Policy, TelescopeSettings};
use crate::pointing::{
    default_sub_arrays, round_to_nearest_modulo_8, should_repoint, skymap_sub_arrays, Pointing,
    SubArrayPointing,
};
use crate::scheduler::{
    fallback_obsid, AtcaBandRequest, AtcaRequest, MwaRequest, MwaTarget, ScheduleRequest,
    TelescopeScheduler,
};
use crate::skymap::SkyMapSource;
use crate::store::ObservationStore;
use crate::types::{AlertRole, DecisionState, GwAlertKind, SourceType, TestMode};
use crate::visibility::{self, Visibility};

/// Exposure of a voltage buffer dump, in seconds.
const BUFFER_DUMP_EXPTIME: u64 = 8;

// =============================================================================
// Request / result
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    HorizonCheck,
    PointingResolution,
    Scheduling,
    Scheduled,
    SchedulingError,
    Persisted,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::HorizonCheck => write!(f, "HorizonCheck"),
            Self::PointingResolution => write!(f, "PointingResolution"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Scheduled => write!(f, "Scheduled"),
            Self::SchedulingError => write!(f, "SchedulingError"),
            Self::Persisted => write!(f, "Persisted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationMode {
    /// First observation for this decision.
    Initial,
    /// The position moved beyond the repointing limit; carries the reason.
    Repoint(String),
    /// A later alert for an already triggered GW decision.
    FollowUp,
}

pub struct OrchestrationRequest<'a> {
    pub policy: &'a Policy,
    pub group: &'a EventGroup,
    pub alert: &'a AlertRecord,
    pub decision: &'a Decision,
    pub mode: OrchestrationMode,
    pub now: DateTime<Utc>,
}

#[derive(Debug)]
pub struct OrchestrationResult {
    /// New decision state; `None` leaves the current state.
    pub state: Option<DecisionState>,
    pub audit: AuditLog,
    pub observations: Vec<Observation>,
    pub horizontal: Option<HorizontalCoord>,
    pub stage: Stage,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub mwa_location: ObserverLocation,
    pub atca_location: ObserverLocation,
    pub declustering_radius: f64,
    pub schedule_timeout: Duration,
    pub creator: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            mwa_location: ObserverLocation::mwa(),
            atca_location: ObserverLocation::atca(),
            declustering_radius: 10.0,
            schedule_timeout: Duration::from_secs(30),
            creator: "tracet".to_string(),
        }
    }
}

/// Decide whether requests are dry runs.  Test alerts are only accepted by
/// policies that observe both roles.
pub fn resolve_pretend(mode: TestMode, role: AlertRole) -> Result<bool, TriggerError> {
    if role == AlertRole::Test && mode != TestMode::Both {
        return Err(TriggerError::Configuration(
            "Invalid event observation and proposal setting".to_string(),
        ));
    }
    Ok(!matches!(
        (mode, role),
        (TestMode::Both | TestMode::RealOnly, AlertRole::Real)
    ))
}

/// Fit an exposure into what is left of an observation window.
///
/// Returns `(exptime, nobs)` or `None` when the window has passed.  A zero
/// window disables the check.  With `split`, a long window becomes several
/// observations of the configured length.
fn fit_to_window(age_secs: f64, window: u64, exptime: u64, split: bool) -> Option<(u64, u32)> {
    if window == 0 {
        return Some((exptime, 1));
    }
    let remaining = window as f64 - age_secs;
    if remaining <= 0.0 {
        return None;
    }
    let est = round_to_nearest_modulo_8(remaining);
    if est == 0 {
        return None;
    }
    if split && exptime > 0 && est >= exptime {
        Some((exptime, (est / exptime) as u32))
    } else {
        Some((est, 1))
    }
}

// =============================================================================
// Per-run working state
// =============================================================================

struct Run<'r, 'a> {
    req: &'r OrchestrationRequest<'a>,
    audit: AuditLog,
    observations: Vec<Observation>,
    horizontal: Option<HorizontalCoord>,
    stage: Stage,
}

impl<'r, 'a> Run<'r, 'a> {
    fn new(req: &'r OrchestrationRequest<'a>) -> Self {
        Self {
            req,
            audit: AuditLog::new(),
            observations: Vec::new(),
            horizontal: None,
            stage: Stage::Start,
        }
    }

    fn note(&mut self, message: impl Into<String>) {
        self.audit
            .push(self.req.now, Some(self.req.alert.id), message);
    }

    fn enter(&mut self, stage: Stage) {
        debug!(key = %self.req.decision.key, from = %self.stage, to = %stage, "orchestration stage");
        self.stage = stage;
    }

    fn finish(self, state: Option<DecisionState>) -> OrchestrationResult {
        OrchestrationResult {
            state,
            audit: self.audit,
            observations: self.observations,
            horizontal: self.horizontal,
            stage: self.stage,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    scheduler: Arc<dyn TelescopeScheduler>,
    skymaps: Arc<dyn SkyMapSource>,
    store: Arc<dyn ObservationStore>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<dyn TelescopeScheduler>,
        skymaps: Arc<dyn SkyMapSource>,
        store: Arc<dyn ObservationStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            scheduler,
            skymaps,
            store,
            settings,
        }
    }

    pub async fn orchestrate(&self, req: &OrchestrationRequest<'_>) -> OrchestrationResult {
        let mut run = Run::new(req);

        let outcome = match &req.policy.telescope {
            TelescopeSettings::Mwa(s) if req.policy.source_type == SourceType::Gw && s.sub_arrays => {
                self.gw_sub_arrays(&mut run, s).await
            }
            TelescopeSettings::Mwa(s) => self.fixed_mwa(&mut run, s).await,
            TelescopeSettings::Atca(s) => self.fixed_atca(&mut run, s).await,
        };

        match outcome {
            Ok(state) => {
                info!(
                    key = %req.decision.key,
                    stage = %run.stage,
                    observations = run.observations.len(),
                    "orchestration finished"
                );
                run.finish(state)
            }
            Err(e) => {
                warn!(key = %req.decision.key, stage = %run.stage, error = %e, "orchestration failed");
                run.note(e.to_string());
                let state = e.decision_state();
                run.finish(state)
            }
        }
    }

    // -------------------------------------------------------------------------
    // MWA, single fixed pointing
    // -------------------------------------------------------------------------

    async fn fixed_mwa(
        &self,
        run: &mut Run<'_, '_>,
        s: &MwaSettings,
    ) -> Result<Option<DecisionState>, TriggerError> {
        let req = run.req;
        let position = req.group.position.ok_or_else(|| {
            TriggerError::Validation("no position available to point at".to_string())
        })?;
        let pretend = resolve_pretend(req.policy.test_mode, req.alert.role)?;

        run.enter(Stage::HorizonCheck);
        let report = visibility::assess(s, position, &self.settings.mwa_location, req.now);
        run.horizontal = Some(report.start);
        if report.visibility == Visibility::Below {
            return Err(TriggerError::VisibilityRejected(report.describe(&s.name)));
        }
        run.note(report.describe(&s.name));

        run.enter(Stage::PointingResolution);
        let pointing = Pointing::Fixed {
            position,
            horizontal: Some(report.start),
        };
        let target = MwaTarget::Single {
            ra: position.ra,
            dec: position.dec,
            alt: Some(report.start.alt),
            az: Some(report.start.az),
        };
        let request = self.mwa_request(req, s, pretend, false, s.exptime, 1, target);
        let (kind, reason) = self.kind_and_reason(req);
        self.submit(run, request, Some(pointing), kind, reason, &s.name)
            .await?;
        Ok(Some(DecisionState::Triggered))
    }

    // -------------------------------------------------------------------------
    // MWA, GW sub-arrays
    // -------------------------------------------------------------------------

    async fn gw_sub_arrays(
        &self,
        run: &mut Run<'_, '_>,
        s: &MwaSettings,
    ) -> Result<Option<DecisionState>, TriggerError> {
        let req = run.req;
        let pretend = resolve_pretend(req.policy.test_mode, req.alert.role)?;
        let key = &req.decision.key;

        if self.store.observations(key).is_empty() {
            self.buffer_dump(run, s, pretend).await;
        }

        match self.store.latest_pointing(key) {
            None => self.initial_sub_arrays(run, s, pretend).await,
            Some(previous) => self.repoint_sub_arrays(run, s, pretend, previous).await,
        }
    }

    /// Always attempted on first contact; a failure is logged and the flow
    /// carries on.
    async fn buffer_dump(&self, run: &mut Run<'_, '_>, s: &MwaSettings, pretend: bool) {
        let request = self.mwa_request(
            run.req,
            s,
            pretend,
            true,
            BUFFER_DUMP_EXPTIME,
            1,
            MwaTarget::Buffer,
        );
        let outcome = self
            .submit(
                run,
                request,
                None,
                ObservationKind::BufferDump,
                "This is a buffer observation ID".to_string(),
                &s.name,
            )
            .await;
        if let Err(e) = outcome {
            run.note(format!("Buffer dump failed: {}", e));
        }
    }

    async fn initial_sub_arrays(
        &self,
        run: &mut Run<'_, '_>,
        s: &MwaSettings,
        pretend: bool,
    ) -> Result<Option<DecisionState>, TriggerError> {
        let req = run.req;
        let skymap_url = req.alert.gw().and_then(|m| m.skymap_url.clone());

        run.enter(Stage::PointingResolution);
        let (pointings, window, split, source) =
            if req.alert.gw_kind() == Some(GwAlertKind::EarlyWarning) {
                (
                    default_sub_arrays(&s.sub_array_pointings, &self.settings.mwa_location, req.now),
                    req.policy.early_observation_time_seconds,
                    false,
                    "default",
                )
            } else if let Some(url) = skymap_url {
                (
                    self.resolve_skymap(&url, req.now).await?,
                    req.policy.maximum_observation_time_seconds,
                    true,
                    "sky map",
                )
            } else {
                run.note("No sky map and not an early warning so not pointing the sub-arrays");
                return Ok(None);
            };

        let age = (req.now - req.alert.observed).num_milliseconds() as f64 / 1000.0;
        let Some((exptime, nobs)) = fit_to_window(age, window, s.exptime, split) else {
            run.note(format!(
                "Event time was {:.0} s ago which is outside the {} s observation window so not observing",
                age, window
            ));
            return Ok(None);
        };
        run.note(format!(
            "Observing the {} sub-array pointings for {} x {} s",
            source, nobs, exptime
        ));

        let request = self.mwa_request(
            req,
            s,
            pretend,
            false,
            exptime,
            nobs,
            sub_array_target(&pointings),
        );
        self.submit(
            run,
            request,
            Some(Pointing::SubArrays { pointings }),
            ObservationKind::Standard,
            format!("Sub-array observation using {} pointings", source),
            &s.name,
        )
        .await?;
        Ok(Some(DecisionState::Triggered))
    }

    async fn repoint_sub_arrays(
        &self,
        run: &mut Run<'_, '_>,
        s: &MwaSettings,
        pretend: bool,
        previous: Pointing,
    ) -> Result<Option<DecisionState>, TriggerError> {
        let req = run.req;
        let Some(url) = req.alert.gw().and_then(|m| m.skymap_url.clone()) else {
            run.note("No new sky map so keeping the current pointing");
            return Ok(None);
        };
        if !matches!(previous, Pointing::SubArrays { .. }) {
            run.note("Could not find sub array position on previous observation");
            return Ok(None);
        }

        run.enter(Stage::PointingResolution);
        let pointings = self.resolve_skymap(&url, req.now).await?;
        let radius = self.settings.declustering_radius;
        let new_positions: Vec<_> = pointings.iter().map(|p| p.position).collect();
        if !should_repoint(&previous.positions(), &new_positions, radius) {
            run.note(format!(
                "New skymap is NOT more than {} degrees from previous observation pointing",
                radius
            ));
            return Ok(Some(DecisionState::Triggered));
        }
        run.note(format!(
            "New skymap is more than {} degrees from previous observation pointing so repointing",
            radius
        ));

        let request = self.mwa_request(
            req,
            s,
            pretend,
            false,
            s.exptime,
            1,
            sub_array_target(&pointings),
        );
        self.submit(
            run,
            request,
            Some(Pointing::SubArrays { pointings }),
            ObservationKind::Repoint,
            "Repointing sub-arrays to the updated sky map".to_string(),
            &s.name,
        )
        .await?;
        Ok(Some(DecisionState::Triggered))
    }

    async fn resolve_skymap(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubArrayPointing>, TriggerError> {
        let table = self
            .skymaps
            .fetch(url)
            .await
            .map_err(|e| TriggerError::DownstreamUnavailable(format!("sky map {}: {:#}", url, e)))?;
        skymap_sub_arrays(
            &table,
            &self.settings.mwa_location,
            now,
            self.settings.declustering_radius,
        )
    }

    // -------------------------------------------------------------------------
    // ATCA
    // -------------------------------------------------------------------------

    async fn fixed_atca(
        &self,
        run: &mut Run<'_, '_>,
        s: &AtcaSettings,
    ) -> Result<Option<DecisionState>, TriggerError> {
        let req = run.req;
        let position = req.group.position.ok_or_else(|| {
            TriggerError::Validation("no position available to point at".to_string())
        })?;
        resolve_pretend(req.policy.test_mode, req.alert.role)?;
        let dry_run = req.policy.test_mode == TestMode::PretendReal;

        run.enter(Stage::PointingResolution);
        let bands = atca_bands(s);
        if bands.is_empty() {
            return Err(TriggerError::Validation(
                "no ATCA receiver bands are enabled".to_string(),
            ));
        }
        let horizontal = equatorial_to_horizontal(position, &self.settings.atca_location, req.now);
        run.horizontal = Some(horizontal);
        run.note(format!("Attempting to observe with {}", s.name));

        let request = ScheduleRequest::Atca(AtcaRequest {
            project_id: req.policy.project.project_id.clone(),
            secure_key: req.policy.project.secure_key.clone(),
            source: req.group.observation_name(),
            right_ascension: format_ra_hms(position.ra),
            declination: format_dec_dms(position.dec),
            bands,
            scan_type: "Dwell".to_string(),
            max_exptime_minutes: s.max_exptime_minutes,
            min_exptime_minutes: s.min_exptime_minutes,
            prioritise_source: s.prioritise_source,
            test: dry_run,
            no_time_limit: dry_run,
            no_score_limit: dry_run,
            email: req.policy.project.email.clone(),
        });
        let pointing = Pointing::Fixed {
            position,
            horizontal: Some(horizontal),
        };
        let (kind, reason) = self.kind_and_reason(req);
        self.submit(run, request, Some(pointing), kind, reason, &s.name)
            .await?;
        Ok(Some(DecisionState::Triggered))
    }

    // -------------------------------------------------------------------------
    // Shared pieces
    // -------------------------------------------------------------------------

    fn kind_and_reason(&self, req: &OrchestrationRequest<'_>) -> (ObservationKind, String) {
        match &req.mode {
            OrchestrationMode::Repoint(reason) => (ObservationKind::Repoint, reason.clone()),
            _ => (
                ObservationKind::Standard,
                format!("Triggered observation of {}", req.group.trig_id),
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mwa_request(
        &self,
        req: &OrchestrationRequest<'_>,
        s: &MwaSettings,
        pretend: bool,
        buffered: bool,
        exptime: u64,
        nobs: u32,
        target: MwaTarget,
    ) -> ScheduleRequest {
        ScheduleRequest::Mwa(MwaRequest {
            project_id: req.policy.project.project_id.clone(),
            secure_key: req.policy.project.secure_key.clone(),
            obsname: req.group.observation_name(),
            creator: self.settings.creator.clone(),
            pretend,
            buffered,
            vcsmode: s.vcs_mode(),
            freqspecs: s.freqspecs.clone(),
            exptime,
            nobs,
            calibrator: s.calibrator,
            calexptime: s.calexptime,
            freqres: s.freqres,
            inttime: s.inttime,
            avoidsun: true,
            target,
        })
    }

    /// Send one request and classify the reply.  On success one Observation
    /// is persisted per returned id.
    async fn submit(
        &self,
        run: &mut Run<'_, '_>,
        request: ScheduleRequest,
        pointing: Option<Pointing>,
        kind: ObservationKind,
        reason: String,
        telescope: &str,
    ) -> Result<(), TriggerError> {
        run.enter(Stage::Scheduling);
        let sent_at = Utc::now();
        let reply = tokio::time::timeout(
            self.settings.schedule_timeout,
            self.scheduler.schedule(&request),
        )
        .await;

        let response = match reply {
            Err(_) => {
                run.enter(Stage::SchedulingError);
                return Err(TriggerError::Scheduling(format!(
                    "Exception trying to schedule event: no reply within {} s",
                    self.settings.schedule_timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                run.enter(Stage::SchedulingError);
                return Err(TriggerError::Scheduling(format!(
                    "Exception trying to schedule event {:#}",
                    e
                )));
            }
            Ok(Ok(None)) => {
                run.enter(Stage::SchedulingError);
                return Err(TriggerError::Scheduling(
                    "Web API error, possible server error".to_string(),
                ));
            }
            Ok(Ok(Some(response))) => response,
        };

        if !response.success {
            run.enter(Stage::SchedulingError);
            for message in response.error_messages() {
                run.note(message);
            }
            return Err(TriggerError::Scheduling(format!(
                "{} did not accept the observation request",
                telescope
            )));
        }
        run.enter(Stage::Scheduled);

        let mut ids = response.observation_ids();
        if ids.is_empty() {
            ids.push(fallback_obsid());
        }
        let trigger_id = response.trigger_id();
        let raw = serde_json::to_value(&response).unwrap_or(serde_json::Value::Null);
        run.note(format!(
            "Observation scheduled with {}: {}",
            telescope,
            ids.join(", ")
        ));

        for obsid in ids {
            let observation = Observation {
                id: Uuid::new_v4(),
                decision_id: run.req.decision.id,
                key: run.req.decision.key.clone(),
                telescope: telescope.to_string(),
                obsid,
                trigger_id: trigger_id.clone(),
                kind,
                reason: reason.clone(),
                pointing: pointing.clone(),
                pretend: request.is_pretend(),
                request_sent_at: sent_at,
                response: raw.clone(),
            };
            self.store.append_observation(observation.clone());
            run.observations.push(observation);
        }
        run.enter(Stage::Persisted);
        Ok(())
    }
}

fn sub_array_target(pointings: &[SubArrayPointing]) -> MwaTarget {
    MwaTarget::SubArrays {
        subarray_list: pointings.iter().map(|p| p.name.clone()).collect(),
        ra: pointings.iter().map(|p| p.position.ra).collect(),
        dec: pointings.iter().map(|p| p.position.dec).collect(),
    }
}

fn atca_bands(s: &AtcaSettings) -> Vec<AtcaBandRequest> {
    let bands = [
        ("3mm", &s.band_3mm),
        ("7mm", &s.band_7mm),
        ("15mm", &s.band_15mm),
        ("4cm", &s.band_4cm),
        ("16cm", &s.band_16cm),
    ];
    bands
        .into_iter()
        .filter(|(_, band)| band.enabled)
        .map(|(name, band)| {
            // The 16cm receiver only takes its fixed centre frequency.
            let (freq1, freq2) = if name == "16cm" {
                (Some(2100), Some(2100))
            } else {
                (band.freq1, band.freq2)
            };
            AtcaBandRequest {
                band: name.to_string(),
                exptime_minutes: band.exptime_minutes,
                freq1,
                freq2,
            }
        })
        .collect()
}
