// =============================================================================
// Scheduler boundary: observation requests out, structured results back
// =============================================================================
//
// Every telescope is driven through `TelescopeScheduler`.  The response shape
// is shared: a success flag, an error map, captured stdout/stderr from the
// scheduling tool, and optionally the observation ids created.  When no id
// list is returned, ids are recovered from the tool's stderr.
// =============================================================================

mod http;

pub use http::HttpScheduler;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// Where an MWA observation points.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MwaTarget {
    /// Buffer dump: no pointing, captures what is already recorded.
    Buffer,
    Single {
        ra: f64,
        dec: f64,
        alt: Option<f64>,
        az: Option<f64>,
    },
    SubArrays {
        subarray_list: Vec<String>,
        ra: Vec<f64>,
        dec: Vec<f64>,
    },
}

#[derive(Clone, PartialEq, Serialize)]
pub struct MwaRequest {
    pub project_id: String,
    pub secure_key: String,
    pub obsname: String,
    pub creator: String,
    pub pretend: bool,
    pub buffered: bool,
    pub vcsmode: bool,
    pub freqspecs: String,
    /// Seconds per observation.
    pub exptime: u64,
    pub nobs: u32,
    pub calibrator: bool,
    pub calexptime: f64,
    pub freqres: f64,
    pub inttime: f64,
    pub avoidsun: bool,
    #[serde(flatten)]
    pub target: MwaTarget,
}

impl std::fmt::Debug for MwaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MwaRequest")
            .field("project_id", &self.project_id)
            .field("obsname", &self.obsname)
            .field("pretend", &self.pretend)
            .field("buffered", &self.buffered)
            .field("exptime", &self.exptime)
            .field("nobs", &self.nobs)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtcaBandRequest {
    pub band: String,
    pub exptime_minutes: u32,
    pub freq1: Option<u32>,
    pub freq2: Option<u32>,
}

#[derive(Clone, PartialEq, Serialize)]
pub struct AtcaRequest {
    pub project_id: String,
    pub secure_key: String,
    pub source: String,
    /// `HH:MM:SS.ss`
    pub right_ascension: String,
    /// `+DD:MM:SS.s`
    pub declination: String,
    pub bands: Vec<AtcaBandRequest>,
    /// Always `Dwell` for transient follow-up.
    pub scan_type: String,
    pub max_exptime_minutes: u32,
    pub min_exptime_minutes: u32,
    pub prioritise_source: bool,
    pub test: bool,
    pub no_time_limit: bool,
    pub no_score_limit: bool,
    pub email: Option<String>,
}

impl std::fmt::Debug for AtcaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtcaRequest")
            .field("project_id", &self.project_id)
            .field("source", &self.source)
            .field("right_ascension", &self.right_ascension)
            .field("declination", &self.declination)
            .field("bands", &self.bands)
            .field("test", &self.test)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleRequest {
    Mwa(MwaRequest),
    Atca(AtcaRequest),
}

impl ScheduleRequest {
    pub fn project_id(&self) -> &str {
        match self {
            Self::Mwa(r) => &r.project_id,
            Self::Atca(r) => &r.project_id,
        }
    }

    pub fn is_pretend(&self) -> bool {
        match self {
            Self::Mwa(r) => r.pretend,
            Self::Atca(r) => r.test,
        }
    }
}

// -----------------------------------------------------------------------------
// Responses
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: BTreeMap<String, Value>,
    #[serde(default)]
    pub schedule: ScheduleOutput,
    #[serde(default)]
    pub obsid_list: Option<Vec<Value>>,
    #[serde(default)]
    pub trigger_id: Option<Value>,
    /// ATCA returns a single schedule id here.
    #[serde(default)]
    pub id: Option<Value>,
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Placeholder id for dry runs: `P` + 4 digits.
pub fn placeholder_obsid() -> String {
    format!("P{}", 1000 + (Uuid::new_v4().as_u128() % 9000))
}

/// Local id for a successful response that names no observation.
pub fn fallback_obsid() -> String {
    Uuid::new_v4().simple().to_string()
}

impl ScheduleResponse {
    /// One message per entry in the error map.
    pub fn error_messages(&self) -> Vec<String> {
        if self.errors.is_empty() {
            return vec!["scheduler reported failure without detail".to_string()];
        }
        self.errors
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value_text(value)))
            .collect()
    }

    pub fn trigger_id(&self) -> Option<String> {
        self.trigger_id.as_ref().map(value_text)
    }

    /// Observation ids created by the request.  Falls back to the id field,
    /// then to stderr lines, in that order.
    pub fn observation_ids(&self) -> Vec<String> {
        if let Some(list) = &self.obsid_list {
            if !list.is_empty() {
                return list.iter().map(value_text).collect();
            }
        }
        if let Some(id) = &self.id {
            return vec![value_text(id)];
        }
        obsids_from_stderr(&self.schedule.stderr)
    }
}

/// Recover ids from scheduling-tool stderr.
///
/// `INFO:Schedule metadata for <id>:` yields `<id>`; a dry-run marker yields
/// a placeholder.
pub fn obsids_from_stderr(stderr: &str) -> Vec<String> {
    let mut ids = Vec::new();
    for line in stderr.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("INFO:Schedule metadata for ") {
            let id = rest.trim_end_matches(':').trim();
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        } else if line.contains("Pretending: commands not run") {
            ids.push(placeholder_obsid());
        }
    }
    ids
}

// -----------------------------------------------------------------------------
// Trait
// -----------------------------------------------------------------------------

#[async_trait]
pub trait TelescopeScheduler: Send + Sync {
    /// Submit `request`.  `Ok(None)` means the service answered with no body.
    async fn schedule(&self, request: &ScheduleRequest) -> anyhow::Result<Option<ScheduleResponse>>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub enum Reply {
        Ok(ScheduleResponse),
        Null,
        Fail(String),
        /// Never answers within any sane timeout.
        Hang,
    }

    /// Records every request and answers from a queue, defaulting to success.
    pub struct MockScheduler {
        pub requests: Mutex<Vec<ScheduleRequest>>,
        replies: Mutex<VecDeque<Reply>>,
    }

    impl MockScheduler {
        pub fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                replies: Mutex::new(VecDeque::new()),
            }
        }

        pub fn push(&self, reply: Reply) {
            self.replies.lock().push_back(reply);
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    pub fn success(ids: &[&str]) -> ScheduleResponse {
        ScheduleResponse {
            success: true,
            obsid_list: Some(ids.iter().map(|s| Value::String(s.to_string())).collect()),
            trigger_id: Some(Value::from(42)),
            ..Default::default()
        }
    }

    #[async_trait]
    impl TelescopeScheduler for MockScheduler {
        async fn schedule(
            &self,
            request: &ScheduleRequest,
        ) -> anyhow::Result<Option<ScheduleResponse>> {
            self.requests.lock().push(request.clone());
            let reply = self.replies.lock().pop_front();
            match reply {
                None => Ok(Some(success(&["1400000000"]))),
                Some(Reply::Ok(resp)) => Ok(Some(resp)),
                Some(Reply::Null) => Ok(None),
                Some(Reply::Fail(msg)) => Err(anyhow::anyhow!(msg)),
                Some(Reply::Hang) => {
                    tokio::time::sleep(std::time::Duration::from_secs(24 * 3600)).await;
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obsid_list_takes_precedence() {
        let resp = ScheduleResponse {
            success: true,
            obsid_list: Some(vec![Value::from(1_400_000_000u64), Value::from("1400000100")]),
            schedule: ScheduleOutput {
                stdout: String::new(),
                stderr: "INFO:Schedule metadata for 999:".into(),
            },
            ..Default::default()
        };
        assert_eq!(resp.observation_ids(), vec!["1400000000", "1400000100"]);
    }

    #[test]
    fn stderr_metadata_lines_yield_ids() {
        let stderr = "DEBUG:stuff\nINFO:Schedule metadata for 1400000000:\nINFO:Schedule metadata for 1400000208:\n";
        assert_eq!(obsids_from_stderr(stderr), vec!["1400000000", "1400000208"]);
    }

    #[test]
    fn dry_run_marker_yields_placeholder() {
        let ids = obsids_from_stderr("WARNING:Pretending: commands not run");
        assert_eq!(ids.len(), 1);
        let id = &ids[0];
        assert!(id.starts_with('P'));
        let digits: u32 = id[1..].parse().unwrap();
        assert!((1000..=9999).contains(&digits));
    }

    #[test]
    fn fallback_ids_are_uuid_derived() {
        let a = fallback_obsid();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, fallback_obsid());
    }

    #[test]
    fn error_map_becomes_one_message_per_entry() {
        let raw = r#"{"success": false, "errors": {"exptime": "must be > 0", "ra": ["out of range"]}}"#;
        let resp: ScheduleResponse = serde_json::from_str(raw).unwrap();
        assert!(!resp.success);
        assert_eq!(
            resp.error_messages(),
            vec!["exptime: must be > 0".to_string(), "ra: [\"out of range\"]".to_string()]
        );
        assert!(ScheduleResponse::default().error_messages()[0].contains("without detail"));
    }

    #[test]
    fn single_target_serialises_flat() {
        let req = MwaRequest {
            project_id: "G0055".into(),
            secure_key: "k".into(),
            obsname: "SWIFT_123".into(),
            creator: "tracet".into(),
            pretend: true,
            buffered: false,
            vcsmode: true,
            freqspecs: "144,24".into(),
            exptime: 896,
            nobs: 1,
            calibrator: false,
            calexptime: 120.0,
            freqres: 10.0,
            inttime: 0.5,
            avoidsun: true,
            target: MwaTarget::Single {
                ra: 10.0,
                dec: -20.0,
                alt: Some(60.0),
                az: Some(100.0),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["ra"], 10.0);
        assert_eq!(json["obsname"], "SWIFT_123");
        assert!(!format!("{:?}", req).contains("secure_key"));
    }
}
