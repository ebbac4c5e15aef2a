//! Core types for the cell event log.
//!
//! A [`LogEntry`] is one recorded cycle of a piece of material on the cell:
//! a load, a machine cycle, a wash, an inspection decision, a queue move, or
//! one of the bookkeeping events (pallet cycle, workorder finalization,
//! corrective edits). Entries are immutable once written, with the two
//! documented exceptions in [`crate::corrections`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// MARK: - Detail keys

/// Program-detail key for the operator who performed a manual action.
pub const DETAIL_OPERATOR: &str = "operator";
/// Program-detail key for a free-form operator note.
pub const DETAIL_NOTE: &str = "note";
/// Program-detail key naming the inspection type on decision entries.
pub const DETAIL_INSPECTION_TYPE: &str = "InspectionType";
/// Program-detail key carrying the serialized per-process actual path.
pub const DETAIL_ACTUAL_PATH: &str = "ActualPath";
/// Program-detail key marking an entry as invalidated (soft delete).
pub const DETAIL_INVALIDATED: &str = "PalletCycleInvalidated";
/// Program-detail key on InvalidateCycle entries listing affected counters.
pub const DETAIL_EDITED_COUNTERS: &str = "EditedCounters";

// MARK: - Log Type

/// The kind of event a [`LogEntry`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogType {
    /// Load or unload cycle at a load/unload station.
    LoadUnload,
    /// Machining cycle at a machine station.
    MachineCycle,
    /// Serial number marked on a part.
    PartMark,
    /// Workorder assigned to a material.
    OrderAssignment,
    /// Automatic inspection sampling decision.
    Inspection,
    /// Operator- or rule-forced inspection decision.
    InspectionForce,
    /// Completed inspection with a pass/fail result.
    InspectionResult,
    /// Pallet returned to the load station, closing one pallet cycle.
    PalletCycle,
    /// Workorder finalized for reporting.
    FinalizeWorkorder,
    /// Wash cycle completed.
    Wash,
    /// Material added to a queue.
    AddToQueue,
    /// Material removed from a queue.
    RemoveFromQueue,
    /// Pallet arrived at or departed a stocker.
    PalletInStocker,
    /// Pallet arrived at or departed a rotary inbound table.
    PalletOnRotaryInbound,
    /// Material on a pallet signaled for quarantine at unload.
    SignalQuarantine,
    /// Corrective edit: material swapped on a pallet mid-cycle.
    SwapMaterialOnPallet,
    /// Corrective edit: a pallet cycle's entries invalidated.
    InvalidateCycle,
    /// Free-form message from an adapter or operator.
    GeneralMessage,
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogType::LoadUnload => "LoadUnload",
            LogType::MachineCycle => "MachineCycle",
            LogType::PartMark => "PartMark",
            LogType::OrderAssignment => "OrderAssignment",
            LogType::Inspection => "Inspection",
            LogType::InspectionForce => "InspectionForce",
            LogType::InspectionResult => "InspectionResult",
            LogType::PalletCycle => "PalletCycle",
            LogType::FinalizeWorkorder => "FinalizeWorkorder",
            LogType::Wash => "Wash",
            LogType::AddToQueue => "AddToQueue",
            LogType::RemoveFromQueue => "RemoveFromQueue",
            LogType::PalletInStocker => "PalletInStocker",
            LogType::PalletOnRotaryInbound => "PalletOnRotaryInbound",
            LogType::SignalQuarantine => "SignalQuarantine",
            LogType::SwapMaterialOnPallet => "SwapMaterialOnPallet",
            LogType::InvalidateCycle => "InvalidateCycle",
            LogType::GeneralMessage => "GeneralMessage",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for LogType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "LoadUnload" => LogType::LoadUnload,
            "MachineCycle" => LogType::MachineCycle,
            "PartMark" => LogType::PartMark,
            "OrderAssignment" => LogType::OrderAssignment,
            "Inspection" => LogType::Inspection,
            "InspectionForce" => LogType::InspectionForce,
            "InspectionResult" => LogType::InspectionResult,
            "PalletCycle" => LogType::PalletCycle,
            "FinalizeWorkorder" => LogType::FinalizeWorkorder,
            "Wash" => LogType::Wash,
            "AddToQueue" => LogType::AddToQueue,
            "RemoveFromQueue" => LogType::RemoveFromQueue,
            "PalletInStocker" => LogType::PalletInStocker,
            "PalletOnRotaryInbound" => LogType::PalletOnRotaryInbound,
            "SignalQuarantine" => LogType::SignalQuarantine,
            "SwapMaterialOnPallet" => LogType::SwapMaterialOnPallet,
            "InvalidateCycle" => LogType::InvalidateCycle,
            _ => LogType::GeneralMessage,
        })
    }
}

// MARK: - Materials

/// Material reference supplied by an adapter when recording an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMaterial {
    /// Material identity. Negative values denote unassigned/ephemeral
    /// material with no registry record.
    pub material_id: i64,
    /// Process number this event applies to (1-based).
    pub process: i32,
    /// Pallet face the material occupies, empty when not applicable.
    pub face: String,
}

impl EventMaterial {
    /// Convenience constructor with an empty face.
    pub fn new(material_id: i64, process: i32) -> Self {
        Self {
            material_id,
            process,
            face: String::new(),
        }
    }
}

/// Material snapshot stored on a log entry, resolved from the identity
/// registry at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMaterial {
    /// Material identity.
    pub material_id: i64,
    /// Job unique the material was assigned to at event time.
    pub job_unique: String,
    /// Part name at event time.
    pub part_name: String,
    /// Process number this event applies to.
    pub process: i32,
    /// Total process count of the material's job.
    pub num_processes: i32,
    /// Pallet face.
    pub face: String,
    /// Serial at event time, if one had been recorded.
    pub serial: Option<String>,
    /// Workorder at event time, if one had been recorded.
    pub workorder: Option<String>,
}

// MARK: - Tools

/// Per-tool usage attributed to one machine cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    /// Cutting time consumed during this cycle.
    pub use_during_cycle: Duration,
    /// Total accumulated use at the end of the cycle.
    pub total_use_at_end_of_cycle: Duration,
    /// Configured tool life.
    pub configured_life: Duration,
    /// Whether a tool change happened mid-cycle.
    pub tool_change_occurred: bool,
}

/// Tool-pocket snapshot taken at machine-cycle start and end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSnapshot {
    /// Pocket number in the magazine.
    pub pocket: i32,
    /// Tool name in the pocket.
    pub tool: String,
    /// Accumulated use at snapshot time.
    pub current_use: Duration,
    /// Configured life of the tool.
    pub tool_life: Duration,
}

// MARK: - Log Entry

/// One event in the cell log. Immutable once created, except for the two
/// sanctioned corrective edits (see [`crate::corrections`]).
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Store-assigned counter: strictly increasing, unique, never reused.
    /// Defines the canonical event order.
    pub counter: i64,
    /// Material snapshots valid at event time.
    pub material: Vec<LogMaterial>,
    /// Pallet, empty for non-pallet events.
    pub pallet: String,
    /// Event kind.
    pub log_type: LogType,
    /// Station or queue name; semantics depend on `log_type`.
    pub location_name: String,
    /// Station or queue position number.
    pub location_num: i32,
    /// Program name, counter string, or operation name.
    pub program: String,
    /// Whether this entry marks the start of a cycle.
    pub start_of_cycle: bool,
    /// Event time (UTC).
    pub end_time: DateTime<Utc>,
    /// Result string; semantics depend on `log_type`.
    pub result: String,
    /// Whether the material completed its final process with this event.
    pub end_of_route: bool,
    /// Wall-clock time of the cycle; `None` when not applicable.
    pub elapsed: Option<Duration>,
    /// Busy (machining/operation) time, zero when not applicable.
    pub active: Duration,
    /// Free-form key/value sidecar.
    pub details: HashMap<String, String>,
    /// Per-tool usage attributed to this entry (machine-cycle end only).
    pub tools: BTreeMap<String, ToolUse>,
    /// Adapter-supplied idempotency/resume key.
    pub foreign_id: Option<String>,
    /// Raw adapter message this entry was translated from.
    pub original_message: Option<String>,
}

impl LogEntry {
    /// Whether this entry has been soft-deleted by a cycle invalidation.
    pub fn is_invalidated(&self) -> bool {
        self.details.contains_key(DETAIL_INVALIDATED)
    }
}

// MARK: - Material details

/// Mutable identity record for one material, keyed by material id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialDetails {
    /// Material identity (monotonically allocated, never reused).
    pub material_id: i64,
    /// Job unique, `None` for unassigned castings.
    pub job_unique: Option<String>,
    /// Part (or casting) name.
    pub part_name: Option<String>,
    /// Total process count of the assigned job.
    pub num_processes: i32,
    /// Last recorded serial.
    pub serial: Option<String>,
    /// Last recorded workorder.
    pub workorder: Option<String>,
    /// Routing path taken at each process, keyed by process number.
    pub paths: BTreeMap<i32, i32>,
}

// MARK: - Queues

/// One material's placement in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMaterial {
    /// Material identity.
    pub material_id: i64,
    /// Queue name.
    pub queue: String,
    /// 0-based dense position within the queue.
    pub position: i32,
    /// When the material entered the queue.
    pub add_time: DateTime<Utc>,
    /// Job unique of the material, for reporting.
    pub job_unique: Option<String>,
    /// Part name of the material, for reporting.
    pub part_name: Option<String>,
    /// Process count of the material's job.
    pub num_processes: i32,
}

// MARK: - Inspections

/// A sampling rule for one inspection type along a routing path.
///
/// Exactly one of `max_val` (count-based) or `random_freq` (frequency-based)
/// drives the decision; `time_interval` escalates either when too much time
/// has passed since the last signal.
#[derive(Debug, Clone, PartialEq)]
pub struct PathInspection {
    /// Inspection type name.
    pub inspection_type: String,
    /// Counter template with `%palN%`, `%loadN%`, `%unloadN%` and
    /// `%statN,K%` placeholders expanded against the material's actual path.
    pub counter: String,
    /// Count-based threshold; signal every `max_val` pieces when > 0.
    pub max_val: i32,
    /// Frequency-based sampling probability in `[0, 1]`, used when
    /// `max_val` is zero.
    pub random_freq: f64,
    /// Escalation interval; zero disables time-based escalation.
    pub time_interval: Duration,
}

/// A sampling decision reconstructed from Inspection/InspectionForce entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionDecision {
    /// Material the decision applies to.
    pub material_id: i64,
    /// Inspection type name.
    pub inspection_type: String,
    /// Expanded counter the decision was drawn from, empty for forced
    /// decisions.
    pub counter: String,
    /// Whether the piece is to be inspected.
    pub inspect: bool,
    /// Whether the decision was forced rather than sampled.
    pub forced: bool,
    /// When the decision was recorded.
    pub create_time: DateTime<Utc>,
}

/// One machine stop on a material's actual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    /// Station group name.
    pub station_group: String,
    /// Station number within the group.
    pub station_num: i32,
}

/// The route a material actually took for one process, reconstructed from
/// its log entries. Serialized into the `ActualPath` detail on decision
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualPath {
    /// Material identity.
    pub material_id: i64,
    /// Process number.
    pub process: i32,
    /// Pallet the material rode for this process.
    pub pallet: String,
    /// Load station number, zero if never loaded.
    pub load_station: i32,
    /// Unload station number, zero if never unloaded.
    pub unload_station: i32,
    /// Machine stops in order.
    pub stops: Vec<Stop>,
}

/// Station kind for next-piece inspection requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationKind {
    /// Load/unload station.
    LoadUnload,
    /// Machine station.
    Machine,
}

impl std::fmt::Display for StationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StationKind::LoadUnload => write!(f, "LoadUnload"),
            StationKind::Machine => write!(f, "Machine"),
        }
    }
}

impl std::str::FromStr for StationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Machine" => Ok(StationKind::Machine),
            _ => Ok(StationKind::LoadUnload),
        }
    }
}

/// A station identity used to key next-piece inspection requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NextPieceStation {
    /// Station kind.
    pub station: StationKind,
    /// Station number.
    pub num: i32,
}

// MARK: - Time helpers

/// Format a timestamp for storage. Fixed-width RFC 3339 with millisecond
/// precision so lexicographic column order equals chronological order.
pub(crate) fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, falling back to now on corrupt data.
pub(crate) fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_type_round_trip() {
        let all = [
            LogType::LoadUnload,
            LogType::MachineCycle,
            LogType::PartMark,
            LogType::OrderAssignment,
            LogType::Inspection,
            LogType::InspectionForce,
            LogType::InspectionResult,
            LogType::PalletCycle,
            LogType::FinalizeWorkorder,
            LogType::Wash,
            LogType::AddToQueue,
            LogType::RemoveFromQueue,
            LogType::PalletInStocker,
            LogType::PalletOnRotaryInbound,
            LogType::SignalQuarantine,
            LogType::SwapMaterialOnPallet,
            LogType::InvalidateCycle,
            LogType::GeneralMessage,
        ];
        for ty in all {
            let parsed: LogType = ty.to_string().parse().unwrap();
            assert_eq!(parsed, ty);
        }
    }

    #[test]
    fn test_unknown_log_type_falls_back() {
        let parsed: LogType = "SomethingElse".parse().unwrap();
        assert_eq!(parsed, LogType::GeneralMessage);
    }

    #[test]
    fn test_time_round_trip_sorts() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let b = a + Duration::milliseconds(250);
        assert!(fmt_time(a) < fmt_time(b));
        assert_eq!(parse_time(&fmt_time(b)), b);
    }

    #[test]
    fn test_actual_path_json_round_trip() {
        let path = ActualPath {
            material_id: 5,
            process: 1,
            pallet: "P3".to_string(),
            load_station: 2,
            unload_station: 1,
            stops: vec![Stop {
                station_group: "MC".to_string(),
                station_num: 4,
            }],
        };
        let json = serde_json::to_string(&path).unwrap();
        let back: ActualPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
