use serde::{Deserialize, Serialize};

pub mod config;
pub mod format;
pub mod time;
pub mod unflatten;

pub use config::EngineConfig;
pub use time::{DurationNs, TimeNs};

// ===== MESSAGE TYPES =====

/// Messages sent from the host into the engine worker.
///
/// Every message that expects a reply carries a `request_id`; replies and
/// progress notifications echo it back so the host can correlate them.
/// `AbortQuery` and `Close` are fire-and-forget.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum UpMsg {
    Init {
        request_id: u64,
    },
    IndexFile {
        request_id: u64,
        source_handle: u64,
        file_size: u64,
    },
    Query {
        request_id: u64,
        t_begin: TimeNs,
        t_end: TimeNs,
        signal_indices: Vec<u32>,
        level_of_detail: LevelOfDetail,
    },
    AbortQuery,
    GetMetadata {
        request_id: u64,
    },
    GetSignals {
        request_id: u64,
    },
    GetHierarchy {
        request_id: u64,
    },
    FindSignal {
        request_id: u64,
        path: String,
    },
    Close,
}

/// Messages sent from the engine worker back to the host.
///
/// A query produces zero or more `QueryProgress` messages followed by
/// exactly one terminal `QueryDone`. Progress payloads are best-effort
/// partial data; the terminal message is authoritative.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum DownMsg {
    InitDone {
        request_id: u64,
        success: bool,
        error: Option<String>,
    },
    IndexProgress {
        request_id: u64,
        bytes_read: u64,
        total_bytes: u64,
    },
    IndexDone {
        request_id: u64,
        success: bool,
        error: Option<String>,
    },
    QueryProgress {
        request_id: u64,
        result: QueryResult,
    },
    QueryDone {
        request_id: u64,
        outcome: QueryOutcome,
    },
    MetadataResult {
        request_id: u64,
        metadata: TraceMetadata,
    },
    SignalsResult {
        request_id: u64,
        json: String,
    },
    HierarchyResult {
        request_id: u64,
        json: String,
    },
    FindSignalResult {
        request_id: u64,
        index: Option<u32>,
    },
    RequestFailed {
        request_id: u64,
        error: String,
    },
}

impl DownMsg {
    /// Correlation id of this message, if it carries one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            DownMsg::InitDone { request_id, .. }
            | DownMsg::IndexProgress { request_id, .. }
            | DownMsg::IndexDone { request_id, .. }
            | DownMsg::QueryProgress { request_id, .. }
            | DownMsg::QueryDone { request_id, .. }
            | DownMsg::MetadataResult { request_id, .. }
            | DownMsg::SignalsResult { request_id, .. }
            | DownMsg::HierarchyResult { request_id, .. }
            | DownMsg::FindSignalResult { request_id, .. }
            | DownMsg::RequestFailed { request_id, .. } => Some(*request_id),
        }
    }

    /// Progress messages may repeat; everything else terminates its request.
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            DownMsg::IndexProgress { .. } | DownMsg::QueryProgress { .. }
        )
    }
}

/// Terminal outcome of one query request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum QueryOutcome {
    Complete(QueryResult),
    Aborted,
    Failed(String),
}

// ===== QUERY TYPES =====

/// Pixel-time-step hint allowing the engine to coalesce sub-pixel
/// transitions before they cross the boundary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelOfDetail {
    /// Every transition is reported.
    Full,
    /// Transitions closer together than the step may be coalesced.
    PixelStep(DurationNs),
}

impl LevelOfDetail {
    /// Raw engine encoding: `-1` means no coalescing.
    pub fn as_raw(self) -> i64 {
        match self {
            LevelOfDetail::Full => -1,
            LevelOfDetail::PixelStep(step) => step.nanos() as i64,
        }
    }
}

impl Default for LevelOfDetail {
    fn default() -> Self {
        LevelOfDetail::Full
    }
}

/// One recorded change of a signal's value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValueChange {
    pub time: TimeNs,
    /// `"0"|"1"|"x"|"z"` for 1-bit signals, a bit string or opaque token
    /// for wider ones.
    pub value: String,
}

/// Per-signal slice of a query result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalQueryResult {
    pub index: u32,
    pub name: String,
    /// Value in effect at the window start.
    pub initial_value: String,
    /// Changes strictly after the window start, strictly increasing in time.
    pub transitions: Vec<ValueChange>,
}

/// Result of one time-windowed multi-signal query, one entry per requested
/// signal index, in request order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub t_begin: TimeNs,
    pub t_end: TimeNs,
    pub signals: Vec<SignalQueryResult>,
}

// ===== TRACE METADATA =====

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimescaleUnit {
    FemtoSeconds,
    PicoSeconds,
    NanoSeconds,
    MicroSeconds,
    MilliSeconds,
    Seconds,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timescale {
    pub factor: u32,
    pub unit: TimescaleUnit,
}

impl Timescale {
    /// Femtoseconds per trace tick, the finest common denominator.
    pub fn femtos_per_tick(&self) -> u64 {
        let unit = match self.unit {
            TimescaleUnit::FemtoSeconds => 1,
            TimescaleUnit::PicoSeconds => 1_000,
            TimescaleUnit::NanoSeconds => 1_000_000,
            TimescaleUnit::MicroSeconds => 1_000_000_000,
            TimescaleUnit::MilliSeconds => 1_000_000_000_000,
            TimescaleUnit::Seconds => 1_000_000_000_000_000,
            TimescaleUnit::Unknown => 1_000_000,
        };
        self.factor as u64 * unit
    }
}

impl Default for Timescale {
    fn default() -> Self {
        Timescale {
            factor: 1,
            unit: TimescaleUnit::NanoSeconds,
        }
    }
}

/// Metadata produced by indexing a trace file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TraceMetadata {
    pub date: Option<String>,
    pub version: Option<String>,
    pub timescale: Timescale,
    /// Inclusive bounds of the recorded time domain.
    pub time_begin: TimeNs,
    pub time_end: TimeNs,
    pub signal_count: u32,
    pub snapshot_count: u32,
    /// Memory the native index holds onto, in bytes.
    pub index_memory_bytes: u64,
}

// ===== SIGNAL & HIERARCHY TYPES =====

/// One signal as reported by indexing. Immutable for the lifetime of an
/// opened trace; `index` is dense and stable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub name: String,
    pub full_path: String,
    pub id_code: u64,
    pub width: u32,
    pub index: u32,
    pub ty: String,
    pub msb: Option<i32>,
    pub lsb: Option<i32>,
}

/// A display-resolved signal inside an unflattened scope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UiSignal {
    pub index: u32,
    pub name: String,
}

/// Node of a scope tree, rooted at a synthetic `<root>` node.
///
/// The engine-reported raw tree carries `signal_indices`; the derived
/// unflattened tree carries `ui_signals`. The two trees are separate
/// immutable values; the derived one is recomputed, never patched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScopeNode {
    pub name: String,
    pub full_path: String,
    #[serde(default)]
    pub signal_indices: Vec<u32>,
    #[serde(default)]
    pub ui_signals: Vec<UiSignal>,
    #[serde(default)]
    pub children: Vec<ScopeNode>,
}

pub const ROOT_SCOPE_NAME: &str = "<root>";

impl ScopeNode {
    pub fn root() -> Self {
        ScopeNode {
            name: ROOT_SCOPE_NAME.to_string(),
            full_path: String::new(),
            signal_indices: Vec::new(),
            ui_signals: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>, full_path: impl Into<String>) -> Self {
        ScopeNode {
            name: name.into(),
            full_path: full_path.into(),
            signal_indices: Vec::new(),
            ui_signals: Vec::new(),
            children: Vec::new(),
        }
    }
}

// ===== SCOPE TREE UTILITIES =====

pub fn find_scope<'a>(node: &'a ScopeNode, full_path: &str) -> Option<&'a ScopeNode> {
    if node.full_path == full_path {
        return Some(node);
    }
    for child in &node.children {
        if let Some(found) = find_scope(child, full_path) {
            return Some(found);
        }
    }
    None
}

/// Every signal index reachable at or below `node`, in tree order.
pub fn collect_signal_indices(node: &ScopeNode, out: &mut Vec<u32>) {
    out.extend(node.signal_indices.iter().copied());
    out.extend(node.ui_signals.iter().map(|s| s.index));
    for child in &node.children {
        collect_signal_indices(child, out);
    }
}

pub fn count_signals(node: &ScopeNode) -> usize {
    let mut count = node.signal_indices.len() + node.ui_signals.len();
    for child in &node.children {
        count += count_signals(child);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ScopeNode {
        let mut root = ScopeNode::root();
        let mut top = ScopeNode::new("top", "top");
        top.signal_indices = vec![0, 1];
        let mut inner = ScopeNode::new("alu", "top.alu");
        inner.signal_indices = vec![2];
        top.children.push(inner);
        root.children.push(top);
        root
    }

    #[test]
    fn collects_signals_recursively() {
        let tree = sample_tree();
        let mut indices = Vec::new();
        collect_signal_indices(&tree, &mut indices);
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(count_signals(&tree), 3);
    }

    #[test]
    fn finds_scope_by_full_path() {
        let tree = sample_tree();
        assert_eq!(find_scope(&tree, "top.alu").unwrap().name, "alu");
        assert!(find_scope(&tree, "top.missing").is_none());
    }

    #[test]
    fn down_msg_correlation_ids() {
        let msg = DownMsg::IndexProgress {
            request_id: 7,
            bytes_read: 10,
            total_bytes: 100,
        };
        assert_eq!(msg.request_id(), Some(7));
        assert!(msg.is_progress());
    }

    #[test]
    fn messages_round_trip_through_serde() {
        let msg = UpMsg::Query {
            request_id: 3,
            t_begin: TimeNs::from_nanos(100),
            t_end: TimeNs::from_nanos(500),
            signal_indices: vec![1, 2, 3],
            level_of_detail: LevelOfDetail::PixelStep(DurationNs::from_nanos(8)),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: UpMsg = serde_json::from_str(&json).unwrap();
        match back {
            UpMsg::Query {
                request_id,
                signal_indices,
                level_of_detail,
                ..
            } => {
                assert_eq!(request_id, 3);
                assert_eq!(signal_indices, vec![1, 2, 3]);
                assert_eq!(level_of_detail.as_raw(), 8);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn level_of_detail_raw_encoding() {
        assert_eq!(LevelOfDetail::Full.as_raw(), -1);
        assert_eq!(
            LevelOfDetail::PixelStep(DurationNs::from_nanos(16)).as_raw(),
            16
        );
    }
}
