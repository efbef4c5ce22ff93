use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, WriteBytesExt};

use shared::{ScopeNode, SignalDescriptor, TimeNs, Timescale, TraceMetadata};

use crate::error::EngineError;
use crate::indexing::IndexingCoordinator;
use crate::parser::{ChunkOutcome, ParserEngine, QueryParams, QueryPlan, RawResultDescriptor};
use crate::source::TraceSource;

// ===== SIMULATION ENGINE =====
//
// An in-process `ParserEngine` over a scripted trace. The "file" is a byte
// range mapped linearly onto the time domain; queries emit results in the
// exact binary record layout the decoder consumes, so the full streaming
// path (snapshot seek, progressive flushes, early stop, cancellation) is
// exercised without a native engine.

pub struct SimSignalSpec {
    pub index: u32,
    pub name: String,
    pub width: u32,
    /// `(time, value)` events, sorted by time.
    pub events: Vec<(u64, String)>,
}

pub struct SimTrace {
    pub total_ticks: u64,
    pub file_size: u64,
    pub snapshot_interval: u64,
    pub signals: Vec<SimSignalSpec>,
}

pub fn sim_trace(total_ticks: u64, file_size: u64) -> SimTrace {
    SimTrace {
        total_ticks: total_ticks.max(1),
        file_size: file_size.max(1),
        snapshot_interval: (total_ticks / 10).max(1),
        signals: Vec::new(),
    }
}

/// Specs are `(index, name, width, events)`.
pub fn sim_trace_with_events(
    total_ticks: u64,
    file_size: u64,
    specs: &[(u32, &str, u32, &[(u64, &str)])],
) -> SimTrace {
    let mut trace = sim_trace(total_ticks, file_size);
    trace.signals = specs
        .iter()
        .map(|(index, name, width, events)| {
            let mut events: Vec<(u64, String)> = events
                .iter()
                .map(|(time, value)| (*time, (*value).to_string()))
                .collect();
            events.sort_by_key(|(time, _)| *time);
            SimSignalSpec {
                index: *index,
                name: (*name).to_string(),
                width: (*width).max(1),
                events,
            }
        })
        .collect();
    trace
}

/// Observable engine counters, shareable before the engine moves into a
/// worker task.
#[derive(Clone)]
pub struct SimStats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    queries_begun: AtomicU64,
    query_chunks: AtomicU64,
    index_chunks: AtomicU64,
    first_query_offset: AtomicU64,
}

impl SimStats {
    pub fn queries_begun(&self) -> u64 {
        self.inner.queries_begun.load(Ordering::SeqCst)
    }

    pub fn query_chunks(&self) -> u64 {
        self.inner.query_chunks.load(Ordering::SeqCst)
    }

    pub fn index_chunks(&self) -> u64 {
        self.inner.index_chunks.load(Ordering::SeqCst)
    }

    /// File offset of the first chunk of the most recent query.
    pub fn first_query_offset(&self) -> u64 {
        self.inner.first_query_offset.load(Ordering::SeqCst)
    }
}

enum SimRecord {
    Scalar { time: u64, index: u32, code: u8 },
    Vector { time: u64, index: u32, value: String },
}

struct ActiveQuery {
    params: QueryParams,
    /// Exclusive lower bound of the time range scanned so far.
    scan_time: u64,
    first_chunk: bool,
    last_emitted: HashMap<u32, u64>,
    pending: Vec<SimRecord>,
}

pub struct SimEngine {
    trace: SimTrace,
    stats: SimStats,
    open: bool,
    fail_open: bool,
    fail_index_at: Option<u64>,
    scratch_bytes: u64,
    active: Option<ActiveQuery>,
    result_buffer: Vec<u8>,
}

impl SimEngine {
    pub fn new(trace: SimTrace) -> Self {
        SimEngine {
            trace,
            stats: SimStats {
                inner: Arc::new(StatsInner::default()),
            },
            open: false,
            fail_open: false,
            fail_index_at: None,
            scratch_bytes: 0,
            active: None,
            result_buffer: Vec::new(),
        }
    }

    /// The engine will stream the whole file but never reach open state.
    pub fn failing_to_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// The engine errors once indexing reaches the given offset.
    pub fn failing_index_at(mut self, offset: u64) -> Self {
        self.fail_index_at = Some(offset);
        self
    }

    pub fn stats(&self) -> SimStats {
        self.stats.clone()
    }

    pub fn descriptors(&self) -> Vec<SignalDescriptor> {
        self.trace
            .signals
            .iter()
            .map(|spec| SignalDescriptor {
                name: spec.name.clone(),
                full_path: format!("top.{}", spec.name),
                id_code: spec.index as u64,
                width: spec.width,
                index: spec.index,
                ty: "wire".to_string(),
                msb: None,
                lsb: None,
            })
            .collect()
    }

    pub fn raw_hierarchy(&self) -> ScopeNode {
        let mut root = ScopeNode::root();
        let mut top = ScopeNode::new("top", "top");
        top.signal_indices = self.trace.signals.iter().map(|s| s.index).collect();
        top.signal_indices.sort_unstable();
        root.children.push(top);
        root
    }

    fn snapshot_count(&self) -> u32 {
        (self.trace.total_ticks / self.trace.snapshot_interval + 1) as u32
    }

    fn value_at(spec: &SimSignalSpec, time: u64) -> (u64, String) {
        spec.events
            .iter()
            .rev()
            .find(|(event_time, _)| *event_time <= time)
            .map(|(event_time, value)| (*event_time, value.clone()))
            .unwrap_or((0, "0".to_string()))
    }
}

fn time_at(total_ticks: u64, file_size: u64, offset: u64) -> u64 {
    (offset.min(file_size)).saturating_mul(total_ticks) / file_size
}

fn offset_at(total_ticks: u64, file_size: u64, time: u64) -> u64 {
    time.min(total_ticks).saturating_mul(file_size) / total_ticks
}

fn scalar_code(value: &str) -> u8 {
    match value {
        "0" => 0,
        "1" => 1,
        "z" => 3,
        _ => 2,
    }
}

impl ParserEngine for SimEngine {
    fn allocate_scratch(&mut self, size: u64) -> Result<(), EngineError> {
        self.scratch_bytes = size;
        Ok(())
    }

    fn begin_indexing(&mut self) -> Result<(), EngineError> {
        self.open = false;
        self.active = None;
        Ok(())
    }

    fn push_chunk_for_index(&mut self, offset: u64, bytes: &[u8]) -> Result<(), EngineError> {
        self.stats.inner.index_chunks.fetch_add(1, Ordering::SeqCst);
        if self.scratch_bytes != 0 && bytes.len() as u64 > self.scratch_bytes {
            return Err(EngineError::Engine(format!(
                "chunk of {} bytes exceeds scratch buffer of {}",
                bytes.len(),
                self.scratch_bytes
            )));
        }
        if let Some(fail_at) = self.fail_index_at {
            if offset + bytes.len() as u64 > fail_at {
                return Err(EngineError::Engine(format!(
                    "scripted index failure at offset {fail_at}"
                )));
            }
        }
        Ok(())
    }

    fn finish_indexing(&mut self) -> Result<(), EngineError> {
        if !self.fail_open {
            self.open = true;
        }
        Ok(())
    }

    fn get_query_plan(&mut self, t: TimeNs) -> Result<QueryPlan, EngineError> {
        if !self.open {
            return Err(EngineError::NoFileLoaded);
        }
        let interval = self.trace.snapshot_interval;
        let snapshot_index = (t.nanos() / interval).min(self.snapshot_count() as u64 - 1);
        let snapshot_time = snapshot_index * interval;
        Ok(QueryPlan {
            file_offset: offset_at(self.trace.total_ticks, self.trace.file_size, snapshot_time),
            snapshot_time: TimeNs::from_nanos(snapshot_time),
            snapshot_index: snapshot_index as u32,
        })
    }

    fn begin_query(&mut self, params: &QueryParams) -> Result<(), EngineError> {
        if !self.open {
            return Err(EngineError::NoFileLoaded);
        }
        self.stats.inner.queries_begun.fetch_add(1, Ordering::SeqCst);

        let snapshot_time = params.snapshot_index as u64 * self.trace.snapshot_interval;
        let mut pending = Vec::new();
        // Snapshot state: one record per requested signal carrying the
        // value in effect at the window start.
        for spec in &self.trace.signals {
            if !params.signal_indices.contains(&spec.index) {
                continue;
            }
            let (time, value) = Self::value_at(spec, params.t_begin.nanos());
            if spec.width == 1 {
                pending.push(SimRecord::Scalar {
                    time,
                    index: spec.index,
                    code: scalar_code(&value),
                });
            } else {
                pending.push(SimRecord::Vector {
                    time,
                    index: spec.index,
                    value,
                });
            }
        }

        self.active = Some(ActiveQuery {
            params: params.clone(),
            scan_time: snapshot_time,
            first_chunk: true,
            last_emitted: HashMap::new(),
            pending,
        });
        Ok(())
    }

    fn push_chunk_for_query(
        &mut self,
        offset: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, EngineError> {
        let total_ticks = self.trace.total_ticks;
        let file_size = self.trace.file_size;
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| EngineError::Engine("no query in progress".to_string()))?;

        if active.first_chunk {
            self.stats
                .inner
                .first_query_offset
                .store(offset, Ordering::SeqCst);
            active.first_chunk = false;
        }
        self.stats.inner.query_chunks.fetch_add(1, Ordering::SeqCst);

        let end_time = time_at(total_ticks, file_size, offset + bytes.len() as u64);
        let t_begin = active.params.t_begin.nanos();
        let t_end = active.params.t_end.nanos();
        let step = active.params.level_of_detail;

        for spec in &self.trace.signals {
            if !active.params.signal_indices.contains(&spec.index) {
                continue;
            }
            for (time, value) in &spec.events {
                if *time <= active.scan_time || *time > end_time || *time > t_end {
                    continue;
                }
                // Coalesce sub-pixel transitions when a step hint is set;
                // records at or before the window start always go through.
                if step > 0 && *time > t_begin {
                    if let Some(last) = active.last_emitted.get(&spec.index) {
                        if time - last < step as u64 {
                            continue;
                        }
                    }
                    active.last_emitted.insert(spec.index, *time);
                }
                if spec.width == 1 {
                    active.pending.push(SimRecord::Scalar {
                        time: *time,
                        index: spec.index,
                        code: scalar_code(value),
                    });
                } else {
                    active.pending.push(SimRecord::Vector {
                        time: *time,
                        index: spec.index,
                        value: value.clone(),
                    });
                }
            }
        }

        active.scan_time = end_time;
        if end_time >= t_end {
            Ok(ChunkOutcome::Done)
        } else {
            Ok(ChunkOutcome::MoreData)
        }
    }

    fn flush_query_binary(&mut self) -> Result<RawResultDescriptor, EngineError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(RawResultDescriptor::default());
        };

        let mut scalars = Vec::new();
        let mut vectors = Vec::new();
        let mut pool: Vec<u8> = Vec::new();
        for record in active.pending.drain(..) {
            match record {
                SimRecord::Scalar { time, index, code } => {
                    scalars.write_u64::<LittleEndian>(time).unwrap();
                    scalars.write_u32::<LittleEndian>(index).unwrap();
                    scalars.write_u8(code).unwrap();
                    scalars.extend_from_slice(&[0u8; 3]);
                }
                SimRecord::Vector { time, index, value } => {
                    vectors.write_u64::<LittleEndian>(time).unwrap();
                    vectors.write_u32::<LittleEndian>(index).unwrap();
                    vectors.write_u32::<LittleEndian>(pool.len() as u32).unwrap();
                    vectors
                        .write_u32::<LittleEndian>(value.len() as u32)
                        .unwrap();
                    vectors.extend_from_slice(&[0u8; 4]);
                    pool.extend_from_slice(value.as_bytes());
                }
            }
        }

        let scalar_count = (scalars.len() / 16) as u32;
        let vector_offset = scalars.len() as u32;
        let vector_count = (vectors.len() / 24) as u32;
        let pool_offset = (scalars.len() + vectors.len()) as u32;
        let pool_len = pool.len() as u32;

        self.result_buffer.clear();
        self.result_buffer.extend_from_slice(&scalars);
        self.result_buffer.extend_from_slice(&vectors);
        self.result_buffer.extend_from_slice(&pool);

        Ok(RawResultDescriptor {
            scalar_offset: 0,
            scalar_count,
            vector_offset,
            vector_count,
            pool_offset,
            pool_len,
        })
    }

    fn cancel_query(&mut self) {
        self.active = None;
    }

    fn metadata(&self) -> Result<TraceMetadata, EngineError> {
        if !self.open {
            return Err(EngineError::NoFileLoaded);
        }
        let event_count: usize = self.trace.signals.iter().map(|s| s.events.len()).sum();
        Ok(TraceMetadata {
            date: Some("2026-08-06".to_string()),
            version: Some("sim-engine 0.1".to_string()),
            timescale: Timescale::default(),
            time_begin: TimeNs::ZERO,
            time_end: TimeNs::from_nanos(self.trace.total_ticks),
            signal_count: self.trace.signals.len() as u32,
            snapshot_count: self.snapshot_count(),
            index_memory_bytes: (event_count * 16) as u64,
        })
    }

    fn signals_json(&self) -> Result<String, EngineError> {
        if !self.open {
            return Err(EngineError::NoFileLoaded);
        }
        serde_json::to_string(&self.descriptors()).map_err(|e| EngineError::Engine(e.to_string()))
    }

    fn hierarchy_json(&self) -> Result<String, EngineError> {
        if !self.open {
            return Err(EngineError::NoFileLoaded);
        }
        serde_json::to_string(&self.raw_hierarchy())
            .map_err(|e| EngineError::Engine(e.to_string()))
    }

    fn find_signal(&self, path: &str) -> Result<Option<u32>, EngineError> {
        if !self.open {
            return Err(EngineError::NoFileLoaded);
        }
        Ok(self
            .descriptors()
            .iter()
            .find(|d| d.full_path == path)
            .map(|d| d.index))
    }

    fn result_buffer(&self) -> &[u8] {
        &self.result_buffer
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
        self.active = None;
        self.result_buffer.clear();
    }
}

/// Index a simulation trace for coordinator-level tests.
pub async fn index_sim(engine: &mut SimEngine, source: &dyn TraceSource) {
    let ok = IndexingCoordinator::new(256)
        .index(engine, source, &mut |_, _| {})
        .await
        .expect("sim indexing failed");
    assert!(ok, "sim engine did not open");
}
