use serde::{Deserialize, Serialize};

use shared::{TimeNs, TraceMetadata};

use crate::error::EngineError;

// ===== PARSER ENGINE SURFACE =====
//
// The native trace parser is consumed through this narrow surface and never
// reimplemented. Any concrete binding (FFI, subprocess, in-process
// simulation) implements the trait; the coordinators stay
// substrate-independent. The primitives are single-threaded and
// non-reentrant: one indexing or query operation in flight per instance.

/// Where to resume streaming for a query starting at a given time: the
/// nearest internal snapshot at or before that time and its file offset.
/// This is what makes repeated queries cheap on gigabyte files.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPlan {
    pub file_offset: u64,
    pub snapshot_time: TimeNs,
    pub snapshot_index: u32,
}

/// Parameters handed to `begin_query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    pub t_begin: TimeNs,
    pub t_end: TimeNs,
    pub signal_indices: Vec<u32>,
    pub snapshot_index: u32,
    /// Pixel-time-step in nanoseconds; `-1` disables coalescing.
    pub level_of_detail: i64,
}

/// Whether the engine still wants data after a pushed query chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Keep streaming.
    MoreData,
    /// No useful data exists beyond the query window; stop early.
    Done,
}

/// Positions of the three result regions inside the engine's shared result
/// buffer: fixed-size scalar (1-bit) records, fixed-size vector (multi-bit)
/// records, and the byte-string pool the vector records reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawResultDescriptor {
    pub scalar_offset: u32,
    pub scalar_count: u32,
    pub vector_offset: u32,
    pub vector_count: u32,
    pub pool_offset: u32,
    pub pool_len: u32,
}

impl RawResultDescriptor {
    pub fn is_empty(&self) -> bool {
        self.scalar_count == 0 && self.vector_count == 0
    }
}

/// Bounds-checked view over the engine's linear result buffer.
pub struct SharedMemoryView<'a> {
    bytes: &'a [u8],
}

impl<'a> SharedMemoryView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SharedMemoryView { bytes }
    }

    pub fn slice(&self, offset: u32, len: u32) -> Result<&'a [u8], EngineError> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| EngineError::Engine("result region overflows".to_string()))?;
        self.bytes.get(start..end).ok_or_else(|| {
            EngineError::Engine(format!(
                "result region [{start}, {end}) exceeds buffer of {} bytes",
                self.bytes.len()
            ))
        })
    }
}

/// The opaque native indexing/query engine.
pub trait ParserEngine: Send {
    /// Size the streaming scratch buffer before the first chunk.
    fn allocate_scratch(&mut self, size: u64) -> Result<(), EngineError>;

    // ---- indexing phase ----
    fn begin_indexing(&mut self) -> Result<(), EngineError>;
    fn push_chunk_for_index(&mut self, offset: u64, bytes: &[u8]) -> Result<(), EngineError>;
    fn finish_indexing(&mut self) -> Result<(), EngineError>;

    // ---- query phase ----
    fn get_query_plan(&mut self, t: TimeNs) -> Result<QueryPlan, EngineError>;
    fn begin_query(&mut self, params: &QueryParams) -> Result<(), EngineError>;
    fn push_chunk_for_query(&mut self, offset: u64, bytes: &[u8])
    -> Result<ChunkOutcome, EngineError>;
    /// Drain buffered results into the shared buffer, returning where the
    /// records landed. Callable repeatedly within one query.
    fn flush_query_binary(&mut self) -> Result<RawResultDescriptor, EngineError>;
    fn cancel_query(&mut self);

    // ---- metadata ----
    fn metadata(&self) -> Result<TraceMetadata, EngineError>;
    /// JSON-serialized signal list; deserialized by the host.
    fn signals_json(&self) -> Result<String, EngineError>;
    /// JSON-serialized raw scope tree; deserialized by the host.
    fn hierarchy_json(&self) -> Result<String, EngineError>;
    fn find_signal(&self, path: &str) -> Result<Option<u32>, EngineError>;

    // ---- lifecycle ----
    /// The shared buffer `flush_query_binary` descriptors point into.
    fn result_buffer(&self) -> &[u8];
    fn is_open(&self) -> bool;
    fn close(&mut self);
}
