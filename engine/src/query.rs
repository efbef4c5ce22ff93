use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use shared::{LevelOfDetail, QueryResult, TimeNs};

use crate::decode::QueryAccumulator;
use crate::error::EngineError;
use crate::parser::{ChunkOutcome, ParserEngine, QueryParams, SharedMemoryView};
use crate::source::TraceSource;

// ===== CANCELLATION =====

/// Cooperative, advisory cancellation flag. Triggering it stops the
/// streaming loop at the next chunk boundary; progress already emitted
/// stays valid.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ===== QUERY REQUEST =====

/// Integer time window of a query. Viewports compute fractional bounds;
/// the window rounds outward to integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryWindow {
    pub t_begin: TimeNs,
    pub t_end: TimeNs,
}

impl QueryWindow {
    pub fn new(t_begin: TimeNs, t_end: TimeNs) -> Self {
        QueryWindow {
            t_begin,
            t_end: t_end.max(t_begin),
        }
    }

    pub fn from_f64(begin_nanos: f64, end_nanos: f64) -> Self {
        Self::new(TimeNs::floor_f64(begin_nanos), TimeNs::ceil_f64(end_nanos))
    }

    pub fn contains(&self, other: &QueryWindow) -> bool {
        self.t_begin <= other.t_begin && self.t_end >= other.t_end
    }

    pub fn width(&self) -> u64 {
        self.t_end.nanos() - self.t_begin.nanos()
    }
}

/// One query as seen by the coordinator: the window, the requested signals
/// with their display names (request order preserved), and the coalescing
/// hint.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub window: QueryWindow,
    pub signals: Vec<(u32, String)>,
    pub level_of_detail: LevelOfDetail,
}

// ===== QUERY COORDINATOR =====

/// Drives one query: plan a snapshot seek, stream chunks from the seek
/// offset, flush and decode after every chunk, emit progressive results,
/// stop early when the engine has nothing more inside the window.
///
/// Not reentrant — one in-flight query per engine instance; the layer
/// above is responsible for never requesting a second one concurrently.
pub struct QueryCoordinator {
    chunk_bytes: u64,
}

impl QueryCoordinator {
    pub fn new(chunk_bytes: u64) -> Self {
        QueryCoordinator { chunk_bytes }
    }

    /// `checkpoint` runs at every chunk boundary so the caller can service
    /// its inbox (observe aborts) while the stream is in flight.
    pub async fn query(
        &self,
        engine: &mut dyn ParserEngine,
        source: &dyn TraceSource,
        request: &QueryRequest,
        cancel: &CancelToken,
        checkpoint: &mut (dyn FnMut() + Send),
        on_progress: &mut (dyn FnMut(QueryResult) + Send),
    ) -> Result<QueryResult, EngineError> {
        if !engine.is_open() {
            return Err(EngineError::NoFileLoaded);
        }

        let window = request.window;
        let plan = engine.get_query_plan(window.t_begin)?;
        debug!(
            t_begin = window.t_begin.nanos(),
            t_end = window.t_end.nanos(),
            snapshot = plan.snapshot_index,
            file_offset = plan.file_offset,
            "query planned"
        );

        engine.begin_query(&QueryParams {
            t_begin: window.t_begin,
            t_end: window.t_end,
            signal_indices: request.signals.iter().map(|(index, _)| *index).collect(),
            snapshot_index: plan.snapshot_index,
            level_of_detail: request.level_of_detail.as_raw(),
        })?;

        let mut accumulator =
            QueryAccumulator::new(window.t_begin, window.t_end, &request.signals);

        let streamed = self
            .stream(
                engine,
                source,
                plan.file_offset,
                cancel,
                &mut accumulator,
                checkpoint,
                on_progress,
            )
            .await;

        match streamed {
            Ok(()) => {
                // Residual data can sit buffered after the last chunk.
                let raw = engine.flush_query_binary()?;
                let view = SharedMemoryView::new(engine.result_buffer());
                accumulator.apply(&raw, &view)?;
                Ok(accumulator.into_result())
            }
            Err(EngineError::Aborted) => {
                engine.cancel_query();
                Err(EngineError::Aborted)
            }
            Err(error @ EngineError::Read { .. }) => {
                // Partial engine state is unusable after a failed read;
                // close and require re-indexing.
                engine.close();
                Err(error)
            }
            Err(error) => {
                engine.cancel_query();
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream(
        &self,
        engine: &mut dyn ParserEngine,
        source: &dyn TraceSource,
        start_offset: u64,
        cancel: &CancelToken,
        accumulator: &mut QueryAccumulator,
        checkpoint: &mut (dyn FnMut() + Send),
        on_progress: &mut (dyn FnMut(QueryResult) + Send),
    ) -> Result<(), EngineError> {
        let total = source.size();
        let mut offset = start_offset;
        let mut first_flush = true;

        loop {
            checkpoint();
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            if offset >= total {
                return Ok(());
            }

            let len = self.chunk_bytes.min(total - offset);
            let read = source.read_range(offset, len).await;
            // Cancellation can race a read already in flight; check again.
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }
            let bytes = read.map_err(|e| EngineError::Read {
                context: format!("query read at offset {offset}: {e}"),
            })?;
            if bytes.is_empty() {
                return Ok(());
            }

            let outcome = engine.push_chunk_for_query(offset, &bytes)?;
            offset += bytes.len() as u64;

            let raw = engine.flush_query_binary()?;
            let view = SharedMemoryView::new(engine.result_buffer());
            let gained = accumulator.apply(&raw, &view)?;
            if gained || first_flush {
                on_progress(accumulator.snapshot());
            }
            first_flush = false;

            if outcome == ChunkOutcome::Done {
                debug!(offset, "engine signalled early stop");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemTraceSource;
    use crate::testing::{SimEngine, sim_trace_with_events, index_sim};

    fn request(t_begin: u64, t_end: u64, signals: &[(u32, &str)]) -> QueryRequest {
        QueryRequest {
            window: QueryWindow::new(TimeNs::from_nanos(t_begin), TimeNs::from_nanos(t_end)),
            signals: signals
                .iter()
                .map(|(index, name)| (*index, name.to_string()))
                .collect(),
            level_of_detail: LevelOfDetail::Full,
        }
    }

    #[tokio::test]
    async fn single_event_query_scenario() {
        // 1-bit signal whose only event is at t=500.
        let trace = sim_trace_with_events(1_000, 1_000, &[(0, "pulse", 1, &[(500, "1")])]);
        let mut engine = SimEngine::new(trace);
        let source = MemTraceSource::zeroed("t", 1_000);
        index_sim(&mut engine, &source).await;

        let result = QueryCoordinator::new(128)
            .query(
                &mut engine,
                &source,
                &request(0, 1000, &[(0, "pulse")]),
                &CancelToken::new(),
                &mut || {},
                &mut |_| {},
            )
            .await
            .unwrap();

        let signal = &result.signals[0];
        assert_eq!(signal.initial_value, "0");
        assert_eq!(signal.transitions.len(), 1);
        assert_eq!(signal.transitions[0].time.nanos(), 500);
        assert_eq!(signal.transitions[0].value, "1");
    }

    #[tokio::test]
    async fn no_transition_at_or_before_window_start() {
        let trace = sim_trace_with_events(
            1_000,
            1_000,
            &[(0, "sig", 1, &[(100, "1"), (400, "0"), (800, "1")])],
        );
        let mut engine = SimEngine::new(trace);
        let source = MemTraceSource::zeroed("t", 1_000);
        index_sim(&mut engine, &source).await;

        let result = QueryCoordinator::new(128)
            .query(
                &mut engine,
                &source,
                &request(400, 1000, &[(0, "sig")]),
                &CancelToken::new(),
                &mut || {},
                &mut |_| {},
            )
            .await
            .unwrap();

        let signal = &result.signals[0];
        // The t=400 record defines the window-start value, not a transition.
        assert_eq!(signal.initial_value, "0");
        let times: Vec<u64> = signal.transitions.iter().map(|t| t.time.nanos()).collect();
        assert_eq!(times, vec![800]);
        assert!(times.iter().all(|&t| t > 400));
    }

    #[tokio::test]
    async fn early_stop_skips_tail_chunks() {
        let trace = sim_trace_with_events(10_000, 10_000, &[(0, "sig", 1, &[(100, "1")])]);
        let mut engine = SimEngine::new(trace);
        let stats = engine.stats();
        let source = MemTraceSource::zeroed("t", 10_000);
        index_sim(&mut engine, &source).await;

        QueryCoordinator::new(256)
            .query(
                &mut engine,
                &source,
                &request(0, 500, &[(0, "sig")]),
                &CancelToken::new(),
                &mut || {},
                &mut |_| {},
            )
            .await
            .unwrap();

        // 10_000 bytes at 256 per chunk would be 40 chunks; the window ends
        // at t=500 so the engine must stop the stream long before that.
        assert!(stats.query_chunks() < 5);
    }

    #[tokio::test]
    async fn snapshot_seek_starts_past_the_beginning() {
        let trace = sim_trace_with_events(10_000, 10_000, &[(0, "sig", 1, &[(9_000, "1")])]);
        let mut engine = SimEngine::new(trace);
        let stats = engine.stats();
        let source = MemTraceSource::zeroed("t", 10_000);
        index_sim(&mut engine, &source).await;

        let result = QueryCoordinator::new(256)
            .query(
                &mut engine,
                &source,
                &request(8_500, 9_500, &[(0, "sig")]),
                &CancelToken::new(),
                &mut || {},
                &mut |_| {},
            )
            .await
            .unwrap();

        assert_eq!(result.signals[0].transitions.len(), 1);
        // Streaming resumed from a snapshot near t=8500, not offset 0.
        assert!(stats.first_query_offset() >= 8_000);
    }

    #[tokio::test]
    async fn cancellation_yields_aborted() {
        let trace = sim_trace_with_events(10_000, 10_000, &[(0, "sig", 1, &[(9_500, "1")])]);
        let mut engine = SimEngine::new(trace);
        let source = MemTraceSource::zeroed("t", 10_000);
        index_sim(&mut engine, &source).await;

        let cancel = CancelToken::new();
        let mut chunks = 0u32;
        let cancel_in_checkpoint = cancel.clone();
        let error = QueryCoordinator::new(64)
            .query(
                &mut engine,
                &source,
                &request(0, 10_000, &[(0, "sig")]),
                &cancel,
                &mut move || {
                    chunks += 1;
                    if chunks == 3 {
                        cancel_in_checkpoint.cancel();
                    }
                },
                &mut |_| {},
            )
            .await
            .unwrap_err();

        assert!(error.is_aborted());
    }

    #[tokio::test]
    async fn progress_fires_on_first_flush_and_new_transitions() {
        let trace = sim_trace_with_events(
            1_000,
            1_000,
            &[(0, "sig", 1, &[(100, "1"), (600, "0")])],
        );
        let mut engine = SimEngine::new(trace);
        let source = MemTraceSource::zeroed("t", 1_000);
        index_sim(&mut engine, &source).await;

        let mut progress_calls = 0usize;
        let result = QueryCoordinator::new(100)
            .query(
                &mut engine,
                &source,
                &request(0, 1_000, &[(0, "sig")]),
                &CancelToken::new(),
                &mut || {},
                &mut |partial| {
                    progress_calls += 1;
                    assert!(partial.signals[0].transitions.len() <= 2);
                },
            )
            .await
            .unwrap();

        assert!(progress_calls >= 2);
        assert_eq!(result.signals[0].transitions.len(), 2);
    }

    #[tokio::test]
    async fn query_without_open_trace_is_a_programmer_error() {
        let trace = sim_trace_with_events(1_000, 1_000, &[(0, "sig", 1, &[])]);
        let mut engine = SimEngine::new(trace);
        let source = MemTraceSource::zeroed("t", 1_000);

        let error = QueryCoordinator::new(100)
            .query(
                &mut engine,
                &source,
                &request(0, 1_000, &[(0, "sig")]),
                &CancelToken::new(),
                &mut || {},
                &mut |_| {},
            )
            .await
            .unwrap_err();

        assert_eq!(error, EngineError::NoFileLoaded);
    }

    #[test]
    fn window_rounds_outward() {
        let window = QueryWindow::from_f64(100.7, 899.2);
        assert_eq!(window.t_begin.nanos(), 100);
        assert_eq!(window.t_end.nanos(), 900);
    }
}
