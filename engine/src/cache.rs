use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use shared::{LevelOfDetail, QueryResult, TimeNs};

use crate::error::EngineError;
use crate::query::QueryWindow;
use crate::rpc::{QueryProgressFn, RpcClient};

// ===== QUERY CACHE =====

/// Cache key: the requested signal set (order-insensitive) plus the
/// level-of-detail the data was fetched at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    signal_set: Vec<u32>,
    level_of_detail: LevelOfDetail,
}

impl CacheKey {
    fn new(signal_indices: &[u32], level_of_detail: LevelOfDetail) -> Self {
        let mut signal_set = signal_indices.to_vec();
        signal_set.sort_unstable();
        signal_set.dedup();
        CacheKey {
            signal_set,
            level_of_detail,
        }
    }
}

struct CacheEntry {
    key: CacheKey,
    window: QueryWindow,
    result: QueryResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Time/signal-set keyed result cache with LRU eviction.
///
/// A hit requires a matching signal set and level-of-detail and an entry
/// window fully CONTAINING the requested one — a previously fetched wider
/// window serves a narrower zoomed-in request without touching the engine.
pub struct QueryCache {
    /// Front is least recently used.
    entries: Vec<CacheEntry>,
    max_entries: usize,
    stats: CacheStats,
}

impl QueryCache {
    pub fn new(max_entries: usize) -> Self {
        QueryCache {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Served results are re-ordered to the request's signal order; the
    /// window fields report the cached coverage.
    pub fn lookup(
        &mut self,
        window: QueryWindow,
        signal_indices: &[u32],
        level_of_detail: LevelOfDetail,
    ) -> Option<QueryResult> {
        let key = CacheKey::new(signal_indices, level_of_detail);
        let position = self
            .entries
            .iter()
            .position(|e| e.key == key && e.window.contains(&window));

        match position {
            Some(position) => {
                let entry = self.entries.remove(position);
                let served = reorder(&entry.result, signal_indices);
                self.entries.push(entry);
                self.stats.hits += 1;
                debug!(
                    t_begin = window.t_begin.nanos(),
                    t_end = window.t_end.nanos(),
                    "cache hit"
                );
                Some(served)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(
        &mut self,
        window: QueryWindow,
        signal_indices: &[u32],
        level_of_detail: LevelOfDetail,
        result: QueryResult,
    ) {
        let key = CacheKey::new(signal_indices, level_of_detail);
        // A wider fetch subsumes narrower entries for the same key.
        self.entries
            .retain(|e| !(e.key == key && window.contains(&e.window)));
        self.entries.push(CacheEntry {
            key,
            window,
            result,
        });
        while self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

fn reorder(result: &QueryResult, signal_indices: &[u32]) -> QueryResult {
    let by_index: HashMap<u32, usize> = result
        .signals
        .iter()
        .enumerate()
        .map(|(position, signal)| (signal.index, position))
        .collect();
    QueryResult {
        t_begin: result.t_begin,
        t_end: result.t_end,
        signals: signal_indices
            .iter()
            .filter_map(|index| by_index.get(index))
            .map(|&position| result.signals[position].clone())
            .collect(),
    }
}

/// Widen a requested window by `pad_factor` window-widths on each side so
/// small pans are absorbed by cache containment, clamped to the trace
/// bounds when known.
pub fn padded_window(
    window: QueryWindow,
    pad_factor: f64,
    bounds: Option<(TimeNs, TimeNs)>,
) -> QueryWindow {
    let pad = (window.width() as f64 * pad_factor) as u64;
    let mut begin = window.t_begin.nanos().saturating_sub(pad);
    let mut end = window.t_end.nanos().saturating_add(pad);
    if let Some((trace_begin, trace_end)) = bounds {
        begin = begin.max(trace_begin.nanos());
        end = end.min(trace_end.nanos()).max(begin);
    }
    QueryWindow::new(TimeNs::from_nanos(begin), TimeNs::from_nanos(end))
}

// ===== SCHEDULER =====

struct SchedulerState {
    generation: u64,
    last_issue: Option<Instant>,
}

/// Debounce/throttle layer for one logical query stream (the visible
/// signal set of a viewport). Rapid repeated requests collapse into one;
/// issued fetches keep a minimum interval; an in-flight fetch is cancelled
/// before a new one goes out.
pub struct QueryScheduler {
    client: Arc<RpcClient>,
    cache: Arc<Mutex<QueryCache>>,
    bounds: (TimeNs, TimeNs),
    pad_factor: f64,
    debounce: Duration,
    throttle: Duration,
    state: Arc<Mutex<SchedulerState>>,
}

impl QueryScheduler {
    pub fn new(
        client: Arc<RpcClient>,
        cache: Arc<Mutex<QueryCache>>,
        bounds: (TimeNs, TimeNs),
        pad_factor: f64,
        debounce: Duration,
        throttle: Duration,
    ) -> Self {
        QueryScheduler {
            client,
            cache,
            bounds,
            pad_factor,
            debounce,
            throttle,
            state: Arc::new(Mutex::new(SchedulerState {
                generation: 0,
                last_issue: None,
            })),
        }
    }

    /// Resolve a viewport request through the cache, or schedule a padded
    /// fetch. Requests superseded during the quiet period resolve as
    /// `Aborted`, which callers discard silently.
    pub async fn request(
        &self,
        window: QueryWindow,
        signal_indices: Vec<u32>,
        level_of_detail: LevelOfDetail,
        on_progress: Option<QueryProgressFn>,
    ) -> Result<QueryResult, EngineError> {
        if let Some(hit) =
            self.cache
                .lock()
                .unwrap()
                .lookup(window, &signal_indices, level_of_detail)
        {
            return Ok(hit);
        }

        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.generation
        };

        tokio::time::sleep(self.debounce).await;
        if self.superseded(generation) {
            return Err(EngineError::Aborted);
        }

        let throttle_wait = {
            let state = self.state.lock().unwrap();
            state
                .last_issue
                .map(|last| (last + self.throttle).saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        if !throttle_wait.is_zero() {
            tokio::time::sleep(throttle_wait).await;
            if self.superseded(generation) {
                return Err(EngineError::Aborted);
            }
        }

        // A fetch issued meanwhile may already cover this window.
        if let Some(hit) =
            self.cache
                .lock()
                .unwrap()
                .lookup(window, &signal_indices, level_of_detail)
        {
            return Ok(hit);
        }

        // Any outstanding in-flight query must go before a new one is
        // issued; the engine's query state is exclusive.
        self.client.abort_query();
        self.state.lock().unwrap().last_issue = Some(Instant::now());

        let padded = padded_window(window, self.pad_factor, Some(self.bounds));
        debug!(
            t_begin = padded.t_begin.nanos(),
            t_end = padded.t_end.nanos(),
            "issuing padded viewport fetch"
        );
        let result = self
            .client
            .query(
                padded,
                signal_indices.clone(),
                level_of_detail,
                on_progress,
            )
            .await?;

        self.cache.lock().unwrap().insert(
            padded,
            &signal_indices,
            level_of_detail,
            result.clone(),
        );
        Ok(result)
    }

    fn superseded(&self, generation: u64) -> bool {
        self.state.lock().unwrap().generation != generation
    }
}
