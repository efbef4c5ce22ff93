use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use shared::unflatten::unflatten;
use shared::{
    EngineConfig, LevelOfDetail, QueryResult, ScopeNode, SignalDescriptor, TraceMetadata,
};

use crate::cache::{CacheStats, QueryCache, QueryScheduler, padded_window};
use crate::error::EngineError;
use crate::parser::ParserEngine;
use crate::query::QueryWindow;
use crate::rpc::{
    IndexProgressFn, QueryProgressFn, RpcClient, SourceRegistry, spawn_engine_worker,
};
use crate::source::TraceSource;

// ===== TRACE SESSION =====

/// Host-facing handle over one opened trace: the engine worker, the raw
/// and derived hierarchies, and the query cache/scheduler.
///
/// One engine, one trace, one in-flight query; a superseding query cancels
/// the older one before the engine sees it.
pub struct TraceSession {
    client: Arc<RpcClient>,
    metadata: TraceMetadata,
    signals: Vec<SignalDescriptor>,
    hierarchy: ScopeNode,
    cache: Arc<Mutex<QueryCache>>,
    scheduler: QueryScheduler,
    pad_factor: f64,
}

impl TraceSession {
    /// Spawn the engine worker, index the source, and load the trace
    /// shape.
    ///
    /// `Ok(None)` means the engine streamed the file but never reached an
    /// open state — the one recoverable failure; the caller may retry with
    /// a different file. Everything already allocated is released first.
    pub async fn open(
        engine: Box<dyn ParserEngine>,
        source: Arc<dyn TraceSource>,
        config: EngineConfig,
        on_index_progress: Option<IndexProgressFn>,
    ) -> Result<Option<TraceSession>, EngineError> {
        let mut config = config;
        for warning in config.validate_and_fix() {
            warn!(%warning, "engine config corrected");
        }

        let registry = SourceRegistry::new();
        let client = Arc::new(spawn_engine_worker(engine, registry.clone(), config.clone()));
        client.init().await?;

        let source_name = source.name().to_string();
        let handle = registry.insert(source.clone());
        let opened = client
            .index_file(handle, source.size(), on_index_progress)
            .await?;
        if !opened {
            client.close();
            return Ok(None);
        }

        let metadata = client.metadata().await?;
        let signals = client.signals().await?;
        let hierarchy = client.hierarchy().await?;
        info!(
            source = %source_name,
            signals = signals.len(),
            time_end = metadata.time_end.nanos(),
            "trace session opened"
        );

        let cache = Arc::new(Mutex::new(QueryCache::new(config.cache.max_entries)));
        let scheduler = QueryScheduler::new(
            client.clone(),
            cache.clone(),
            (metadata.time_begin, metadata.time_end),
            config.cache.pad_factor,
            Duration::from_millis(config.scheduling.debounce_ms),
            Duration::from_millis(config.scheduling.throttle_ms),
        );

        Ok(Some(TraceSession {
            client,
            metadata,
            signals,
            hierarchy,
            cache,
            scheduler,
            pad_factor: config.cache.pad_factor,
        }))
    }

    pub fn metadata(&self) -> &TraceMetadata {
        &self.metadata
    }

    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.signals
    }

    /// The engine-reported raw scope tree.
    pub fn hierarchy(&self) -> &ScopeNode {
        &self.hierarchy
    }

    /// Derived display tree; recomputed per call so a display-mode switch
    /// never mutates the raw tree.
    pub fn unflattened_hierarchy(&self) -> ScopeNode {
        unflatten(&self.hierarchy, &self.signals)
    }

    /// Cache-through query. A containment hit returns the cached wider
    /// result; a miss fetches the padded window and caches it.
    pub async fn query(
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

        let padded = padded_window(
            window,
            self.pad_factor,
            Some((self.metadata.time_begin, self.metadata.time_end)),
        );
        let result = self
            .client
            .query(padded, signal_indices.clone(), level_of_detail, on_progress)
            .await?;
        self.cache.lock().unwrap().insert(
            padded,
            &signal_indices,
            level_of_detail,
            result.clone(),
        );
        Ok(result)
    }

    /// Debounced/throttled viewport query stream; rapid repeats collapse
    /// and superseded requests resolve as `Aborted`.
    pub async fn query_viewport(
        &self,
        window: QueryWindow,
        signal_indices: Vec<u32>,
        level_of_detail: LevelOfDetail,
        on_progress: Option<QueryProgressFn>,
    ) -> Result<QueryResult, EngineError> {
        self.scheduler
            .request(window, signal_indices, level_of_detail, on_progress)
            .await
    }

    /// Cancel whatever query is currently streaming.
    pub fn abort_query(&self) {
        self.client.abort_query();
    }

    pub async fn find_signal(&self, path: &str) -> Result<Option<u32>, EngineError> {
        self.client.find_signal(path).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap().stats()
    }

    /// Release the trace source and every engine resource.
    pub fn close(self) {
        self.client.close();
    }
}
