use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use shared::{
    DownMsg, EngineConfig, LevelOfDetail, QueryOutcome, QueryResult, ScopeNode,
    SignalDescriptor, TimeNs, TraceMetadata, UpMsg,
};

use crate::error::EngineError;
use crate::indexing::IndexingCoordinator;
use crate::parser::ParserEngine;
use crate::query::{CancelToken, QueryCoordinator, QueryRequest, QueryWindow};
use crate::source::TraceSource;

// ===== RPC CHANNEL =====
//
// The engine's native primitives are single-threaded and non-reentrant, so
// a dedicated worker task owns the engine and every host call crosses a
// typed channel, correlated by a monotonically increasing request id. The
// worker drains its inbox at chunk boundaries while streaming, which is how
// aborts and superseding queries take effect mid-query.

pub type QueryProgressFn = Arc<dyn Fn(QueryResult) + Send + Sync>;
pub type IndexProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

// ===== SOURCE REGISTRY =====

/// Hand-off slot map for trace sources. Sources cannot ride inside message
/// payloads, so `IndexFile` carries a handle into this registry instead.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    inner: Arc<Mutex<SourceSlots>>,
}

#[derive(Default)]
struct SourceSlots {
    next_handle: u64,
    slots: HashMap<u64, Arc<dyn TraceSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: Arc<dyn TraceSource>) -> u64 {
        let mut slots = self.inner.lock().unwrap();
        slots.next_handle += 1;
        let handle = slots.next_handle;
        slots.slots.insert(handle, source);
        handle
    }

    fn take(&self, handle: u64) -> Option<Arc<dyn TraceSource>> {
        self.inner.lock().unwrap().slots.remove(&handle)
    }
}

// ===== PENDING REQUESTS =====

enum ProgressSink {
    Index(IndexProgressFn),
    Query(QueryProgressFn),
}

/// Lives only for the duration of one outstanding cross-boundary call.
struct PendingRequest {
    respond: oneshot::Sender<DownMsg>,
    progress: Option<ProgressSink>,
}

struct ClientShared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    poisoned: AtomicBool,
}

// ===== CLIENT =====

/// Host-side endpoint of the worker channel.
///
/// After a transport failure every pending request is rejected and the
/// client is poisoned; it must not be reused.
pub struct RpcClient {
    tx: mpsc::UnboundedSender<UpMsg>,
    shared: Arc<ClientShared>,
}

impl RpcClient {
    async fn call(
        &self,
        build: impl FnOnce(u64) -> UpMsg,
        progress: Option<ProgressSink>,
    ) -> Result<DownMsg, EngineError> {
        if self.shared.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::Transport(
                "engine channel already failed".to_string(),
            ));
        }
        let request_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (respond, receive) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, PendingRequest { respond, progress });

        if self.tx.send(build(request_id)).is_err() {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(EngineError::Transport("engine worker is gone".to_string()));
        }

        receive
            .await
            .map_err(|_| EngineError::Transport("engine worker dropped the request".to_string()))
    }

    pub async fn init(&self) -> Result<(), EngineError> {
        match self.call(|request_id| UpMsg::Init { request_id }, None).await? {
            DownMsg::InitDone { success: true, .. } => Ok(()),
            DownMsg::InitDone { error, .. } => Err(EngineError::Engine(
                error.unwrap_or_else(|| "engine failed to initialize".to_string()),
            )),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn index_file(
        &self,
        source_handle: u64,
        file_size: u64,
        on_progress: Option<IndexProgressFn>,
    ) -> Result<bool, EngineError> {
        let reply = self
            .call(
                |request_id| UpMsg::IndexFile {
                    request_id,
                    source_handle,
                    file_size,
                },
                on_progress.map(ProgressSink::Index),
            )
            .await?;
        match reply {
            DownMsg::IndexDone {
                error: Some(error), ..
            } => Err(from_worker_error(error)),
            DownMsg::IndexDone { success, .. } => Ok(success),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn query(
        &self,
        window: QueryWindow,
        signal_indices: Vec<u32>,
        level_of_detail: LevelOfDetail,
        on_progress: Option<QueryProgressFn>,
    ) -> Result<QueryResult, EngineError> {
        let reply = self
            .call(
                |request_id| UpMsg::Query {
                    request_id,
                    t_begin: window.t_begin,
                    t_end: window.t_end,
                    signal_indices,
                    level_of_detail,
                },
                on_progress.map(ProgressSink::Query),
            )
            .await?;
        match reply {
            DownMsg::QueryDone { outcome, .. } => match outcome {
                QueryOutcome::Complete(result) => Ok(result),
                QueryOutcome::Aborted => Err(EngineError::Aborted),
                QueryOutcome::Failed(error) => Err(from_worker_error(error)),
            },
            other => Err(unexpected_reply(other)),
        }
    }

    /// Fire-and-forget: cancels whatever query is streaming right now.
    pub fn abort_query(&self) {
        let _ = self.tx.send(UpMsg::AbortQuery);
    }

    pub async fn metadata(&self) -> Result<TraceMetadata, EngineError> {
        match self
            .call(|request_id| UpMsg::GetMetadata { request_id }, None)
            .await?
        {
            DownMsg::MetadataResult { metadata, .. } => Ok(metadata),
            DownMsg::RequestFailed { error, .. } => Err(from_worker_error(error)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn signals(&self) -> Result<Vec<SignalDescriptor>, EngineError> {
        match self
            .call(|request_id| UpMsg::GetSignals { request_id }, None)
            .await?
        {
            DownMsg::SignalsResult { json, .. } => serde_json::from_str(&json)
                .map_err(|e| EngineError::Engine(format!("malformed signal list: {e}"))),
            DownMsg::RequestFailed { error, .. } => Err(from_worker_error(error)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn hierarchy(&self) -> Result<ScopeNode, EngineError> {
        match self
            .call(|request_id| UpMsg::GetHierarchy { request_id }, None)
            .await?
        {
            DownMsg::HierarchyResult { json, .. } => serde_json::from_str(&json)
                .map_err(|e| EngineError::Engine(format!("malformed hierarchy: {e}"))),
            DownMsg::RequestFailed { error, .. } => Err(from_worker_error(error)),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn find_signal(&self, path: &str) -> Result<Option<u32>, EngineError> {
        let path = path.to_string();
        match self
            .call(
                move |request_id| UpMsg::FindSignal { request_id, path },
                None,
            )
            .await?
        {
            DownMsg::FindSignalResult { index, .. } => Ok(index),
            DownMsg::RequestFailed { error, .. } => Err(from_worker_error(error)),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Fire-and-forget: releases engine resources and ends the worker.
    pub fn close(&self) {
        let _ = self.tx.send(UpMsg::Close);
    }
}

fn unexpected_reply(msg: DownMsg) -> EngineError {
    EngineError::Transport(format!("unexpected reply: {msg:?}"))
}

fn request_failed(request_id: u64, error: EngineError) -> DownMsg {
    DownMsg::RequestFailed {
        request_id,
        error: error.to_string(),
    }
}

/// Errors cross the boundary as strings; rehydrate the variants callers
/// dispatch on.
fn from_worker_error(error: String) -> EngineError {
    if error == EngineError::NoFileLoaded.to_string() {
        EngineError::NoFileLoaded
    } else if error == EngineError::Aborted.to_string() {
        EngineError::Aborted
    } else if let Some(context) = error.strip_prefix("trace read failed: ") {
        EngineError::Read {
            context: context.to_string(),
        }
    } else {
        EngineError::Engine(error)
    }
}

// ===== DISPATCHER =====

async fn dispatch(mut rx: mpsc::UnboundedReceiver<DownMsg>, shared: Arc<ClientShared>) {
    while let Some(msg) = rx.recv().await {
        let Some(request_id) = msg.request_id() else {
            continue;
        };
        if msg.is_progress() {
            let sink = {
                let pending = shared.pending.lock().unwrap();
                pending.get(&request_id).and_then(|p| match &p.progress {
                    Some(ProgressSink::Index(f)) => Some(ProgressSink::Index(f.clone())),
                    Some(ProgressSink::Query(f)) => Some(ProgressSink::Query(f.clone())),
                    None => None,
                })
            };
            match (sink, msg) {
                (
                    Some(ProgressSink::Index(f)),
                    DownMsg::IndexProgress {
                        bytes_read,
                        total_bytes,
                        ..
                    },
                ) => f(bytes_read, total_bytes),
                (Some(ProgressSink::Query(f)), DownMsg::QueryProgress { result, .. }) => f(result),
                _ => {}
            }
        } else {
            let pending = shared.pending.lock().unwrap().remove(&request_id);
            match pending {
                Some(p) => {
                    let _ = p.respond.send(msg);
                }
                None => debug!(request_id, "reply for unknown request"),
            }
        }
    }

    // Transport gone: poison the client and reject everything pending.
    // Dropping the responders rejects the callers; the entries must never
    // be reused.
    shared.poisoned.store(true, Ordering::SeqCst);
    let dangling = {
        let mut pending = shared.pending.lock().unwrap();
        pending.drain().count()
    };
    if dangling > 0 {
        warn!(dangling, "engine channel closed with requests in flight");
    }
}

// ===== WORKER =====

struct EngineWorker {
    engine: Box<dyn ParserEngine>,
    rx: mpsc::UnboundedReceiver<UpMsg>,
    tx: mpsc::UnboundedSender<DownMsg>,
    registry: SourceRegistry,
    config: EngineConfig,
    active_source: Option<Arc<dyn TraceSource>>,
    signal_names: HashMap<u32, String>,
    deferred: VecDeque<UpMsg>,
}

impl EngineWorker {
    async fn run(mut self) {
        loop {
            let msg = match self.deferred.pop_front() {
                Some(msg) => msg,
                None => match self.rx.recv().await {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                UpMsg::Init { request_id } => {
                    self.send(DownMsg::InitDone {
                        request_id,
                        success: true,
                        error: None,
                    });
                }
                UpMsg::IndexFile {
                    request_id,
                    source_handle,
                    file_size,
                } => {
                    self.handle_index(request_id, source_handle, file_size).await;
                }
                UpMsg::Query {
                    request_id,
                    t_begin,
                    t_end,
                    signal_indices,
                    level_of_detail,
                } => {
                    self.handle_query(request_id, t_begin, t_end, signal_indices, level_of_detail)
                        .await;
                }
                // No query is streaming when this is seen here; mid-query
                // aborts are caught by the checkpoint tap instead.
                UpMsg::AbortQuery => {}
                UpMsg::GetMetadata { request_id } => {
                    let reply = match self.require_open() {
                        Err(e) => request_failed(request_id, e),
                        Ok(()) => match self.engine.metadata() {
                            Ok(metadata) => DownMsg::MetadataResult {
                                request_id,
                                metadata,
                            },
                            Err(e) => request_failed(request_id, e),
                        },
                    };
                    self.send(reply);
                }
                UpMsg::GetSignals { request_id } => {
                    let reply = match self.require_open().and_then(|_| self.engine.signals_json())
                    {
                        Ok(json) => DownMsg::SignalsResult { request_id, json },
                        Err(e) => request_failed(request_id, e),
                    };
                    self.send(reply);
                }
                UpMsg::GetHierarchy { request_id } => {
                    let reply = match self
                        .require_open()
                        .and_then(|_| self.engine.hierarchy_json())
                    {
                        Ok(json) => DownMsg::HierarchyResult { request_id, json },
                        Err(e) => request_failed(request_id, e),
                    };
                    self.send(reply);
                }
                UpMsg::FindSignal { request_id, path } => {
                    let reply = match self.require_open().and_then(|_| self.engine.find_signal(&path))
                    {
                        Ok(index) => DownMsg::FindSignalResult { request_id, index },
                        Err(e) => request_failed(request_id, e),
                    };
                    self.send(reply);
                }
                UpMsg::Close => {
                    self.engine.close();
                    break;
                }
            }
        }
    }

    fn send(&self, msg: DownMsg) {
        let _ = self.tx.send(msg);
    }

    fn require_open(&self) -> Result<(), EngineError> {
        if self.engine.is_open() {
            Ok(())
        } else {
            Err(EngineError::NoFileLoaded)
        }
    }

    async fn handle_index(&mut self, request_id: u64, source_handle: u64, file_size: u64) {
        let Some(source) = self.registry.take(source_handle) else {
            self.send(DownMsg::IndexDone {
                request_id,
                success: false,
                error: Some(format!("unknown source handle {source_handle}")),
            });
            return;
        };
        if source.size() != file_size {
            warn!(
                declared = file_size,
                actual = source.size(),
                "declared file size differs from source"
            );
        }

        self.active_source = None;
        self.signal_names.clear();

        let coordinator = IndexingCoordinator::new(self.config.streaming.chunk_bytes);
        let tx = self.tx.clone();
        let mut on_progress = move |bytes_read: u64, total_bytes: u64| {
            let _ = tx.send(DownMsg::IndexProgress {
                request_id,
                bytes_read,
                total_bytes,
            });
        };

        let reply = match coordinator
            .index(self.engine.as_mut(), source.as_ref(), &mut on_progress)
            .await
        {
            Ok(success) => {
                if success {
                    self.active_source = Some(source);
                    self.load_signal_names();
                }
                DownMsg::IndexDone {
                    request_id,
                    success,
                    error: None,
                }
            }
            Err(error) => DownMsg::IndexDone {
                request_id,
                success: false,
                error: Some(error.to_string()),
            },
        };
        self.send(reply);
    }

    fn load_signal_names(&mut self) {
        match self
            .engine
            .signals_json()
            .and_then(|json| {
                serde_json::from_str::<Vec<SignalDescriptor>>(&json)
                    .map_err(|e| EngineError::Engine(e.to_string()))
            }) {
            Ok(descriptors) => {
                self.signal_names = descriptors
                    .into_iter()
                    .map(|d| (d.index, d.name))
                    .collect();
            }
            Err(error) => warn!(%error, "could not load signal names"),
        }
    }

    async fn handle_query(
        &mut self,
        request_id: u64,
        t_begin: TimeNs,
        t_end: TimeNs,
        signal_indices: Vec<u32>,
        level_of_detail: LevelOfDetail,
    ) {
        let Some(source) = self.active_source.clone() else {
            self.send(DownMsg::QueryDone {
                request_id,
                outcome: QueryOutcome::Failed(EngineError::NoFileLoaded.to_string()),
            });
            return;
        };

        let request = QueryRequest {
            window: QueryWindow::new(t_begin, t_end),
            signals: signal_indices
                .iter()
                .map(|&index| {
                    let name = self
                        .signal_names
                        .get(&index)
                        .cloned()
                        .unwrap_or_else(|| index.to_string());
                    (index, name)
                })
                .collect(),
            level_of_detail,
        };

        let cancel = CancelToken::new();
        let coordinator = QueryCoordinator::new(self.config.streaming.chunk_bytes);

        let tx = self.tx.clone();
        let mut on_progress = move |result: QueryResult| {
            let _ = tx.send(DownMsg::QueryProgress { request_id, result });
        };

        let streamed = {
            // Split borrows: the coordinator drives the engine while the
            // checkpoint tap services the inbox.
            let Self {
                engine,
                rx,
                deferred,
                ..
            } = &mut *self;
            let tap_cancel = cancel.clone();
            let mut checkpoint = move || {
                while let Ok(incoming) = rx.try_recv() {
                    match incoming {
                        UpMsg::AbortQuery => tap_cancel.cancel(),
                        // A newer query (or shutdown) supersedes the one
                        // that is streaming; cancel first, then let the
                        // main loop pick the deferred message up.
                        UpMsg::Query { .. } | UpMsg::Close => {
                            tap_cancel.cancel();
                            deferred.push_back(incoming);
                        }
                        other => deferred.push_back(other),
                    }
                }
            };

            coordinator
                .query(
                    engine.as_mut(),
                    source.as_ref(),
                    &request,
                    &cancel,
                    &mut checkpoint,
                    &mut on_progress,
                )
                .await
        };

        let outcome = match streamed {
            Ok(result) => QueryOutcome::Complete(result),
            Err(EngineError::Aborted) => QueryOutcome::Aborted,
            Err(error) => QueryOutcome::Failed(error.to_string()),
        };

        self.send(DownMsg::QueryDone {
            request_id,
            outcome,
        });
    }
}

/// Spawn the worker and dispatcher tasks for one engine instance and hand
/// back the client endpoint.
pub fn spawn_engine_worker(
    engine: Box<dyn ParserEngine>,
    registry: SourceRegistry,
    config: EngineConfig,
) -> RpcClient {
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    let (down_tx, down_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(ClientShared {
        next_id: AtomicU64::new(0),
        pending: Mutex::new(HashMap::new()),
        poisoned: AtomicBool::new(false),
    });

    tokio::spawn(dispatch(down_rx, shared.clone()));

    let worker = EngineWorker {
        engine,
        rx: up_rx,
        tx: down_tx,
        registry,
        config,
        active_source: None,
        signal_names: HashMap::new(),
        deferred: VecDeque::new(),
    };
    tokio::spawn(worker.run());

    RpcClient {
        tx: up_tx,
        shared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemTraceSource;
    use crate::testing::{SimEngine, sim_trace_with_events};
    use std::sync::atomic::AtomicUsize;

    async fn open_client(trace_ticks: u64) -> (RpcClient, SourceRegistry) {
        let trace =
            sim_trace_with_events(trace_ticks, trace_ticks, &[(0, "clk", 1, &[(100, "1")])]);
        let engine = SimEngine::new(trace);
        let registry = SourceRegistry::new();
        let mut config = EngineConfig::default();
        config.streaming.chunk_bytes = 256;
        let client = spawn_engine_worker(Box::new(engine), registry.clone(), config);
        client.init().await.unwrap();

        let source: Arc<dyn TraceSource> =
            Arc::new(MemTraceSource::zeroed("t", trace_ticks));
        let handle = registry.insert(source.clone());
        assert!(client.index_file(handle, source.size(), None).await.unwrap());
        (client, registry)
    }

    #[tokio::test]
    async fn correlates_concurrent_requests() {
        let (client, _registry) = open_client(1_000).await;

        let (metadata, signals, found) = tokio::join!(
            client.metadata(),
            client.signals(),
            client.find_signal("top.clk"),
        );
        assert_eq!(metadata.unwrap().signal_count, 1);
        assert_eq!(signals.unwrap()[0].name, "clk");
        assert_eq!(found.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn metadata_before_indexing_is_no_file_loaded() {
        let trace = sim_trace_with_events(100, 100, &[]);
        let client = spawn_engine_worker(
            Box::new(SimEngine::new(trace)),
            SourceRegistry::new(),
            EngineConfig::default(),
        );
        client.init().await.unwrap();
        assert_eq!(client.metadata().await.unwrap_err(), EngineError::NoFileLoaded);
    }

    #[tokio::test]
    async fn close_poisons_the_channel() {
        let (client, _registry) = open_client(1_000).await;
        client.close();

        // The worker exits; eventually every call fails with a transport
        // error and the client must not be reused.
        let mut saw_transport = false;
        for _ in 0..50 {
            match client.metadata().await {
                Err(EngineError::Transport(_)) => {
                    saw_transport = true;
                    break;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        }
        assert!(saw_transport);
    }

    #[tokio::test]
    async fn abort_mid_stream_supersedes_old_query() {
        let trace = sim_trace_with_events(
            100_000,
            100_000,
            &[(0, "sig", 1, &[(50_000, "1")])],
        );
        let engine = SimEngine::new(trace);
        let registry = SourceRegistry::new();
        let mut config = EngineConfig::default();
        config.streaming.chunk_bytes = 512;
        let client = Arc::new(spawn_engine_worker(
            Box::new(engine),
            registry.clone(),
            config,
        ));
        client.init().await.unwrap();

        let source: Arc<dyn TraceSource> = Arc::new(
            MemTraceSource::zeroed("t", 100_000)
                .with_read_delay(std::time::Duration::from_millis(2)),
        );
        let handle = registry.insert(source.clone());
        assert!(client.index_file(handle, source.size(), None).await.unwrap());

        let slow_client = client.clone();
        let slow = tokio::spawn(async move {
            slow_client
                .query(
                    QueryWindow::new(TimeNs::ZERO, TimeNs::from_nanos(100_000)),
                    vec![0],
                    LevelOfDetail::Full,
                    None,
                )
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.abort_query();

        let outcome = slow.await.unwrap();
        assert_eq!(outcome.unwrap_err(), EngineError::Aborted);

        // The engine remains usable for the next query.
        let result = client
            .query(
                QueryWindow::new(TimeNs::ZERO, TimeNs::from_nanos(60_000)),
                vec![0],
                LevelOfDetail::Full,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.signals[0].transitions.len(), 1);
    }

    #[tokio::test]
    async fn progress_streams_before_the_terminal_message() {
        let (client, _registry) = open_client(1_000).await;

        let progress_seen = Arc::new(AtomicUsize::new(0));
        let counter = progress_seen.clone();
        let result = client
            .query(
                QueryWindow::new(TimeNs::ZERO, TimeNs::from_nanos(1_000)),
                vec![0],
                LevelOfDetail::Full,
                Some(Arc::new(move |_partial| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        assert!(progress_seen.load(Ordering::SeqCst) >= 1);
        assert_eq!(result.signals[0].transitions.len(), 1);
    }
}
