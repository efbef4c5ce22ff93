//! Trace-query engine for an interactive waveform viewer.
//!
//! Turns a large binary simulation-trace file into fast, cancellable,
//! time-windowed, multi-signal queries, driven across a worker-task
//! boundary against an opaque native indexing engine:
//!
//! - [`source::TraceSource`] — random-access byte provider for the file
//! - [`parser::ParserEngine`] — the narrow native-engine surface
//! - [`indexing::IndexingCoordinator`] — streaming index phase
//! - [`query::QueryCoordinator`] — plan/seek/stream/flush query phase
//! - [`decode`] — binary result records out of the shared buffer
//! - [`cache::QueryCache`] / [`cache::QueryScheduler`] — containment
//!   cache, padding, debounce/throttle
//! - [`rpc`] — typed channel, request correlation, progress multiplexing
//! - [`session::TraceSession`] — the host-facing API tying it together
//!
//! Hierarchy unflattening and the shared data model live in the `shared`
//! crate.

pub mod cache;
pub mod config_store;
pub mod decode;
pub mod error;
pub mod indexing;
pub mod parser;
pub mod query;
pub mod rpc;
pub mod session;
pub mod source;
pub mod testing;

pub use cache::{CacheStats, QueryCache, QueryScheduler};
pub use error::EngineError;
pub use indexing::IndexingCoordinator;
pub use parser::{ChunkOutcome, ParserEngine, QueryParams, QueryPlan, RawResultDescriptor, SharedMemoryView};
pub use query::{CancelToken, QueryCoordinator, QueryRequest, QueryWindow};
pub use rpc::{RpcClient, SourceRegistry, spawn_engine_worker};
pub use session::TraceSession;
pub use source::{FileTraceSource, MemTraceSource, TraceSource};
