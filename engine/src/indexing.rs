use tracing::{info, warn};

use crate::error::EngineError;
use crate::parser::ParserEngine;
use crate::source::TraceSource;

// ===== INDEXING COORDINATOR =====

/// Drives the streaming indexing phase: the whole source, start to end, in
/// fixed-size chunks through the engine's scratch buffer.
pub struct IndexingCoordinator {
    chunk_bytes: u64,
}

impl IndexingCoordinator {
    pub fn new(chunk_bytes: u64) -> Self {
        IndexingCoordinator { chunk_bytes }
    }

    /// Stream `source` into `engine` and finalize the index.
    ///
    /// Returns `Ok(false)` when the engine never reached an open state or
    /// errored mid-stream — the sole recoverable failure; the caller may
    /// retry with a different file. Source read errors propagate as
    /// `EngineError::Read`. In every failure case engine resources are
    /// released first; engine sessions are never layered.
    pub async fn index(
        &self,
        engine: &mut dyn ParserEngine,
        source: &dyn TraceSource,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<bool, EngineError> {
        if engine.is_open() {
            info!("closing previous engine session before re-indexing");
            engine.close();
        }

        if let Err(error) = self.stream(engine, source, on_progress).await {
            engine.close();
            return match error {
                EngineError::Read { .. } => Err(error),
                other => {
                    warn!(error = %other, "engine failed during indexing");
                    Ok(false)
                }
            };
        }

        if !engine.is_open() {
            warn!(source = source.name(), "engine did not reach open state");
            engine.close();
            return Ok(false);
        }

        info!(
            source = source.name(),
            bytes = source.size(),
            "indexing complete"
        );
        Ok(true)
    }

    async fn stream(
        &self,
        engine: &mut dyn ParserEngine,
        source: &dyn TraceSource,
        on_progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<(), EngineError> {
        let total = source.size();
        engine.allocate_scratch(self.chunk_bytes)?;
        engine.begin_indexing()?;

        let mut offset = 0u64;
        while offset < total {
            let len = self.chunk_bytes.min(total - offset);
            let bytes = source.read_range(offset, len).await.map_err(|e| {
                EngineError::Read {
                    context: format!("indexing read at offset {offset}: {e}"),
                }
            })?;
            if bytes.is_empty() {
                break;
            }
            engine.push_chunk_for_index(offset, &bytes)?;
            offset += bytes.len() as u64;
            on_progress(offset, total);
        }

        engine.finish_indexing()
    }
}
