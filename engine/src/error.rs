use thiserror::Error;

/// Failure taxonomy of the trace-query engine.
///
/// Engine-open failure during indexing is deliberately NOT an error: the
/// indexing coordinator reports it as `Ok(false)` so callers can retry
/// with another file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A query or metadata call was made while no trace is open. Always a
    /// programmer error in the caller.
    #[error("no trace file is loaded")]
    NoFileLoaded,

    /// The query observed cancellation mid-stream. Distinguished from
    /// ordinary failure so callers can discard silently.
    #[error("query aborted")]
    Aborted,

    /// The worker boundary itself failed. The channel is unusable
    /// afterward and must not be reused.
    #[error("engine transport failed: {0}")]
    Transport(String),

    /// The trace source raised during a chunk read. Fatal for the attempt;
    /// the engine is closed and a re-index is required.
    #[error("trace read failed: {context}")]
    Read { context: String },

    /// The native engine reported a failure mid-operation.
    #[error("engine failure: {0}")]
    Engine(String),
}

impl EngineError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }

    /// Single human-readable message suitable for surfacing in the viewer.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::NoFileLoaded => {
                "No waveform file is loaded. Open a trace file first.".to_string()
            }
            EngineError::Aborted => "The query was cancelled.".to_string(),
            EngineError::Transport(detail) => {
                format!("The waveform engine stopped responding: {detail}")
            }
            EngineError::Read { context } => {
                format!("Could not read the trace file: {context}")
            }
            EngineError::Engine(detail) => {
                format!("The waveform engine reported an error: {detail}")
            }
        }
    }
}
