//! Error types shared by all pipeline operations.

/// Errors surfaced by stages and pipelines. All errors propagate to the
/// caller of the pipeline operation; nothing is retried internally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DspError {
    /// A constructor or setter received a bad parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Input length is not a multiple of the channel count, or a timestamp
    /// array does not match the frame count.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A state payload does not match the receiving pipeline (wrong stage
    /// count, stage types, or internal buffer sizes).
    #[error("state mismatch: {0}")]
    StateMismatch(String),

    /// A state payload is internally inconsistent (bad magic, version, or
    /// truncated data).
    #[error("state corrupted: {0}")]
    StateCorrupted(String),

    /// Operation on a disposed pipeline.
    #[error("pipeline is disposed")]
    PipelineDisposed,

    /// Operation attempted while a `process` call is active on the same
    /// pipeline.
    #[error("pipeline is busy")]
    PipelineBusy,

    /// A numerical precondition failed, e.g. a zero-size transform.
    #[error("numerical error: {0}")]
    Numerical(String),
}

impl DspError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        DspError::InvalidArgument(message.into())
    }
}

pub type Result<T> = core::result::Result<T, DspError>;
