/// Failure classes surfaced to the user. Everything except `WorkerFailure`
/// ends the run with a non-zero exit.
#[derive(Debug, thiserror::Error)]
pub enum PulverizeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("worker {worker} failed: {reason}")]
    WorkerFailure { worker: usize, reason: String },

    #[error("concatenation failed: {0}")]
    ConcatenationFailure(String),
}

impl PulverizeError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn invalid_partition(msg: impl Into<String>) -> Self {
        Self::InvalidPartition(msg.into())
    }

    pub fn concatenation(msg: impl Into<String>) -> Self {
        Self::ConcatenationFailure(msg.into())
    }
}
