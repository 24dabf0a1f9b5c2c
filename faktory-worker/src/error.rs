use thiserror::Error;

/// Errors related to worker setup and its top-level run loop. Errors from
/// individual job executions never surface here — they're turned into a
/// server `FAIL` and an [`Error`](faktory_common::Error) event instead.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] faktory_common::Error),

    #[error("failed to bind the health/metrics server: {0}")]
    Io(#[from] std::io::Error),
}
