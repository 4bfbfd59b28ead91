//! Error types for the execution pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::deadline::DeadlineCause;

/// Admission failures, reported synchronously to the submitter.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Every buffer slot is taken
    #[error("queue is full ({capacity} jobs pending), try again later")]
    QueueFull { capacity: usize },

    /// The worker side of the queue is gone
    #[error("job queue is closed")]
    Closed,
}

/// Failures of a single job's run.
///
/// Everything except [`RunError::DeadlineExceeded`] is an infrastructure
/// failure; the sandboxed program exiting non-zero is not an error at all.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to create sandbox unit: {0:#}")]
    Create(anyhow::Error),

    #[error("failed to start sandbox unit: {0:#}")]
    Start(anyhow::Error),

    #[error("failed waiting for sandbox unit: {0:#}")]
    Wait(anyhow::Error),

    #[error("failed to read sandbox output: {0:#}")]
    Logs(anyhow::Error),

    /// The run was terminated by the system, not by the user's code
    #[error("execution deadline exceeded: {cause}")]
    DeadlineExceeded {
        cause: DeadlineCause,
        elapsed: Duration,
    },

    #[error("worker panicked while running job: {0}")]
    WorkerPanic(String),
}

impl RunError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Check if the failure came from the container runtime.
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Create(_) | Self::Start(_) | Self::Wait(_) | Self::Logs(_)
        )
    }
}
