//! Outcome logging.
//!
//! Timeouts are the system's doing and are always logged. Confirmed OOM
//! kills are expected and stay quiet unless asked for. A kill-style exit
//! code the runtime did not attribute to memory pressure is an alert.

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::classify::{TerminationReason, OOM_EXIT_CODE};
use crate::queue::JobResult;

/// Outcome logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportingConfig {
    /// Log confirmed OOM kills at info level.
    #[serde(default)]
    pub log_oom_kills: bool,

    /// Exit codes that raise an alert when the runtime reports no OOM kill.
    #[serde(default = "default_alert_exit_codes")]
    pub alert_exit_codes: Vec<i64>,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            log_oom_kills: false,
            alert_exit_codes: default_alert_exit_codes(),
        }
    }
}

fn default_alert_exit_codes() -> Vec<i64> {
    vec![OOM_EXIT_CODE]
}

/// How a finished job gets logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Program exited non-zero on its own.
    ProgramFailure,
    Timeout,
    OomKill,
    UnexpectedKill,
    InfrastructureFailure,
}

impl ReportingConfig {
    pub fn outcome(&self, job: &JobResult) -> Outcome {
        let result = &job.result;
        if let Some(err) = &job.error {
            return if err.is_timeout() {
                Outcome::Timeout
            } else {
                Outcome::InfrastructureFailure
            };
        }

        // `Some(false)` only: a runtime that cannot tell is trusted.
        if self.alert_exit_codes.contains(&result.exit_code) && result.oom_killed == Some(false) {
            return Outcome::UnexpectedKill;
        }

        match result.termination_reason {
            Some(TerminationReason::Success) => Outcome::Success,
            Some(TerminationReason::OomKill) => Outcome::OomKill,
            Some(TerminationReason::Timeout) => Outcome::Timeout,
            Some(TerminationReason::GracefulStop | TerminationReason::RuntimeError) | None => {
                Outcome::ProgramFailure
            }
        }
    }

    /// Log a finished job according to this policy.
    pub fn log(&self, job_id: u64, job: &JobResult) {
        let result = &job.result;
        match self.outcome(job) {
            Outcome::Success => {
                debug!(job_id, duration_s = result.duration, "Job succeeded");
            }
            Outcome::ProgramFailure => {
                debug!(
                    job_id,
                    exit_code = result.exit_code,
                    reason = ?result.termination_reason,
                    "Program exited with failure"
                );
            }
            Outcome::Timeout => {
                let cause = job.error.as_ref().map(ToString::to_string);
                warn!(
                    job_id,
                    duration_s = result.duration,
                    cause = cause.as_deref().unwrap_or("deadline"),
                    "[TIMEOUT] Execution terminated by the system"
                );
            }
            Outcome::OomKill => {
                if self.log_oom_kills {
                    info!(job_id, duration_s = result.duration, "Job killed at memory limit");
                }
            }
            Outcome::UnexpectedKill => {
                error!(
                    job_id,
                    exit_code = result.exit_code,
                    "[ALERT] Unexpected kill exit code without OOM signal, investigate"
                );
            }
            Outcome::InfrastructureFailure => {
                if let Some(err) = &job.error {
                    error!(job_id, error = %err, "Sandbox infrastructure failure");
                }
            }
        }
    }
}
