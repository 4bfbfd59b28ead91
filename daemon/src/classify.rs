//! Termination classification.
//!
//! Maps a sandbox unit's raw exit status into the small, stable set of
//! outcomes callers key their alerting on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit code reported when the runtime SIGKILLs a unit (memory ceiling).
pub const OOM_EXIT_CODE: i64 = 137;

/// Exit code reported when a unit stops on SIGTERM.
pub const GRACEFUL_STOP_EXIT_CODE: i64 = 143;

/// Exit code recorded for runs the system terminated on its deadline.
pub const TIMEOUT_EXIT_CODE: i64 = -1;

/// Why a sandbox unit stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Success,
    GracefulStop,
    OomKill,
    RuntimeError,
    Timeout,
}

impl TerminationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::GracefulStop => "graceful_stop",
            Self::OomKill => "oom_kill",
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a unit's exit.
///
/// A fired deadline wins unconditionally: the exit status that races it is
/// discarded and the recorded exit code becomes [`TIMEOUT_EXIT_CODE`].
pub const fn classify(exit_code: i64, deadline_fired: bool) -> (TerminationReason, i64) {
    if deadline_fired {
        return (TerminationReason::Timeout, TIMEOUT_EXIT_CODE);
    }

    let reason = match exit_code {
        0 => TerminationReason::Success,
        OOM_EXIT_CODE => TerminationReason::OomKill,
        GRACEFUL_STOP_EXIT_CODE => TerminationReason::GracefulStop,
        _ => TerminationReason::RuntimeError,
    };
    (reason, exit_code)
}
