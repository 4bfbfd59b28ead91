//! Sandbox runner.
//!
//! Runs one piece of code in one freshly provisioned unit:
//! create → start → wait (racing the deadline) → read output → remove.
//! The unit is removed on every path once it has been created.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::backend::{ContainerRuntime, SandboxProfile};
use crate::classify::{classify, TerminationReason, TIMEOUT_EXIT_CODE};
use crate::deadline::{Deadline, DeadlineCause};
use crate::error::RunError;

/// The only interpreter the sandbox image provides.
pub const SUPPORTED_LANGUAGE: &str = "python";

/// Result of one sandboxed run. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Combined stdout then stderr.
    pub output: String,
    /// Seconds from start to termination.
    pub duration: f64,
    pub exit_code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    /// Runtime's own OOM verdict, when it has one.
    #[serde(skip)]
    pub oom_killed: Option<bool>,
}

impl ExecutionResult {
    /// The result recorded for a run the system terminated.
    pub fn timed_out(elapsed: std::time::Duration) -> Self {
        let (reason, exit_code) = classify(TIMEOUT_EXIT_CODE, true);
        Self {
            output: String::new(),
            duration: elapsed.as_secs_f64(),
            exit_code,
            termination_reason: Some(reason),
            oom_killed: None,
        }
    }
}

/// Removes the unit it holds, inline via [`UnitGuard::release`] or, if the
/// owning future is dropped first, from a task spawned in `Drop`.
struct UnitGuard<R: ContainerRuntime> {
    runtime: Arc<R>,
    unit: Option<String>,
}

impl<R: ContainerRuntime> UnitGuard<R> {
    const fn new(runtime: Arc<R>, unit: String) -> Self {
        Self {
            runtime,
            unit: Some(unit),
        }
    }

    fn unit(&self) -> &str {
        self.unit.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(unit) = self.unit.take() {
            teardown(self.runtime.as_ref(), &unit).await;
        }
    }
}

impl<R: ContainerRuntime> Drop for UnitGuard<R> {
    fn drop(&mut self) {
        let Some(unit) = self.unit.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { teardown(runtime.as_ref(), &unit).await });
            }
            Err(_) => warn!(unit = %unit, "No runtime available, sandbox unit leaked"),
        }
    }
}

/// Best-effort removal; failures never reach the job's result.
async fn teardown<R: ContainerRuntime + ?Sized>(runtime: &R, unit: &str) {
    match runtime.remove(unit).await {
        Ok(()) => debug!(unit = %unit, "Removed sandbox unit"),
        Err(e) => debug!(unit = %unit, error = %e, "Sandbox unit removal failed"),
    }
}

/// Runs code against a shared container runtime.
pub struct SandboxRunner<R> {
    runtime: Arc<R>,
    profile: SandboxProfile,
}

impl<R: ContainerRuntime> SandboxRunner<R> {
    pub const fn new(runtime: Arc<R>, profile: SandboxProfile) -> Self {
        Self { runtime, profile }
    }

    pub const fn profile(&self) -> &SandboxProfile {
        &self.profile
    }

    /// Run `code` until it exits or `deadline` fires.
    ///
    /// Every stage is bounded by `deadline`. A fired deadline yields
    /// [`RunError::DeadlineExceeded`]; a non-zero exit is a normal result.
    #[instrument(skip(self, code, deadline), fields(code_len = code.len(), limit = ?deadline.limit()))]
    pub async fn run(
        &self,
        code: &str,
        language: &str,
        mut deadline: Deadline,
    ) -> Result<ExecutionResult, RunError> {
        if !language.eq_ignore_ascii_case(SUPPORTED_LANGUAGE) {
            debug!(language = %language, "Unsupported language requested, running as python");
        }

        let begun = Instant::now();
        let guard = self.provision(code, &mut deadline, begun).await?;
        debug!(unit = %guard.unit(), "Created sandbox unit");

        let outcome = self.drive(guard.unit(), &mut deadline, begun).await;
        guard.release().await;
        outcome
    }

    /// Create the unit in its own task so a unit that appears after the
    /// deadline fired is still removed.
    async fn provision(
        &self,
        code: &str,
        deadline: &mut Deadline,
        begun: Instant,
    ) -> Result<UnitGuard<R>, RunError> {
        let spec = self.profile.unit_spec(code);
        let runtime = Arc::clone(&self.runtime);
        let mut create = tokio::spawn(async move { runtime.create(&spec).await });

        let joined = match bounded(deadline, &mut create).await {
            Ok(joined) => joined,
            Err(cause) => {
                let runtime = Arc::clone(&self.runtime);
                tokio::spawn(async move {
                    if let Ok(Ok(unit)) = create.await {
                        debug!(unit = %unit, "Removing unit created after the deadline");
                        teardown(runtime.as_ref(), &unit).await;
                    }
                });
                return Err(RunError::DeadlineExceeded {
                    cause,
                    elapsed: begun.elapsed(),
                });
            }
        };

        match joined {
            Ok(created) => created
                .map(|unit| UnitGuard::new(Arc::clone(&self.runtime), unit))
                .map_err(RunError::Create),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(RunError::Create(anyhow::anyhow!("create task cancelled: {e}"))),
        }
    }

    async fn drive(
        &self,
        unit: &str,
        deadline: &mut Deadline,
        begun: Instant,
    ) -> Result<ExecutionResult, RunError> {
        let timed_out = |cause: DeadlineCause, since: Instant| RunError::DeadlineExceeded {
            cause,
            elapsed: since.elapsed(),
        };

        bounded(deadline, self.runtime.start(unit))
            .await
            .map_err(|cause| timed_out(cause, begun))?
            .map_err(RunError::Start)?;
        let started = Instant::now();

        let status = bounded(deadline, self.runtime.wait(unit))
            .await
            .map_err(|cause| timed_out(cause, started))?;
        let elapsed = started.elapsed();
        let exit_code = status.map_err(RunError::Wait)?;

        // An exit racing the deadline is discarded.
        if let Some(cause) = deadline.check() {
            return Err(RunError::DeadlineExceeded { cause, elapsed });
        }

        let (reason, exit_code) = classify(exit_code, false);
        // Any non-zero exit may be a kill; reporting needs the runtime's verdict.
        let oom_killed = if reason == TerminationReason::Success {
            None
        } else {
            bounded(deadline, self.runtime.oom_killed(unit))
                .await
                .map_err(|cause| timed_out(cause, started))?
                .unwrap_or_else(|e| {
                    warn!(unit = %unit, error = %e, "Could not determine OOM state");
                    None
                })
        };

        let output = bounded(deadline, self.runtime.logs(unit))
            .await
            .map_err(|cause| timed_out(cause, started))?
            .map_err(RunError::Logs)?;

        debug!(exit_code, reason = %reason, duration_s = elapsed.as_secs_f64(), "Sandbox unit exited");
        Ok(ExecutionResult {
            output: output.combined(),
            duration: elapsed.as_secs_f64(),
            exit_code,
            termination_reason: Some(reason),
            oom_killed,
        })
    }
}

/// Await `stage` unless `deadline` fires first.
async fn bounded<F: Future>(deadline: &mut Deadline, stage: F) -> Result<F::Output, DeadlineCause> {
    tokio::select! {
        biased;
        cause = deadline.expired() => Err(cause),
        value = stage => Ok(value),
    }
}
