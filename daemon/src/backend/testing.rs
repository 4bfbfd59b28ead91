//! Scripted in-memory runtime for tests.
//!
//! Behaviour is keyed on the submitted code; unknown code exits 0 and echoes
//! itself on stdout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{ContainerRuntime, UnitOutput, UnitSpec};

/// Stage at which a scripted failure is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    Start,
    Wait,
    Logs,
}

/// What a unit running a given piece of code does.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    pub exit_code: i64,
    pub delay: Duration,
    pub stdout: Option<String>,
    pub stderr: String,
    pub fail_at: Option<Stage>,
    pub panic_on_create: bool,
    pub oom_killed: Option<bool>,
    /// Extra latency injected before a stage completes.
    pub stall: Option<(Stage, Duration)>,
    /// Wait blocks until a permit is added.
    pub gate: Option<Arc<Semaphore>>,
}

impl Behaviour {
    pub fn exits(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn sleeps(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fails_at(stage: Stage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::default()
        }
    }

    pub fn stalls(stage: Stage, delay: Duration) -> Self {
        Self {
            stall: Some((stage, delay)),
            ..Self::default()
        }
    }

    pub fn panics() -> Self {
        Self {
            panic_on_create: true,
            ..Self::default()
        }
    }

    pub fn with_exit(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = Some(stdout.to_string());
        self.stderr = stderr.to_string();
        self
    }

    pub const fn with_oom_killed(mut self, oom: bool) -> Self {
        self.oom_killed = Some(oom);
        self
    }

    async fn stall_at(&self, stage: Stage) {
        if let Some((at, delay)) = self.stall {
            if at == stage {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    units: HashMap<String, String>,
    created: Vec<String>,
    created_codes: Vec<String>,
    started: Vec<String>,
    removed: Vec<String>,
    live: usize,
    max_live: usize,
}

#[derive(Debug, Default)]
pub struct MockRuntime {
    scripts: Mutex<HashMap<String, Behaviour>>,
    state: Mutex<State>,
    fail_removes: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `remove` call reports an error, as if the unit were already gone.
    pub fn failing_removes() -> Self {
        Self {
            fail_removes: true,
            ..Self::default()
        }
    }

    pub fn on(self, code: &str, behaviour: Behaviour) -> Self {
        self.script(code, behaviour);
        self
    }

    pub fn script(&self, code: &str, behaviour: Behaviour) {
        self.scripts
            .lock()
            .unwrap()
            .insert(code.to_string(), behaviour);
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    /// Submitted code, in the order units were created.
    pub fn created_codes(&self) -> Vec<String> {
        self.state.lock().unwrap().created_codes.clone()
    }

    pub fn started(&self) -> usize {
        self.state.lock().unwrap().started.len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    /// Poll until at least `n` units have started.
    pub async fn wait_started(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.started() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("units did not start in time");
    }

    /// Poll until at least `n` units have been removed.
    pub async fn wait_removed(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.removed().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("units were not removed in time");
    }

    fn behaviour_for_unit(&self, unit: &str) -> Result<(String, Behaviour)> {
        let code = self
            .state
            .lock()
            .unwrap()
            .units
            .get(unit)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such container: {unit}"))?;
        let behaviour = self.behaviour_for_code(&code);
        Ok((code, behaviour))
    }

    fn behaviour_for_code(&self, code: &str) -> Behaviour {
        self.scripts
            .lock()
            .unwrap()
            .get(code)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &UnitSpec) -> Result<String> {
        let code = spec.command.last().cloned().unwrap_or_default();
        let behaviour = self.behaviour_for_code(&code);
        assert!(!behaviour.panic_on_create, "scripted panic in create");
        behaviour.stall_at(Stage::Create).await;
        if behaviour.fail_at == Some(Stage::Create) {
            anyhow::bail!("image not found");
        }

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("unit-{}", state.next_id);
        state.units.insert(id.clone(), code.clone());
        state.created.push(id.clone());
        state.created_codes.push(code);
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        Ok(id)
    }

    async fn start(&self, unit: &str) -> Result<()> {
        let (_, behaviour) = self.behaviour_for_unit(unit)?;
        behaviour.stall_at(Stage::Start).await;
        if behaviour.fail_at == Some(Stage::Start) {
            anyhow::bail!("OCI runtime create failed");
        }
        self.state.lock().unwrap().started.push(unit.to_string());
        Ok(())
    }

    async fn wait(&self, unit: &str) -> Result<i64> {
        let (_, behaviour) = self.behaviour_for_unit(unit)?;
        if let Some(gate) = &behaviour.gate {
            gate.acquire().await?.forget();
        }
        tokio::time::sleep(behaviour.delay).await;
        if behaviour.fail_at == Some(Stage::Wait) {
            anyhow::bail!("connection reset while waiting");
        }
        Ok(behaviour.exit_code)
    }

    async fn logs(&self, unit: &str) -> Result<UnitOutput> {
        let (code, behaviour) = self.behaviour_for_unit(unit)?;
        behaviour.stall_at(Stage::Logs).await;
        if behaviour.fail_at == Some(Stage::Logs) {
            anyhow::bail!("log driver unavailable");
        }
        Ok(UnitOutput {
            stdout: behaviour
                .stdout
                .unwrap_or_else(|| format!("executed: {code}\n")),
            stderr: behaviour.stderr,
        })
    }

    async fn remove(&self, unit: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed.push(unit.to_string());
        if state.units.remove(unit).is_some() {
            state.live -= 1;
        }
        if self.fail_removes {
            anyhow::bail!("No such container: {unit}");
        }
        Ok(())
    }

    async fn oom_killed(&self, unit: &str) -> Result<Option<bool>> {
        let (_, behaviour) = self.behaviour_for_unit(unit)?;
        Ok(behaviour.oom_killed)
    }
}
