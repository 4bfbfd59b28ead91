//! Container runtime boundary.
//!
//! The runner drives sandbox units only through this narrow
//! create/start/wait/logs/remove contract. Isolation itself (namespaces,
//! cgroups, filesystem layering) belongs to the host's container runtime.

pub mod docker;
#[cfg(test)]
pub mod testing;

pub use docker::DockerRuntime;

use anyhow::Result;
use async_trait::async_trait;

/// A single resource limit applied inside the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ulimit {
    pub name: &'static str,
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    const fn fixed(name: &'static str, value: i64) -> Self {
        Self {
            name,
            soft: value,
            hard: value,
        }
    }
}

/// Security and resource profile every sandbox unit runs with.
///
/// Runtimes must additionally disable networking, mount the root filesystem
/// read-only, refuse privileged mode, drop every capability and forbid
/// privilege escalation. None of this is adjustable per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxProfile {
    /// Image providing the interpreter.
    pub image: String,
    /// Unprivileged uid the code runs as.
    pub user: String,
    /// Writable tmpfs mount inside the read-only root.
    pub scratch_dir: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub ulimits: Vec<Ulimit>,
}

impl SandboxProfile {
    /// The hardened defaults for `image`.
    pub fn hardened(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            user: "1000".to_string(),
            scratch_dir: "/tmp".to_string(),
            memory_bytes: 128 * 1024 * 1024,
            nano_cpus: 500_000_000,
            pids_limit: 20,
            ulimits: vec![
                Ulimit::fixed("nofile", 1024),
                Ulimit::fixed("nproc", 50),
                Ulimit::fixed("fsize", 10 * 1024 * 1024),
                Ulimit::fixed("core", 0),
            ],
        }
    }

    /// Build the provisioning request for one run of `code`.
    pub fn unit_spec(&self, code: &str) -> UnitSpec {
        UnitSpec {
            command: vec!["python".to_string(), "-c".to_string(), code.to_string()],
            profile: self.clone(),
        }
    }
}

/// Everything a runtime needs to provision one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub command: Vec<String>,
    pub profile: SandboxProfile,
}

/// Output captured from a terminated unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl UnitOutput {
    /// stdout followed by stderr.
    pub fn combined(self) -> String {
        let mut out = self.stdout;
        out.push_str(&self.stderr);
        out
    }
}

/// Trait for container runtimes.
///
/// A single runtime handle is shared by every worker, so implementations
/// must be safe for concurrent use.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Provision an unnamed unit and return its id.
    async fn create(&self, spec: &UnitSpec) -> Result<String>;

    async fn start(&self, unit: &str) -> Result<()>;

    /// Block until the unit stops and return its exit code.
    async fn wait(&self, unit: &str) -> Result<i64>;

    /// Read the complete output of a stopped unit.
    async fn logs(&self, unit: &str) -> Result<UnitOutput>;

    /// Stop and force-remove the unit.
    async fn remove(&self, unit: &str) -> Result<()>;

    /// Whether the runtime observed the unit being killed for memory.
    ///
    /// `None` means the runtime cannot tell.
    async fn oom_killed(&self, _unit: &str) -> Result<Option<bool>> {
        Ok(None)
    }
}
