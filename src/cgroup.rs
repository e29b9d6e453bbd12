//! cgroup v2 resource scopes for hypervisor processes and their threads.
//!
//! Each domain gets a machine-level scope under a parent slice; the placement
//! engine creates per-thread sub-scopes inside it. The backend trait keeps
//! mount detection and controller mechanics behind one seam so the supervisor
//! and tests can swap implementations.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::config::CgroupConfig;
use crate::placement::CpuMask;

/// Controllers the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    Cpu,
    Cpuset,
}

impl Controller {
    fn token(&self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::Cpuset => "cpuset",
        }
    }
}

/// Handle to one cgroup directory (machine scope or thread sub-scope).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    path: PathBuf,
}

impl Scope {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

pub trait CgroupBackend: Send + Sync {
    /// Whether any cgroup placement is possible on this host.
    fn available(&self) -> bool;

    fn has_controller(&self, controller: Controller) -> bool;

    /// Machine-level scope for one domain. With `create` false the scope must
    /// already exist (reconnection rederives it rather than recreating it).
    fn machine_scope(&self, machine: &str, create: bool) -> Result<Scope>;

    /// Per-thread sub-scope inside a machine scope, named by role and index.
    fn thread_scope(&self, parent: &Scope, name: &str, create: bool) -> Result<Scope>;

    fn add_process(&self, scope: &Scope, pid: i32) -> Result<()>;

    fn add_thread(&self, scope: &Scope, tid: i32) -> Result<()>;

    fn set_cpuset_cpus(&self, scope: &Scope, mask: &CpuMask) -> Result<()>;

    fn set_cpuset_mems(&self, scope: &Scope, mems: &CpuMask) -> Result<()>;

    /// CPU bandwidth limit: `period` microseconds per window, `quota`
    /// microseconds of runtime (<= 0 means unlimited).
    fn set_cpu_bandwidth(&self, scope: &Scope, period: u64, quota: i64) -> Result<()>;

    /// Remove the scope directory (children first). Busy errors bubble up so
    /// the caller can retry while the kernel finishes tearing down exited
    /// threads.
    fn remove(&self, scope: &Scope) -> Result<()>;
}

/// True when any error in the chain is EBUSY.
pub fn is_busy(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map_or(false, |io| io.raw_os_error() == Some(libc::EBUSY))
    })
}

/// cgroup v2 backend writing control files under the unified hierarchy.
pub struct CgroupV2 {
    enabled: bool,
    root: PathBuf,
    parent: String,
}

impl CgroupV2 {
    pub fn new(config: &CgroupConfig) -> Self {
        Self {
            enabled: config.enabled,
            root: config.root.clone(),
            parent: config.parent.clone(),
        }
    }

    fn parent_path(&self) -> PathBuf {
        self.root.join(&self.parent)
    }

    fn controllers(&self) -> String {
        // The parent slice advertises what its children may use; fall back to
        // the root when the slice does not exist yet.
        std::fs::read_to_string(self.parent_path().join("cgroup.controllers"))
            .or_else(|_| std::fs::read_to_string(self.root.join("cgroup.controllers")))
            .unwrap_or_default()
    }

    fn write_control(&self, scope: &Scope, file: &str, value: &str) -> Result<()> {
        let path = scope.path().join(file);
        std::fs::write(&path, value)
            .with_context(|| format!("writing {} to {}", value, path.display()))
    }

    fn enable_subtree(&self, dir: &std::path::Path) {
        let path = dir.join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&path, "+cpu +cpuset") {
            warn!(path = %path.display(), error = %e, "could not delegate cpu controllers");
        }
    }
}

impl CgroupBackend for CgroupV2 {
    fn available(&self) -> bool {
        self.enabled && self.root.join("cgroup.controllers").exists()
    }

    fn has_controller(&self, controller: Controller) -> bool {
        self.available()
            && self
                .controllers()
                .split_whitespace()
                .any(|token| token == controller.token())
    }

    fn machine_scope(&self, machine: &str, create: bool) -> Result<Scope> {
        let parent = self.parent_path();
        let path = parent.join(format!("{}.scope", machine));
        if create {
            std::fs::create_dir_all(&parent)
                .with_context(|| format!("creating parent slice {}", parent.display()))?;
            self.enable_subtree(&self.root);
            self.enable_subtree(&parent);
            std::fs::create_dir_all(&path)
                .with_context(|| format!("creating machine scope {}", path.display()))?;
            self.enable_subtree(&path);
            debug!(scope = %path.display(), "created machine scope");
        } else if !path.is_dir() {
            bail!("machine scope {} does not exist", path.display());
        }
        Ok(Scope::new(path))
    }

    fn thread_scope(&self, parent: &Scope, name: &str, create: bool) -> Result<Scope> {
        let path = parent.path().join(name);
        if create {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("creating thread scope {}", path.display()))?;
            // Sub-scopes hold individual threads of the hypervisor process,
            // which requires threaded mode on cgroup v2.
            if let Err(e) = std::fs::write(path.join("cgroup.type"), "threaded") {
                warn!(scope = %path.display(), error = %e, "could not mark scope threaded");
            }
        } else if !path.is_dir() {
            bail!("thread scope {} does not exist", path.display());
        }
        Ok(Scope::new(path))
    }

    fn add_process(&self, scope: &Scope, pid: i32) -> Result<()> {
        self.write_control(scope, "cgroup.procs", &pid.to_string())
    }

    fn add_thread(&self, scope: &Scope, tid: i32) -> Result<()> {
        self.write_control(scope, "cgroup.threads", &tid.to_string())
    }

    fn set_cpuset_cpus(&self, scope: &Scope, mask: &CpuMask) -> Result<()> {
        self.write_control(scope, "cpuset.cpus", &mask.to_list_string())
    }

    fn set_cpuset_mems(&self, scope: &Scope, mems: &CpuMask) -> Result<()> {
        self.write_control(scope, "cpuset.mems", &mems.to_list_string())
    }

    fn set_cpu_bandwidth(&self, scope: &Scope, period: u64, quota: i64) -> Result<()> {
        let period = if period != 0 { period } else { 100_000 };
        let value = if quota > 0 {
            format!("{} {}", quota, period)
        } else {
            format!("max {}", period)
        };
        self.write_control(scope, "cpu.max", &value)
    }

    fn remove(&self, scope: &Scope) -> Result<()> {
        // Thread sub-scopes must go before the machine scope itself.
        if let Ok(entries) = std::fs::read_dir(scope.path()) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    std::fs::remove_dir(entry.path()).with_context(|| {
                        format!("removing sub-scope {}", entry.path().display())
                    })?;
                }
            }
        }
        std::fs::remove_dir(scope.path())
            .with_context(|| format!("removing scope {}", scope.path().display()))
    }
}
