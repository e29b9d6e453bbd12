//! Domain definitions, lifecycle state, and the persisted record that
//! survives daemon restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cgroup::Scope;
use crate::monitor::Monitor;
use crate::placement::{CpuMask, PlacementConfig};

/// User-supplied definition of one domain. The `vm_config` payload is opaque
/// to the daemon and forwarded verbatim to the hypervisor's create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub name: String,
    pub uuid: Uuid,
    /// Number of vCPUs the definition declares; used to validate pinning.
    pub vcpus: u32,
    #[serde(default)]
    pub placement: PlacementConfig,
    /// Network devices to hand off before boot, in definition order.
    #[serde(default)]
    pub networks: Vec<NetworkDevice>,
    /// Host devices to reserve before launch.
    #[serde(default)]
    pub hostdevs: Vec<String>,
    /// Opaque hypervisor VM configuration.
    pub vm_config: serde_json::Value,
}

impl DomainConfig {
    /// Scope/socket-safe machine name: short uuid prefix plus the name,
    /// so two domains with the same name never collide on disk.
    pub fn machine_name(&self) -> String {
        let uuid = self.uuid.simple().to_string();
        format!("{}-{}", &uuid[..8], self.name)
    }
}

/// One tap-backed network device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDevice {
    /// Interface id within the VM config, e.g. "net0".
    pub id: String,
    /// Host tap interface name.
    pub tap: String,
    pub mac: String,
    /// Multi-queue pair count; one fd per queue pair is transferred.
    #[serde(default = "default_queues")]
    pub num_queues: u32,
}

fn default_queues() -> u32 {
    1
}

/// Lifecycle state with the reason it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum DomainState {
    /// Defined but never started.
    NoState,
    Running(RunningReason),
    Paused(PausedReason),
    /// Guest initiated shutdown; process may still be winding down.
    Shutdown,
    Shutoff(ShutoffReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningReason {
    Booted,
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PausedReason {
    User,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutoffReason {
    Shutdown,
    Destroyed,
    Failed,
    /// Daemon tore the domain down itself (e.g. reconnect found it stopping).
    Daemon,
    Unknown,
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainState::NoState => write!(f, "no-state"),
            DomainState::Running(RunningReason::Booted) => write!(f, "running (booted)"),
            DomainState::Running(RunningReason::Reconnected) => {
                write!(f, "running (reconnected)")
            }
            DomainState::Paused(PausedReason::User) => write!(f, "paused (user)"),
            DomainState::Paused(PausedReason::ShuttingDown) => {
                write!(f, "paused (shutting down)")
            }
            DomainState::Shutdown => write!(f, "shutting down"),
            DomainState::Shutoff(reason) => {
                let reason = match reason {
                    ShutoffReason::Shutdown => "shutdown",
                    ShutoffReason::Destroyed => "destroyed",
                    ShutoffReason::Failed => "failed",
                    ShutoffReason::Daemon => "daemon",
                    ShutoffReason::Unknown => "unknown",
                };
                write!(f, "shut off ({})", reason)
            }
        }
    }
}

impl DomainState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running(_) | DomainState::Paused(_) | DomainState::Shutdown
        )
    }
}

/// Exclusive modification job on one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    /// Task that holds the job, for diagnostics only.
    pub owner: String,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Modify,
    Destroy,
}

/// Mutable per-domain runtime state, guarded by the registry's lock.
pub struct Domain {
    pub config: DomainConfig,
    pub state: DomainState,
    pub pid: Option<i32>,
    pub monitor: Option<Monitor>,
    /// Machine scope while the domain is placed in a cgroup.
    pub cgroup: Option<Scope>,
    /// vCPU index to thread id, from the last thread inventory.
    pub vcpu_tids: HashMap<u32, i32>,
    /// NUMA-derived cpuset, when automatic placement resolved one.
    pub auto_cpuset: Option<CpuMask>,
    pub job: Option<Job>,
    pub console_path: Option<PathBuf>,
    pub serial_path: Option<PathBuf>,
}

impl Domain {
    pub fn new(config: DomainConfig) -> Domain {
        Domain {
            config,
            state: DomainState::NoState,
            pid: None,
            monitor: None,
            cgroup: None,
            vcpu_tids: HashMap::new(),
            auto_cpuset: None,
            job: None,
            console_path: None,
            serial_path: None,
        }
    }

    /// Snapshot for persistence. The monitor and cgroup handles are runtime
    /// only; the record keeps what reconnection needs to find them again.
    pub fn record(&self) -> DomainRecord {
        DomainRecord {
            config: self.config.clone(),
            state: self.state,
            pid: self.pid,
            job: self.job.clone(),
        }
    }
}

/// On-disk form of a domain, one JSON file per domain under the state dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub config: DomainConfig,
    pub state: DomainState,
    pub pid: Option<i32>,
    /// Job that was in flight when the daemon last saved; reconnection
    /// restores it so the interrupted operation can be finished or undone.
    pub job: Option<Job>,
}

impl DomainRecord {
    fn path(state_dir: &Path, name: &str) -> PathBuf {
        state_dir.join(format!("{name}.json"))
    }

    /// Write atomically: temp file then rename, so a crash mid-write never
    /// leaves a truncated record.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        let path = Self::path(state_dir, &self.config.name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self).context("encoding domain record")?;
        std::fs::write(&tmp, data)
            .with_context(|| format!("writing domain record {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming domain record into {}", path.display()))?;
        debug!(domain = %self.config.name, path = %path.display(), "saved domain record");
        Ok(())
    }

    pub fn delete(state_dir: &Path, name: &str) -> Result<()> {
        let path = Self::path(state_dir, name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("removing domain record {}", path.display()))
            }
        }
    }

    /// Load every record in the state dir. Unreadable records are skipped
    /// with a warning so one corrupt file cannot block daemon startup.
    pub fn load_all(state_dir: &Path) -> Result<Vec<DomainRecord>> {
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading state dir {}", state_dir.display()))
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable domain record");
                    continue;
                }
            };
            match serde_json::from_slice::<DomainRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt domain record");
                }
            }
        }
        records.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        Ok(records)
    }
}

/// Runtime directory for one domain (API socket, logs).
pub fn domain_run_dir(run_dir: &Path, config: &DomainConfig) -> PathBuf {
    run_dir.join(config.machine_name())
}

pub fn api_socket_path(run_dir: &Path, config: &DomainConfig) -> PathBuf {
    domain_run_dir(run_dir, config).join("api.sock")
}


#[cfg(test)]
mod tests {
    use super::testing::sample_config;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_machine_name_is_stable_and_collision_safe() {
        let config = sample_config("web");
        let name = config.machine_name();
        assert!(name.ends_with("-web"));
        assert_eq!(name.len(), 8 + 1 + 3);
        assert_eq!(name, config.machine_name());

        let other = sample_config("web");
        assert_ne!(name, other.machine_name());
    }

    #[test]
    fn test_state_roundtrip_and_tagging() {
        let state = DomainState::Running(RunningReason::Reconnected);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"running","reason":"reconnected"}"#);
        let back: DomainState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        let json = serde_json::to_string(&DomainState::NoState).unwrap();
        let back: DomainState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DomainState::NoState);
    }

    #[test]
    fn test_is_active() {
        assert!(DomainState::Running(RunningReason::Booted).is_active());
        assert!(DomainState::Paused(PausedReason::ShuttingDown).is_active());
        assert!(DomainState::Shutdown.is_active());
        assert!(!DomainState::NoState.is_active());
        assert!(!DomainState::Shutoff(ShutoffReason::Destroyed).is_active());
    }

    #[test]
    fn test_record_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let mut domain = Domain::new(sample_config("db"));
        domain.state = DomainState::Running(RunningReason::Booted);
        domain.pid = Some(4242);
        domain.job = Some(Job {
            kind: JobKind::Modify,
            owner: "start".into(),
            started: Utc::now(),
        });

        domain.record().save(dir.path()).unwrap();
        let loaded = DomainRecord::load_all(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].config.name, "db");
        assert_eq!(loaded[0].pid, Some(4242));
        assert_eq!(loaded[0].state, DomainState::Running(RunningReason::Booted));
        assert_eq!(loaded[0].job.as_ref().unwrap().kind, JobKind::Modify);

        DomainRecord::delete(dir.path(), "db").unwrap();
        assert!(DomainRecord::load_all(dir.path()).unwrap().is_empty());
        // Deleting again is not an error.
        DomainRecord::delete(dir.path(), "db").unwrap();
    }

    #[test]
    fn test_load_all_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        Domain::new(sample_config("good")).record().save(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let loaded = DomainRecord::load_all(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].config.name, "good");
    }

    #[test]
    fn test_load_all_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(DomainRecord::load_all(&missing).unwrap().is_empty());
    }
}
