use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the domaind daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one persisted record per domain.
    pub state_dir: PathBuf,
    /// Base directory for per-domain runtime files (API socket, pid file, log).
    pub run_dir: PathBuf,
    /// Seconds to wait for a domain's job lock before giving up.
    pub job_timeout_secs: u64,
    pub hypervisor: HypervisorConfig,
    pub cgroup: CgroupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/domaind"),
            run_dir: PathBuf::from("/run/domaind"),
            job_timeout_secs: 30,
            hypervisor: HypervisorConfig::default(),
            cgroup: CgroupConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.job_timeout_secs >= 1,
            "job_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            !self.cgroup.parent.is_empty(),
            "cgroup.parent must not be empty"
        );
        anyhow::ensure!(
            !self.cgroup.parent.contains('/'),
            "cgroup.parent must be a single path component"
        );
        anyhow::ensure!(
            self.hypervisor.request_timeout_secs >= 1,
            "hypervisor.request_timeout_secs must be >= 1"
        );
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Settings for the external hypervisor process and its control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Path to the hypervisor binary.
    pub binary: PathBuf,
    /// Seconds to wait for the API socket to appear after spawn.
    pub socket_timeout_secs: u64,
    /// Timeout applied to each individual control-socket request.
    pub request_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/cloud-hypervisor"),
            socket_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl HypervisorConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// cgroup v2 placement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Disable all cgroup placement when false; affinity still applies.
    pub enabled: bool,
    /// cgroup v2 mount point.
    pub root: PathBuf,
    /// Parent slice under the root holding all domain scopes.
    pub parent: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("/sys/fs/cgroup"),
            parent: "domaind.slice".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/domaind"));
        assert_eq!(config.run_dir, PathBuf::from("/run/domaind"));
        assert_eq!(config.job_timeout_secs, 30);
        assert_eq!(
            config.hypervisor.binary,
            PathBuf::from("/usr/bin/cloud-hypervisor")
        );
        assert!(config.cgroup.enabled);
        assert_eq!(config.cgroup.parent, "domaind.slice");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_job_timeout() {
        let mut config = Config::default();
        config.job_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("job_timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_nested_cgroup_parent() {
        let mut config = Config::default();
        config.cgroup.parent = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let parsed: Config = toml::from_str(
            r#"
            state_dir = "/tmp/domaind-state"

            [hypervisor]
            binary = "/opt/ch/cloud-hypervisor"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.state_dir, PathBuf::from("/tmp/domaind-state"));
        assert_eq!(parsed.run_dir, PathBuf::from("/run/domaind"));
        assert_eq!(
            parsed.hypervisor.binary,
            PathBuf::from("/opt/ch/cloud-hypervisor")
        );
        assert_eq!(parsed.hypervisor.request_timeout_secs, 10);
    }
}
