//! Process supervision: domain start, stop, and thread placement.
//!
//! The supervisor owns the collaborators (cgroup backend, host device
//! backend) and the daemon configuration; every lifecycle operation runs
//! under the domain's job lock. Start is all-or-nothing: any failure tears
//! the domain back down to `Shutoff(Failed)` before the error is returned.
//! Stop is best-effort and never fails.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, info, warn};

use crate::cgroup::{is_busy, CgroupBackend, CgroupV2, Scope};
use crate::config::Config;
use crate::domain::{
    api_socket_path, domain_run_dir, Domain, DomainConfig, DomainRecord, DomainState, JobKind,
    PausedReason, RunningReason, ShutoffReason,
};
use crate::hostdev::{HostdevBackend, NoopHostdev};
use crate::monitor::{kill_process, Monitor, ThreadRecord, ThreadRole, VmState};
use crate::netdev;
use crate::placement::{place_thread, DomainPlacement, ThreadKind, ThreadPlacement};
use crate::registry::{DomainObj, Registry};

const CGROUP_REMOVE_ATTEMPTS: u32 = 5;
const CGROUP_REMOVE_BACKOFF: Duration = Duration::from_millis(200);

/// True when a signal can be delivered to `pid`, i.e. the process exists.
pub(crate) fn pid_alive(pid: i32) -> bool {
    if pid <= 1 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn write_pid_file(run_dir: &Path, pid: i32) -> Result<()> {
    let path = run_dir.join("pid");
    std::fs::write(&path, pid.to_string())
        .with_context(|| format!("writing pid file {}", path.display()))
}

fn remove_pid_file(run_dir: &Path) -> Result<()> {
    let path = run_dir.join("pid");
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing pid file {}", path.display())),
    }
}

/// Shared daemon context for domain lifecycle operations.
pub struct Supervisor {
    pub config: Config,
    pub registry: Registry,
    pub(crate) cgroup: Arc<dyn CgroupBackend>,
    pub(crate) hostdev: Arc<dyn HostdevBackend>,
}

impl Supervisor {
    pub fn new(config: Config) -> Supervisor {
        let cgroup = Arc::new(CgroupV2::new(&config.cgroup));
        Supervisor::with_backends(config, cgroup, Arc::new(NoopHostdev))
    }

    pub fn with_backends(
        config: Config,
        cgroup: Arc<dyn CgroupBackend>,
        hostdev: Arc<dyn HostdevBackend>,
    ) -> Supervisor {
        Supervisor {
            config,
            registry: Registry::new(),
            cgroup,
            hostdev,
        }
    }

    /// Register a new domain definition and persist it.
    pub async fn define(&self, config: DomainConfig) -> Result<Arc<DomainObj>> {
        validate_domain_config(&config)?;
        let obj = self.registry.add(config).await?;
        {
            let domain = obj.runtime.lock().await;
            domain.record().save(&self.config.state_dir)?;
        }
        info!(domain = %obj.name, uuid = %obj.uuid, "domain defined");
        Ok(obj)
    }

    /// Re-register a persisted domain without touching its record on disk.
    pub async fn adopt(&self, record: DomainRecord) -> Result<Arc<DomainObj>> {
        let obj = self.registry.add(record.config).await?;
        {
            let mut domain = obj.runtime.lock().await;
            domain.state = record.state;
            domain.pid = record.pid;
        }
        Ok(obj)
    }

    /// Start a defined domain: spawn the hypervisor, hand off network
    /// devices, place the process and its threads, and boot the guest.
    pub async fn start(&self, obj: &Arc<DomainObj>) -> Result<()> {
        let _job = obj
            .begin_job(JobKind::Modify, "start", self.config.job_timeout())
            .await?;
        let mut domain = obj.runtime.lock().await;
        if domain.state.is_active() {
            bail!("domain '{}' is already running", obj.name);
        }
        info!(domain = %obj.name, "starting domain");
        // Mid-operation record saves carry the job so a crashed start can be
        // recognized and rolled forward or back on reconnect.
        domain.job = obj.current_job();

        match self.start_locked(&mut domain).await {
            Ok(()) => {
                info!(domain = %obj.name, pid = domain.pid, "domain started");
                Ok(())
            }
            Err(e) => {
                warn!(domain = %obj.name, error = %e, "start failed, tearing down");
                self.stop_locked(&mut domain, ShutoffReason::Failed).await;
                Err(e)
            }
        }
    }

    async fn start_locked(&self, domain: &mut Domain) -> Result<()> {
        let config = domain.config.clone();
        let hypervisor = &self.config.hypervisor;

        self.hostdev
            .prepare(&config.name, &config.hostdevs, true)
            .context("preparing host devices")?;

        let run_dir = domain_run_dir(&self.config.run_dir, &config);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating run dir {}", run_dir.display()))?;

        let socket = api_socket_path(&self.config.run_dir, &config);
        let monitor = Monitor::create(
            &hypervisor.binary,
            &socket,
            &config.vm_config,
            hypervisor.socket_timeout(),
            hypervisor.request_timeout(),
        )
        .await?;
        let pid = monitor.pid();
        domain.pid = Some(pid);
        domain.monitor = Some(monitor);
        write_pid_file(&run_dir, pid)?;
        domain.record().save(&self.config.state_dir)?;

        // Every network device is handed off before boot; the hypervisor
        // must never bring up a guest with taps it does not hold yet.
        for device in &config.networks {
            let fds = netdev::open_tap(&device.tap, device.num_queues)?;
            netdev::add_net(&socket, device, fds, hypervisor.request_timeout()).await?;
            netdev::set_link_up(&device.tap).await?;
        }

        domain.auto_cpuset = config.placement.auto_cpuset()?;
        if self.cgroup.available() {
            let scope = self
                .cgroup
                .machine_scope(&config.machine_name(), true)
                .context("creating domain cgroup scope")?;
            self.cgroup
                .add_process(&scope, pid)
                .context("moving hypervisor into domain scope")?;
            domain.cgroup = Some(scope);
        }

        // Whole-process affinity before threads exist; per-thread placement
        // refines it after boot.
        let process_mask = domain
            .auto_cpuset
            .as_ref()
            .or(config.placement.cpuset.as_ref());
        if let Some(mask) = process_mask {
            mask.apply_to_task(pid)
                .context("setting process cpu affinity")?;
        }

        let Some(monitor) = domain.monitor.as_ref() else {
            bail!("domain '{}' lost its monitor before boot", config.name);
        };
        monitor.boot().await.context("booting guest")?;

        self.setup_threads(domain)?;
        self.update_info(domain, RunningReason::Booted).await?;

        // The running record must land on disk before start reports success;
        // a domain we cannot persist is torn back down like any other start
        // failure.
        domain.job = None;
        domain.record().save(&self.config.state_dir)?;
        Ok(())
    }

    /// Tear a domain down. Individual cleanup failures are logged and
    /// skipped; the domain always ends up `Shutoff(reason)`.
    pub async fn stop(&self, obj: &Arc<DomainObj>, reason: ShutoffReason) -> Result<()> {
        let _job = obj
            .begin_job(JobKind::Destroy, "stop", self.config.job_timeout())
            .await?;
        let mut domain = obj.runtime.lock().await;
        if !domain.state.is_active() && domain.pid.is_none() {
            debug!(domain = %obj.name, "stop on inactive domain is a no-op");
            return Ok(());
        }
        self.stop_locked(&mut domain, reason).await;
        Ok(())
    }

    pub(crate) async fn stop_locked(&self, domain: &mut Domain, reason: ShutoffReason) {
        info!(domain = %domain.config.name, ?reason, "stopping domain");

        if let Some(monitor) = domain.monitor.take() {
            if reason == ShutoffReason::Shutdown {
                if let Err(e) = monitor.shutdown_vm().await {
                    debug!(domain = %domain.config.name, error = %e,
                        "guest power-down request failed, proceeding with teardown");
                }
            }
            monitor.close().await;
        }
        if let Some(pid) = domain.pid.take() {
            if pid_alive(pid) {
                kill_process(pid);
            }
        }
        // Host devices go back to the host before the cgroup disappears,
        // matching the start order in reverse.
        if let Err(e) = self
            .hostdev
            .reattach(&domain.config.name, &domain.config.hostdevs)
        {
            warn!(domain = %domain.config.name, error = %e, "host device reattach failed");
        }
        if let Some(scope) = domain.cgroup.take() {
            self.remove_cgroup(&scope).await;
        }

        domain.vcpu_tids.clear();
        domain.auto_cpuset = None;
        domain.console_path = None;
        domain.serial_path = None;
        domain.job = None;
        domain.state = DomainState::Shutoff(reason);

        let run_dir = domain_run_dir(&self.config.run_dir, &domain.config);
        if let Err(e) = remove_pid_file(&run_dir) {
            warn!(domain = %domain.config.name, error = %e, "pid file cleanup failed");
        }
        match tokio::fs::remove_dir_all(&run_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(domain = %domain.config.name, error = %e, "run dir cleanup failed")
            }
        }
        if let Err(e) = domain.record().save(&self.config.state_dir) {
            warn!(domain = %domain.config.name, error = %e, "saving shutoff record failed");
        }
        info!(domain = %domain.config.name, "domain stopped");
    }

    /// Remove the machine scope, waiting out transient EBUSY while the
    /// kernel finishes reaping exited threads.
    async fn remove_cgroup(&self, scope: &Scope) {
        for attempt in 1..=CGROUP_REMOVE_ATTEMPTS {
            match self.cgroup.remove(scope) {
                Ok(()) => return,
                Err(e) if is_busy(&e) && attempt < CGROUP_REMOVE_ATTEMPTS => {
                    debug!(scope = %scope.path().display(), attempt, "cgroup scope busy, retrying");
                    tokio::time::sleep(CGROUP_REMOVE_BACKOFF).await;
                }
                Err(e) => {
                    warn!(scope = %scope.path().display(), error = %e, "cgroup scope removal failed");
                    return;
                }
            }
        }
    }

    /// Discover the hypervisor's threads and place each by role: emulator
    /// threads first, then I/O threads, then vCPUs.
    pub(crate) fn setup_threads(&self, domain: &mut Domain) -> Result<()> {
        let (threads, iothreads): (Vec<ThreadRecord>, Vec<(i32, String)>) = {
            let Some(monitor) = domain.monitor.as_mut() else {
                bail!(
                    "domain '{}' has no monitor connection",
                    domain.config.name
                );
            };
            monitor
                .refresh_thread_info()
                .context("discovering hypervisor threads")?;
            (monitor.threads().to_vec(), monitor.get_iothreads())
        };

        domain.vcpu_tids = threads
            .iter()
            .filter_map(|record| match record.role {
                ThreadRole::Vcpu { index } => Some((index, record.tid)),
                _ => None,
            })
            .collect();

        let placement = &domain.config.placement;
        if domain.vcpu_tids.is_empty() && !placement.vcpu_pins.is_empty() {
            // Without per-thread ids a vCPU pin that differs from the
            // domain-wide mask can never be honored.
            let domain_mask = placement.cpuset.as_ref();
            if placement.vcpu_pins.values().any(|pin| Some(pin) != domain_mask) {
                bail!(
                    "per-vCPU pinning on domain '{}' requires vCPU thread ids \
                     from the hypervisor",
                    domain.config.name
                );
            }
        }

        let dom = DomainPlacement {
            auto_cpuset: domain.auto_cpuset.as_ref(),
            domain_cpumask: placement.cpuset.as_ref(),
            mem_nodeset: placement.mem_nodeset(),
        };
        let scope = domain.cgroup.as_ref();

        for record in &threads {
            if let ThreadRole::Emulator { name } = &record.role {
                debug!(domain = %domain.config.name, tid = record.tid, thread = %name,
                    "placing emulator thread");
                let th = ThreadPlacement {
                    tid: record.tid,
                    kind: ThreadKind::Emulator,
                    index: 0,
                    cpumask: placement.emulator_pin.as_ref(),
                    period: placement.emulator_period,
                    quota: placement.emulator_quota,
                    sched: None,
                };
                place_thread(self.cgroup.as_ref(), scope, &dom, &th)
                    .with_context(|| format!("placing emulator thread '{}'", name))?;
            }
        }

        for (index, (tid, name)) in iothreads.iter().enumerate() {
            debug!(domain = %domain.config.name, tid = *tid, thread = %name,
                "placing io thread");
            let th = ThreadPlacement {
                tid: *tid,
                kind: ThreadKind::IoThread,
                index: index as u32,
                cpumask: placement.iothread_pins.get(name),
                period: placement.iothread_period,
                quota: placement.iothread_quota,
                sched: placement.iothread_sched,
            };
            place_thread(self.cgroup.as_ref(), scope, &dom, &th)
                .with_context(|| format!("placing io thread '{}'", name))?;
        }

        let vcpus: Vec<(u32, i32)> = domain
            .vcpu_tids
            .iter()
            .map(|(index, tid)| (*index, *tid))
            .collect();
        for (index, tid) in vcpus {
            self.setup_vcpu(domain, index, tid)?;
        }
        Ok(())
    }

    /// Placement for a single vCPU thread.
    pub(crate) fn setup_vcpu(&self, domain: &Domain, index: u32, tid: i32) -> Result<()> {
        let placement = &domain.config.placement;
        debug!(domain = %domain.config.name, vcpu = index, tid, "placing vcpu thread");
        let dom = DomainPlacement {
            auto_cpuset: domain.auto_cpuset.as_ref(),
            domain_cpumask: placement.cpuset.as_ref(),
            mem_nodeset: placement.mem_nodeset(),
        };
        let th = ThreadPlacement {
            tid,
            kind: ThreadKind::Vcpu,
            index,
            cpumask: placement.vcpu_pins.get(&index),
            period: placement.vcpu_period,
            quota: placement.vcpu_quota,
            sched: placement.vcpu_sched,
        };
        place_thread(self.cgroup.as_ref(), domain.cgroup.as_ref(), &dom, &th)
            .with_context(|| format!("placing vcpu {}", index))
    }

    /// Refresh state and console paths from the hypervisor's view.
    pub(crate) async fn update_info(
        &self,
        domain: &mut Domain,
        reason: RunningReason,
    ) -> Result<()> {
        let Some(monitor) = domain.monitor.as_ref() else {
            bail!(
                "domain '{}' has no monitor connection",
                domain.config.name
            );
        };
        let info = monitor.get_info().await.context("querying guest state")?;
        domain.state = match info.state {
            VmState::Created => DomainState::NoState,
            VmState::Running => DomainState::Running(reason),
            VmState::Paused => DomainState::Paused(PausedReason::User),
            VmState::Shutdown => DomainState::Shutdown,
        };
        domain.console_path = info.console_path;
        domain.serial_path = info.serial_path;
        Ok(())
    }
}

fn validate_domain_config(config: &DomainConfig) -> Result<()> {
    ensure!(!config.name.is_empty(), "domain name must not be empty");
    ensure!(
        config
            .name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
        "domain name '{}' contains invalid characters",
        config.name
    );
    ensure!(config.vcpus >= 1, "domain needs at least one vcpu");
    for index in config.placement.vcpu_pins.keys() {
        ensure!(
            *index < config.vcpus,
            "vcpu pin index {} out of range (domain has {} vcpus)",
            index,
            config.vcpus
        );
    }
    for device in &config.networks {
        ensure!(
            device.num_queues >= 1,
            "network device '{}' needs at least one queue",
            device.id
        );
    }
    Ok(())
}
