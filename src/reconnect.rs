//! Crash-recovery reconnection to hypervisor processes that outlived the
//! previous daemon instance.
//!
//! One enumeration pass over the persisted records, then one task per domain
//! with a recorded pid. Tasks do not communicate; each owns its domain
//! through the job it holds. A domain that cannot be recovered is forcibly
//! stopped rather than left as an unsupervised process.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::{
    api_socket_path, Domain, DomainRecord, DomainState, Job, JobKind, PausedReason,
    RunningReason, ShutoffReason,
};
use crate::monitor::{kill_process, Monitor, ThreadRole};
use crate::process::Supervisor;
use crate::registry::DomainObj;

enum Outcome {
    /// The domain is alive and back under supervision.
    Active,
    /// The domain was already winding down; finish the stop for it.
    FinishStop,
}

/// Load every persisted domain and recover the ones with a recorded pid.
/// Returns once all recovery tasks have finished.
pub async fn reconnect_all(supervisor: &Arc<Supervisor>) -> Result<()> {
    let records = DomainRecord::load_all(&supervisor.config.state_dir)
        .context("enumerating persisted domains")?;
    if records.is_empty() {
        debug!("no persisted domains to reconnect");
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for record in records {
        let name = record.config.name.clone();
        let prior_job = record.job.clone();
        let obj = match supervisor.adopt(record).await {
            Ok(obj) => obj,
            Err(e) => {
                warn!(domain = %name, error = %e, "could not re-register persisted domain");
                continue;
            }
        };
        let pid = obj.runtime.lock().await.pid;
        let Some(pid) = pid else {
            debug!(domain = %name, "no recorded pid, nothing to reconnect");
            continue;
        };
        info!(domain = %name, pid, "reconnecting to hypervisor process");
        let supervisor = Arc::clone(supervisor);
        tasks.spawn(async move {
            reconnect_domain(supervisor, obj, prior_job).await;
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "reconnection task panicked");
        }
    }
    Ok(())
}

async fn reconnect_domain(
    supervisor: Arc<Supervisor>,
    obj: Arc<DomainObj>,
    prior_job: Option<Job>,
) {
    let guard = match prior_job {
        Some(job) => obj.restore_job(job),
        None => {
            obj.begin_job(JobKind::Modify, "reconnect", supervisor.config.job_timeout())
                .await
        }
    };
    let _guard = match guard {
        Ok(guard) => guard,
        Err(e) => {
            warn!(domain = %obj.name, error = %e,
                "could not take the domain job for recovery, forcing the domain down");
            let mut domain = obj.runtime.lock().await;
            force_down(&supervisor, &mut domain).await;
            return;
        }
    };

    let mut domain = obj.runtime.lock().await;
    match reconnect_locked(&supervisor, &mut domain).await {
        Ok(Outcome::Active) => {
            if let Err(e) = domain.record().save(&supervisor.config.state_dir) {
                warn!(domain = %obj.name, error = %e, "saving reconnected domain failed");
            }
            info!(domain = %obj.name, pid = domain.pid, state = ?domain.state,
                "domain reconnected");
        }
        Ok(Outcome::FinishStop) => {
            info!(domain = %obj.name, "domain was shutting down, finishing the stop");
            supervisor
                .stop_locked(&mut domain, ShutoffReason::Daemon)
                .await;
        }
        Err(e) => {
            warn!(domain = %obj.name, error = %e,
                "reconnection failed, forcing the domain down");
            force_down(&supervisor, &mut domain).await;
        }
    }
}

/// An unrecoverable domain must not keep an unsupervised process running.
async fn force_down(supervisor: &Supervisor, domain: &mut Domain) {
    if let Some(pid) = domain.pid {
        kill_process(pid);
    }
    supervisor
        .stop_locked(domain, ShutoffReason::Unknown)
        .await;
}

async fn reconnect_locked(supervisor: &Supervisor, domain: &mut Domain) -> Result<Outcome> {
    let config = domain.config.clone();
    let Some(pid) = domain.pid else {
        bail!("domain '{}' has no recorded pid", config.name);
    };

    supervisor
        .hostdev
        .update_active(&config.name, &config.hostdevs)
        .context("re-marking host devices active")?;

    let socket = api_socket_path(&supervisor.config.run_dir, &config);
    let monitor = Monitor::open(&socket, pid, supervisor.config.hypervisor.request_timeout())
        .await
        .context("reattaching to hypervisor control socket")?;
    domain.monitor = Some(monitor);

    // Rederive the cgroup handle; the scope survived with the process. A
    // missing scope only disables placement updates, it is not fatal.
    if supervisor.cgroup.available() {
        match supervisor
            .cgroup
            .machine_scope(&config.machine_name(), false)
        {
            Ok(scope) => domain.cgroup = Some(scope),
            Err(e) => {
                debug!(domain = %config.name, error = %e, "no machine scope to reattach")
            }
        }
    }
    domain.auto_cpuset = config.placement.auto_cpuset()?;

    // Rebuild the thread inventory; placement itself is left as the running
    // process has it.
    if let Some(monitor) = domain.monitor.as_mut() {
        monitor
            .refresh_thread_info()
            .context("rebuilding thread inventory")?;
        domain.vcpu_tids = monitor
            .threads()
            .iter()
            .filter_map(|record| match record.role {
                ThreadRole::Vcpu { index } => Some((index, record.tid)),
                _ => None,
            })
            .collect();
    }

    let prior_state = domain.state;
    supervisor
        .update_info(domain, RunningReason::Reconnected)
        .await?;

    if domain.state == DomainState::Shutdown
        || prior_state == DomainState::Paused(PausedReason::ShuttingDown)
    {
        return Ok(Outcome::FinishStop);
    }
    Ok(Outcome::Active)
}
