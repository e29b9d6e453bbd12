//! In-memory domain table and the per-domain job lock.
//!
//! Every operation that modifies a domain must hold a job on it. The job is
//! a slot separate from the runtime mutex so that its holder can release the
//! runtime lock during long waits (process spawn, monitor requests) without
//! letting a second modification interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Domain, DomainConfig, Job, JobKind};

/// One registered domain: identity, job slot, and lockable runtime state.
pub struct DomainObj {
    pub uuid: Uuid,
    pub name: String,
    job: Mutex<Option<Job>>,
    job_released: Notify,
    pub runtime: tokio::sync::Mutex<Domain>,
}

impl DomainObj {
    fn new(config: DomainConfig) -> DomainObj {
        DomainObj {
            uuid: config.uuid,
            name: config.name.clone(),
            job: Mutex::new(None),
            job_released: Notify::new(),
            runtime: tokio::sync::Mutex::new(Domain::new(config)),
        }
    }

    fn job_slot(&self) -> MutexGuard<'_, Option<Job>> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The currently held job, if any.
    pub fn current_job(&self) -> Option<Job> {
        self.job_slot().clone()
    }

    /// Acquire the job slot, waiting up to `timeout` for the current holder
    /// to finish. The returned guard releases the slot on drop.
    pub async fn begin_job(
        &self,
        kind: JobKind,
        owner: &str,
        timeout: Duration,
    ) -> Result<JobGuard<'_>> {
        let acquire = async {
            loop {
                // Register for the wakeup before checking the slot, so a
                // release between check and await cannot be missed.
                let released = self.job_released.notified();
                {
                    let mut slot = self.job_slot();
                    if slot.is_none() {
                        *slot = Some(Job {
                            kind,
                            owner: owner.to_string(),
                            started: Utc::now(),
                        });
                        debug!(domain = %self.name, ?kind, owner, "job acquired");
                        return JobGuard { domain: self };
                    }
                }
                released.await;
            }
        };
        match tokio::time::timeout(timeout, acquire).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let holder = self
                    .current_job()
                    .map(|job| job.owner)
                    .unwrap_or_else(|| "unknown".to_string());
                bail!(
                    "timed out waiting for job on domain '{}' (held by {})",
                    self.name,
                    holder
                )
            }
        }
    }

    /// Re-enter a job that a previous daemon instance held when it saved the
    /// domain record. Only valid before the domain accepts new jobs, i.e.
    /// during reconnection; fails if the slot is somehow taken.
    pub fn restore_job(&self, prior: Job) -> Result<JobGuard<'_>> {
        let mut slot = self.job_slot();
        if slot.is_some() {
            bail!("domain '{}' already has an active job", self.name);
        }
        debug!(domain = %self.name, kind = ?prior.kind, owner = %prior.owner, "restored interrupted job");
        *slot = Some(prior);
        Ok(JobGuard { domain: self })
    }
}

/// Holds the domain's job slot; releases it and wakes waiters on drop.
pub struct JobGuard<'a> {
    domain: &'a DomainObj,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.domain.job_slot();
        *slot = None;
        drop(slot);
        debug!(domain = %self.domain.name, "job released");
        self.domain.job_released.notify_waiters();
    }
}

/// All known domains, indexed by uuid.
#[derive(Default)]
pub struct Registry {
    domains: RwLock<HashMap<Uuid, Arc<DomainObj>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register a domain. Name and uuid must both be unique.
    pub async fn add(&self, config: DomainConfig) -> Result<Arc<DomainObj>> {
        let mut domains = self.domains.write().await;
        if domains.contains_key(&config.uuid) {
            bail!("domain with uuid {} already exists", config.uuid);
        }
        if domains.values().any(|d| d.name == config.name) {
            bail!("domain with name '{}' already exists", config.name);
        }
        let obj = Arc::new(DomainObj::new(config));
        domains.insert(obj.uuid, Arc::clone(&obj));
        Ok(obj)
    }

    pub async fn get(&self, uuid: Uuid) -> Option<Arc<DomainObj>> {
        self.domains.read().await.get(&uuid).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<DomainObj>> {
        self.domains
            .read()
            .await
            .values()
            .find(|d| d.name == name)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Arc<DomainObj>> {
        let mut all: Vec<_> = self.domains.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn remove(&self, uuid: Uuid) -> Option<Arc<DomainObj>> {
        self.domains.write().await.remove(&uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::sample_config;

    #[tokio::test]
    async fn test_add_and_lookup() {
        let registry = Registry::new();
        let config = sample_config("alpha");
        let uuid = config.uuid;
        registry.add(config).await.unwrap();

        assert!(registry.get(uuid).await.is_some());
        assert!(registry.get_by_name("alpha").await.is_some());
        assert!(registry.get_by_name("beta").await.is_none());
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_name() {
        let registry = Registry::new();
        registry.add(sample_config("alpha")).await.unwrap();
        let err = registry.add(sample_config("alpha")).await.err().unwrap();
        assert!(format!("{}", err).contains("already exists"));
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = Registry::new();
        let config = sample_config("alpha");
        let uuid = config.uuid;
        registry.add(config).await.unwrap();
        assert!(registry.remove(uuid).await.is_some());
        assert!(registry.get(uuid).await.is_none());
        assert!(registry.remove(uuid).await.is_none());
    }

    #[tokio::test]
    async fn test_job_exclusion_and_release() {
        let registry = Registry::new();
        let obj = registry.add(sample_config("alpha")).await.unwrap();

        let guard = obj
            .begin_job(JobKind::Modify, "start", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(obj.current_job().unwrap().owner, "start");

        // A second job cannot begin while the first is held.
        let err = obj
            .begin_job(JobKind::Destroy, "stop", Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"), "{msg}");
        assert!(msg.contains("held by start"), "{msg}");

        drop(guard);
        assert!(obj.current_job().is_none());
        let _guard = obj
            .begin_job(JobKind::Destroy, "stop", Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_begin_job_waits_for_release() {
        let registry = Registry::new();
        let obj = registry.add(sample_config("alpha")).await.unwrap();
        let guard = obj
            .begin_job(JobKind::Modify, "first", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let obj = Arc::clone(&obj);
            tokio::spawn(async move {
                obj.begin_job(JobKind::Modify, "second", Duration::from_secs(5))
                    .await
                    .map(|guard| drop(guard))
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restore_job() {
        let registry = Registry::new();
        let obj = registry.add(sample_config("alpha")).await.unwrap();
        let prior = Job {
            kind: JobKind::Modify,
            owner: "start".into(),
            started: Utc::now(),
        };
        let guard = obj.restore_job(prior.clone()).unwrap();
        assert_eq!(obj.current_job().unwrap().owner, "start");
        assert!(obj.restore_job(prior).is_err());
        drop(guard);
        assert!(obj.current_job().is_none());
    }
}
