//! CPU affinity, cgroup placement, and scheduler policy for hypervisor
//! threads.
//!
//! One entry point, [`place_thread`], handles emulator, I/O, and vCPU threads
//! the same way: resolve the effective CPU mask, confine the thread inside a
//! per-thread cgroup sub-scope when a controller is available, and always set
//! thread affinity directly as the floor guarantee.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cgroup::{CgroupBackend, Controller, Scope};

/// A set of CPU (or NUMA node) ids, serialized in kernel list syntax
/// ("0-3,7"). The same representation covers cpuset nodemasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuMask {
    ids: BTreeSet<u32>,
}

impl CpuMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Parse kernel list syntax: comma-separated ids and inclusive ranges.
    pub fn parse(s: &str) -> Result<Self> {
        let mut ids = BTreeSet::new();
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                bail!("empty entry in cpu list '{}'", s);
            }
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid cpu range '{}'", token))?;
                    let hi: u32 = hi
                        .trim()
                        .parse()
                        .with_context(|| format!("invalid cpu range '{}'", token))?;
                    if lo > hi {
                        bail!("descending cpu range '{}'", token);
                    }
                    ids.extend(lo..=hi);
                }
                None => {
                    ids.insert(
                        token
                            .parse()
                            .with_context(|| format!("invalid cpu id '{}'", token))?,
                    );
                }
            }
        }
        Ok(Self { ids })
    }

    /// Format as kernel list syntax, collapsing consecutive ids into ranges.
    pub fn to_list_string(&self) -> String {
        let mut out = String::new();
        let mut iter = self.ids.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap_or(end);
            }
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{}-{}", start, end));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    /// All online host CPUs, from sysfs. The hypervisor process is not
    /// guaranteed to already be confined to the right CPUs, so callers use
    /// this as the explicit fallback affinity.
    pub fn all_online() -> Result<Self> {
        let raw = std::fs::read_to_string("/sys/devices/system/cpu/online")
            .context("reading online cpu list")?;
        Self::parse(raw.trim())
    }

    /// Set the affinity of one task (thread or whole process) to this mask.
    pub fn apply_to_task(&self, tid: i32) -> Result<()> {
        if self.ids.is_empty() {
            bail!("cannot apply an empty cpu mask to task {}", tid);
        }
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut set) };
        for cpu in self.iter() {
            if cpu as usize >= libc::CPU_SETSIZE as usize {
                bail!("cpu id {} out of range for affinity mask", cpu);
            }
            unsafe { libc::CPU_SET(cpu as usize, &mut set) };
        }
        let rc = unsafe {
            libc::sched_setaffinity(tid as libc::pid_t, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(anyhow::Error::from(std::io::Error::last_os_error())
                .context(format!("setting affinity of task {} to {}", tid, self)));
        }
        Ok(())
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_list_string())
    }
}

impl TryFrom<String> for CpuMask {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CpuMask> for String {
    fn from(mask: CpuMask) -> String {
        mask.to_list_string()
    }
}

/// CPUs belonging to one NUMA node, from sysfs.
pub fn node_cpus(node: u32) -> Result<CpuMask> {
    let path = format!("/sys/devices/system/node/node{}/cpulist", node);
    let raw = std::fs::read_to_string(Path::new(&path))
        .with_context(|| format!("reading cpu list of NUMA node {}", node))?;
    CpuMask::parse(raw.trim())
}

/// Union of the CPUs of every node in `nodeset`.
pub fn nodeset_to_cpumask(nodeset: &CpuMask) -> Result<CpuMask> {
    let mut cpus = CpuMask::new();
    for node in nodeset.iter() {
        cpus.ids.extend(node_cpus(node)?.ids);
    }
    Ok(cpus)
}

/// Per-domain placement tuning from the domain definition.
///
/// Explicit pins are keyed by vCPU index or I/O thread name. Bandwidth
/// values follow cgroup conventions: period in microseconds per window,
/// quota in microseconds of runtime, zero meaning unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Domain-wide CPU mask applied to threads without an explicit pin.
    pub cpuset: Option<CpuMask>,
    pub vcpu_pins: HashMap<u32, CpuMask>,
    pub emulator_pin: Option<CpuMask>,
    pub iothread_pins: HashMap<String, CpuMask>,
    /// NUMA nodes to bind guest memory to.
    pub numa_nodeset: Option<CpuMask>,
    /// Strict binding confines memory allocation to the nodeset; a strict
    /// single-node binding also derives an automatic CPU mask.
    pub numa_strict: bool,
    pub vcpu_period: u64,
    pub vcpu_quota: i64,
    pub emulator_period: u64,
    pub emulator_quota: i64,
    pub iothread_period: u64,
    pub iothread_quota: i64,
    pub vcpu_sched: Option<SchedPolicy>,
    pub iothread_sched: Option<SchedPolicy>,
}

impl PlacementConfig {
    /// The NUMA-derived automatic CPU mask: only a strict binding to exactly
    /// one node pins CPUs implicitly.
    pub fn auto_cpuset(&self) -> Result<Option<CpuMask>> {
        match &self.numa_nodeset {
            Some(nodeset) if self.numa_strict && nodeset.len() == 1 => {
                Ok(Some(nodeset_to_cpumask(nodeset)?))
            }
            _ => Ok(None),
        }
    }

    /// Memory nodes for cpuset.mems, strict mode only.
    pub fn mem_nodeset(&self) -> Option<&CpuMask> {
        if self.numa_strict {
            self.numa_nodeset.as_ref()
        } else {
            None
        }
    }
}

/// Scheduler policy for a placed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "policy")]
pub enum SchedPolicy {
    Batch,
    Idle,
    Fifo { priority: i32 },
    Rr { priority: i32 },
}

impl SchedPolicy {
    pub fn apply_to_task(&self, tid: i32) -> Result<()> {
        let (policy, priority) = match *self {
            SchedPolicy::Batch => (libc::SCHED_BATCH, 0),
            SchedPolicy::Idle => (libc::SCHED_IDLE, 0),
            SchedPolicy::Fifo { priority } => (libc::SCHED_FIFO, priority),
            SchedPolicy::Rr { priority } => (libc::SCHED_RR, priority),
        };
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = unsafe { libc::sched_setscheduler(tid as libc::pid_t, policy, &param) };
        if rc != 0 {
            return Err(anyhow::Error::from(std::io::Error::last_os_error())
                .context(format!("setting scheduler policy of task {}", tid)));
        }
        Ok(())
    }
}

/// Functional role of a placed thread; names the cgroup sub-scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Emulator,
    Vcpu,
    IoThread,
}

impl ThreadKind {
    pub fn scope_name(&self, index: u32) -> String {
        match self {
            ThreadKind::Emulator => "emulator".to_string(),
            ThreadKind::Vcpu => format!("vcpu{}", index),
            ThreadKind::IoThread => format!("iothread{}", index),
        }
    }
}

/// Per-thread placement parameters.
pub struct ThreadPlacement<'a> {
    pub tid: i32,
    pub kind: ThreadKind,
    pub index: u32,
    /// Explicit per-thread pin; takes precedence over everything else.
    pub cpumask: Option<&'a CpuMask>,
    /// CPU bandwidth period in microseconds; 0 = unset.
    pub period: u64,
    /// CPU bandwidth quota in microseconds; 0 = unset.
    pub quota: i64,
    pub sched: Option<SchedPolicy>,
}

/// Domain-wide placement context shared by every thread of one domain.
pub struct DomainPlacement<'a> {
    /// NUMA-derived mask, present when the domain is single-node with strict
    /// memory binding.
    pub auto_cpuset: Option<&'a CpuMask>,
    /// Domain-wide configured mask.
    pub domain_cpumask: Option<&'a CpuMask>,
    /// NUMA memory nodes to confine the sub-scope to (strict mode only).
    pub mem_nodeset: Option<&'a CpuMask>,
}

/// Which mask governs a thread. `AllOnline` is applied as plain affinity only,
/// never as a cpuset restriction.
#[derive(Debug, PartialEq, Eq)]
pub enum EffectiveMask<'a> {
    Configured(&'a CpuMask),
    AllOnline,
}

/// Mask precedence: explicit per-thread pin, then the NUMA-derived automatic
/// mask, then the domain-wide mask, then all online host CPUs.
pub fn effective_cpumask<'a>(
    explicit: Option<&'a CpuMask>,
    auto_cpuset: Option<&'a CpuMask>,
    domain: Option<&'a CpuMask>,
) -> EffectiveMask<'a> {
    if let Some(mask) = explicit {
        EffectiveMask::Configured(mask)
    } else if let Some(mask) = auto_cpuset {
        EffectiveMask::Configured(mask)
    } else if let Some(mask) = domain {
        EffectiveMask::Configured(mask)
    } else {
        EffectiveMask::AllOnline
    }
}

/// Removes a freshly created thread scope unless disarmed; no orphaned cgroup
/// directories are left behind on a failed placement.
struct ScopeGuard<'a> {
    cgroup: &'a dyn CgroupBackend,
    scope: Option<Scope>,
}

impl<'a> ScopeGuard<'a> {
    fn new(cgroup: &'a dyn CgroupBackend, scope: Scope) -> Self {
        Self {
            cgroup,
            scope: Some(scope),
        }
    }

    fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    /// Keep the scope; the thread now lives in it.
    fn disarm(mut self) {
        self.scope = None;
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            if let Err(e) = self.cgroup.remove(&scope) {
                warn!(scope = %scope.path().display(), error = %e,
                    "failed to remove thread scope after placement failure");
            }
        }
    }
}

/// Place one hypervisor thread: cgroup sub-scope (when controllers exist),
/// affinity, and scheduler policy.
///
/// CPU bandwidth tuning without a cpu controller is a configuration error and
/// is rejected before any state is touched. Emulator threads never get a
/// custom scheduler policy.
pub fn place_thread(
    cgroup: &dyn CgroupBackend,
    domain_scope: Option<&Scope>,
    dom: &DomainPlacement<'_>,
    th: &ThreadPlacement<'_>,
) -> Result<()> {
    if (th.period != 0 || th.quota != 0) && !cgroup.has_controller(Controller::Cpu) {
        bail!("cgroup cpu controller is required for CPU bandwidth tuning");
    }

    let configured = match effective_cpumask(th.cpumask, dom.auto_cpuset, dom.domain_cpumask) {
        EffectiveMask::Configured(mask) => Some(mask),
        EffectiveMask::AllOnline => None,
    };

    let mut guard = None;
    if let Some(parent) = domain_scope {
        if cgroup.has_controller(Controller::Cpu) || cgroup.has_controller(Controller::Cpuset) {
            let name = th.kind.scope_name(th.index);
            let scope = cgroup
                .thread_scope(parent, &name, true)
                .with_context(|| format!("creating thread scope {}", name))?;
            let scope_guard = ScopeGuard::new(cgroup, scope);
            if let Some(scope) = scope_guard.scope() {
                if cgroup.has_controller(Controller::Cpuset) {
                    if let Some(mask) = configured {
                        cgroup
                            .set_cpuset_cpus(scope, mask)
                            .context("restricting thread scope cpuset")?;
                    }
                    if let Some(mems) = dom.mem_nodeset {
                        cgroup
                            .set_cpuset_mems(scope, mems)
                            .context("restricting thread scope memory nodes")?;
                    }
                }
                if th.period != 0 || th.quota != 0 {
                    cgroup
                        .set_cpu_bandwidth(scope, th.period, th.quota)
                        .context("applying CPU bandwidth limits")?;
                }
                debug!(tid = th.tid, scope = %name, "moving thread into scope");
                cgroup
                    .add_thread(scope, th.tid)
                    .context("moving thread into scope")?;
            }
            guard = Some(scope_guard);
        }
    }

    // Affinity is the floor guarantee, applied whether or not a cpuset
    // restriction exists.
    let affinity = match configured {
        Some(mask) => mask.clone(),
        None => CpuMask::all_online()?,
    };
    affinity.apply_to_task(th.tid)?;

    if let Some(sched) = th.sched {
        if th.kind != ThreadKind::Emulator {
            sched.apply_to_task(th.tid)?;
        }
    }

    if let Some(guard) = guard {
        guard.disarm();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::testing::MockCgroup;

    fn own_tid() -> i32 {
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }

    #[test]
    fn test_cpumask_parse_list() {
        let mask = CpuMask::parse("0-3,7").unwrap();
        assert_eq!(mask.len(), 5);
        assert!(mask.contains(0) && mask.contains(3) && mask.contains(7));
        assert!(!mask.contains(4));
    }

    #[test]
    fn test_cpumask_format_collapses_ranges() {
        let mask = CpuMask::from_ids([0, 1, 2, 3, 7]);
        assert_eq!(mask.to_list_string(), "0-3,7");
        let single = CpuMask::from_ids([5]);
        assert_eq!(single.to_list_string(), "5");
    }

    #[test]
    fn test_cpumask_roundtrip() {
        for s in ["0", "0-15", "1,3,5", "0-2,8-10,31"] {
            assert_eq!(CpuMask::parse(s).unwrap().to_list_string(), s);
        }
    }

    #[test]
    fn test_cpumask_parse_rejects_garbage() {
        assert!(CpuMask::parse("").is_err());
        assert!(CpuMask::parse("3-1").is_err());
        assert!(CpuMask::parse("a-b").is_err());
        assert!(CpuMask::parse("1,,2").is_err());
    }

    #[test]
    fn test_all_online_is_nonempty() {
        let mask = CpuMask::all_online().unwrap();
        assert!(!mask.is_empty());
        assert!(mask.contains(0));
    }

    #[test]
    fn test_effective_mask_precedence() {
        let explicit = CpuMask::parse("0").unwrap();
        let auto = CpuMask::parse("1").unwrap();
        let domain = CpuMask::parse("2").unwrap();

        assert_eq!(
            effective_cpumask(Some(&explicit), Some(&auto), Some(&domain)),
            EffectiveMask::Configured(&explicit)
        );
        assert_eq!(
            effective_cpumask(None, Some(&auto), Some(&domain)),
            EffectiveMask::Configured(&auto)
        );
        assert_eq!(
            effective_cpumask(None, None, Some(&domain)),
            EffectiveMask::Configured(&domain)
        );
        assert_eq!(effective_cpumask(None, None, None), EffectiveMask::AllOnline);
    }

    #[test]
    fn test_placement_config_parses_from_json() {
        let config: PlacementConfig = serde_json::from_str(
            r#"{
                "cpuset": "0-7",
                "vcpu_pins": { "0": "0-1", "1": "2-3" },
                "numa_nodeset": "0",
                "numa_strict": true,
                "vcpu_quota": 50000,
                "vcpu_sched": { "policy": "fifo", "priority": 1 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.cpuset.as_ref().unwrap().to_list_string(), "0-7");
        assert_eq!(config.vcpu_pins[&1].to_list_string(), "2-3");
        assert!(config.numa_strict);
        assert_eq!(config.mem_nodeset().unwrap().to_list_string(), "0");
        assert_eq!(config.vcpu_quota, 50_000);
        assert_eq!(config.vcpu_sched, Some(SchedPolicy::Fifo { priority: 1 }));
        assert_eq!(config.emulator_period, 0);
    }

    #[test]
    fn test_auto_cpuset_requires_strict_single_node() {
        let mut config = PlacementConfig {
            numa_nodeset: Some(CpuMask::parse("0").unwrap()),
            numa_strict: false,
            ..PlacementConfig::default()
        };
        assert!(config.auto_cpuset().unwrap().is_none());

        config.numa_nodeset = Some(CpuMask::parse("0-1").unwrap());
        config.numa_strict = true;
        assert!(config.auto_cpuset().unwrap().is_none());

        config.numa_nodeset = Some(CpuMask::parse("0").unwrap());
        if let Ok(Some(auto)) = config.auto_cpuset() {
            assert!(!auto.is_empty());
        }
        // Hosts without a NUMA sysfs tree surface a read error instead,
        // which is also correct for a strict binding.
    }

    #[test]
    fn test_scope_names() {
        assert_eq!(ThreadKind::Emulator.scope_name(0), "emulator");
        assert_eq!(ThreadKind::Vcpu.scope_name(3), "vcpu3");
        assert_eq!(ThreadKind::IoThread.scope_name(1), "iothread1");
    }

    #[test]
    fn test_bandwidth_without_cpu_controller_is_config_error() {
        let cgroup = MockCgroup::without_controllers();
        let scope = cgroup.machine_scope("m", true).unwrap();
        let dom = DomainPlacement {
            auto_cpuset: None,
            domain_cpumask: None,
            mem_nodeset: None,
        };
        let th = ThreadPlacement {
            tid: own_tid(),
            kind: ThreadKind::Vcpu,
            index: 0,
            cpumask: None,
            period: 100_000,
            quota: 50_000,
            sched: None,
        };
        let err = place_thread(&cgroup, Some(&scope), &dom, &th).unwrap_err();
        assert!(format!("{}", err).contains("cpu controller is required"));
        // Rejected before any cgroup or affinity state was touched.
        assert!(cgroup.ops().iter().all(|op| op.starts_with("machine_scope")));
    }

    #[test]
    fn test_failed_placement_removes_thread_scope() {
        let cgroup = MockCgroup::with_all_controllers();
        cgroup.fail_add_thread();
        let scope = cgroup.machine_scope("m", true).unwrap();
        let pin = CpuMask::parse("0").unwrap();
        let dom = DomainPlacement {
            auto_cpuset: None,
            domain_cpumask: None,
            mem_nodeset: None,
        };
        let th = ThreadPlacement {
            tid: own_tid(),
            kind: ThreadKind::Vcpu,
            index: 2,
            cpumask: Some(&pin),
            period: 0,
            quota: 0,
            sched: None,
        };
        assert!(place_thread(&cgroup, Some(&scope), &dom, &th).is_err());
        let ops = cgroup.ops();
        assert!(ops.iter().any(|op| op == "thread_scope vcpu2"));
        assert!(ops.iter().any(|op| op.starts_with("remove") && op.contains("vcpu2")));
    }

    #[test]
    fn test_placement_with_cpuset_controller() {
        let cgroup = MockCgroup::with_all_controllers();
        let scope = cgroup.machine_scope("m", true).unwrap();
        // cpu 0 always exists, so applying the mask to our own tid succeeds.
        let domain_mask = CpuMask::parse("0").unwrap();
        let dom = DomainPlacement {
            auto_cpuset: None,
            domain_cpumask: Some(&domain_mask),
            mem_nodeset: None,
        };
        let th = ThreadPlacement {
            tid: own_tid(),
            kind: ThreadKind::Vcpu,
            index: 0,
            cpumask: None,
            period: 0,
            quota: 0,
            sched: None,
        };
        place_thread(&cgroup, Some(&scope), &dom, &th).unwrap();
        let ops = cgroup.ops();
        assert!(ops.iter().any(|op| op == "set_cpuset_cpus vcpu0 0"));
        assert!(ops.iter().any(|op| op.starts_with("add_thread vcpu0")));
        // Scope kept on success.
        assert!(!ops.iter().any(|op| op.starts_with("remove")));
    }

    #[test]
    fn test_affinity_only_when_no_cgroup() {
        let cgroup = MockCgroup::without_controllers();
        let dom = DomainPlacement {
            auto_cpuset: None,
            domain_cpumask: None,
            mem_nodeset: None,
        };
        let th = ThreadPlacement {
            tid: own_tid(),
            kind: ThreadKind::Emulator,
            index: 0,
            cpumask: None,
            period: 0,
            quota: 0,
            sched: None,
        };
        // No domain scope at all: affinity to all online CPUs still applies.
        place_thread(&cgroup, None, &dom, &th).unwrap();
        assert!(cgroup.ops().is_empty());
    }
}
