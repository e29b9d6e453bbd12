//! domaind: supervision of virtual machine domains executed by an external
//! hypervisor process.
//!
//! The daemon does not run guest code itself. It launches the hypervisor,
//! attaches to its control socket, places the hypervisor's threads onto host
//! resources (CPU affinity, cgroups, scheduler policy), hands pre-opened
//! network descriptors to it before boot, and can reattach to domains that
//! were already running when the daemon restarts.

pub mod cgroup;
pub mod config;
pub mod domain;
pub mod hostdev;
pub mod monitor;
pub mod netdev;
pub mod placement;
pub mod process;
pub mod reconnect;
pub mod registry;
