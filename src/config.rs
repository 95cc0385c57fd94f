//! Runtime configuration: the fixed filesystem locations the firewall works
//! against, and the daemon's timing constants.
//!
//! Every path can be overridden through a `PVEFW_TEST_*` environment
//! variable so tests run against a scratch tree instead of the live system.

use std::path::PathBuf;
use std::time::Duration;

/// How long a cycle may wait for the advisory lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between daemon update cycles.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Filesystem locations used by the compiler and the service wrapper.
#[derive(Debug, Clone)]
pub struct FwPaths {
    /// Per-VM rule files (`<vmid>.fw`) and `groups.fw`.
    pub firewall_dir: PathBuf,
    /// Host rule file; its existence enables the host firewall.
    pub host_fw_file: PathBuf,
    /// VM inventory configuration files (`<vmid>.conf`).
    pub vm_conf_dir: PathBuf,
    /// Advisory lock serializing compile+apply cycles.
    pub lock_file: PathBuf,
    /// Daemon pid file.
    pub pid_file: PathBuf,
    /// Bridge-netfilter sysctl directory.
    pub bridge_proc_dir: PathBuf,
}

fn path_from_env(var: &str, default: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

impl Default for FwPaths {
    fn default() -> Self {
        Self {
            firewall_dir: path_from_env("PVEFW_TEST_FIREWALL_DIR", "/etc/pve/firewall"),
            host_fw_file: path_from_env("PVEFW_TEST_HOST_FW", "/etc/pve/local/host.fw"),
            vm_conf_dir: path_from_env("PVEFW_TEST_VM_CONF_DIR", "/etc/pve/qemu-server"),
            lock_file: path_from_env("PVEFW_TEST_LOCK_FILE", "/var/lock/pvefw.lck"),
            pid_file: path_from_env("PVEFW_TEST_PID_FILE", "/run/pvefw.pid"),
            bridge_proc_dir: path_from_env("PVEFW_TEST_BRIDGE_PROC_DIR", "/proc/sys/net/bridge"),
        }
    }
}

impl FwPaths {
    /// Places every path under one scratch root. Used by tests.
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            firewall_dir: root.join("firewall"),
            host_fw_file: root.join("local/host.fw"),
            vm_conf_dir: root.join("qemu-server"),
            lock_file: root.join("pvefw.lck"),
            pid_file: root.join("pvefw.pid"),
            bridge_proc_dir: root.join("proc-bridge"),
        }
    }
}
