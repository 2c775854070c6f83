//! Detection of optional OS isolation layers.
//!
//! The sandbox's proxy-routing environment (L1) always works; three
//! optional layers strengthen it: a network namespace with firewall rules
//! (L2), a dynamic-loader interception shim (L3), and a kernel syscall
//! filter (L4). None of them is required for the audit claim to hold -
//! they bound how honest the claim is, and the probe's classification is
//! what a deployment reports alongside its logs.
//!
//! Probing never fails: a missing layer is reported as `false`, not as an
//! error.

use std::path::Path;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Declared strength of the sandbox isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Namespace, loader shim, and syscall filter all available.
    Full,
    /// At least one of namespace or loader shim available.
    Partial,
    /// Proxy environment variables only.
    Minimal,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Partial => f.write_str("partial"),
            Self::Minimal => f.write_str("minimal"),
        }
    }
}

/// Enforcement mode for the syscall-filter layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyscallProfile {
    /// Violations fail with `EPERM`.
    Strict,
    /// Violations are audited but allowed.
    Logging,
    /// Violations kill the process.
    Paranoid,
}

/// Which reinforcement layers this environment can provide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// L2: network namespace plus firewall tooling.
    pub network_namespace: bool,
    /// L3: dynamic-loader interception shim present.
    pub loader_shim: bool,
    /// L4: kernel syscall filtering available.
    pub syscall_filter: bool,
    /// The resulting declared isolation level.
    pub level: IsolationLevel,
}

impl Capabilities {
    /// Classifies an isolation level from layer availability.
    ///
    /// `full` requires all three optional layers; `partial` requires the
    /// namespace or the loader shim. A syscall filter alone does not lift
    /// the level above `minimal` - it constrains the child but does not
    /// route its traffic.
    #[must_use]
    pub const fn classify(
        network_namespace: bool,
        loader_shim: bool,
        syscall_filter: bool,
    ) -> IsolationLevel {
        if network_namespace && loader_shim && syscall_filter {
            IsolationLevel::Full
        } else if network_namespace || loader_shim {
            IsolationLevel::Partial
        } else {
            IsolationLevel::Minimal
        }
    }
}

/// Probes the environment for the optional reinforcement layers.
///
/// `shim_path` is the configured location of the loader interception
/// shim object; `None` or a missing file means L3 is unavailable. The
/// result is advisory - the audit pipeline behaves identically at every
/// level.
#[must_use]
pub fn probe(shim_path: Option<&Path>) -> Capabilities {
    let network_namespace = probe_namespace_tooling();
    let loader_shim = probe_loader_shim(shim_path);
    let syscall_filter = probe_syscall_filter();

    let capabilities = Capabilities {
        network_namespace,
        loader_shim,
        syscall_filter,
        level: Capabilities::classify(network_namespace, loader_shim, syscall_filter),
    };
    debug!(?capabilities, "probed isolation capabilities");
    capabilities
}

/// L2 needs namespace creation and firewall tooling on `$PATH`.
fn probe_namespace_tooling() -> bool {
    probe_command("unshare", &["--version"]) && probe_command("iptables", &["--version"])
}

/// L3 works through the dynamic loader, which only one OS family supports
/// here; elsewhere it is always `false`.
fn probe_loader_shim(shim_path: Option<&Path>) -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    shim_path.is_some_and(Path::exists)
}

/// L4: the kernel advertises seccomp actions when filtering is available.
fn probe_syscall_filter() -> bool {
    Path::new("/proc/sys/kernel/seccomp/actions_avail").exists()
}

/// Attempts to launch `cmd args...`; only a failure to launch (binary not
/// found) counts as unavailable. The exit code is irrelevant.
fn probe_command(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}
