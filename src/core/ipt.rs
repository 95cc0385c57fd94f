//! Thin adapter around the iptables tools. No policy lives here: it knows
//! how to read the kernel's current chains, probe for a single rule, and
//! feed a script to the atomic bulk-restore interface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::core::error::{Error, Result};

/// Timeout for iptables-restore runs.
const RESTORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Signature reported for a managed chain that carries no canary comment.
pub const UNKNOWN_SIG: &str = "unknown";

/// The kernel packet-filter seam.
///
/// The production implementation shells out to the iptables tools; tests
/// substitute an in-memory kernel.
#[allow(async_fn_in_trait)]
pub trait KernelFilter {
    /// Returns the managed chains currently installed, mapped to the
    /// signature recorded in their canary comment (or [`UNKNOWN_SIG`]).
    async fn get_chains(&self) -> Result<BTreeMap<String, String>>;

    /// True iff the given rule specification exists (single-rule check).
    async fn rule_exists(&self, rule: &str) -> Result<bool>;

    /// Feeds a script to the bulk-restore interface. Atomic at the table
    /// level: on failure the previous ruleset remains live.
    async fn apply(&self, script: &str) -> Result<()>;
}

/// Kernel filter backed by the iptables binaries.
#[derive(Debug, Clone)]
pub struct Iptables {
    pub iptables: PathBuf,
    pub iptables_save: PathBuf,
    pub iptables_restore: PathBuf,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            iptables: PathBuf::from("iptables"),
            iptables_save: PathBuf::from("iptables-save"),
            iptables_restore: PathBuf::from("iptables-restore"),
        }
    }
}

impl KernelFilter for Iptables {
    async fn get_chains(&self) -> Result<BTreeMap<String, String>> {
        let output = Command::new(&self.iptables_save)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Internal(format!("failed to run iptables-save: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(Error::Iptables {
                message: format!("iptables-save failed: {stderr}"),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            });
        }
        Ok(parse_save_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn rule_exists(&self, rule: &str) -> Result<bool> {
        let status = Command::new(&self.iptables)
            .arg("-C")
            .args(rule.split_whitespace())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Internal(format!("failed to run iptables: {e}")))?;
        Ok(status.success())
    }

    async fn apply(&self, script: &str) -> Result<()> {
        let mut child = Command::new(&self.iptables_restore)
            .arg("-n")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn iptables-restore: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = match tokio::time::timeout(RESTORE_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("failed to read iptables-restore output: {e}");
                return Err(Error::Internal(format!(
                    "failed to read iptables-restore output: {e}"
                )));
            }
            Err(_) => {
                error!(
                    "iptables-restore timed out after {} seconds",
                    RESTORE_TIMEOUT.as_secs()
                );
                return Err(Error::Iptables {
                    message: format!(
                        "iptables-restore timed out after {} seconds",
                        RESTORE_TIMEOUT.as_secs()
                    ),
                    stderr: None,
                    exit_code: None,
                });
            }
        };

        if output.status.success() {
            debug!("iptables-restore completed");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!("iptables-restore failed: {stderr}");
            Err(Error::Iptables {
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

static MANAGED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:PVEFW-\S+|tap\d+i\d+-(?:IN|OUT)|vmbr\d+-(?:FW|IN|OUT)|GROUP-\S+-(?:IN|OUT))$")
        .unwrap()
});

static SIG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^-A\s+(\S+)\s.*--comment\s+"PVESIG:(\S+)""#).unwrap());

/// True for chain names this firewall owns.
pub fn is_managed_chain(name: &str) -> bool {
    MANAGED_RE.is_match(name)
}

/// Extracts `(chain, signature)` from a canary rule line.
pub(crate) fn parse_canary(line: &str) -> Option<(&str, &str)> {
    let caps = SIG_RE.captures(line)?;
    Some((
        caps.get(1).unwrap().as_str(),
        caps.get(2).unwrap().as_str(),
    ))
}

/// Parses `iptables-save` output into `{chain -> signature}` for managed
/// chains of the filter table. Chains without a canary register as
/// [`UNKNOWN_SIG`].
pub fn parse_save_output(text: &str) -> BTreeMap<String, String> {
    let mut chains = BTreeMap::new();
    let mut table = "";
    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            table = name;
            continue;
        }
        if table != "filter" {
            continue;
        }
        if let Some(rest) = line.strip_prefix(':') {
            let name = rest.split_whitespace().next().unwrap_or_default();
            if is_managed_chain(name) {
                chains.insert(name.to_string(), UNKNOWN_SIG.to_string());
            }
        } else if let Some((chain, sig)) = parse_canary(line)
            && is_managed_chain(chain)
        {
            chains.insert(chain.to_string(), sig.to_string());
        }
    }
    chains
}

/// Lets bridged traffic traverse the kernel filter by writing `1` into the
/// bridge-netfilter sysctls. Idempotent; failures only warn, matching a
/// host where the bridge module is not loaded yet.
pub fn enable_bridge_firewall(proc_dir: &Path) {
    for name in ["bridge-nf-call-iptables", "bridge-nf-call-ip6tables"] {
        let path = proc_dir.join(name);
        if matches!(std::fs::read_to_string(&path), Ok(v) if v.trim() == "1") {
            continue;
        }
        if let Err(err) = std::fs::write(&path, "1") {
            warn!("unable to write '{}': {err}", path.display());
        }
    }
}
