//! Content-addressed diff/apply engine.
//!
//! Every compiled chain is fingerprinted with a SHA-1 over its command
//! lines. The kernel side of the comparison comes from the canary comment a
//! previous apply left behind as the last rule of each chain; no signature
//! is cached locally, so out-of-band edits are detected against the kernel
//! itself. Changed chains are flushed and rewritten wholesale, and the whole
//! plan goes through the bulk-restore interface in one atomic step.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::core::compile::{Ruleset, TOP_CHAINS};
use crate::core::error::{Error, Result};
use crate::core::ipt::KernelFilter;

/// Jumps spliced into the kernel's built-in chains.
const BUILTIN_JUMPS: [(&str, &str); 3] = [
    ("INPUT", "PVEFW-INPUT"),
    ("OUTPUT", "PVEFW-OUTPUT"),
    ("FORWARD", "PVEFW-FORWARD"),
];

/// Base64 SHA-1 over a chain's command lines, one trailing newline per line.
pub fn chain_digest<S: AsRef<str>>(cmds: &[S]) -> String {
    let mut hasher = Sha1::new();
    for cmd in cmds {
        hasher.update(cmd.as_ref().as_bytes());
        hasher.update(b"\n");
    }
    STANDARD_NO_PAD.encode(hasher.finalize())
}

/// What the reconciler will do with one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainAction {
    Create,
    Update,
    Exists,
    Delete,
}

impl fmt::Display for ChainAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainAction::Create => "create",
            ChainAction::Update => "update",
            ChainAction::Exists => "exists",
            ChainAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Per-chain reconciliation state: the target signature plus the action
/// needed to converge.
#[derive(Debug, Clone)]
pub struct ChainStatus {
    pub sig: String,
    pub action: ChainAction,
}

/// Compares the compiled ruleset with the kernel's current chains.
pub fn diff(ruleset: &Ruleset, active: &BTreeMap<String, String>) -> BTreeMap<String, ChainStatus> {
    let mut status = BTreeMap::new();
    for (chain, cmds) in ruleset.iter() {
        let sig = chain_digest(cmds);
        let action = match active.get(chain) {
            None => ChainAction::Create,
            Some(old) if *old == sig => ChainAction::Exists,
            Some(_) => ChainAction::Update,
        };
        status.insert(chain.clone(), ChainStatus { sig, action });
    }
    for (chain, old_sig) in active {
        if !ruleset.contains(chain) {
            status.insert(
                chain.clone(),
                ChainStatus {
                    sig: old_sig.clone(),
                    action: ChainAction::Delete,
                },
            );
        }
    }
    status
}

/// Counts of what an apply changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    fn from_status(status: &BTreeMap<String, ChainStatus>) -> Self {
        let mut summary = ApplySummary::default();
        for st in status.values() {
            match st.action {
                ChainAction::Create => summary.created += 1,
                ChainAction::Update => summary.updated += 1,
                ChainAction::Delete => summary.deleted += 1,
                ChainAction::Exists => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

/// Builds the atomic restore script for a computed diff. `missing_jumps`
/// lists built-in jump rules the existence probe reported absent; they are
/// appended inside the same transaction.
pub fn build_restore_script(
    ruleset: &Ruleset,
    status: &BTreeMap<String, ChainStatus>,
    missing_jumps: &[String],
) -> Result<String> {
    let mut script = String::from("*filter\n");

    for (chain, st) in status {
        if st.action == ChainAction::Create {
            script.push_str(&format!(":{chain} - [0:0]\n"));
        }
    }
    for rule in missing_jumps {
        script.push_str(&format!("-A {rule}\n"));
    }
    for (chain, st) in status {
        match st.action {
            ChainAction::Create | ChainAction::Update => {
                script.push_str(&format!("-F {chain}\n"));
                let cmds = ruleset
                    .get(chain)
                    .ok_or_else(|| Error::Internal(format!("no rules for chain '{chain}'")))?;
                for cmd in cmds {
                    script.push_str(cmd);
                    script.push('\n');
                }
                script.push_str(&format!(
                    "-A {chain} -m comment --comment \"PVESIG:{}\"\n",
                    st.sig
                ));
            }
            ChainAction::Exists | ChainAction::Delete => {}
        }
    }
    for (chain, st) in status {
        if st.action == ChainAction::Delete {
            script.push_str(&format!("-F {chain}\n"));
        }
    }
    for (chain, st) in status {
        if st.action == ChainAction::Delete && !TOP_CHAINS.contains(&chain.as_str()) {
            script.push_str(&format!("-X {chain}\n"));
        }
    }
    script.push_str("COMMIT\n");
    Ok(script)
}

async fn missing_builtin_jumps<K: KernelFilter>(kernel: &K) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for (builtin, target) in BUILTIN_JUMPS {
        let rule = format!("{builtin} -j {target}");
        if !kernel.rule_exists(&rule).await? {
            missing.push(rule);
        }
    }
    Ok(missing)
}

/// Reconciles the kernel with the compiled ruleset: diff, restore, verify.
///
/// After the restore a second discovery must report every chain as
/// unchanged; anything else fails the cycle (the restore itself was atomic,
/// so the previous ruleset is still live on failure).
pub async fn apply<K: KernelFilter>(kernel: &K, ruleset: &Ruleset) -> Result<ApplySummary> {
    let active = kernel.get_chains().await?;
    let status = diff(ruleset, &active);
    let summary = ApplySummary::from_status(&status);
    let missing_jumps = missing_builtin_jumps(kernel).await?;

    if !summary.changed() && missing_jumps.is_empty() {
        debug!("ruleset unchanged, skipping restore");
        return Ok(summary);
    }

    for (chain, st) in &status {
        debug!("{} {chain}", st.action);
    }

    let script = build_restore_script(ruleset, &status, &missing_jumps)?;
    kernel.apply(&script).await?;

    let active = kernel.get_chains().await?;
    for (chain, st) in diff(ruleset, &active) {
        if st.action != ChainAction::Exists {
            warn!("unable to update chain '{chain}'");
            return Err(Error::Diverged(chain));
        }
    }

    info!(
        "applied ruleset: {} created, {} updated, {} deleted",
        summary.created, summary.updated, summary.deleted
    );
    Ok(summary)
}

/// True when the kernel differs from the compiled ruleset.
pub async fn has_changes<K: KernelFilter>(kernel: &K, ruleset: &Ruleset) -> Result<bool> {
    let active = kernel.get_chains().await?;
    let status = diff(ruleset, &active);
    Ok(status.values().any(|st| st.action != ChainAction::Exists))
}

/// Removes everything this firewall installed: the built-in jumps, then all
/// managed chains. Used on daemon shutdown and `stop`.
pub async fn remove_managed_chains<K: KernelFilter>(kernel: &K) -> Result<()> {
    let active = kernel.get_chains().await?;
    let mut script = String::from("*filter\n");
    let mut work = false;
    for (builtin, target) in BUILTIN_JUMPS {
        let rule = format!("{builtin} -j {target}");
        if kernel.rule_exists(&rule).await? {
            script.push_str(&format!("-D {rule}\n"));
            work = true;
        }
    }
    for chain in active.keys() {
        script.push_str(&format!("-F {chain}\n"));
        work = true;
    }
    for chain in active.keys() {
        script.push_str(&format!("-X {chain}\n"));
    }
    script.push_str("COMMIT\n");

    if !work {
        debug!("no managed chains installed");
        return Ok(());
    }
    kernel.apply(&script).await?;
    info!("removed {} managed chains", active.len());
    Ok(())
}
