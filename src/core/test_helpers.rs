//! Shared test fixtures: an in-memory kernel filter and a small compile
//! input set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::core::compile::CompileInputs;
use crate::core::error::{Error, Result};
use crate::core::ipt::{self, KernelFilter, UNKNOWN_SIG};
use crate::core::parse::{parse_group_rules, parse_vm_rules};
use crate::inventory::{Inventory, NetConfig};

/// An in-memory stand-in for the kernel filter. It interprets restore
/// scripts the way `iptables-restore -n` would (chain declarations, flush,
/// append, delete-chain, and jump edits on the built-in chains) and applies
/// them transactionally: a script that fails leaves the state untouched.
#[derive(Default)]
pub struct MockKernel {
    state: Mutex<MockState>,
}

#[derive(Default, Clone)]
struct MockState {
    chains: BTreeMap<String, Vec<String>>,
    builtin_rules: BTreeSet<String>,
}

impl MockKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a chain directly, bypassing apply (simulates pre-existing
    /// state).
    pub fn seed_chain(&self, name: &str, rules: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .chains
            .insert(name.to_string(), rules.iter().map(|s| s.to_string()).collect());
    }

    /// Empties a chain in place, the way an operator's `iptables -F` would.
    /// The canary goes with it, so the next discovery reports `unknown`.
    pub fn flush_chain(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.chains.get_mut(name) {
            rules.clear();
        }
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.state.lock().unwrap().chains.contains_key(name)
    }

    pub fn chain_rules(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().chains.get(name).cloned()
    }

    pub fn builtin_rule_count(&self) -> usize {
        self.state.lock().unwrap().builtin_rules.len()
    }

    fn fail(message: impl Into<String>) -> Error {
        Error::Iptables {
            message: message.into(),
            stderr: None,
            exit_code: Some(2),
        }
    }
}

impl KernelFilter for MockKernel {
    async fn get_chains(&self) -> Result<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        let mut result = BTreeMap::new();
        for (chain, rules) in &state.chains {
            if !ipt::is_managed_chain(chain) {
                continue;
            }
            let mut sig = UNKNOWN_SIG.to_string();
            for rule in rules {
                if let Some((owner, found)) = ipt::parse_canary(rule)
                    && owner == chain
                {
                    sig = found.to_string();
                }
            }
            result.insert(chain.clone(), sig);
        }
        Ok(result)
    }

    async fn rule_exists(&self, rule: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().builtin_rules.contains(rule))
    }

    async fn apply(&self, script: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut staged = state.clone();

        for line in script.lines() {
            if line == "*filter" || line == "COMMIT" || line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(':') {
                let name = rest
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| Self::fail("bad chain declaration"))?;
                staged.chains.entry(name.to_string()).or_default();
            } else if let Some(name) = line.strip_prefix("-F ") {
                staged
                    .chains
                    .get_mut(name)
                    .ok_or_else(|| Self::fail(format!("flush of unknown chain '{name}'")))?
                    .clear();
            } else if let Some(name) = line.strip_prefix("-X ") {
                match staged.chains.get(name) {
                    Some(rules) if rules.is_empty() => {
                        staged.chains.remove(name);
                    }
                    Some(_) => return Err(Self::fail(format!("chain '{name}' not empty"))),
                    None => return Err(Self::fail(format!("no such chain '{name}'"))),
                }
            } else if let Some(rest) = line.strip_prefix("-D ") {
                if !staged.builtin_rules.remove(rest) {
                    return Err(Self::fail(format!("no such rule '{rest}'")));
                }
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let chain = rest
                    .split_whitespace()
                    .next()
                    .ok_or_else(|| Self::fail("bad append"))?;
                if matches!(chain, "INPUT" | "OUTPUT" | "FORWARD") {
                    staged.builtin_rules.insert(rest.to_string());
                } else {
                    staged
                        .chains
                        .get_mut(chain)
                        .ok_or_else(|| Self::fail(format!("no such chain '{chain}'")))?
                        .push(line.to_string());
                }
            } else {
                return Err(Self::fail(format!("cannot parse line '{line}'")));
            }
        }

        *state = staged;
        Ok(())
    }
}

/// One VM (vmid 100, net0 on vmbr0) with a couple of rules and one security
/// group.
pub fn sample_inputs() -> CompileInputs {
    let mut inventory = Inventory::default();
    inventory.add_net(
        100,
        0,
        NetConfig {
            bridge: Some("vmbr0".to_string()),
            tag: None,
            macaddr: Some("aa:bb:cc:dd:ee:01".to_string()),
        },
    );

    let mut vm_rules = BTreeMap::new();
    vm_rules.insert(
        100,
        parse_vm_rules(
            "100.fw",
            "[in]\nACCEPT net0 - - tcp 22 -\nGROUP-web - - - - - -\n[out]\nGROUP-web - - - - - -\n",
        ),
    );

    CompileInputs {
        inventory,
        vm_rules,
        host_rules: None,
        groups: parse_group_rules(
            "groups.fw",
            "[in:web]\nACCEPT - - tcp 80 -\n[out:web]\nACCEPT - - tcp 80 -\n",
        ),
    }
}
