//! Builds the complete chain ruleset from parsed rule files and the VM
//! inventory.
//!
//! The output is a mapping from chain name to an ordered list of fully
//! formed iptables commands. Compilation is a pure function of its inputs:
//! identical configuration always produces a byte-identical ruleset, which
//! is what makes the reconciler's chain signatures meaningful.

use std::collections::BTreeMap;

use crate::config::FwPaths;
use crate::core::error::{Error, Result};
use crate::core::parse::{self, GroupsFile, HostRuleFile, VmRuleFile};
use crate::core::rule::{Direction, Policy, Rule, RuleAction};
use crate::inventory::{self, Inventory};
use crate::validators;

/// The three entry chains spliced into the kernel's built-in chains.
pub const TOP_CHAINS: [&str; 3] = ["PVEFW-INPUT", "PVEFW-OUTPUT", "PVEFW-FORWARD"];

const SET_ACCEPT_MARK_CHAIN: &str = "PVEFW-SET-ACCEPT-MARK";

/// An ordered set of named chains, each holding fully formed iptables
/// commands. Chains are created exactly once; rule order within a chain is
/// semantically significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ruleset {
    chains: BTreeMap<String, Vec<String>>,
}

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty chain. Duplicate creation is an internal error:
    /// every generator is expected to check [`Ruleset::contains`] first.
    fn create_chain(&mut self, name: &str) -> Result<()> {
        validators::validate_chain_name(name).map_err(Error::Internal)?;
        if self.chains.contains_key(name) {
            return Err(Error::Internal(format!("chain '{name}' already exists")));
        }
        self.chains.insert(name.to_string(), Vec::new());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    fn chain_mut(&mut self, name: &str) -> Result<&mut Vec<String>> {
        self.chains
            .get_mut(name)
            .ok_or_else(|| Error::Internal(format!("no such chain '{name}'")))
    }

    /// Appends a rule to an existing chain.
    fn add(&mut self, chain: &str, rule: &str) -> Result<()> {
        let cmd = format!("-A {chain} {rule}");
        self.chain_mut(chain)?.push(cmd);
        Ok(())
    }

    /// Inserts a rule at the top of an existing chain.
    fn insert(&mut self, chain: &str, rule: &str) -> Result<()> {
        let cmd = format!("-A {chain} {rule}");
        self.chain_mut(chain)?.insert(0, cmd);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.chains.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.chains.iter()
    }

    pub fn chain_names(&self) -> impl Iterator<Item = &String> {
        self.chains.keys()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Everything the compiler consumes.
#[derive(Debug, Default)]
pub struct CompileInputs {
    pub inventory: Inventory,
    pub vm_rules: BTreeMap<u32, VmRuleFile>,
    pub host_rules: Option<HostRuleFile>,
    pub groups: GroupsFile,
}

/// Renders a rule into the command text following `-A <chain>`.
///
/// Matcher order is fixed: source, dest, `-p`, multiport, `--dport`,
/// multiport, `--sport`, terminator. An `a-b` address range becomes the
/// operand of the iprange matcher (`-s`/`-d` cannot express it); the parser
/// guarantees a range never shares a list with other addresses. Port lists
/// with more than one element switch to the multiport matcher. The
/// terminator is a goto (`-g`) for the accept-mark chain so the group chain
/// returns straight to its caller.
fn generate_rule_cmd(rule: &Rule) -> String {
    let mut cmd = String::new();
    if let Some(source) = &rule.source {
        if source.contains('-') {
            cmd.push_str(&format!("-m iprange --src-range {source} "));
        } else {
            cmd.push_str(&format!("-s {source} "));
        }
    }
    if let Some(dest) = &rule.dest {
        if dest.contains('-') {
            cmd.push_str(&format!("-m iprange --dst-range {dest} "));
        } else {
            cmd.push_str(&format!("-d {dest} "));
        }
    }
    if let Some(proto) = &rule.proto {
        cmd.push_str(&format!("-p {proto} "));
    }
    if rule.nbdport > 1 {
        cmd.push_str("--match multiport ");
    }
    if let Some(dport) = &rule.dport {
        cmd.push_str(&format!("--dport {dport} "));
    }
    if rule.nbsport > 1 {
        cmd.push_str("--match multiport ");
    }
    if let Some(sport) = &rule.sport {
        cmd.push_str(&format!("--sport {sport} "));
    }
    match &rule.action {
        RuleAction::SetAcceptMark => cmd.push_str(&format!("-g {SET_ACCEPT_MARK_CHAIN}")),
        action => cmd.push_str(&format!("-j {action}")),
    }
    cmd
}

/// Appends a direction's default-policy tail to a chain.
fn add_chain_policy(rs: &mut Ruleset, chain: &str, policy: Policy, dir: Direction) -> Result<()> {
    match policy {
        Policy::Accept => {
            let action = match dir {
                Direction::Out => "RETURN",
                Direction::In => "ACCEPT",
            };
            rs.add(chain, &format!("-j {action}"))
        }
        Policy::Drop => {
            rs.add(
                chain,
                &format!("-j LOG --log-prefix \"{chain}-dropped: \" --log-level 4"),
            )?;
            rs.add(chain, "-j DROP")
        }
        Policy::Reject => {
            rs.add(
                chain,
                &format!("-j LOG --log-prefix \"{chain}-reject: \" --log-level 4"),
            )?;
            rs.add(chain, "-j REJECT")
        }
    }
}

/// Creates the `<bridge>-FW/IN/OUT` plumbing once per bridge.
///
/// `PVEFW-FORWARD` gets the conntrack fast path, jumps for bridged traffic
/// in both directions, and trailing drops so nothing is routed between
/// bridges.
fn generate_bridge_chains(rs: &mut Ruleset, bridge: &str) -> Result<()> {
    let fw = format!("{bridge}-FW");
    if !rs.contains(&fw) {
        rs.create_chain(&fw)?;
        rs.add(
            "PVEFW-FORWARD",
            "-m state --state RELATED,ESTABLISHED -j ACCEPT",
        )?;
        rs.add(
            "PVEFW-FORWARD",
            &format!("-o {bridge} -m physdev --physdev-is-bridged -j {fw}"),
        )?;
        rs.add(
            "PVEFW-FORWARD",
            &format!("-i {bridge} -m physdev --physdev-is-bridged -j {fw}"),
        )?;
        rs.add("PVEFW-FORWARD", &format!("-o {bridge} -j DROP"))?;
        rs.add("PVEFW-FORWARD", &format!("-i {bridge} -j DROP"))?;
    }
    let out = format!("{bridge}-OUT");
    if !rs.contains(&out) {
        rs.create_chain(&out)?;
        rs.add(&fw, &format!("-m physdev --physdev-is-in -j {out}"))?;
    }
    let inb = format!("{bridge}-IN");
    if !rs.contains(&inb) {
        rs.create_chain(&inb)?;
        rs.add(&fw, &format!("-m physdev --physdev-is-out -j {inb}"))?;
    }
    Ok(())
}

/// Builds `GROUP-<name>-IN` and `GROUP-<name>-OUT`.
///
/// The OUT chain opens by clearing the packet mark, and accepting rules are
/// rewritten to goto the mark-setter: a group cannot know which bridge chain
/// called it, so "accept" is signalled out of band through mark value 1.
fn generate_group_rules(rs: &mut Ruleset, groups: &GroupsFile, group: &str) -> Result<()> {
    let rules = groups.groups.get(group);

    let chain = format!("GROUP-{group}-IN");
    rs.create_chain(&chain)?;
    if let Some(rules) = rules {
        for rule in &rules.rules_in {
            rs.add(&chain, &generate_rule_cmd(rule))?;
        }
    }

    let chain = format!("GROUP-{group}-OUT");
    rs.create_chain(&chain)?;
    rs.add(&chain, "-j MARK --set-mark 0")?;
    if let Some(rules) = rules {
        for rule in &rules.rules_out {
            let mut rule = rule.clone();
            if rule.action == RuleAction::Accept {
                rule.action = RuleAction::SetAcceptMark;
            }
            rs.add(&chain, &generate_rule_cmd(&rule))?;
        }
    }
    Ok(())
}

/// Emits one direction's user rules into `chain`.
///
/// Rules are cloned before any rewrite so a rule record shared between
/// directions is never corrupted. `netid` filters VM rules bound to a
/// specific interface; `rewrite_accept` turns ACCEPT terminators into RETURN
/// (OUT chains and host chains, where later checks must still run). Group
/// references are redirected to the direction-specific group chain, created
/// on first use; after a group jump an OUT rule honors the group's accept
/// mark.
fn emit_user_rules(
    rs: &mut Ruleset,
    chain: &str,
    rules: &[Rule],
    dir: Direction,
    groups: &GroupsFile,
    netid: Option<&str>,
    rewrite_accept: bool,
) -> Result<()> {
    for rule in rules {
        if let (Some(netid), Some(iface)) = (netid, rule.iface.as_deref())
            && iface != netid
        {
            continue;
        }
        let mut rule = rule.clone();
        let mut group_jump = false;
        if let RuleAction::Group(group) = &rule.action {
            let target = format!("GROUP-{group}-{dir}");
            if !rs.contains(&target) {
                generate_group_rules(rs, groups, group)?;
            }
            rule.action = RuleAction::Group(format!("{group}-{dir}"));
            group_jump = true;
        } else if rewrite_accept && rule.action == RuleAction::Accept {
            rule.action = RuleAction::Return;
        }
        rs.add(chain, &generate_rule_cmd(&rule))?;
        if group_jump && dir == Direction::Out {
            rs.add(chain, "-m mark --mark 1 -j RETURN")?;
        }
    }
    Ok(())
}

/// Builds one tap chain (`<iface>-IN` or `<iface>-OUT`) and splices it into
/// the bridge plumbing.
#[allow(clippy::too_many_arguments)]
fn generate_tap_chain(
    rs: &mut Ruleset,
    groups: &GroupsFile,
    iface: &str,
    netid: &str,
    vmfw: &VmRuleFile,
    macaddr: Option<&str>,
    dir: Direction,
    bridge: &str,
) -> Result<()> {
    let chain = format!("{iface}-{dir}");
    rs.create_chain(&chain)?;
    rs.add(&chain, "-m state --state INVALID -j DROP")?;
    rs.add(&chain, "-m state --state RELATED,ESTABLISHED -j ACCEPT")?;
    if dir == Direction::Out
        && let Some(mac) = macaddr
    {
        rs.add(&chain, &format!("-m mac ! --mac-source {mac} -j DROP"))?;
    }

    let rules = match dir {
        Direction::In => &vmfw.rules_in,
        Direction::Out => &vmfw.rules_out,
    };
    emit_user_rules(
        rs,
        &chain,
        rules,
        dir,
        groups,
        Some(netid),
        dir == Direction::Out,
    )?;

    let policy = match dir {
        Direction::Out => vmfw.options.policy_out.unwrap_or(Policy::Accept),
        Direction::In => vmfw.options.policy_in.unwrap_or(Policy::Drop),
    };
    add_chain_policy(rs, &chain, policy, dir)?;

    match dir {
        Direction::In => rs.insert(
            &format!("{bridge}-IN"),
            &format!("-m physdev --physdev-out {iface} --physdev-is-bridged -j {chain}"),
        )?,
        Direction::Out => {
            rs.insert(
                &format!("{bridge}-OUT"),
                &format!("-m physdev --physdev-in {iface} --physdev-is-bridged -j {chain}"),
            )?;
            // tap to host traffic is not bridged; filter it on host input
            rs.add(
                "PVEFW-INPUT",
                &format!("-m physdev --physdev-in {iface} -j {chain}"),
            )?;
        }
    }
    Ok(())
}

/// Builds `PVEFW-HOST-IN`/`PVEFW-HOST-OUT` and splices them into the entry
/// chains. Present only when a host rule file exists.
fn enable_host_fw(rs: &mut Ruleset, host: &HostRuleFile, groups: &GroupsFile) -> Result<()> {
    for dir in [Direction::In, Direction::Out] {
        let chain = format!("PVEFW-HOST-{dir}");
        rs.create_chain(&chain)?;
        rs.add(&chain, "-m state --state INVALID -j DROP")?;
        rs.add(&chain, "-m state --state RELATED,ESTABLISHED -j ACCEPT")?;
        match dir {
            Direction::In => rs.add(&chain, "-i lo -j ACCEPT")?,
            Direction::Out => rs.add(&chain, "-o lo -j ACCEPT")?,
        }
        rs.add(&chain, "-m addrtype --dst-type MULTICAST -j ACCEPT")?;
        // cluster heartbeat and corosync
        rs.add(
            &chain,
            "-p udp -m state --state NEW -m multiport --dports 5404,5405 -j ACCEPT",
        )?;
        rs.add(&chain, "-p udp -m udp --dport 9000 -j ACCEPT")?;

        let rules = match dir {
            Direction::In => &host.rules_in,
            Direction::Out => &host.rules_out,
        };
        emit_user_rules(rs, &chain, rules, dir, groups, None, true)?;

        rs.add(
            &chain,
            &format!("-j LOG --log-prefix \"{chain}-dropped: \" --log-level 4"),
        )?;
        rs.add(&chain, "-j DROP")?;
    }

    rs.add("PVEFW-OUTPUT", "-j PVEFW-HOST-OUT")?;
    rs.add("PVEFW-INPUT", "-j PVEFW-HOST-IN")?;
    rs.insert("PVEFW-INPUT", "-i lo -j ACCEPT")?;
    Ok(())
}

/// Compiles the full ruleset.
pub fn compile(inputs: &CompileInputs) -> Result<Ruleset> {
    let mut rs = Ruleset::new();
    for chain in TOP_CHAINS {
        rs.create_chain(chain)?;
    }
    rs.create_chain(SET_ACCEPT_MARK_CHAIN)?;
    rs.add(SET_ACCEPT_MARK_CHAIN, "-j MARK --set-mark 1")?;

    if let Some(host) = &inputs.host_rules {
        enable_host_fw(&mut rs, host, &inputs.groups)?;
    }

    for (vmid, vm) in &inputs.inventory.vms {
        let Some(vmfw) = inputs.vm_rules.get(vmid) else {
            continue;
        };
        if !vmfw.options.enable {
            continue;
        }
        for (index, net) in &vm.nets {
            let Some(bridge) = &net.bridge else {
                continue;
            };
            generate_bridge_chains(&mut rs, bridge)?;
            let iface = format!("tap{vmid}i{index}");
            let netid = format!("net{index}");
            for dir in [Direction::In, Direction::Out] {
                generate_tap_chain(
                    &mut rs,
                    &inputs.groups,
                    &iface,
                    &netid,
                    vmfw,
                    net.macaddr.as_deref(),
                    dir,
                    bridge,
                )?;
            }
        }
    }
    Ok(rs)
}

/// Loads all configuration from disk and compiles it. This is the per-cycle
/// entry point used by the daemon and the CLI.
pub fn compile_from_paths(paths: &FwPaths) -> Result<Ruleset> {
    let inventory = inventory::list_vms(&paths.vm_conf_dir)?;
    let mut vm_rules = BTreeMap::new();
    for vmid in inventory.vms.keys() {
        let path = paths.firewall_dir.join(format!("{vmid}.fw"));
        if let Some(rules) = parse::load_vm_rules(&path) {
            vm_rules.insert(*vmid, rules);
        }
    }
    let groups = parse::load_group_rules(&paths.firewall_dir.join("groups.fw"));
    let host_rules = parse::load_host_rules(&paths.host_fw_file);
    compile(&CompileInputs {
        inventory,
        vm_rules,
        host_rules,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parse::{parse_group_rules, parse_host_rules, parse_vm_rules};
    use crate::inventory::NetConfig;

    fn one_vm_inputs(vmfw: VmRuleFile) -> CompileInputs {
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
        vm_rules.insert(100, vmfw);
        CompileInputs {
            inventory,
            vm_rules,
            host_rules: None,
            groups: GroupsFile::default(),
        }
    }

    #[test]
    fn test_always_present_chains() {
        let rs = compile(&CompileInputs::default()).unwrap();
        for chain in TOP_CHAINS {
            assert!(rs.contains(chain), "missing {chain}");
        }
        assert_eq!(
            rs.get("PVEFW-SET-ACCEPT-MARK").unwrap(),
            &["-A PVEFW-SET-ACCEPT-MARK -j MARK --set-mark 1".to_string()]
        );
    }

    #[test]
    fn test_empty_vm_file_default_policies() {
        // seed scenario: an empty VM rule file still yields full plumbing
        let rs = compile(&one_vm_inputs(VmRuleFile::default())).unwrap();
        for chain in ["vmbr0-FW", "vmbr0-IN", "vmbr0-OUT", "tap100i0-IN", "tap100i0-OUT"] {
            assert!(rs.contains(chain), "missing {chain}");
        }

        let tap_in = rs.get("tap100i0-IN").unwrap();
        assert_eq!(
            &tap_in[tap_in.len() - 2..],
            &[
                "-A tap100i0-IN -j LOG --log-prefix \"tap100i0-IN-dropped: \" --log-level 4"
                    .to_string(),
                "-A tap100i0-IN -j DROP".to_string(),
            ]
        );

        let tap_out = rs.get("tap100i0-OUT").unwrap();
        assert_eq!(tap_out.last().unwrap(), "-A tap100i0-OUT -j RETURN");
        assert!(
            tap_out.contains(
                &"-A tap100i0-OUT -m mac ! --mac-source aa:bb:cc:dd:ee:01 -j DROP".to_string()
            )
        );
        // preamble + anti-spoof + policy only
        assert_eq!(tap_out.len(), 4);
        assert_eq!(tap_in.len(), 4);
    }

    #[test]
    fn test_bridge_plumbing() {
        let rs = compile(&one_vm_inputs(VmRuleFile::default())).unwrap();
        assert_eq!(
            rs.get("PVEFW-FORWARD").unwrap(),
            &[
                "-A PVEFW-FORWARD -m state --state RELATED,ESTABLISHED -j ACCEPT",
                "-A PVEFW-FORWARD -o vmbr0 -m physdev --physdev-is-bridged -j vmbr0-FW",
                "-A PVEFW-FORWARD -i vmbr0 -m physdev --physdev-is-bridged -j vmbr0-FW",
                "-A PVEFW-FORWARD -o vmbr0 -j DROP",
                "-A PVEFW-FORWARD -i vmbr0 -j DROP",
            ]
        );
        assert_eq!(
            rs.get("vmbr0-FW").unwrap(),
            &[
                "-A vmbr0-FW -m physdev --physdev-is-in -j vmbr0-OUT",
                "-A vmbr0-FW -m physdev --physdev-is-out -j vmbr0-IN",
            ]
        );
        // tap chains are spliced at the top of the bridge chains
        assert_eq!(
            rs.get("vmbr0-IN").unwrap()[0],
            "-A vmbr0-IN -m physdev --physdev-out tap100i0 --physdev-is-bridged -j tap100i0-IN"
        );
        assert_eq!(
            rs.get("vmbr0-OUT").unwrap()[0],
            "-A vmbr0-OUT -m physdev --physdev-in tap100i0 --physdev-is-bridged -j tap100i0-OUT"
        );
        // non-bridged variant filters tap-to-host traffic
        assert!(
            rs.get("PVEFW-INPUT")
                .unwrap()
                .contains(&"-A PVEFW-INPUT -m physdev --physdev-in tap100i0 -j tap100i0-OUT".to_string())
        );
    }

    #[test]
    fn test_macro_rule_in_tap_chain() {
        let vmfw = parse_vm_rules("100.fw", "[in]\nHTTP(ACCEPT) - - - - - -\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        assert!(
            rs.get("tap100i0-IN")
                .unwrap()
                .contains(&"-A tap100i0-IN -p tcp --dport 80 -j ACCEPT".to_string())
        );
    }

    #[test]
    fn test_out_accept_becomes_return() {
        let vmfw = parse_vm_rules("100.fw", "[out]\nACCEPT net0 - - tcp 22 -\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        let tap_out = rs.get("tap100i0-OUT").unwrap();
        assert!(tap_out.contains(&"-A tap100i0-OUT -p tcp --dport 22 -j RETURN".to_string()));
        assert!(!tap_out.iter().any(|cmd| cmd.ends_with("--dport 22 -j ACCEPT")));
    }

    #[test]
    fn test_in_accept_stays_accept() {
        let vmfw = parse_vm_rules("100.fw", "[in]\nACCEPT net0 - - tcp 22 -\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        assert!(
            rs.get("tap100i0-IN")
                .unwrap()
                .contains(&"-A tap100i0-IN -p tcp --dport 22 -j ACCEPT".to_string())
        );
    }

    #[test]
    fn test_group_mark_protocol() {
        // seed scenario: group accepts are signalled through the packet mark
        let mut inputs = one_vm_inputs(parse_vm_rules(
            "100.fw",
            "[in]\nGROUP-web - - - - - -\n[out]\nGROUP-web - - - - - -\n",
        ));
        inputs.groups = parse_group_rules(
            "groups.fw",
            "[in:web]\nACCEPT - - tcp 80 -\n[out:web]\nACCEPT - - tcp 80 -\n",
        );
        let rs = compile(&inputs).unwrap();

        let group_out = rs.get("GROUP-web-OUT").unwrap();
        assert_eq!(group_out[0], "-A GROUP-web-OUT -j MARK --set-mark 0");
        assert!(group_out
            .contains(&"-A GROUP-web-OUT -p tcp --dport 80 -g PVEFW-SET-ACCEPT-MARK".to_string()));

        let group_in = rs.get("GROUP-web-IN").unwrap();
        assert!(group_in.contains(&"-A GROUP-web-IN -p tcp --dport 80 -j ACCEPT".to_string()));

        // the caller checks the mark right after the group jump
        let tap_out = rs.get("tap100i0-OUT").unwrap();
        let jump = tap_out
            .iter()
            .position(|cmd| cmd == "-A tap100i0-OUT -j GROUP-web-OUT")
            .expect("group jump missing");
        assert_eq!(tap_out[jump + 1], "-A tap100i0-OUT -m mark --mark 1 -j RETURN");

        // IN jumps have no mark check
        let tap_in = rs.get("tap100i0-IN").unwrap();
        let jump = tap_in
            .iter()
            .position(|cmd| cmd == "-A tap100i0-IN -j GROUP-web-IN")
            .expect("group jump missing");
        assert_ne!(tap_in[jump + 1], "-A tap100i0-IN -m mark --mark 1 -j RETURN");
    }

    #[test]
    fn test_group_reference_without_definition() {
        let inputs = one_vm_inputs(parse_vm_rules("100.fw", "[out]\nGROUP-ghost - - - - - -\n"));
        let rs = compile(&inputs).unwrap();
        assert_eq!(rs.get("GROUP-ghost-IN").unwrap().len(), 0);
        assert_eq!(
            rs.get("GROUP-ghost-OUT").unwrap(),
            &["-A GROUP-ghost-OUT -j MARK --set-mark 0".to_string()]
        );
    }

    #[test]
    fn test_policy_reject_tail() {
        let vmfw = parse_vm_rules("100.fw", "[options]\npolicy-in: REJECT\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        let tap_in = rs.get("tap100i0-IN").unwrap();
        assert_eq!(
            &tap_in[tap_in.len() - 2..],
            &[
                "-A tap100i0-IN -j LOG --log-prefix \"tap100i0-IN-reject: \" --log-level 4"
                    .to_string(),
                "-A tap100i0-IN -j REJECT".to_string(),
            ]
        );
    }

    #[test]
    fn test_multiport_emission() {
        // seed scenario: a four-element port list uses the multiport matcher
        let vmfw = parse_vm_rules("100.fw", "[in]\nACCEPT net0 - - tcp 80,443,8080:8090 -\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        assert!(rs.get("tap100i0-IN").unwrap().contains(
            &"-A tap100i0-IN -p tcp --match multiport --dport 80,443,8080:8090 -j ACCEPT"
                .to_string()
        ));
    }

    #[test]
    fn test_iprange_emission() {
        let vmfw = parse_vm_rules(
            "100.fw",
            "[in]\nACCEPT net0 10.0.0.1-10.0.0.5 - - - -\nACCEPT net0 - 10.1.0.0-10.1.0.9 - - -\n",
        );
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        let tap_in = rs.get("tap100i0-IN").unwrap();
        assert!(tap_in.contains(
            &"-A tap100i0-IN -m iprange --src-range 10.0.0.1-10.0.0.5 -j ACCEPT".to_string()
        ));
        assert!(tap_in.contains(
            &"-A tap100i0-IN -m iprange --dst-range 10.1.0.0-10.1.0.9 -j ACCEPT".to_string()
        ));
        // a range never carries a redundant -s/-d
        assert!(!tap_in.iter().any(|cmd| cmd.contains("--src-range -s")));
        assert!(!tap_in.iter().any(|cmd| cmd.contains("--dst-range -d")));
    }

    #[test]
    fn test_address_list_emission() {
        let vmfw = parse_vm_rules("100.fw", "[in]\nACCEPT net0 10.0.0.1,10.0.0.5 - - - -\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        assert!(
            rs.get("tap100i0-IN")
                .unwrap()
                .contains(&"-A tap100i0-IN -s 10.0.0.1,10.0.0.5 -j ACCEPT".to_string())
        );
    }

    #[test]
    fn test_iface_filter() {
        let vmfw = parse_vm_rules(
            "100.fw",
            "[in]\nACCEPT net1 - - tcp 22 -\nACCEPT net0 - - tcp 80 -\nACCEPT - - - tcp 443 -\n",
        );
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        let tap_in = rs.get("tap100i0-IN").unwrap();
        assert!(!tap_in.iter().any(|cmd| cmd.contains("--dport 22")));
        assert!(tap_in.iter().any(|cmd| cmd.contains("--dport 80")));
        assert!(tap_in.iter().any(|cmd| cmd.contains("--dport 443")));
    }

    #[test]
    fn test_vm_disabled_produces_no_chains() {
        let vmfw = parse_vm_rules("100.fw", "[options]\nenable: 0\n");
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        assert!(!rs.contains("tap100i0-IN"));
        assert!(!rs.contains("vmbr0-FW"));
    }

    #[test]
    fn test_vm_without_rule_file_skipped() {
        let mut inputs = one_vm_inputs(VmRuleFile::default());
        inputs.vm_rules.clear();
        let rs = compile(&inputs).unwrap();
        assert!(!rs.contains("tap100i0-IN"));
    }

    #[test]
    fn test_host_firewall_chains() {
        let mut inputs = CompileInputs::default();
        inputs.host_rules = Some(parse_host_rules(
            "host.fw",
            "[in]\nACCEPT - - - tcp 8006 -\n",
        ));
        let rs = compile(&inputs).unwrap();

        let host_in = rs.get("PVEFW-HOST-IN").unwrap();
        assert_eq!(
            &host_in[..6],
            &[
                "-A PVEFW-HOST-IN -m state --state INVALID -j DROP",
                "-A PVEFW-HOST-IN -m state --state RELATED,ESTABLISHED -j ACCEPT",
                "-A PVEFW-HOST-IN -i lo -j ACCEPT",
                "-A PVEFW-HOST-IN -m addrtype --dst-type MULTICAST -j ACCEPT",
                "-A PVEFW-HOST-IN -p udp -m state --state NEW -m multiport --dports 5404,5405 -j ACCEPT",
                "-A PVEFW-HOST-IN -p udp -m udp --dport 9000 -j ACCEPT",
            ]
        );
        // host accepts are rewritten so tap checks still run
        assert!(host_in.contains(&"-A PVEFW-HOST-IN -p tcp --dport 8006 -j RETURN".to_string()));
        assert_eq!(
            &host_in[host_in.len() - 2..],
            &[
                "-A PVEFW-HOST-IN -j LOG --log-prefix \"PVEFW-HOST-IN-dropped: \" --log-level 4"
                    .to_string(),
                "-A PVEFW-HOST-IN -j DROP".to_string(),
            ]
        );

        let input = rs.get("PVEFW-INPUT").unwrap();
        assert_eq!(input[0], "-A PVEFW-INPUT -i lo -j ACCEPT");
        assert!(input.contains(&"-A PVEFW-INPUT -j PVEFW-HOST-IN".to_string()));
        assert!(
            rs.get("PVEFW-OUTPUT")
                .unwrap()
                .contains(&"-A PVEFW-OUTPUT -j PVEFW-HOST-OUT".to_string())
        );
        assert!(rs.contains("PVEFW-HOST-OUT"));
    }

    #[test]
    fn test_no_host_file_no_host_chains() {
        let rs = compile(&one_vm_inputs(VmRuleFile::default())).unwrap();
        assert!(!rs.contains("PVEFW-HOST-IN"));
        assert!(!rs.contains("PVEFW-HOST-OUT"));
    }

    #[test]
    fn test_shared_rule_not_mutated_across_directions() {
        let parsed = parse_vm_rules("100.fw", "[in]\nACCEPT net0 - - tcp 22 -\n");
        let shared = parsed.rules_in[0].clone();
        let mut vmfw = VmRuleFile::default();
        vmfw.rules_in = vec![shared.clone()];
        vmfw.rules_out = vec![shared];
        let rs = compile(&one_vm_inputs(vmfw)).unwrap();
        // OUT rewrites to RETURN without corrupting the IN emission
        assert!(
            rs.get("tap100i0-IN")
                .unwrap()
                .contains(&"-A tap100i0-IN -p tcp --dport 22 -j ACCEPT".to_string())
        );
        assert!(
            rs.get("tap100i0-OUT")
                .unwrap()
                .contains(&"-A tap100i0-OUT -p tcp --dport 22 -j RETURN".to_string())
        );
    }

    #[test]
    fn test_chain_names_within_kernel_limit() {
        let mut inputs = one_vm_inputs(parse_vm_rules(
            "100.fw",
            "[in]\nGROUP-longest-group-nam - - - - - -\n",
        ));
        inputs.host_rules = Some(HostRuleFile::default());
        let rs = compile(&inputs).unwrap();
        for name in rs.chain_names() {
            assert!(name.len() <= 28, "chain '{name}' too long");
        }
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut inputs = one_vm_inputs(parse_vm_rules(
            "100.fw",
            "[in]\nGROUP-web - - - - - -\nHTTP(ACCEPT) - - - - - -\n",
        ));
        inputs.groups = parse_group_rules("groups.fw", "[in:web]\nACCEPT - - tcp 80 -\n");
        inputs.host_rules = Some(parse_host_rules("host.fw", "[in]\nSSH(ACCEPT) - - - - -\n"));
        let first = compile(&inputs).unwrap();
        let second = compile(&inputs).unwrap();
        assert_eq!(first, second);
    }
}
