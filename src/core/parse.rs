//! Parsers for the three rule-file schemas.
//!
//! VM files carry `[in]`/`[out]`/`[options]` sections, host files
//! `[in]`/`[out]`, group files `[in:<group>]`/`[out:<group>]`. Rule lines are
//! whitespace-separated (`action [iface] source dest proto dport sport`,
//! `-` meaning unset), `#` starts a comment, blank lines are ignored.
//!
//! Parsing is line-recoverable: a malformed line is skipped with a warning
//! carrying `filename:lineno` and every other line stays valid.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use tracing::warn;

use crate::core::macros;
use crate::core::rule::{Policy, Rule, RuleAction};
use crate::core::services::{etc_protocols, etc_services};
use crate::validators;

/// Options section of a VM rule file.
///
/// A VM firewall is enabled unless the file says `enable: 0`; an empty rule
/// file still gets its tap chains with the default policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOptions {
    pub enable: bool,
    pub policy_in: Option<Policy>,
    pub policy_out: Option<Policy>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            enable: true,
            policy_in: None,
            policy_out: None,
        }
    }
}

/// Parsed per-VM rule file.
#[derive(Debug, Clone, Default)]
pub struct VmRuleFile {
    pub rules_in: Vec<Rule>,
    pub rules_out: Vec<Rule>,
    pub options: VmOptions,
}

/// Parsed host rule file.
#[derive(Debug, Clone, Default)]
pub struct HostRuleFile {
    pub rules_in: Vec<Rule>,
    pub rules_out: Vec<Rule>,
}

/// Directional rules of one security group.
#[derive(Debug, Clone, Default)]
pub struct GroupRules {
    pub rules_in: Vec<Rule>,
    pub rules_out: Vec<Rule>,
}

/// Parsed security-groups file.
#[derive(Debug, Clone, Default)]
pub struct GroupsFile {
    pub groups: BTreeMap<String, GroupRules>,
}

/// Validates one address token: IPv4 address, CIDR network, or `a-b` range.
/// Returns whether the token is a range.
fn parse_address_token(tok: &str) -> Result<bool, String> {
    if let Some((start, end)) = tok.split_once('-') {
        let start = Ipv4Addr::from_str(start).map_err(|_| format!("invalid IP address '{tok}'"))?;
        let end = Ipv4Addr::from_str(end).map_err(|_| format!("invalid IP address '{tok}'"))?;
        if u32::from(start) > u32::from(end) {
            return Err(format!("invalid IP range '{tok}'"));
        }
        return Ok(true);
    }
    Ipv4Network::from_str(tok)
        .map(|_| false)
        .map_err(|_| format!("invalid IP address '{tok}'"))
}

/// Validates a comma-separated address list and returns its cardinality.
/// A range token counts twice and must stand alone: the iprange matcher
/// takes exactly one `lo-hi` operand, so a range cannot be combined with
/// other addresses.
pub(crate) fn parse_address_list(list: &str) -> Result<usize, String> {
    let mut count = 0;
    let mut elements = 0;
    let mut has_range = false;
    for tok in list.split(',') {
        if parse_address_token(tok)? {
            has_range = true;
            count += 2;
        } else {
            count += 1;
        }
        elements += 1;
    }
    if has_range && elements > 1 {
        return Err(format!("range cannot be part of a list '{list}'"));
    }
    Ok(count)
}

/// Validates a comma-separated port list and returns its cardinality. Tokens
/// are port numbers, service names, or `lo:hi` ranges; a range counts twice.
pub(crate) fn parse_port_list(list: &str) -> Result<usize, String> {
    let mut count = 0;
    for tok in list.split(',') {
        if let Some((lo, hi)) = tok.split_once(':') {
            let lo = lo.parse::<u32>().map_err(|_| format!("invalid port '{lo}'"))?;
            let hi = hi.parse::<u32>().map_err(|_| format!("invalid port '{hi}'"))?;
            validators::validate_port_range(lo, hi)?;
            count += 2;
        } else if !tok.is_empty() && tok.chars().all(|c| c.is_ascii_digit()) {
            let port = tok.parse::<u32>().map_err(|_| format!("invalid port '{tok}'"))?;
            validators::validate_port(port)?;
            count += 1;
        } else {
            etc_services()
                .lookup_name(tok)
                .ok_or_else(|| format!("unknown service '{tok}'"))?;
            count += 1;
        }
    }
    Ok(count)
}

/// Resolves a protocol name or decimal number through the protocols table.
fn resolve_protocol(proto: &str) -> Result<u16, String> {
    if !proto.is_empty() && proto.chars().all(|c| c.is_ascii_digit()) {
        let id = proto
            .parse::<u16>()
            .map_err(|_| format!("unknown protocol '{proto}'"))?;
        etc_protocols()
            .lookup_id(id)
            .ok_or_else(|| format!("unknown protocol '{proto}'"))?;
        return Ok(id);
    }
    etc_protocols()
        .lookup_name(proto)
        .ok_or_else(|| format!("unknown protocol '{proto}'"))
}

const PROTO_TCP: u16 = 6;
const PROTO_UDP: u16 = 17;

/// Validates a rule's fields and computes the cached cardinalities.
fn finalize_rule(rule: &mut Rule) -> Result<(), String> {
    if let Some(iface) = &rule.iface {
        validators::validate_iface_ref(iface)?;
    }
    let proto_id = match &rule.proto {
        Some(proto) => Some(resolve_protocol(proto)?),
        None => None,
    };
    if rule.dport.is_some() || rule.sport.is_some() {
        match proto_id {
            Some(PROTO_TCP) | Some(PROTO_UDP) => {}
            Some(_) => {
                return Err(format!(
                    "protocol '{}' does not support ports",
                    rule.proto.as_deref().unwrap_or_default()
                ));
            }
            None => return Err("port matches require a tcp/udp protocol".to_string()),
        }
    }
    if let Some(dport) = &rule.dport {
        rule.nbdport = parse_port_list(dport)?;
    }
    if let Some(sport) = &rule.sport {
        rule.nbsport = parse_port_list(sport)?;
    }
    if let Some(source) = &rule.source {
        rule.nbsource = parse_address_list(source)?;
    }
    if let Some(dest) = &rule.dest {
        rule.nbdest = parse_address_list(dest)?;
    }
    Ok(())
}

/// Parses one rule line into fully validated rules (a macro invocation may
/// yield several).
///
/// `with_iface` selects the 7-slot VM/host layout over the 6-slot group
/// layout; `allow_groups` permits `GROUP-<name>` actions.
pub fn parse_rule_line(line: &str, with_iface: bool, allow_groups: bool) -> Result<Vec<Rule>, String> {
    let mut fields = line.split_whitespace();
    let action_tok = fields.next().ok_or("empty rule line")?;
    let rest: Vec<&str> = fields.collect();

    let max_rest = if with_iface { 6 } else { 5 };
    if rest.len() > max_rest {
        return Err(format!("too many fields (at most {} expected)", max_rest + 1));
    }
    let slot = |i: usize| {
        rest.get(i)
            .copied()
            .filter(|s| *s != "-")
            .map(str::to_string)
    };
    let (iface, off) = if with_iface { (slot(0), 1) } else { (None, 0) };

    let mut base = Rule::new(RuleAction::Drop);
    base.iface = iface;
    base.source = slot(off);
    base.dest = slot(off + 1);
    base.proto = slot(off + 2);
    base.dport = slot(off + 3);
    base.sport = slot(off + 4);

    if let Some(action) = RuleAction::from_terminal(action_tok) {
        base.action = action;
        finalize_rule(&mut base)?;
        return Ok(vec![base]);
    }

    if let Some(group) = action_tok.strip_prefix("GROUP-") {
        if !allow_groups {
            return Err(format!("group reference '{action_tok}' not allowed here"));
        }
        validators::validate_group_name(group)?;
        base.action = RuleAction::Group(group.to_string());
        finalize_rule(&mut base)?;
        return Ok(vec![base]);
    }

    if let Some((name, inner)) = action_tok.strip_suffix(')').and_then(|s| s.split_once('(')) {
        let action = RuleAction::from_terminal(inner)
            .ok_or_else(|| format!("invalid macro action '{inner}'"))?;
        let (canonical, templates) =
            macros::lookup(name).ok_or_else(|| format!("unknown macro '{name}'"))?;
        let mut rules = macros::expand(templates, &base, &action);
        for rule in &mut rules {
            finalize_rule(rule).map_err(|msg| format!("macro {canonical}: {msg}"))?;
        }
        return Ok(rules);
    }

    Err(format!("unknown action '{action_tok}'"))
}

/// Strips the trailing comment and surrounding whitespace.
fn strip_line(raw: &str) -> &str {
    raw.split('#').next().unwrap_or("").trim()
}

enum VmSection {
    None,
    In,
    Out,
    Options,
}

/// Parses a per-VM rule file. `label` names the source in warnings.
pub fn parse_vm_rules(label: &str, text: &str) -> VmRuleFile {
    let mut file = VmRuleFile::default();
    let mut section = VmSection::None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = strip_line(raw);
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            section = match line {
                "[in]" => VmSection::In,
                "[out]" => VmSection::Out,
                "[options]" => VmSection::Options,
                _ => {
                    warn!("{label}:{lineno}: skipping unknown section '{line}'");
                    VmSection::None
                }
            };
            continue;
        }
        match section {
            VmSection::None => warn!("{label}:{lineno}: skipping line outside any section"),
            VmSection::Options => {
                if let Err(msg) = parse_option_line(line, &mut file.options) {
                    warn!("{label}:{lineno}: {msg}");
                }
            }
            VmSection::In | VmSection::Out => match parse_rule_line(line, true, true) {
                Ok(rules) => {
                    let target = match section {
                        VmSection::In => &mut file.rules_in,
                        _ => &mut file.rules_out,
                    };
                    target.extend(rules);
                }
                Err(msg) => warn!("{label}:{lineno}: {msg}"),
            },
        }
    }
    file
}

fn parse_option_line(line: &str, options: &mut VmOptions) -> Result<(), String> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| format!("invalid option line '{line}'"))?;
    let (key, value) = (key.trim(), value.trim());
    match key {
        "enable" => {
            options.enable = match value {
                "0" => false,
                "1" => true,
                _ => return Err(format!("invalid enable value '{value}'")),
            };
        }
        "policy-in" => {
            options.policy_in =
                Some(Policy::parse(value).ok_or_else(|| format!("invalid policy '{value}'"))?);
        }
        "policy-out" => {
            options.policy_out =
                Some(Policy::parse(value).ok_or_else(|| format!("invalid policy '{value}'"))?);
        }
        _ => return Err(format!("unknown option '{key}'")),
    }
    Ok(())
}

/// Parses the host rule file.
pub fn parse_host_rules(label: &str, text: &str) -> HostRuleFile {
    let mut file = HostRuleFile::default();
    let mut section: Option<bool> = None; // true = in, false = out

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = strip_line(raw);
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            section = match line {
                "[in]" => Some(true),
                "[out]" => Some(false),
                _ => {
                    warn!("{label}:{lineno}: skipping unknown section '{line}'");
                    None
                }
            };
            continue;
        }
        match section {
            None => warn!("{label}:{lineno}: skipping line outside any section"),
            Some(inbound) => match parse_rule_line(line, true, true) {
                Ok(rules) => {
                    if inbound {
                        file.rules_in.extend(rules);
                    } else {
                        file.rules_out.extend(rules);
                    }
                }
                Err(msg) => warn!("{label}:{lineno}: {msg}"),
            },
        }
    }
    file
}

/// Parses the security-groups file.
pub fn parse_group_rules(label: &str, text: &str) -> GroupsFile {
    let mut file = GroupsFile::default();
    let mut section: Option<(String, bool)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = strip_line(raw);
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            section = parse_group_header(line);
            match &section {
                Some((group, _)) => {
                    file.groups.entry(group.clone()).or_default();
                }
                None => warn!("{label}:{lineno}: skipping unknown section '{line}'"),
            }
            continue;
        }
        match &section {
            None => warn!("{label}:{lineno}: skipping line outside any section"),
            Some((group, inbound)) => match parse_rule_line(line, false, false) {
                Ok(rules) => {
                    let entry = file.groups.entry(group.clone()).or_default();
                    if *inbound {
                        entry.rules_in.extend(rules);
                    } else {
                        entry.rules_out.extend(rules);
                    }
                }
                Err(msg) => warn!("{label}:{lineno}: {msg}"),
            },
        }
    }
    file
}

fn parse_group_header(line: &str) -> Option<(String, bool)> {
    let inner = line.strip_prefix('[')?.strip_suffix(']')?;
    let (dir, group) = inner.split_once(':')?;
    let inbound = match dir {
        "in" => true,
        "out" => false,
        _ => return None,
    };
    validators::validate_group_name(group).ok()?;
    Some((group.to_string(), inbound))
}

/// Loads and parses a VM rule file; `None` when the file does not exist.
pub fn load_vm_rules(path: &Path) -> Option<VmRuleFile> {
    let text = read_optional(path)?;
    Some(parse_vm_rules(&path.display().to_string(), &text))
}

/// Loads and parses the host rule file; `None` when the file does not exist
/// (the host firewall is then disabled).
pub fn load_host_rules(path: &Path) -> Option<HostRuleFile> {
    let text = read_optional(path)?;
    Some(parse_host_rules(&path.display().to_string(), &text))
}

/// Loads and parses the groups file; a missing file yields no groups.
pub fn load_group_rules(path: &Path) -> GroupsFile {
    match read_optional(path) {
        Some(text) => parse_group_rules(&path.display().to_string(), &text),
        None => GroupsFile::default(),
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!("unable to read '{}': {err}", path.display());
            None
        }
    }
}
