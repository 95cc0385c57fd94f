//! The canonical intermediate form for firewall rules.
//!
//! Rule files are parsed into [`Rule`] records; the compiler turns them into
//! iptables command lines. A rule keeps the raw comma-separated address and
//! port lists exactly as written, plus the cardinality of each list so the
//! compiler can decide between plain matchers and multiport/iprange.

use std::fmt;

/// Traffic direction relative to a guest or the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default chain policy, also the value space of the `policy-in`/`policy-out`
/// options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
    Reject,
}

impl Policy {
    pub fn parse(s: &str) -> Option<Policy> {
        match s {
            "ACCEPT" => Some(Policy::Accept),
            "DROP" => Some(Policy::Drop),
            "REJECT" => Some(Policy::Reject),
            _ => None,
        }
    }
}

/// What a rule does with a matching packet.
///
/// `Return` and `SetAcceptMark` are never produced by the parser; they appear
/// when the compiler rewrites rules for OUT chains and security-group chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    Return,
    SetAcceptMark,
    /// Jump into a security-group chain. The name initially carries just the
    /// group; the compiler appends the direction suffix before emission.
    Group(String),
}

impl RuleAction {
    pub fn from_terminal(s: &str) -> Option<RuleAction> {
        match s {
            "ACCEPT" => Some(RuleAction::Accept),
            "DROP" => Some(RuleAction::Drop),
            "REJECT" => Some(RuleAction::Reject),
            _ => None,
        }
    }
}

impl From<Policy> for RuleAction {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Accept => RuleAction::Accept,
            Policy::Drop => RuleAction::Drop,
            Policy::Reject => RuleAction::Reject,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Accept => f.write_str("ACCEPT"),
            RuleAction::Drop => f.write_str("DROP"),
            RuleAction::Reject => f.write_str("REJECT"),
            RuleAction::Return => f.write_str("RETURN"),
            RuleAction::SetAcceptMark => f.write_str("PVEFW-SET-ACCEPT-MARK"),
            RuleAction::Group(name) => write!(f, "GROUP-{name}"),
        }
    }
}

/// A single parsed firewall rule.
///
/// `source`/`dest`/`dport`/`sport` keep the raw list syntax; the `nb*`
/// fields cache each list's cardinality as computed at parse time (a port
/// range counts twice). Cardinality decides the matcher: more than one
/// destination port requires multiport, more than one source address
/// requires iprange, and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: RuleAction,
    pub iface: Option<String>,
    pub source: Option<String>,
    pub dest: Option<String>,
    pub proto: Option<String>,
    pub dport: Option<String>,
    pub sport: Option<String>,
    pub nbsource: usize,
    pub nbdest: usize,
    pub nbdport: usize,
    pub nbsport: usize,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            action,
            iface: None,
            source: None,
            dest: None,
            proto: None,
            dport: None,
            sport: None,
            nbsource: 0,
            nbdest: 0,
            nbdport: 0,
            nbsport: 0,
        }
    }

    /// Renders the rule back into the rule-file line format. VM and host
    /// files carry the interface slot, group files do not.
    pub fn format_line(&self, with_iface: bool) -> String {
        fn slot(v: &Option<String>) -> &str {
            v.as_deref().unwrap_or("-")
        }

        let mut fields = vec![self.action.to_string()];
        if with_iface {
            fields.push(slot(&self.iface).to_string());
        }
        fields.push(slot(&self.source).to_string());
        fields.push(slot(&self.dest).to_string());
        fields.push(slot(&self.proto).to_string());
        fields.push(slot(&self.dport).to_string());
        fields.push(slot(&self.sport).to_string());
        fields.join(" ")
    }
}
