//! Registry of well-known service macros.
//!
//! A macro expands a single rule line like `HTTP(ACCEPT)` into one or more
//! partially-specified rules. Macros are plain data: each entry is a list of
//! templates whose fields are either literals or endpoint sentinels resolved
//! against the invoking rule ([`Tpl::Source`]/[`Tpl::Dest`] copy the
//! invocation's addresses, which is how bidirectional macros swap
//! endpoints). Every expanded rule carries the terminal action given in the
//! invocation.
//!
//! Macros that would need ICMP-type matching (Ping, Trcrt) are not carried;
//! the rule model has no ICMP-type field.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::core::rule::{Rule, RuleAction};

/// A template field value: literal text or an endpoint sentinel resolved at
/// expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpl {
    Lit(&'static str),
    Source,
    Dest,
}

/// One partial rule inside a macro definition.
#[derive(Debug, Clone, Copy)]
pub struct MacroRule {
    pub source: Option<Tpl>,
    pub dest: Option<Tpl>,
    pub proto: Option<Tpl>,
    pub dport: Option<Tpl>,
    pub sport: Option<Tpl>,
}

const fn tcp(dport: &'static str) -> MacroRule {
    MacroRule {
        source: None,
        dest: None,
        proto: Some(Tpl::Lit("tcp")),
        dport: Some(Tpl::Lit(dport)),
        sport: None,
    }
}

const fn udp(dport: &'static str) -> MacroRule {
    MacroRule {
        source: None,
        dest: None,
        proto: Some(Tpl::Lit("udp")),
        dport: Some(Tpl::Lit(dport)),
        sport: None,
    }
}

const fn udp_sport(dport: &'static str, sport: &'static str) -> MacroRule {
    MacroRule {
        source: None,
        dest: None,
        proto: Some(Tpl::Lit("udp")),
        dport: Some(Tpl::Lit(dport)),
        sport: Some(Tpl::Lit(sport)),
    }
}

const fn proto(name: &'static str) -> MacroRule {
    MacroRule {
        source: None,
        dest: None,
        proto: Some(Tpl::Lit(name)),
        dport: None,
        sport: None,
    }
}

/// Swap the invocation's endpoints, for the reverse leg of a bidirectional
/// flow.
const fn reverse(r: MacroRule) -> MacroRule {
    MacroRule {
        source: Some(Tpl::Dest),
        dest: Some(Tpl::Source),
        proto: r.proto,
        dport: r.dport,
        sport: r.sport,
    }
}

static MACRO_TABLE: &[(&str, &[MacroRule])] = &[
    ("Amanda", &[udp("10080"), tcp("10080")]),
    ("Auth", &[tcp("113")]),
    ("BGP", &[tcp("179")]),
    ("BitTorrent", &[tcp("6881:6889"), udp("6881")]),
    ("CVS", &[tcp("2401")]),
    ("Citrix", &[tcp("1494"), udp("1604"), tcp("2598")]),
    ("DAAP", &[tcp("3689"), udp("3689")]),
    ("DCC", &[tcp("6277")]),
    ("DHCPfwd", &[udp_sport("67:68", "67:68")]),
    ("DNS", &[udp("53"), tcp("53")]),
    ("Distcc", &[tcp("3632")]),
    ("FTP", &[tcp("21")]),
    ("Finger", &[tcp("79")]),
    ("GNUnet", &[tcp("2086"), udp("2086"), tcp("1080"), udp("1080")]),
    ("Gopher", &[tcp("70")]),
    ("HKP", &[tcp("11371")]),
    ("HTTP", &[tcp("80")]),
    ("HTTPS", &[tcp("443")]),
    ("ICPV2", &[udp("3130")]),
    ("ICQ", &[tcp("5190")]),
    ("IMAP", &[tcp("143")]),
    ("IMAPS", &[tcp("993")]),
    ("IPsec", &[udp_sport("500", "500"), proto("esp")]),
    ("IPsecah", &[udp_sport("500", "500"), proto("ah")]),
    ("IPsecnat", &[udp("500"), udp("4500"), proto("esp")]),
    ("IRC", &[tcp("6667")]),
    ("Jetdirect", &[tcp("9100")]),
    ("L2TP", &[udp("1701")]),
    ("LDAP", &[tcp("389")]),
    ("LDAPS", &[tcp("636")]),
    ("MSNP", &[tcp("1863")]),
    ("MSSQL", &[tcp("1433")]),
    ("Mail", &[tcp("25"), tcp("465"), tcp("587")]),
    ("Munin", &[tcp("4949")]),
    ("MySQL", &[tcp("3306")]),
    ("NNTP", &[tcp("119")]),
    ("NNTPS", &[tcp("563")]),
    ("NTP", &[udp("123")]),
    ("NTPbi", &[udp("123"), reverse(udp("123"))]),
    ("OSPF", &[proto("89")]),
    ("OpenVPN", &[udp("1194")]),
    ("PCA", &[udp("5632"), tcp("5631")]),
    ("POP3", &[tcp("110")]),
    ("POP3S", &[tcp("995")]),
    ("PPtP", &[proto("47"), tcp("1723")]),
    ("PostgreSQL", &[tcp("5432")]),
    ("Printer", &[tcp("515")]),
    ("RDP", &[tcp("3389")]),
    ("RIPbi", &[udp("520"), reverse(udp("520"))]),
    ("RNDC", &[tcp("953")]),
    ("Razor", &[tcp("2703")]),
    ("Rdate", &[tcp("37")]),
    ("Rsync", &[tcp("873")]),
    ("SANE", &[tcp("6566")]),
    ("SMB", &[udp("135,445"), udp("137:139"), tcp("135,139,445")]),
    ("SMBswat", &[tcp("901")]),
    ("SMTP", &[tcp("25")]),
    ("SMTPS", &[tcp("465")]),
    ("SNMP", &[udp("161:162"), tcp("161")]),
    ("SPAMD", &[tcp("783")]),
    ("SSH", &[tcp("22")]),
    ("SVN", &[tcp("3690")]),
    ("Squid", &[tcp("3128")]),
    ("Submission", &[tcp("587")]),
    ("Syslog", &[udp("514")]),
    ("TFTP", &[udp("69")]),
    ("Telnet", &[tcp("23")]),
    ("Telnets", &[tcp("992")]),
    ("Time", &[tcp("37")]),
    ("VNC", &[tcp("5900:5909")]),
    ("VNCL", &[tcp("5500")]),
    ("Web", &[tcp("80"), tcp("443")]),
    ("Webmin", &[tcp("10000")]),
    ("Whois", &[tcp("43")]),
];

/// Lowercased name -> index into [`MACRO_TABLE`], so lookups are
/// case-insensitive while diagnostics can echo the canonical spelling.
static BY_NAME: LazyLock<HashMap<String, usize>> = LazyLock::new(|| {
    MACRO_TABLE
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.to_lowercase(), i))
        .collect()
});

/// Case-insensitive macro lookup. Returns the canonical name and the
/// template list.
pub fn lookup(name: &str) -> Option<(&'static str, &'static [MacroRule])> {
    let idx = *BY_NAME.get(&name.to_lowercase())?;
    let (canonical, templates) = MACRO_TABLE[idx];
    Some((canonical, templates))
}

/// Expands a macro invocation into one rule per template.
///
/// Template fields win over the invocation's own fields; whatever the
/// template neither sets nor consumed through a sentinel is copied over from
/// the invocation, so `HTTP(ACCEPT) - 10.1.1.0/24 - - - -` still matches on
/// the given source.
pub fn expand(templates: &[MacroRule], base: &Rule, action: &RuleAction) -> Vec<Rule> {
    templates
        .iter()
        .map(|templ| {
            let mut used_source = false;
            let mut used_dest = false;
            let mut resolve = |tpl: Option<Tpl>| match tpl {
                None => None,
                Some(Tpl::Lit(text)) => Some(text.to_string()),
                Some(Tpl::Source) => {
                    used_source = true;
                    base.source.clone()
                }
                Some(Tpl::Dest) => {
                    used_dest = true;
                    base.dest.clone()
                }
            };

            let mut rule = Rule::new(action.clone());
            rule.source = resolve(templ.source);
            rule.dest = resolve(templ.dest);
            rule.proto = resolve(templ.proto);
            rule.dport = resolve(templ.dport);
            rule.sport = resolve(templ.sport);

            rule.iface = base.iface.clone();
            if rule.source.is_none() && !used_source {
                rule.source = base.source.clone();
            }
            if rule.dest.is_none() && !used_dest {
                rule.dest = base.dest.clone();
            }
            rule
        })
        .collect()
}
