//! Directory of the OS-supplied service and protocol name tables.
//!
//! `/etc/services` and `/etc/protocols` are read once per process and kept
//! as immutable lookup tables. A missing file degrades to an empty table
//! with a warning; name resolution then fails for any rule that relies on
//! it. Lookups are case-sensitive.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

const ETC_SERVICES: &str = "/etc/services";
const ETC_PROTOCOLS: &str = "/etc/protocols";

/// One well-known service: a port plus which of tcp/udp it is registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub port: u16,
    pub tcp: bool,
    pub udp: bool,
}

/// Index over `/etc/services`, by name and by port number.
#[derive(Debug, Default)]
pub struct ServiceTable {
    by_port: HashMap<u16, ServiceInfo>,
    by_name: HashMap<String, u16>,
}

impl ServiceTable {
    /// Parses lines of the form `name port/(tcp|udp) …`. Entries for the
    /// same port merge their tcp/udp flags; later names win, like repeated
    /// registrations in the file itself.
    pub fn parse(text: &str) -> Self {
        let mut table = ServiceTable::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(portproto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = portproto.split_once('/') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            if proto != "tcp" && proto != "udp" {
                continue;
            }
            let entry = table.by_port.entry(port).or_insert_with(|| ServiceInfo {
                name: name.to_string(),
                port,
                tcp: false,
                udp: false,
            });
            entry.name = name.to_string();
            match proto {
                "tcp" => entry.tcp = true,
                _ => entry.udp = true,
            }
            table.by_name.insert(name.to_string(), port);
        }
        table
    }

    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) => {
                warn!("unable to read '{}': {err}", path.display());
                ServiceTable::default()
            }
        }
    }

    pub fn lookup_name(&self, name: &str) -> Option<&ServiceInfo> {
        self.by_name.get(name).and_then(|port| self.by_port.get(port))
    }

    pub fn lookup_port(&self, port: u16) -> Option<&ServiceInfo> {
        self.by_port.get(&port)
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }
}

/// Index over `/etc/protocols`, by name and by protocol number.
#[derive(Debug, Default)]
pub struct ProtocolTable {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
}

impl ProtocolTable {
    /// Parses lines of the form `name number …`.
    pub fn parse(text: &str) -> Self {
        let mut table = ProtocolTable::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(id)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(id) = id.parse::<u16>() else {
                continue;
            };
            table.by_name.insert(name.to_string(), id);
            table.by_id.insert(id, name.to_string());
        }
        table
    }

    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) => {
                warn!("unable to read '{}': {err}", path.display());
                ProtocolTable::default()
            }
        }
    }

    pub fn lookup_name(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn lookup_id(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

static SERVICES: LazyLock<ServiceTable> =
    LazyLock::new(|| ServiceTable::load(Path::new(ETC_SERVICES)));

static PROTOCOLS: LazyLock<ProtocolTable> =
    LazyLock::new(|| ProtocolTable::load(Path::new(ETC_PROTOCOLS)));

/// Process-wide `/etc/services` table, loaded on first use.
pub fn etc_services() -> &'static ServiceTable {
    &SERVICES
}

/// Process-wide `/etc/protocols` table, loaded on first use.
pub fn etc_protocols() -> &'static ProtocolTable {
    &PROTOCOLS
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICES_SAMPLE: &str = "\
# Network services, Internet style
ssh             22/tcp
domain          53/tcp
domain          53/udp
http            80/tcp          www
ntp             123/udp
";

    const PROTOCOLS_SAMPLE: &str = "\
ip      0       IP
icmp    1       ICMP
tcp     6       TCP
udp     17      UDP
esp     50      IPSEC-ESP
ah      51      IPSEC-AH
";

    #[test]
    fn test_service_lookup_by_name() {
        let table = ServiceTable::parse(SERVICES_SAMPLE);
        let ssh = table.lookup_name("ssh").unwrap();
        assert_eq!(ssh.port, 22);
        assert!(ssh.tcp);
        assert!(!ssh.udp);
    }

    #[test]
    fn test_service_merges_tcp_and_udp() {
        let table = ServiceTable::parse(SERVICES_SAMPLE);
        let dns = table.lookup_name("domain").unwrap();
        assert!(dns.tcp);
        assert!(dns.udp);
        assert_eq!(table.lookup_port(53).unwrap().name, "domain");
    }

    #[test]
    fn test_service_lookup_case_sensitive() {
        let table = ServiceTable::parse(SERVICES_SAMPLE);
        assert!(table.lookup_name("SSH").is_none());
        assert!(table.lookup_name("ssh").is_some());
    }

    #[test]
    fn test_service_aliases_ignored() {
        let table = ServiceTable::parse(SERVICES_SAMPLE);
        assert!(table.lookup_name("www").is_none());
        assert!(table.lookup_name("http").is_some());
    }

    #[test]
    fn test_protocol_lookup() {
        let table = ProtocolTable::parse(PROTOCOLS_SAMPLE);
        assert_eq!(table.lookup_name("tcp"), Some(6));
        assert_eq!(table.lookup_name("esp"), Some(50));
        assert_eq!(table.lookup_id(17), Some("udp"));
        assert_eq!(table.lookup_name("TCP"), None);
        assert_eq!(table.lookup_name("nosuch"), None);
    }

    #[test]
    fn test_missing_file_degrades_to_empty() {
        let table = ServiceTable::load(Path::new("/nonexistent/services"));
        assert!(table.is_empty());
        let protocols = ProtocolTable::load(Path::new("/nonexistent/protocols"));
        assert!(protocols.is_empty());
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let table = ServiceTable::parse("# comment\n\nssh 22/tcp # trailing\n");
        assert_eq!(table.lookup_name("ssh").unwrap().port, 22);
    }
}
