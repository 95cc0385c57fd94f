//! VM inventory provider.
//!
//! Enumerates the configured VMs and their network interfaces from the VM
//! configuration directory. Only the `net<N>` lines matter here; a VM whose
//! configuration cannot be read is skipped, so its interfaces simply get no
//! tap chains this cycle.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::core::error::Result;
use crate::validators;

/// One VM network interface as declared in the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetConfig {
    pub bridge: Option<String>,
    pub tag: Option<u16>,
    pub macaddr: Option<String>,
}

/// A VM's interfaces, keyed by `net<N>` index.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub nets: BTreeMap<u32, NetConfig>,
}

/// All configured VMs.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub vms: BTreeMap<u32, VmConfig>,
}

impl Inventory {
    pub fn add_net(&mut self, vmid: u32, index: u32, net: NetConfig) {
        self.vms.entry(vmid).or_default().nets.insert(index, net);
    }
}

/// NIC model keys whose value is the interface MAC address.
const NIC_MODELS: &[&str] = &["virtio", "e1000", "rtl8139", "vmxnet3"];

/// Parses a `net<N>` value like `virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0,tag=5`.
///
/// Returns `None` when the string is malformed; unknown `key=value` pairs
/// are ignored so newer inventory fields do not break parsing.
pub fn parse_net(value: &str) -> Option<NetConfig> {
    let mut net = NetConfig::default();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (key, val) = item.split_once('=')?;
        match key {
            "bridge" => {
                validators::validate_bridge_name(val).ok()?;
                net.bridge = Some(val.to_string());
            }
            "tag" => {
                let tag = val.parse::<u16>().ok()?;
                if !(1..=4094).contains(&tag) {
                    return None;
                }
                net.tag = Some(tag);
            }
            "macaddr" => {
                validators::validate_macaddr(val).ok()?;
                net.macaddr = Some(val.to_string());
            }
            model if NIC_MODELS.contains(&model) => {
                validators::validate_macaddr(val).ok()?;
                net.macaddr = Some(val.to_string());
            }
            _ => {}
        }
    }
    Some(net)
}

/// Scans `<dir>/<vmid>.conf` files into an [`Inventory`].
pub fn list_vms(dir: &Path) -> Result<Inventory> {
    let mut inventory = Inventory::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(inventory),
        Err(err) => return Err(err.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(vmid) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".conf"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                debug!("skipping unreadable VM config '{}': {err}", path.display());
                continue;
            }
        };

        let mut vm = VmConfig::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let Some(index) = key
                .trim()
                .strip_prefix("net")
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            match parse_net(value.trim()) {
                Some(net) => {
                    vm.nets.insert(index, net);
                }
                None => debug!("{}: skipping malformed '{}'", path.display(), key.trim()),
            }
        }
        inventory.vms.insert(vmid, vm);
    }
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_net_full() {
        let net = parse_net("virtio=AA:BB:CC:DD:EE:01,bridge=vmbr0,tag=5").unwrap();
        assert_eq!(net.bridge.as_deref(), Some("vmbr0"));
        assert_eq!(net.tag, Some(5));
        assert_eq!(net.macaddr.as_deref(), Some("AA:BB:CC:DD:EE:01"));
    }

    #[test]
    fn test_parse_net_explicit_macaddr() {
        let net = parse_net("macaddr=aa:bb:cc:dd:ee:ff,bridge=vmbr1").unwrap();
        assert_eq!(net.macaddr.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(net.bridge.as_deref(), Some("vmbr1"));
    }

    #[test]
    fn test_parse_net_without_bridge() {
        let net = parse_net("e1000=aa:bb:cc:dd:ee:ff").unwrap();
        assert!(net.bridge.is_none());
    }

    #[test]
    fn test_parse_net_unknown_keys_ignored() {
        let net = parse_net("virtio=aa:bb:cc:dd:ee:ff,bridge=vmbr0,rate=50,queues=4").unwrap();
        assert_eq!(net.bridge.as_deref(), Some("vmbr0"));
    }

    #[test]
    fn test_parse_net_malformed() {
        assert!(parse_net("justgarbage").is_none());
        assert!(parse_net("bridge=bad bridge").is_none());
        assert!(parse_net("virtio=nonsense").is_none());
        assert!(parse_net("tag=0,bridge=vmbr0").is_none());
        assert!(parse_net("tag=4095,bridge=vmbr0").is_none());
    }

    #[test]
    fn test_list_vms_missing_dir() {
        let inventory = list_vms(Path::new("/nonexistent/qemu-server")).unwrap();
        assert!(inventory.vms.is_empty());
    }

    #[test]
    fn test_list_vms_scans_conf_files() {
        let dir = std::env::temp_dir().join(format!("pvefw-inv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("100.conf"),
            "memory: 2048\nnet0: virtio=aa:bb:cc:dd:ee:01,bridge=vmbr0\nnet1: virtio=aa:bb:cc:dd:ee:02,bridge=vmbr1,tag=10\n",
        )
        .unwrap();
        std::fs::write(dir.join("ignore.txt"), "not a vm\n").unwrap();
        std::fs::write(dir.join("101.conf"), "net0: broken net line\n").unwrap();

        let inventory = list_vms(&dir).unwrap();
        assert_eq!(inventory.vms.len(), 2);
        let vm = inventory.vms.get(&100).unwrap();
        assert_eq!(vm.nets.len(), 2);
        assert_eq!(vm.nets.get(&0).unwrap().bridge.as_deref(), Some("vmbr0"));
        assert_eq!(vm.nets.get(&1).unwrap().tag, Some(10));
        // malformed net line skipped, VM still listed
        assert!(inventory.vms.get(&101).unwrap().nets.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
